//! Request descriptors supplied by the dispatch layer.

use std::collections::HashMap;
use tokio::sync::watch;

/// Create a linked cancellation handle and signal.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
}

/// Cancels the request its [`CancelSignal`] belongs to.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes whether a request was aborted.
///
/// Dropping the [`CancelHandle`] without calling `cancel` leaves the request
/// live.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once the request is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let Some(rx) = self.rx.as_ref() else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        let sender_gone = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if sender_gone {
            std::future::pending::<()>().await;
        }
    }
}

/// The attributes of an inbound request that partitioners may look at.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    route: String,
    query: Option<String>,
    headers: HashMap<String, String>,
    client: Option<String>,
    cancel: CancelSignal,
}

impl RequestDescriptor {
    /// Describe a request for `route` with no query, headers or client.
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            ..Default::default()
        }
    }

    /// Split a request target such as `/token?page=2` into route and query.
    pub fn from_target(target: &str) -> Self {
        match target.split_once('?') {
            Some((route, query)) => Self::new(route).with_query(query),
            None => Self::new(target),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Add a header. Names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Whether the request carries a non-empty query string.
    pub fn has_query(&self) -> bool {
        self.query.as_deref().is_some_and(|query| !query.is_empty())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }
}
