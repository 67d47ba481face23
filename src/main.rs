use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Admission, AdmissionControl, AdmissionEngine, RequestDescriptor};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Partitioned admission control engine")]
struct Cli {
    /// Configuration file (defaults to the built-in configuration)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print policies and routes
    Check,

    /// Drive the engine with synthetic requests
    Simulate {
        /// Request target, e.g. `/token` or `/token?page=2`
        #[arg(long)]
        target: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 6)]
        requests: usize,

        /// Requests in flight at once
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Delay between request starts, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// How long an admitted request holds its lease, in milliseconds
        #[arg(long, default_value_t = 0)]
        hold_ms: u64,

        /// Client identity attached to every request
        #[arg(long)]
        client: Option<String>,

        /// Header attached to every request, as NAME=VALUE
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => TurnstileConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TurnstileConfig::builtin().context("loading built-in configuration")?,
    };
    info!(policies = config.policies.len(), routes = config.routes.len(), "Configuration loaded");

    match cli.command {
        Command::Check => check(&config),
        Command::Simulate {
            target,
            requests,
            concurrency,
            interval_ms,
            hold_ms,
            client,
            headers,
        } => {
            let engine = AdmissionEngine::from_config(&config)?;
            let maintenance = config.engine.idle_eviction.map(|eviction| {
                engine
                    .registry()
                    .spawn_maintenance(eviction.interval(), eviction.idle_after())
            });

            let mut request = RequestDescriptor::from_target(&target);
            if let Some(client) = client {
                request = request.with_client(client);
            }
            for (name, value) in &headers {
                request = request.with_header(name, value.clone());
            }

            let plan = SimulationPlan {
                requests,
                concurrency: concurrency.max(1),
                interval: Duration::from_millis(interval_ms),
                hold: Duration::from_millis(hold_ms),
            };

            tokio::select! {
                summary = simulate(Arc::new(engine), request, plan) => summary.print(),
                _ = shutdown_signal() => warn!("Simulation interrupted"),
            }

            if let Some(handle) = maintenance {
                handle.abort();
            }
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn check(config: &TurnstileConfig) -> anyhow::Result<()> {
    let engine = AdmissionEngine::from_config(config)?;
    let registry = engine.registry();

    println!("Policies:");
    for policy in &config.policies {
        println!(
            "  {:<16} {:<14} partition={}",
            policy.name,
            policy.limiter.kind(),
            policy.partition
        );
    }

    println!("Routes:");
    for (route, policy) in registry.routes() {
        println!("  {:<16} -> {}", route, policy);
    }
    match registry.default_policy() {
        Some(policy) => println!("  {:<16} -> {}", "(default)", policy),
        None => println!("  {:<16} -> unlimited", "(default)"),
    }

    println!(
        "Rejections answer with status {}",
        config.engine.rejection_status_code
    );
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct SimulationPlan {
    requests: usize,
    concurrency: usize,
    interval: Duration,
    hold: Duration,
}

#[derive(Debug, Default)]
struct SimulationSummary {
    admitted: usize,
    rejected: usize,
    cancelled: usize,
    errors: usize,
}

impl SimulationSummary {
    fn print(&self) {
        println!(
            "admitted={} rejected={} cancelled={} errors={}",
            self.admitted, self.rejected, self.cancelled, self.errors
        );
    }
}

async fn simulate(
    control: Arc<dyn AdmissionControl>,
    request: RequestDescriptor,
    plan: SimulationPlan,
) -> SimulationSummary {
    let started = tokio::time::Instant::now();

    let outcomes = stream::iter(0..plan.requests)
        .map(|index| {
            let control = control.clone();
            let request = request.clone();
            async move {
                let offset = plan.interval.saturating_mul(index as u32);
                tokio::time::sleep_until(started + offset).await;

                let outcome = control.admit_route(&request).await;
                let elapsed_ms = started.elapsed().as_millis();
                match outcome {
                    Ok(Admission::Admitted(lease)) => {
                        println!("#{:<3} t={:>6}ms admitted", index + 1, elapsed_ms);
                        tokio::time::sleep(plan.hold).await;
                        drop(lease);
                        Outcome::Admitted
                    }
                    Ok(Admission::Rejected(rejection)) => {
                        let retry = rejection
                            .retry_after
                            .map(|after| format!(" retry_after={}ms", after.as_millis()))
                            .unwrap_or_default();
                        println!(
                            "#{:<3} t={:>6}ms rejected status={} reason={}{}",
                            index + 1,
                            elapsed_ms,
                            rejection.status,
                            rejection.reason().unwrap_or("unknown"),
                            retry
                        );
                        Outcome::Rejected
                    }
                    Ok(Admission::Cancelled) => {
                        println!("#{:<3} t={:>6}ms cancelled", index + 1, elapsed_ms);
                        Outcome::Cancelled
                    }
                    Err(err) => {
                        println!("#{:<3} t={:>6}ms error: {}", index + 1, elapsed_ms, err);
                        Outcome::Error
                    }
                }
            }
        })
        .buffer_unordered(plan.concurrency)
        .collect::<Vec<_>>()
        .await;

    let mut summary = SimulationSummary::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Admitted => summary.admitted += 1,
            Outcome::Rejected => summary.rejected += 1,
            Outcome::Cancelled => summary.cancelled += 1,
            Outcome::Error => summary.errors += 1,
        }
    }
    summary
}

enum Outcome {
    Admitted,
    Rejected,
    Cancelled,
    Error,
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
