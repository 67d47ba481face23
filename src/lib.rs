//! Turnstile - Partitioned Admission Control
//!
//! This crate decides, per inbound request, whether the request may proceed
//! now, must wait, or is rejected. Requests are classified into partitions by
//! a policy; each partition owns an independent limiter (concurrency, token
//! bucket, or none). Admitted requests hold a lease until they finish.

pub mod config;
pub mod error;
pub mod ratelimit;
