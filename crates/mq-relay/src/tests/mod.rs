//! Integration tests for the relay.
//!
//! - `harness.rs`     - Mock sink, background relay runner
//! - `polling.rs`     - Empty queue behaviour
//! - `delivery.rs`    - Commit on delivery, backout on failure, redelivery
//! - `fatal.rs`       - Fatal receive, startup and close failures
//! - `concurrency.rs` - Session pool isolation and serialization
//! - `backout.rs`     - Backout threshold and backout queue
//! - `drain.rs`       - Graceful shutdown with deliveries in flight
//! - `http_sink.rs`   - CloudEvents over HTTP against a wiremock server

mod concurrency;
mod http_sink;
