//! mq-relay: transactional relay from a point-to-point queue to an HTTP
//! CloudEvents sink.
//!
//! Every message is read under syncpoint, wrapped in a CloudEvent, and
//! sent to the sink. The read is committed only after the sink accepts the
//! event; otherwise it is backed out and the queue redelivers it.
//!
//! # Core Invariants
//!
//! 1. **Commit-Gated**: a message leaves the queue only after the sink acknowledges it
//! 2. **Exactly One Outcome**: each received message gets one commit or one backout
//! 3. **One Open Transaction per Session**: a session never receives while a message is unresolved
//! 4. **Crash-Safe**: an unresolved message is redelivered by the queue manager
//!
//! # Architecture
//!
//! ```text
//!               +-> worker 0 (session 0) --+
//! Queue --------+-> worker 1 (session 1) --+--> HTTP sink
//!   ^           +-> worker N (session N) --+
//!   |______ commit / backout <_____________|
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod memory_queue;
pub mod queue;
pub mod redis_queue;
pub mod relay;
pub mod sink;
pub mod stats;

#[cfg(test)]
mod tests;

pub use config::{BackoutPolicy, ContentMode, RelayConfig};
pub use envelope::{EnvelopeBuilder, StructuredEvent};
pub use error::{RelayError, RelayResult};
pub use memory_queue::InMemoryQueueManager;
pub use queue::{
    QueueManager, ReceiveOutcome, SourceMessage, TransactionOutcome, TransactionalSession,
    UnitOfWork,
};
pub use redis_queue::RedisQueueManager;
pub use relay::Relay;
pub use sink::{EventSink, HttpSink};
pub use stats::{RelayStats, StatsSnapshot};
