//! Queue-manager seam.
//!
//! A [`QueueManager`] hands out [`TransactionalSession`]s. Each session owns
//! one connection with its queue already opened for shared input, and has at
//! most one open syncpoint transaction at a time. Sessions are not shared:
//! the relay gives every worker its own.

use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{error, warn};

/// A message read from the source queue under syncpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    /// Identifier assigned by the source system.
    pub message_id: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// How many times this message has been backed out before.
    pub backout_count: u32,
}

/// Result of one transactional receive.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A message arrived; its transaction is open.
    Message(SourceMessage),
    /// The wait interval elapsed with nothing to read.
    NoMessage,
    /// The session is unusable.
    Fatal(RelayError),
}

/// How a unit of work is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Commit,
    Backout,
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionOutcome::Commit => write!(f, "commit"),
            TransactionOutcome::Backout => write!(f, "backout"),
        }
    }
}

/// Connects sessions against one queue.
#[async_trait]
pub trait QueueManager: Send + Sync {
    type Session: TransactionalSession + 'static;

    /// Connect, authenticate and open the source queue for the given
    /// worker slot.
    async fn connect(&self, slot: usize) -> RelayResult<Self::Session>;
}

/// One connection plus an open queue handle.
#[async_trait]
pub trait TransactionalSession: Send {
    /// Blocking read of one message under syncpoint, waiting up to `wait`.
    ///
    /// On [`ReceiveOutcome::Message`] the transaction stays open until
    /// [`commit`](Self::commit) or [`backout`](Self::backout) is called.
    async fn receive(&mut self, wait: Duration) -> ReceiveOutcome;

    /// Make the open transaction's gets and puts permanent.
    async fn commit(&mut self) -> RelayResult<()>;

    /// Roll back the open transaction; gotten messages become visible again
    /// with their backout count incremented.
    async fn backout(&mut self) -> RelayResult<()>;

    /// Put a copy of `message` on `queue` inside the open transaction.
    async fn forward(&mut self, queue: &str, message: &SourceMessage) -> RelayResult<()>;

    /// Close the queue handle and disconnect.
    async fn close(self) -> RelayResult<()>
    where
        Self: Sized;
}

/// An open unit of work.
///
/// Holds the session mutably until it is resolved, so the session cannot
/// receive again while a message is undecided.
#[must_use = "a unit of work must be committed or backed out"]
pub struct UnitOfWork<'s, S: TransactionalSession> {
    session: &'s mut S,
    message: SourceMessage,
}

impl<'s, S: TransactionalSession> UnitOfWork<'s, S> {
    /// Receive one message and wrap it in a unit of work.
    pub async fn begin(session: &'s mut S, wait: Duration) -> Result<Option<Self>, RelayError> {
        match session.receive(wait).await {
            ReceiveOutcome::Message(message) => Ok(Some(Self { session, message })),
            ReceiveOutcome::NoMessage => Ok(None),
            ReceiveOutcome::Fatal(e) => Err(e),
        }
    }

    /// The message being processed.
    pub fn message(&self) -> &SourceMessage {
        &self.message
    }

    /// Forward the message to `queue` and commit, in one transaction.
    pub async fn requeue(self, queue: &str) -> RelayResult<SourceMessage> {
        if let Err(e) = self.session.forward(queue, &self.message).await {
            // The get is still open; hand it back rather than lose it.
            match self.session.backout().await {
                Ok(()) => warn!(
                    message_id = %self.message.message_id,
                    backout_queue = %queue,
                    error = %e,
                    "Forward failed, message backed out"
                ),
                Err(backout_err) => error!(
                    message_id = %self.message.message_id,
                    backout_queue = %queue,
                    error = %backout_err,
                    "Can't backout after failed forward"
                ),
            }
            return Err(e);
        }
        self.session.commit().await?;
        Ok(self.message)
    }

    /// Close the unit of work with `outcome`.
    pub async fn resolve(self, outcome: TransactionOutcome) -> RelayResult<SourceMessage> {
        match outcome {
            TransactionOutcome::Commit => self.session.commit().await?,
            TransactionOutcome::Backout => self.session.backout().await?,
        }
        Ok(self.message)
    }
}
