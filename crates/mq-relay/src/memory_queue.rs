//! In-process queue manager with syncpoint semantics.
//!
//! Useful for:
//! - Unit and integration testing without a broker
//! - Embedding the relay in a single process
//!
//! Gets are provisional until commit; puts are buffered until commit; a
//! backout returns gotten messages to the head of their queue with the
//! backout count incremented. Every session operation is appended to a
//! journal that tests can inspect, and failures can be injected.

use crate::error::{RelayError, RelayResult};
use crate::queue::{QueueManager, ReceiveOutcome, SourceMessage, TransactionalSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// One recorded session operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connected { slot: usize },
    Received { slot: usize, message_id: String },
    Committed { slot: usize, message_ids: Vec<String> },
    BackedOut { slot: usize, message_ids: Vec<String> },
    Forwarded { slot: usize, queue: String, message_id: String },
    Closed { slot: usize },
    /// Session dropped without `close`; its gets went back to the queue.
    Abandoned { slot: usize, message_ids: Vec<String> },
}

/// A failure to inject into the next matching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Connect,
    /// Refuse the connect for one slot only.
    ConnectSlot(usize),
    Receive,
    Commit,
    Backout,
    Forward,
    Close,
}

#[derive(Default)]
struct Broker {
    queues: HashMap<String, VecDeque<SourceMessage>>,
    journal: Vec<Operation>,
    faults: Vec<Fault>,
    next_id: u64,
    open_sessions: usize,
}

impl Broker {
    /// Put gotten messages back at the head of `queue`, in their original
    /// order, with the backout count incremented.
    fn restore(&mut self, queue: &str, gets: Vec<SourceMessage>) {
        let queue = self.queues.entry(queue.to_string()).or_default();
        for mut message in gets.into_iter().rev() {
            message.backout_count += 1;
            queue.push_front(message);
        }
    }

    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(pos) => {
                self.faults.remove(pos);
                true
            }
            None => false,
        }
    }
}

struct Shared {
    broker: Mutex<Broker>,
    arrivals: Notify,
}

/// In-memory queue manager.
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct InMemoryQueueManager {
    queue_name: String,
    shared: Arc<Shared>,
}

impl InMemoryQueueManager {
    /// Create a queue manager whose sessions read from `queue_name`.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            shared: Arc::new(Shared {
                broker: Mutex::new(Broker::default()),
                arrivals: Notify::new(),
            }),
        }
    }

    /// The queue sessions read from.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Put a message outside of any transaction. Returns its id.
    pub fn put(&self, queue: &str, payload: impl Into<Vec<u8>>) -> String {
        let message_id = {
            let mut broker = self.shared.broker.lock();
            broker.next_id += 1;
            // 24 bytes in hex, unique across queue manager instances.
            let message_id = format!("{}{:016x}", Uuid::new_v4().simple(), broker.next_id);
            broker
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(SourceMessage {
                    message_id: message_id.clone(),
                    payload: payload.into(),
                    backout_count: 0,
                });
            message_id
        };
        self.shared.arrivals.notify_waiters();
        message_id
    }

    /// Put a message on the source queue.
    pub fn put_source(&self, payload: impl Into<Vec<u8>>) -> String {
        let queue = self.queue_name.clone();
        self.put(&queue, payload)
    }

    /// Number of visible messages on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.shared
            .broker
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Snapshot of the visible messages on `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<SourceMessage> {
        self.shared
            .broker
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All session operations so far, in order.
    pub fn journal(&self) -> Vec<Operation> {
        self.shared.broker.lock().journal.clone()
    }

    /// Number of commits recorded.
    pub fn commit_count(&self) -> usize {
        self.count(|op| matches!(op, Operation::Committed { .. }))
    }

    /// Number of backouts recorded.
    pub fn backout_count(&self) -> usize {
        self.count(|op| matches!(op, Operation::BackedOut { .. }))
    }

    /// Number of sessions connected and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.shared.broker.lock().open_sessions
    }

    /// Make the next operation of this kind fail.
    pub fn inject(&self, fault: Fault) {
        self.shared.broker.lock().faults.push(fault);
        if fault == Fault::Receive {
            self.shared.arrivals.notify_waiters();
        }
    }

    fn count(&self, pred: impl Fn(&Operation) -> bool) -> usize {
        self.shared.broker.lock().journal.iter().filter(|op| pred(op)).count()
    }
}

#[async_trait]
impl QueueManager for InMemoryQueueManager {
    type Session = InMemorySession;

    async fn connect(&self, slot: usize) -> RelayResult<InMemorySession> {
        let mut broker = self.shared.broker.lock();
        if broker.take_fault(Fault::Connect) || broker.take_fault(Fault::ConnectSlot(slot)) {
            return Err(RelayError::Session(format!(
                "connection refused for slot {}",
                slot
            )));
        }
        broker.open_sessions += 1;
        broker.journal.push(Operation::Connected { slot });
        debug!(slot, queue = %self.queue_name, "In-memory session connected");

        Ok(InMemorySession {
            slot,
            queue_name: self.queue_name.clone(),
            shared: self.shared.clone(),
            gets: Vec::new(),
            puts: Vec::new(),
            closed: false,
        })
    }
}

/// Session against an [`InMemoryQueueManager`].
pub struct InMemorySession {
    slot: usize,
    queue_name: String,
    shared: Arc<Shared>,
    gets: Vec<SourceMessage>,
    puts: Vec<(String, SourceMessage)>,
    closed: bool,
}

impl InMemorySession {
    fn in_transaction(&self) -> bool {
        !self.gets.is_empty() || !self.puts.is_empty()
    }

    fn message_ids(&self) -> Vec<String> {
        self.gets.iter().map(|m| m.message_id.clone()).collect()
    }
}

#[async_trait]
impl TransactionalSession for InMemorySession {
    async fn receive(&mut self, wait: Duration) -> ReceiveOutcome {
        if self.in_transaction() {
            return ReceiveOutcome::Fatal(RelayError::Transaction(
                "receive issued while a transaction is open".to_string(),
            ));
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.shared.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut broker = self.shared.broker.lock();
                if broker.take_fault(Fault::Receive) {
                    return ReceiveOutcome::Fatal(RelayError::Session(
                        "connection broken".to_string(),
                    ));
                }
                if let Some(message) = broker
                    .queues
                    .get_mut(&self.queue_name)
                    .and_then(VecDeque::pop_front)
                {
                    broker.journal.push(Operation::Received {
                        slot: self.slot,
                        message_id: message.message_id.clone(),
                    });
                    self.gets.push(message.clone());
                    return ReceiveOutcome::Message(message);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return ReceiveOutcome::NoMessage;
            }
        }
    }

    async fn commit(&mut self) -> RelayResult<()> {
        let message_ids = self.message_ids();
        let gets = std::mem::take(&mut self.gets);
        let puts = std::mem::take(&mut self.puts);

        let forwarded = !puts.is_empty();
        {
            let mut broker = self.shared.broker.lock();
            if broker.take_fault(Fault::Commit) {
                // A failed commit rolls the unit of work back.
                broker.restore(&self.queue_name, gets);
                drop(broker);
                self.shared.arrivals.notify_waiters();
                return Err(RelayError::Transaction(format!(
                    "commit failed for {:?}",
                    message_ids
                )));
            }
            for (queue, message) in puts {
                broker.queues.entry(queue).or_default().push_back(message);
            }
            broker.journal.push(Operation::Committed {
                slot: self.slot,
                message_ids,
            });
        }
        if forwarded {
            self.shared.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn backout(&mut self) -> RelayResult<()> {
        let message_ids = self.message_ids();
        let gets = std::mem::take(&mut self.gets);
        self.puts.clear();

        {
            let mut broker = self.shared.broker.lock();
            let failed = broker.take_fault(Fault::Backout);

            // Even a failed backout leaves the messages recoverable.
            broker.restore(&self.queue_name, gets);

            if failed {
                drop(broker);
                self.shared.arrivals.notify_waiters();
                return Err(RelayError::Transaction(format!(
                    "backout failed for {:?}",
                    message_ids
                )));
            }
            broker.journal.push(Operation::BackedOut {
                slot: self.slot,
                message_ids,
            });
        }
        self.shared.arrivals.notify_waiters();
        Ok(())
    }

    async fn forward(&mut self, queue: &str, message: &SourceMessage) -> RelayResult<()> {
        if self.gets.is_empty() {
            return Err(RelayError::Transaction(
                "forward issued outside a transaction".to_string(),
            ));
        }
        let mut broker = self.shared.broker.lock();
        if broker.take_fault(Fault::Forward) {
            return Err(RelayError::Transaction(format!(
                "put to {} failed for {}",
                queue, message.message_id
            )));
        }
        self.puts.push((queue.to_string(), message.clone()));
        broker.journal.push(Operation::Forwarded {
            slot: self.slot,
            queue: queue.to_string(),
            message_id: message.message_id.clone(),
        });
        Ok(())
    }

    async fn close(mut self) -> RelayResult<()> {
        if self.in_transaction() {
            self.backout().await?;
        }

        let mut broker = self.shared.broker.lock();
        broker.open_sessions = broker.open_sessions.saturating_sub(1);
        self.closed = true;
        if broker.take_fault(Fault::Close) {
            return Err(RelayError::Session(format!(
                "disconnect failed for slot {}",
                self.slot
            )));
        }
        broker.journal.push(Operation::Closed { slot: self.slot });
        Ok(())
    }
}

/// A session dropped without `close` (aborted task, panic) behaves like a
/// broken connection: the queue manager backs out whatever it had open.
impl Drop for InMemorySession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        let message_ids = self.message_ids();
        let gets = std::mem::take(&mut self.gets);
        self.puts.clear();

        {
            let mut broker = self.shared.broker.lock();
            broker.open_sessions = broker.open_sessions.saturating_sub(1);
            broker.restore(&self.queue_name, gets);
            broker.journal.push(Operation::Abandoned {
                slot: self.slot,
                message_ids,
            });
        }
        debug!(slot = self.slot, "In-memory session dropped without close");
        self.shared.arrivals.notify_waiters();
    }
}
