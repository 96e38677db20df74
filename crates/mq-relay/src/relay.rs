//! Relay loop orchestration.
//!
//! The relay connects one transactional session per worker slot and hands
//! each session to its own worker by value. A worker runs a strictly serial
//! pipeline on its session:
//!
//! ```text
//! receive (syncpoint) -> build envelope -> send to sink -> commit | backout
//! ```
//!
//! so no session ever has more than one open transaction, while the pool
//! size bounds how many deliveries are in flight at once.

use crate::config::{BackoutPolicy, RelayConfig};
use crate::envelope::EnvelopeBuilder;
use crate::error::{RelayError, RelayResult};
use crate::queue::{QueueManager, TransactionOutcome, TransactionalSession, UnitOfWork};
use crate::sink::EventSink;
use crate::stats::{RelayStats, StatsSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The relay coordinator.
pub struct Relay<Q: QueueManager> {
    queue_manager: Q,
    sink: Arc<dyn EventSink>,
    builder: EnvelopeBuilder,
    policy: BackoutPolicy,
    wait_interval: Duration,
    workers: usize,
    stats: Arc<RelayStats>,
}

impl<Q: QueueManager> Relay<Q> {
    /// Create a relay from validated configuration.
    pub fn new(config: &RelayConfig, queue_manager: Q, sink: Arc<dyn EventSink>) -> Self {
        Self {
            queue_manager,
            sink,
            builder: EnvelopeBuilder::from_config(config),
            policy: config.backout.clone(),
            wait_interval: config.wait_interval,
            workers: config.workers.max(1),
            stats: Arc::new(RelayStats::new()),
        }
    }

    /// Shared counters, live while the relay runs.
    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` turns true (or its sender is dropped) or a
    /// session fails fatally.
    ///
    /// On shutdown, workers stop receiving but finish the delivery they are
    /// on. Every session is closed before this returns. A fatal receive or a
    /// failed close is returned as an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RelayResult<StatsSnapshot> {
        info!(workers = self.workers, "Starting relay");

        let mut sessions = Vec::with_capacity(self.workers);
        for slot in 0..self.workers {
            match self.queue_manager.connect(slot).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    error!(slot, error = %e, "Failed to open session");
                    for session in sessions {
                        if let Err(close_err) = session.close().await {
                            warn!(error = %close_err, "Failed to close session after startup error");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for (slot, session) in sessions.into_iter().enumerate() {
            let worker = Worker {
                slot,
                sink: self.sink.clone(),
                builder: self.builder.clone(),
                policy: self.policy.clone(),
                wait_interval: self.wait_interval,
                stats: self.stats.clone(),
            };
            tasks.spawn(worker.run(session, stop_rx.clone()));
        }

        let mut stopping = false;
        if *shutdown.borrow_and_update() {
            stopping = true;
            let _ = stop_tx.send(true);
        }

        let mut fatal: Option<RelayError> = None;
        while !tasks.is_empty() {
            tokio::select! {
                changed = shutdown.changed(), if !stopping => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, draining in-flight deliveries");
                        stopping = true;
                        let _ = stop_tx.send(true);
                    }
                }
                Some(joined) = tasks.join_next() => {
                    let result = joined.unwrap_or_else(|e| {
                        Err(RelayError::Session(format!("worker task failed: {}", e)))
                    });
                    if let Err(e) = result {
                        if !stopping {
                            error!(error = %e, "Stopping relay after fatal error");
                            stopping = true;
                            let _ = stop_tx.send(true);
                        }
                        fatal.get_or_insert(e);
                    }
                }
            }
        }

        let snapshot = self.stats.snapshot();
        info!(
            received = snapshot.received,
            committed = snapshot.committed,
            backed_out = snapshot.backed_out,
            requeued = snapshot.requeued,
            resolve_failures = snapshot.resolve_failures,
            "Relay stopped"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(snapshot),
        }
    }
}

/// Owns nothing shared but the sink; its session is passed in by value.
struct Worker {
    slot: usize,
    sink: Arc<dyn EventSink>,
    builder: EnvelopeBuilder,
    policy: BackoutPolicy,
    wait_interval: Duration,
    stats: Arc<RelayStats>,
}

impl Worker {
    async fn run<S: TransactionalSession>(
        self,
        mut session: S,
        mut stop: watch::Receiver<bool>,
    ) -> RelayResult<()> {
        debug!(slot = self.slot, "Worker started");

        let outcome = self.pump(&mut session, &mut stop).await;
        let closed = session.close().await;

        match (outcome, closed) {
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(slot = self.slot, error = %close_err, "Failed to close session");
                }
                Err(e)
            }
            (Ok(()), Err(close_err)) => {
                error!(slot = self.slot, error = %close_err, "Failed to close session");
                Err(close_err)
            }
            (Ok(()), Ok(())) => {
                debug!(slot = self.slot, "Worker stopped");
                Ok(())
            }
        }
    }

    /// Receive and deliver until told to stop or the session breaks.
    async fn pump<S: TransactionalSession>(
        &self,
        session: &mut S,
        stop: &mut watch::Receiver<bool>,
    ) -> RelayResult<()> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            // Only the idle wait is abandoned on stop; deliveries always finish.
            let received = tokio::select! {
                _ = stop.changed() => return Ok(()),
                received = UnitOfWork::begin(&mut *session, self.wait_interval) => received,
            };

            let unit = match received {
                Ok(Some(unit)) => unit,
                Ok(None) => {
                    self.stats.record_empty_poll();
                    debug!(slot = self.slot, "No message available, polling again");
                    continue;
                }
                Err(e) => {
                    error!(slot = self.slot, error = %e, "Error retrieving message");
                    return Err(e);
                }
            };

            self.stats.record_received();
            self.deliver(unit).await;
        }
    }

    /// Send one message and close its unit of work.
    async fn deliver<S: TransactionalSession>(&self, unit: UnitOfWork<'_, S>) {
        let message = unit.message();
        let message_id = message.message_id.clone();
        let backout_count = message.backout_count;
        let event = self.builder.build(message);

        debug!(
            slot = self.slot,
            message_id = %message_id,
            backout_count,
            payload_len = event.data.len(),
            "Processing message"
        );

        let send_error = match self.sink.send(&event).await {
            Ok(()) => {
                match unit.resolve(TransactionOutcome::Commit).await {
                    Ok(_) => {
                        self.stats.record_committed();
                        info!(slot = self.slot, message_id = %message_id, "Message delivered");
                    }
                    Err(e) => {
                        self.stats.record_resolve_failure();
                        error!(
                            slot = self.slot,
                            message_id = %message_id,
                            error = %e,
                            "Can't commit transaction"
                        );
                    }
                }
                return;
            }
            Err(e) => e,
        };

        self.stats.record_sink_failure();

        if let Some(queue) = self.policy.requeue_target(backout_count) {
            warn!(
                slot = self.slot,
                message_id = %message_id,
                backout_count,
                backout_queue = %queue,
                error = %send_error,
                "Backout threshold reached, moving message to backout queue"
            );
            match unit.requeue(queue).await {
                Ok(_) => self.stats.record_requeued(),
                Err(e) => {
                    self.stats.record_resolve_failure();
                    error!(
                        slot = self.slot,
                        message_id = %message_id,
                        error = %e,
                        "Can't move message to backout queue"
                    );
                }
            }
            return;
        }

        warn!(
            slot = self.slot,
            message_id = %message_id,
            backout_count,
            error = %send_error,
            "Message send failed, backing out"
        );
        match unit.resolve(TransactionOutcome::Backout).await {
            Ok(_) => self.stats.record_backed_out(),
            Err(e) => {
                self.stats.record_resolve_failure();
                error!(
                    slot = self.slot,
                    message_id = %message_id,
                    error = %e,
                    "Can't backout failed transaction"
                );
            }
        }
    }
}
