//! Redis Streams queue manager.
//!
//! Maps the queue-manager model onto a stream and consumer group:
//!
//! | Queue manager     | Redis                                  |
//! |-------------------|----------------------------------------|
//! | queue             | stream key (`queue_name`)              |
//! | queue manager     | consumer group (`queue_manager`)       |
//! | session           | consumer `{channel}-{slot}-{instance}` |
//! | get under syncpoint | XREADGROUP COUNT 1 (entry enters PEL) |
//! | commit            | MULTI / XADD forwards / XACK / EXEC    |
//! | backout           | leave the entry pending                |
//! | backout count     | XPENDING delivery count - 1            |
//!
//! A session reads, in order: its own pending entries (backed-out
//! messages), then one entry left pending by another consumer for longer
//! than the claim idle time (XAUTOCLAIM), then new entries. Consumer names
//! carry a per-process instance id, so replicas sharing a channel name
//! never share a pending list, and entries orphaned by a crashed process
//! or a removed slot are taken over once they go idle.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::queue::{QueueManager, ReceiveOutcome, SourceMessage, TransactionalSession};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stream field holding the message body.
pub const PAYLOAD_FIELD: &str = "payload";
/// Field recording the original id on forwarded copies.
pub const ORIGINAL_ID_FIELD: &str = "original_id";
/// Field recording the backout count on forwarded copies.
pub const BACKOUT_COUNT_FIELD: &str = "backout_count";
/// XAUTOCLAIM cursor meaning "start of the pending list".
const CLAIM_START: &str = "0-0";

/// Queue manager backed by Redis Streams.
#[derive(Clone)]
pub struct RedisQueueManager {
    client: Client,
    config: RelayConfig,
    /// Distinguishes this process's consumers from other replicas'.
    instance: String,
}

impl RedisQueueManager {
    /// Create a queue manager from relay configuration.
    ///
    /// No connection is made until [`QueueManager::connect`].
    pub fn new(config: RelayConfig) -> RelayResult<Self> {
        let client = Client::open(config.redis_url()?.as_str())?;
        let mut instance = Uuid::new_v4().simple().to_string();
        instance.truncate(12);
        Ok(Self {
            client,
            config,
            instance,
        })
    }

    /// Consumer name used by the session in `slot`.
    pub fn consumer_for(&self, slot: usize) -> String {
        self.config.consumer_name(slot, &self.instance)
    }

    /// Ensure the consumer group exists, creating it if necessary.
    async fn ensure_consumer_group(&self, conn: &mut MultiplexedConnection) -> RelayResult<()> {
        // Start at 0 so messages queued before the first start are consumed.
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.queue_name)
            .arg(&self.config.queue_manager)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    queue = %self.config.queue_name,
                    queue_manager = %self.config.queue_manager,
                    "Created consumer group"
                );
                Ok(())
            }
            // BUSYGROUP means the group already exists
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(
                    queue = %self.config.queue_name,
                    queue_manager = %self.config.queue_manager,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl QueueManager for RedisQueueManager {
    type Session = RedisSession;

    async fn connect(&self, slot: usize) -> RelayResult<RedisSession> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                RelayError::Session(format!(
                    "failed to connect to {:?}: {}",
                    self.config.connection_name, e
                ))
            })?;

        self.ensure_consumer_group(&mut conn).await?;

        let consumer = self.consumer_for(slot);
        info!(
            slot,
            queue_manager = %self.config.queue_manager,
            queue = %self.config.queue_name,
            consumer = %consumer,
            "Opened queue"
        );

        Ok(RedisSession {
            conn,
            stream_key: self.config.queue_name.clone(),
            group: self.config.queue_manager.clone(),
            consumer,
            claim_idle: self.config.claim_idle,
            claim_cursor: CLAIM_START.to_string(),
            open: None,
        })
    }
}

/// An open transaction: one pending entry plus buffered forwards.
#[derive(Debug)]
struct OpenTransaction {
    message_id: String,
    forwards: Vec<(String, SourceMessage)>,
}

/// One consumer of the stream.
pub struct RedisSession {
    conn: MultiplexedConnection,
    stream_key: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
    claim_cursor: String,
    open: Option<OpenTransaction>,
}

impl RedisSession {
    /// Read one entry, from this consumer's history (`0`) or new (`>`).
    async fn read_one(
        &mut self,
        id: &str,
        block: Option<Duration>,
    ) -> RelayResult<Option<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(id);

        let value: Value = cmd.query_async(&mut self.conn).await?;
        parse_xreadgroup_response(value)
    }

    /// Take over one entry another consumer has left idle too long.
    ///
    /// Walks the group's pending list a step per call, wrapping around.
    async fn claim_one(&mut self) -> RelayResult<Option<StreamEntry>> {
        let value: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg(&self.claim_cursor)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut self.conn)
            .await?;

        let (cursor, entry) = parse_autoclaim_response(value)?;
        self.claim_cursor = cursor;

        if let Some(entry) = &entry {
            info!(
                message_id = %entry.message_id,
                consumer = %self.consumer,
                "Claimed idle pending message"
            );
        }
        Ok(entry)
    }

    /// Whether this consumer still owns any pending entry.
    async fn has_pending(&mut self) -> RelayResult<bool> {
        let value: Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(1)
            .arg(&self.consumer)
            .query_async(&mut self.conn)
            .await?;

        Ok(matches!(value, Value::Array(rows) if !rows.is_empty()))
    }

    /// Delivery count of a pending entry.
    async fn delivery_count(&mut self, message_id: &str) -> RelayResult<u64> {
        let value: Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(message_id)
            .arg(message_id)
            .arg(1)
            .arg(&self.consumer)
            .query_async(&mut self.conn)
            .await?;

        parse_delivery_count(value)
    }

    async fn acknowledge(&mut self, message_id: &str) -> RelayResult<()> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(message_id)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn next_entry(&mut self, wait: Duration) -> RelayResult<Option<(String, Vec<u8>)>> {
        loop {
            let mut entry = self.read_one("0", None).await?;
            if entry.is_none() {
                entry = self.claim_one().await?;
            }
            if entry.is_none() {
                entry = self.read_one(">", Some(wait)).await?;
            }

            match entry {
                None => return Ok(None),
                Some(StreamEntry {
                    message_id,
                    payload: Some(payload),
                }) => return Ok(Some((message_id, payload))),
                Some(StreamEntry {
                    message_id,
                    payload: None,
                }) => {
                    // Trimmed or deleted while pending; nothing left to deliver.
                    warn!(
                        message_id = %message_id,
                        consumer = %self.consumer,
                        "Discarding pending entry with no payload"
                    );
                    self.acknowledge(&message_id).await?;
                }
            }
        }
    }
}

#[async_trait]
impl TransactionalSession for RedisSession {
    async fn receive(&mut self, wait: Duration) -> ReceiveOutcome {
        if let Some(open) = &self.open {
            return ReceiveOutcome::Fatal(RelayError::Transaction(format!(
                "receive issued while {} is unresolved",
                open.message_id
            )));
        }

        let (message_id, payload) = match self.next_entry(wait).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return ReceiveOutcome::NoMessage,
            Err(e) => return ReceiveOutcome::Fatal(e),
        };

        let deliveries = match self.delivery_count(&message_id).await {
            Ok(count) => count,
            Err(e) => return ReceiveOutcome::Fatal(e),
        };

        debug!(
            message_id = %message_id,
            consumer = %self.consumer,
            deliveries,
            payload_len = payload.len(),
            "Read message from stream"
        );

        self.open = Some(OpenTransaction {
            message_id: message_id.clone(),
            forwards: Vec::new(),
        });

        ReceiveOutcome::Message(SourceMessage {
            message_id,
            payload,
            backout_count: deliveries.saturating_sub(1).min(u32::MAX as u64) as u32,
        })
    }

    async fn commit(&mut self) -> RelayResult<()> {
        let open = self.open.take().ok_or_else(|| {
            RelayError::Transaction("commit issued with no open transaction".to_string())
        })?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (queue, message) in &open.forwards {
            pipe.cmd("XADD")
                .arg(queue)
                .arg("*")
                .arg(PAYLOAD_FIELD)
                .arg(message.payload.as_slice())
                .arg(ORIGINAL_ID_FIELD)
                .arg(&message.message_id)
                .arg(BACKOUT_COUNT_FIELD)
                .arg(message.backout_count)
                .ignore();
        }
        pipe.cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&open.message_id)
            .ignore();

        let _: () = pipe.query_async(&mut self.conn).await.map_err(|e| {
            RelayError::Transaction(format!("commit of {} failed: {}", open.message_id, e))
        })?;

        debug!(message_id = %open.message_id, consumer = %self.consumer, "Committed");
        Ok(())
    }

    async fn backout(&mut self) -> RelayResult<()> {
        let open = self.open.take().ok_or_else(|| {
            RelayError::Transaction("backout issued with no open transaction".to_string())
        })?;

        // The entry stays in this consumer's PEL and is read again first.
        debug!(message_id = %open.message_id, consumer = %self.consumer, "Backed out");
        Ok(())
    }

    async fn forward(&mut self, queue: &str, message: &SourceMessage) -> RelayResult<()> {
        let open = self.open.as_mut().ok_or_else(|| {
            RelayError::Transaction("forward issued with no open transaction".to_string())
        })?;
        open.forwards.push((queue.to_string(), message.clone()));
        Ok(())
    }

    async fn close(mut self) -> RelayResult<()> {
        if self.open.is_some() {
            self.backout().await?;
        }

        // A consumer with nothing pending can go; one with backed-out
        // entries stays so they can be claimed once idle.
        match self.has_pending().await {
            Ok(false) => {
                let removed: RedisResult<i64> = redis::cmd("XGROUP")
                    .arg("DELCONSUMER")
                    .arg(&self.stream_key)
                    .arg(&self.group)
                    .arg(&self.consumer)
                    .query_async(&mut self.conn)
                    .await;
                if let Err(e) = removed {
                    warn!(consumer = %self.consumer, error = %e, "Failed to remove consumer");
                }
            }
            Ok(true) => {
                debug!(consumer = %self.consumer, "Leaving pending entries to be claimed")
            }
            Err(e) => {
                warn!(consumer = %self.consumer, error = %e, "Failed to inspect pending entries")
            }
        }

        info!(consumer = %self.consumer, "Closed queue");
        Ok(())
    }
}

/// One entry of an XREADGROUP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    message_id: String,
    /// `None` when the entry was deleted while pending.
    payload: Option<Vec<u8>>,
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(s) => Some(String::from_utf8_lossy(s).to_string()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse `[[stream_key, [[message_id, [field, value, ...]]]]]`.
fn parse_xreadgroup_response(value: Value) -> RelayResult<Option<StreamEntry>> {
    let streams = match value {
        Value::Array(streams) => streams,
        Value::Nil => return Ok(None),
        // RESP3 servers answer with a map keyed by stream.
        Value::Map(pairs) => pairs
            .into_iter()
            .map(|(k, v)| Value::Array(vec![k, v]))
            .collect(),
        other => {
            return Err(RelayError::Protocol(format!(
                "Unexpected XREADGROUP response type: {:?}",
                other
            )))
        }
    };

    let Some(stream) = streams.first() else {
        return Ok(None);
    };

    let stream = match stream {
        Value::Array(s) if s.len() >= 2 => s,
        _ => {
            return Err(RelayError::Protocol(
                "Expected [key, entries] for stream".to_string(),
            ))
        }
    };

    let entries = match &stream[1] {
        Value::Array(m) => m,
        _ => {
            return Err(RelayError::Protocol(
                "Expected array for stream entries".to_string(),
            ))
        }
    };

    entries.first().map(parse_entry).transpose()
}

/// Parse `[next_cursor, [[message_id, fields]], deleted_ids?]` from XAUTOCLAIM.
fn parse_autoclaim_response(value: Value) -> RelayResult<(String, Option<StreamEntry>)> {
    let parts = match value {
        Value::Array(parts) if parts.len() >= 2 => parts,
        other => {
            return Err(RelayError::Protocol(format!(
                "Unexpected XAUTOCLAIM response: {:?}",
                other
            )))
        }
    };

    let cursor = value_to_string(&parts[0]).ok_or_else(|| {
        RelayError::Protocol(format!("Expected string for claim cursor, got {:?}", parts[0]))
    })?;

    let entry = match &parts[1] {
        Value::Array(entries) => entries.first().map(parse_entry).transpose()?,
        Value::Nil => None,
        other => {
            return Err(RelayError::Protocol(format!(
                "Expected array of claimed entries, got {:?}",
                other
            )))
        }
    };

    Ok((cursor, entry))
}

/// Parse one `[message_id, [field, value, ...]]` stream entry.
fn parse_entry(entry: &Value) -> RelayResult<StreamEntry> {
    let entry = match entry {
        Value::Array(m) if m.len() >= 2 => m,
        _ => {
            return Err(RelayError::Protocol(
                "Expected [id, fields] for stream entry".to_string(),
            ))
        }
    };

    let message_id = value_to_string(&entry[0]).ok_or_else(|| {
        RelayError::Protocol(format!("Expected string for message ID, got {:?}", entry[0]))
    })?;

    let fields = match &entry[1] {
        Value::Array(f) => f,
        Value::Nil => {
            return Ok(StreamEntry {
                message_id,
                payload: None,
            })
        }
        _ => {
            return Err(RelayError::Protocol(
                "Expected array for entry fields".to_string(),
            ))
        }
    };

    let payload = fields
        .chunks_exact(2)
        .find(|pair| value_to_string(&pair[0]).as_deref() == Some(PAYLOAD_FIELD))
        .and_then(|pair| match &pair[1] {
            Value::BulkString(s) => Some(s.clone()),
            Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        })
        .ok_or_else(|| {
            RelayError::Protocol(format!(
                "Entry {} is missing the {} field",
                message_id, PAYLOAD_FIELD
            ))
        })?;

    Ok(StreamEntry {
        message_id,
        payload: Some(payload),
    })
}

/// Parse `[[id, consumer, idle_ms, deliveries]]` from extended XPENDING.
fn parse_delivery_count(value: Value) -> RelayResult<u64> {
    let rows = match value {
        Value::Array(rows) => rows,
        other => {
            return Err(RelayError::Protocol(format!(
                "Unexpected XPENDING response type: {:?}",
                other
            )))
        }
    };

    match rows.first() {
        Some(Value::Array(row)) if row.len() >= 4 => match &row[3] {
            Value::Int(count) if *count >= 0 => Ok(*count as u64),
            other => Err(RelayError::Protocol(format!(
                "Expected delivery count, got {:?}",
                other
            ))),
        },
        // Not pending any more; count as a first delivery.
        None => Ok(1),
        Some(other) => Err(RelayError::Protocol(format!(
            "Unexpected XPENDING row: {:?}",
            other
        ))),
    }
}
