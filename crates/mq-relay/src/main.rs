//! mq-relay binary entry point.
//!
//! Usage: mq-relay [--sink <url>] [--workers <n>] ...
//!
//! Every option can also be set through the environment variable named in
//! `--help`.

use clap::Parser;
use mq_relay::config::{self, BackoutPolicy, ContentMode, RelayConfig};
use mq_relay::logging::{self, LogConfig, LogFormat};
use mq_relay::{HttpSink, RedisQueueManager, Relay, RelayResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Relays queue messages to a CloudEvents sink, committing only on delivery.
#[derive(Parser, Debug)]
#[command(name = "mq-relay")]
#[command(about = "Transactional relay from a message queue to a CloudEvents HTTP sink")]
struct Args {
    /// Queue manager name.
    #[arg(long, env = "QUEUE_MANAGER", default_value = config::DEFAULT_QUEUE_MANAGER)]
    queue_manager: String,

    /// Server-connection channel name.
    #[arg(long, env = "CHANNEL_NAME", default_value = config::DEFAULT_CHANNEL_NAME)]
    channel_name: String,

    /// Connection name, host(port).
    #[arg(long, env = "CONNECTION_NAME", default_value = config::DEFAULT_CONNECTION_NAME)]
    connection_name: String,

    /// User id for authentication.
    #[arg(long, env = "USER_ID", default_value = config::DEFAULT_USER_ID)]
    user_id: String,

    /// Password for authentication.
    #[arg(long, env = "PASSWORD", default_value = config::DEFAULT_PASSWORD, hide_env_values = true, hide_default_value = true)]
    password: String,

    /// Source queue name.
    #[arg(long, env = "QUEUE_NAME", default_value = config::DEFAULT_QUEUE_NAME)]
    queue_name: String,

    /// CloudEvents type attribute.
    #[arg(long, env = "EVENT_TYPE", default_value = config::DEFAULT_EVENT_TYPE)]
    event_type: String,

    /// Where to sink events to.
    #[arg(long, env = "K_SINK", default_value = config::DEFAULT_SINK)]
    sink: String,

    /// Seconds one receive waits for a message.
    #[arg(long, env = "WAIT_INTERVAL_SECS", default_value = "10")]
    wait_secs: u64,

    /// Concurrent sessions, each with at most one delivery in flight.
    #[arg(long, env = "RELAY_WORKERS", default_value = "4")]
    workers: usize,

    /// Backout count at which a failing message is moved to the backout queue.
    #[arg(long, env = "BACKOUT_THRESHOLD", requires = "backout_queue")]
    backout_threshold: Option<u32>,

    /// Queue receiving messages past the backout threshold.
    #[arg(long, env = "BACKOUT_QUEUE")]
    backout_queue: Option<String>,

    /// CloudEvents HTTP content mode.
    #[arg(long, env = "CE_CONTENT_MODE", value_enum, default_value_t = ContentMode::Binary)]
    content_mode: ContentMode,

    /// Sink request timeout in seconds.
    #[arg(long, env = "SINK_TIMEOUT_SECS", default_value = "30")]
    sink_timeout_secs: u64,

    /// Seconds another consumer's pending message must be idle before it is taken over.
    #[arg(long, env = "CLAIM_IDLE_SECS", default_value = "60")]
    claim_idle_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins if set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Stderr log format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Also append JSON logs to this file.
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            queue_manager: self.queue_manager.clone(),
            channel_name: self.channel_name.clone(),
            connection_name: self.connection_name.clone(),
            user_id: self.user_id.clone(),
            password: self.password.clone(),
            queue_name: self.queue_name.clone(),
            event_type: self.event_type.clone(),
            sink: self.sink.clone(),
            wait_interval: Duration::from_secs(self.wait_secs),
            workers: self.workers,
            backout: BackoutPolicy {
                threshold: self.backout_threshold,
                backout_queue: self.backout_queue.clone(),
            },
            content_mode: self.content_mode,
            sink_timeout: Duration::from_secs(self.sink_timeout_secs),
            claim_idle: Duration::from_secs(self.claim_idle_secs),
        }
    }
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    let args = Args::parse();

    logging::init(&LogConfig {
        default_level: args.log_level.clone(),
        format: args.log_format,
        log_path: args.log_file.clone(),
    })?;

    info!("mq-relay starting...");

    let config = args.relay_config();
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e);
    }

    info!(
        queue_manager = %config.queue_manager,
        channel = %config.channel_name,
        connection = %config.connection_name,
        queue = %config.queue_name,
        event_type = %config.event_type,
        sink = %config.sink,
        workers = config.workers,
        wait_secs = config.wait_interval.as_secs(),
        backout_threshold = ?config.backout.threshold,
        backout_queue = ?config.backout.backout_queue,
        "Configuration loaded"
    );

    let sink = HttpSink::from_config(&config).inspect_err(|e| {
        error!(error = %e, "Failed to create sink client");
    })?;
    let queue_manager = RedisQueueManager::new(config.clone())?;
    let relay = Relay::new(&config, queue_manager, Arc::new(sink));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal, draining...");
        let _ = shutdown_tx.send(true);
    });

    match relay.run(shutdown_rx).await {
        Ok(stats) => {
            info!(
                committed = stats.committed,
                backed_out = stats.backed_out,
                "mq-relay stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Relay exited with error");
            Err(e)
        }
    }
}
