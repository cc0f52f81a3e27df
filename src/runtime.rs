//! Process-wide feed runtime.
//!
//! Wires the store, writer, buffer, health, and connection manager together,
//! exactly once per process, and owns the periodic flush and retention tasks.
//! The runtime is an explicit context object handed to every consumer (API
//! state, shutdown hook) rather than reached through hidden globals; the
//! `OnceLock` below only enforces that at most one instance is ever built.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::feed::buffer::TradeBuffer;
use crate::feed::manager::FeedManager;
use crate::feed::session::FeedHealth;
use crate::feed::writer::BatchWriter;
use crate::models::{Config, TradeRecord};
use crate::storage::TradeStore;

static INSTANCE: OnceLock<Arc<FeedRuntime>> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

pub struct FeedRuntime {
    pub config: Config,
    pub buffer: Arc<TradeBuffer>,
    pub health: Arc<FeedHealth>,
    pub writer: Arc<BatchWriter>,
    pub store: Arc<TradeStore>,
    pub manager: Arc<FeedManager>,
    live_tx: broadcast::Sender<TradeRecord>,
    shutting_down: Arc<AtomicBool>,
}

impl FeedRuntime {
    /// Return the process-wide instance, constructing and starting it on
    /// first use. Construction spawns the connection manager and the flush
    /// and retention timers.
    pub fn get_or_init(config: &Config) -> Result<Arc<Self>> {
        let _guard = INIT_LOCK.lock();
        if let Some(existing) = INSTANCE.get() {
            return Ok(existing.clone());
        }

        let runtime = Self::start(config.clone())?;
        let _ = INSTANCE.set(runtime.clone());
        Ok(runtime)
    }

    fn start(config: Config) -> Result<Arc<Self>> {
        let store = Arc::new(TradeStore::new(&config.database_path)?);
        let writer = Arc::new(BatchWriter::new(
            store.clone(),
            config.write_batch_size,
            Duration::from_secs(config.flush_timeout_secs),
            config.whale_min_usd,
        ));
        let buffer = Arc::new(TradeBuffer::new(config.buffer_capacity));
        let health = Arc::new(FeedHealth::new());
        let (live_tx, _) = broadcast::channel::<TradeRecord>(1024);
        let shutting_down = Arc::new(AtomicBool::new(false));

        if config.feed_api_key.is_none() {
            warn!("FEED_API_KEY not configured; upstream auth will be rejected and retried");
        }

        let manager = FeedManager::spawn(
            config.clone(),
            buffer.clone(),
            health.clone(),
            writer.clone(),
            live_tx.clone(),
        );

        tokio::spawn(flush_loop(
            writer.clone(),
            Duration::from_secs(config.flush_interval_secs),
            shutting_down.clone(),
        ));

        tokio::spawn(retention_loop(
            store.clone(),
            config.trade_retention_days,
            shutting_down.clone(),
        ));

        info!(
            buffer_capacity = config.buffer_capacity,
            batch_size = config.write_batch_size,
            "feed runtime started"
        );

        Ok(Arc::new(Self {
            config,
            buffer,
            health,
            writer,
            store,
            manager,
            live_tx,
            shutting_down,
        }))
    }

    /// Live record stream for push consumers.
    pub fn subscribe_live(&self) -> broadcast::Receiver<TradeRecord> {
        self.live_tx.subscribe()
    }

    /// Idempotent teardown: stop the timers, close the transport, and make a
    /// final attempt to drain the pending write queue.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("feed runtime shutting down");
        self.manager.shutdown().await;

        let drained = self.writer.drain_all().await;
        let remaining = self.writer.queue_depth();
        if remaining > 0 {
            warn!(drained, remaining, "final flush left records behind");
        } else {
            info!(drained, "final flush complete");
        }
    }
}

async fn flush_loop(writer: Arc<BatchWriter>, every: Duration, shutting_down: Arc<AtomicBool>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if shutting_down.load(Ordering::SeqCst) {
            break;
        }

        let flushed = writer.flush().await;
        if flushed > 0 {
            debug!(flushed, depth = writer.queue_depth(), "periodic flush");
        }
    }
}

async fn retention_loop(store: Arc<TradeStore>, retention_days: i64, shutting_down: Arc<AtomicBool>) {
    let mut ticker = interval(Duration::from_secs(86_400));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if shutting_down.load(Ordering::SeqCst) {
            break;
        }

        let cutoff_ms = chrono::Utc::now().timestamp_millis() - retention_days * 86_400_000;
        match store.prune_before(cutoff_ms) {
            Ok(deleted) if deleted > 0 => {
                info!(deleted, retention_days, "pruned aged trades");
                if let Err(e) = store.optimize() {
                    warn!(error = %e, "store optimize failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "trade prune failed"),
        }
    }
}
