//! Batch persistence writer.
//!
//! Sits between the hot receive path and the durable store: `enqueue` is
//! non-blocking and never fails, a timer-driven `flush` drains the pending
//! queue in idempotent batches. Failed batches go back to the *front* of the
//! queue (at-least-once delivery; the store dedups by content hash). The
//! queue has no hard cap, since dropping trade records silently is worse than
//! memory growth; its depth is exported as an operational metric.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::models::TradeRecord;
use crate::storage::TradeSink;

pub struct BatchWriter {
    pending: Mutex<VecDeque<TradeRecord>>,
    sink: Arc<dyn TradeSink>,
    // Only one flush may run at a time; timer ticks and burst-drain calls
    // that lose the race are no-ops.
    flushing: AtomicBool,
    batch_size: usize,
    flush_timeout: Duration,
    whale_min_usd: f64,
    whale_count: AtomicU64,
}

impl BatchWriter {
    pub fn new(
        sink: Arc<dyn TradeSink>,
        batch_size: usize,
        flush_timeout: Duration,
        whale_min_usd: f64,
    ) -> Self {
        Self {
            pending: Mutex::new(VecDeque::with_capacity(256)),
            sink,
            flushing: AtomicBool::new(false),
            batch_size: batch_size.max(1),
            flush_timeout,
            whale_min_usd,
            whale_count: AtomicU64::new(0),
        }
    }

    /// Append to the pending queue. Non-blocking; called from the receive
    /// path for every accepted record.
    pub fn enqueue(&self, record: TradeRecord) {
        if record.notional >= self.whale_min_usd {
            self.whale_count.fetch_add(1, Ordering::Relaxed);
            info!(
                wallet = %record.wallet,
                symbol = %record.symbol,
                side = record.side.as_str(),
                notional = record.notional,
                "whale trade observed"
            );
        }

        self.pending.lock().push_back(record);
    }

    pub fn queue_depth(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn whale_count(&self) -> u64 {
        self.whale_count.load(Ordering::Relaxed)
    }

    /// Drain up to one batch per write, repeating immediately while the queue
    /// is still above one batch, so bursts clear without waiting for the next
    /// timer tick. Returns how many records were handed to the store.
    ///
    /// A failed or timed-out batch is pushed back to the front of the queue
    /// in its original order and retried on the next cycle.
    pub async fn flush(&self) -> usize {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return 0;
        }

        let mut flushed = 0usize;
        loop {
            let batch: Vec<TradeRecord> = {
                let mut pending = self.pending.lock();
                let take = pending.len().min(self.batch_size);
                pending.drain(..take).collect()
            };

            if batch.is_empty() {
                break;
            }

            match tokio::time::timeout(self.flush_timeout, self.sink.store_batch(&batch)).await
            {
                Ok(Ok(inserted)) => {
                    flushed += batch.len();
                    debug!(batch = batch.len(), inserted, "flush batch stored");
                }
                Ok(Err(e)) => {
                    warn!(batch = batch.len(), error = %e, "flush failed, requeueing batch");
                    self.requeue_front(batch);
                    break;
                }
                Err(_) => {
                    warn!(
                        batch = batch.len(),
                        timeout_ms = self.flush_timeout.as_millis() as u64,
                        "flush timed out, requeueing batch"
                    );
                    self.requeue_front(batch);
                    break;
                }
            }

            if self.queue_depth() <= self.batch_size {
                break;
            }
        }

        self.flushing.store(false, Ordering::Release);
        flushed
    }

    /// Final drain at shutdown: keep flushing until the queue is empty or the
    /// store stops making progress.
    pub async fn drain_all(&self) -> usize {
        let mut total = 0usize;
        loop {
            let flushed = self.flush().await;
            total += flushed;
            if self.queue_depth() == 0 || flushed == 0 {
                break;
            }
        }
        total
    }

    fn requeue_front(&self, batch: Vec<TradeRecord>) {
        let mut pending = self.pending.lock();
        for record in batch.into_iter().rev() {
            pending.push_front(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn record(hash: &str, notional: f64) -> TradeRecord {
        TradeRecord {
            id: hash.to_string(),
            wallet: "0xwallet".to_string(),
            symbol: "SOL".to_string(),
            price: 1.0,
            size: notional,
            side: Side::Sell,
            event_time_ms: 1,
            notional,
            fee: 0.0,
            realized_pnl: 0.0,
            content_hash: hash.to_string(),
        }
    }

    /// Records batches; fails the first `fail_first` calls.
    struct RecordingSink {
        batches: Mutex<Vec<Vec<String>>>,
        fail_remaining: AtomicUsize,
    }

    impl RecordingSink {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail_remaining: AtomicUsize::new(fail_first),
            })
        }

        fn recorded(&self) -> Vec<Vec<String>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl TradeSink for RecordingSink {
        async fn store_batch(&self, records: &[TradeRecord]) -> Result<usize> {
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("durable store unavailable");
            }
            self.batches
                .lock()
                .push(records.iter().map(|r| r.content_hash.clone()).collect());
            Ok(records.len())
        }
    }

    /// Sleeps long enough to trip any reasonable flush timeout.
    struct SlowSink;

    #[async_trait]
    impl TradeSink for SlowSink {
        async fn store_batch(&self, _records: &[TradeRecord]) -> Result<usize> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(0)
        }
    }

    fn writer_with(sink: Arc<dyn TradeSink>, batch_size: usize) -> BatchWriter {
        BatchWriter::new(sink, batch_size, Duration::from_millis(200), 50_000.0)
    }

    #[tokio::test]
    async fn test_flush_drains_burst_past_batch_size() {
        let sink = RecordingSink::new(0);
        let writer = writer_with(sink.clone(), 50);

        for i in 0..120 {
            writer.enqueue(record(&format!("h-{}", i), 10.0));
        }

        // 120 pending: two full batches go out back to back; the remainder
        // (≤ one batch) waits for the next timer tick.
        let flushed = writer.flush().await;
        assert_eq!(flushed, 100);
        assert_eq!(writer.queue_depth(), 20);

        let flushed = writer.flush().await;
        assert_eq!(flushed, 20);
        assert_eq!(writer.queue_depth(), 0);

        let batches = sink.recorded();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 50);
        assert_eq!(batches[0][0], "h-0");
        assert_eq!(batches[2].len(), 20);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_at_front_in_order() {
        let sink = RecordingSink::new(1);
        let writer = writer_with(sink.clone(), 2);

        writer.enqueue(record("a", 10.0));
        writer.enqueue(record("b", 10.0));
        writer.enqueue(record("c", 10.0));

        // First attempt fails; nothing is lost and order is intact.
        assert_eq!(writer.flush().await, 0);
        assert_eq!(writer.queue_depth(), 3);

        assert_eq!(writer.flush().await, 2);
        assert_eq!(writer.flush().await, 1);

        let batches = sink.recorded();
        let expected = vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()],
        ];
        assert_eq!(batches, expected);
    }

    #[tokio::test]
    async fn test_store_timeout_counts_as_failure() {
        let writer = BatchWriter::new(
            Arc::new(SlowSink),
            10,
            Duration::from_millis(50),
            50_000.0,
        );
        writer.enqueue(record("a", 10.0));

        assert_eq!(writer.flush().await, 0);
        assert_eq!(writer.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_only_one_flush_runs_at_a_time() {
        let writer = Arc::new(BatchWriter::new(
            Arc::new(SlowSink),
            10,
            Duration::from_secs(5),
            50_000.0,
        ));
        writer.enqueue(record("a", 10.0));

        let slow = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The slow flush holds the guard; a concurrent call is a no-op.
        assert_eq!(writer.flush().await, 0);
        slow.abort();
    }

    #[tokio::test]
    async fn test_whale_trades_counted_but_written_normally() {
        let sink = RecordingSink::new(0);
        let writer = writer_with(sink.clone(), 10);

        writer.enqueue(record("small", 100.0));
        writer.enqueue(record("big", 75_000.0));

        assert_eq!(writer.whale_count(), 1);
        assert_eq!(writer.flush().await, 2);
        assert_eq!(sink.recorded()[0], vec!["small".to_string(), "big".to_string()]);
    }

    #[tokio::test]
    async fn test_drain_all_empties_queue() {
        let sink = RecordingSink::new(0);
        let writer = writer_with(sink.clone(), 10);
        for i in 0..35 {
            writer.enqueue(record(&format!("h-{}", i), 10.0));
        }

        assert_eq!(writer.drain_all().await, 35);
        assert_eq!(writer.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_drain_all_stops_when_store_is_down() {
        let sink = RecordingSink::new(usize::MAX);
        let writer = writer_with(sink, 10);
        writer.enqueue(record("a", 10.0));

        // Store keeps failing: drain gives up instead of hanging shutdown.
        assert_eq!(writer.drain_all().await, 0);
        assert_eq!(writer.queue_depth(), 1);
    }
}
