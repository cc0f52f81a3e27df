//! Bounded in-memory history of recent trades, newest first.
//!
//! Single writer (the feed manager's receive path), unbounded concurrent
//! readers. Readers get copy-on-read snapshots so a slow caller is never
//! affected by concurrent inserts; the writer excludes readers only for the
//! push/evict itself. This is a cache of recent history, not an append log:
//! overflow evicts the oldest record.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::models::TradeRecord;

pub struct TradeBuffer {
    inner: RwLock<VecDeque<TradeRecord>>,
    capacity: usize,
}

impl TradeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(VecDeque::with_capacity(capacity.min(8192))),
            capacity: capacity.max(1),
        }
    }

    /// Insert at the head. Always succeeds; evicts the oldest record when the
    /// buffer is at capacity.
    pub fn insert(&self, record: TradeRecord) {
        let mut buf = self.inner.write();
        buf.push_front(record);
        while buf.len() > self.capacity {
            buf.pop_back();
        }
    }

    /// Up to `limit` most-recent records, newest first, as owned copies.
    pub fn snapshot(&self, limit: usize) -> Vec<TradeRecord> {
        let buf = self.inner.read();
        buf.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn record(id: u32) -> TradeRecord {
        TradeRecord {
            id: format!("r-{}", id),
            wallet: "0xwallet".to_string(),
            symbol: "BTC".to_string(),
            price: 100.0,
            size: 1.0,
            side: Side::Buy,
            event_time_ms: id as i64,
            notional: 100.0,
            fee: 0.0,
            realized_pnl: 0.0,
            content_hash: format!("hash-{}", id),
        }
    }

    #[test]
    fn test_newest_first_ordering() {
        let buffer = TradeBuffer::new(10);
        for i in 0..5 {
            buffer.insert(record(i));
        }

        let snap = buffer.snapshot(10);
        assert_eq!(snap.len(), 5);
        assert_eq!(snap[0].id, "r-4");
        assert_eq!(snap[4].id, "r-0");
    }

    #[test]
    fn test_capacity_never_exceeded_and_oldest_evicted() {
        let buffer = TradeBuffer::new(5000);
        for i in 0..5001 {
            buffer.insert(record(i));
            assert!(buffer.len() <= 5000);
        }

        assert_eq!(buffer.len(), 5000);
        let snap = buffer.snapshot(5000);
        assert_eq!(snap[0].id, "r-5000");
        // The very first insert is the one that fell off.
        assert_eq!(snap.last().unwrap().id, "r-1");
        assert!(!snap.iter().any(|r| r.id == "r-0"));
    }

    #[test]
    fn test_snapshot_limit_and_isolation() {
        let buffer = TradeBuffer::new(100);
        for i in 0..20 {
            buffer.insert(record(i));
        }

        let snap = buffer.snapshot(3);
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].id, "r-19");

        // Snapshots are copies: later inserts do not show up in them.
        buffer.insert(record(99));
        assert_eq!(snap[0].id, "r-19");
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let buffer = TradeBuffer::new(0);
        buffer.insert(record(1));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.capacity(), 1);
    }
}
