//! End-to-end ingestion pipeline tests.
//!
//! Drives the wire-protocol → normalizer → buffer/writer → durable-store
//! path the same way the feed manager's dispatch loop does, against a
//! temporary SQLite database, and verifies the dedup and ordering contracts
//! hold across the whole pipe.

use std::sync::Arc;
use std::time::Duration;

use tapewatch_backend::feed::buffer::TradeBuffer;
use tapewatch_backend::feed::normalizer::normalize;
use tapewatch_backend::feed::protocol::{ServerEnvelope, ServerMessage};
use tapewatch_backend::feed::writer::BatchWriter;
use tapewatch_backend::storage::TradeStore;

fn data_frame(order: &str, tx_hash: &str, price: f64, size: f64, time: i64) -> String {
    format!(
        r#"{{"type":"trades","data":[{{"orderId":"{order}","tradeId":"t-1","txHash":"{tx_hash}","user":"0x6031b6eed1c97e853c6e0f03ad3ce3529351f96d","symbol":"BTC","side":"BUY","price":{price},"size":{size},"time":{time}}}]}}"#
    )
}

/// Feed one wire frame through classification and normalization into the
/// buffer and pending write queue, as the manager's receive path does.
fn ingest(
    frame: &str,
    buffer: &TradeBuffer,
    writer: &BatchWriter,
    received_at_ms: i64,
) -> (u64, u64) {
    let envelope: ServerEnvelope = serde_json::from_str(frame).expect("parse frame");
    let ServerMessage::Data(events) = ServerMessage::classify(envelope, "trades") else {
        panic!("expected data frame");
    };

    let mut accepted = 0u64;
    let mut rejected = 0u64;
    for event in &events {
        match normalize(event, received_at_ms) {
            Some(record) => {
                buffer.insert(record.clone());
                writer.enqueue(record);
                accepted += 1;
            }
            None => rejected += 1,
        }
    }
    (accepted, rejected)
}

fn pipeline(db_path: &str) -> (Arc<TradeStore>, TradeBuffer, BatchWriter) {
    let store = Arc::new(TradeStore::new(db_path).expect("open store"));
    let buffer = TradeBuffer::new(100);
    let writer = BatchWriter::new(
        store.clone(),
        50,
        Duration::from_secs(1),
        50_000.0,
    );
    (store, buffer, writer)
}

#[tokio::test]
async fn test_frames_land_durable_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("trades.db");
    let (store, buffer, writer) = pipeline(db_path.to_str().unwrap());

    // Two frames describing the same logical event (same tx hash, different
    // provider order ids), plus one distinct event.
    let (a, _) = ingest(
        &data_frame("o-1", "0xabc", 60_000.0, 0.5, 1_000),
        &buffer,
        &writer,
        1_000,
    );
    let (b, _) = ingest(
        &data_frame("o-2", "0xabc", 60_000.0, 0.5, 1_000),
        &buffer,
        &writer,
        1_001,
    );
    let (c, _) = ingest(
        &data_frame("o-3", "0xdef", 61_000.0, 1.0, 2_000),
        &buffer,
        &writer,
        2_000,
    );
    assert_eq!((a, b, c), (1, 1, 1));

    // The buffer is a plain history; dedup happens only at persistence time.
    assert_eq!(buffer.len(), 3);
    assert_eq!(writer.queue_depth(), 3);

    let flushed = writer.flush().await;
    assert_eq!(flushed, 3);
    assert_eq!(writer.queue_depth(), 0);

    // Durably: exactly one row per content hash.
    assert_eq!(store.len(), 2);
    assert_eq!(store.total_trades_ever().unwrap(), 2);

    let recent = store.get_recent(10).expect("recent rows");
    assert_eq!(recent[0].content_hash, "0xdef");
    assert_eq!(recent[0].notional, 61_000.0);
}

#[tokio::test]
async fn test_invalid_events_never_reach_buffer_or_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("trades.db");
    let (store, buffer, writer) = pipeline(db_path.to_str().unwrap());

    let (accepted, rejected) = ingest(
        &data_frame("o-1", "0xaaa", 0.0, 1.0, 1_000),
        &buffer,
        &writer,
        1_000,
    );
    assert_eq!((accepted, rejected), (0, 1));

    let (accepted, rejected) = ingest(
        &data_frame("o-2", "0xbbb", 100.0, -3.0, 1_000),
        &buffer,
        &writer,
        1_000,
    );
    assert_eq!((accepted, rejected), (0, 1));

    assert!(buffer.is_empty());
    assert_eq!(writer.queue_depth(), 0);

    writer.flush().await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_retried_flush_is_idempotent_after_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("trades.db");

    {
        let (_store, buffer, writer) = pipeline(db_path.to_str().unwrap());
        ingest(
            &data_frame("o-1", "0xabc", 60_000.0, 0.5, 1_000),
            &buffer,
            &writer,
            1_000,
        );
        writer.flush().await;
    }

    // A replay of the same upstream event after restart is silently ignored.
    let (store, buffer, writer) = pipeline(db_path.to_str().unwrap());
    ingest(
        &data_frame("o-9", "0xabc", 60_000.0, 0.5, 1_000),
        &buffer,
        &writer,
        9_000,
    );
    writer.flush().await;

    assert_eq!(store.len(), 1);
    assert_eq!(store.total_trades_ever().unwrap(), 1);
}
