//! Raw feed event → canonical trade record.
//!
//! Stateless. Anything that fails validation is rejected here, once, and the
//! caller counts it; rejected events are never retried.

use sha2::{Digest, Sha256};

use crate::feed::protocol::FeedEvent;
use crate::models::{Side, TradeRecord};

/// Normalize one raw event. Returns `None` when the event is missing required
/// fields or violates the price/size invariant.
pub fn normalize(event: &FeedEvent, received_at_ms: i64) -> Option<TradeRecord> {
    let wallet = non_empty(event.user.as_deref())?;
    let symbol = non_empty(event.symbol.as_deref())?;
    let side = Side::parse(event.side.as_deref()?)?;

    let price = event.price.filter(|p| p.is_finite() && *p > 0.0)?;
    let size = event.size.filter(|s| s.is_finite() && *s > 0.0)?;

    let event_time_ms = event.time.unwrap_or(received_at_ms);

    Some(TradeRecord {
        id: derive_id(event, received_at_ms),
        content_hash: derive_content_hash(event, &wallet, event_time_ms),
        wallet,
        symbol,
        price,
        size,
        side,
        event_time_ms,
        notional: price * size,
        fee: event.fee.unwrap_or(0.0),
        realized_pnl: event.realized_pnl.unwrap_or(0.0),
    })
}

/// Record id: provider order/trade identifiers when available. The provider
/// does not guarantee those are globally unique across reconnects, so the
/// arrival time is appended when either half is missing.
fn derive_id(event: &FeedEvent, received_at_ms: i64) -> String {
    match (event.order_id.as_deref(), event.trade_id.as_deref()) {
        (Some(oid), Some(tid)) => format!("{}-{}", oid, tid),
        (Some(oid), None) => format!("{}-{}", oid, received_at_ms),
        (None, Some(tid)) => format!("{}-{}", tid, received_at_ms),
        (None, None) => format!("evt-{}", received_at_ms),
    }
}

/// Dedup key for durable writes. The provider tx hash is used verbatim when
/// present; otherwise a SHA-256 over the identifying fields stands in.
fn derive_content_hash(event: &FeedEvent, wallet: &str, event_time_ms: i64) -> String {
    if let Some(tx) = non_empty(event.tx_hash.as_deref()) {
        return tx;
    }

    let mut hasher = Sha256::new();
    hasher.update(event.order_id.as_deref().unwrap_or(""));
    hasher.update(b":");
    hasher.update(event.trade_id.as_deref().unwrap_or(""));
    hasher.update(b":");
    hasher.update(wallet);
    hasher.update(b":");
    hasher.update(event_time_ms.to_le_bytes());
    hex::encode(hasher.finalize())
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
