use serde::{Deserialize, Serialize};

/// Trade direction as reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// Parse the feed's side strings. Case-insensitive; providers disagree.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("buy") || s.eq_ignore_ascii_case("b") {
            Some(Side::Buy)
        } else if s.eq_ignore_ascii_case("sell") || s.eq_ignore_ascii_case("s") {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// One normalized market event. Immutable after construction; everything
/// downstream (buffer, writer, API) holds clones or shared references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: String,
    pub wallet: String,
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub event_time_ms: i64,
    /// price × size, computed at normalization time.
    pub notional: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    /// Dedup key for durable writes. Two records with equal content_hash are
    /// the same logical event.
    pub content_hash: String,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub feed_url: String,
    pub feed_api_key: Option<String>,
    pub feed_stream: String,
    pub database_path: String,
    pub port: u16,
    pub buffer_capacity: usize,
    pub write_batch_size: usize,
    pub flush_interval_secs: u64,
    pub flush_timeout_secs: u64,
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    pub stale_threshold_secs: u64,
    pub health_check_secs: u64,
    pub ping_interval_secs: u64,
    pub whale_min_usd: f64,
    pub trade_retention_days: i64,
    pub ws_replay_limit: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let feed_url = std::env::var("FEED_URL")
            .unwrap_or_else(|_| "wss://feed.tapewatch.io/ws".to_string());

        let feed_api_key = std::env::var("FEED_API_KEY").ok().filter(|k| {
            let k = k.trim();
            !k.is_empty() && k != "your_api_key_here"
        });

        let feed_stream =
            std::env::var("FEED_STREAM").unwrap_or_else(|_| "trades".to_string());

        let database_path = std::env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "./tapewatch_trades.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let buffer_capacity = std::env::var("BUFFER_CAPACITY")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);

        let write_batch_size = std::env::var("WRITE_BATCH_SIZE")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50);

        let flush_interval_secs = std::env::var("FLUSH_INTERVAL_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let flush_timeout_secs = std::env::var("FLUSH_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let reconnect_base_secs = std::env::var("RECONNECT_BASE_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let reconnect_max_secs = std::env::var("RECONNECT_MAX_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let stale_threshold_secs = std::env::var("STALE_THRESHOLD_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let health_check_secs = std::env::var("HEALTH_CHECK_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let ping_interval_secs = std::env::var("PING_INTERVAL_SECS")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .unwrap_or(15);

        let whale_min_usd = std::env::var("WHALE_MIN_USD")
            .unwrap_or_else(|_| "50000".to_string())
            .parse()
            .unwrap_or(50_000.0);

        let trade_retention_days = std::env::var("TRADE_RETENTION_DAYS")
            .unwrap_or_else(|_| "90".to_string())
            .parse()
            .unwrap_or(90);

        let ws_replay_limit = std::env::var("WS_REPLAY_LIMIT")
            .unwrap_or_else(|_| "200".to_string())
            .parse()
            .unwrap_or(200);

        Ok(Self {
            feed_url,
            feed_api_key,
            feed_stream,
            database_path,
            port,
            buffer_capacity,
            write_batch_size,
            flush_interval_secs,
            flush_timeout_secs,
            reconnect_base_secs,
            reconnect_max_secs,
            stale_threshold_secs,
            health_check_secs,
            ping_interval_secs,
            whale_min_usd,
            trade_retention_days,
            ws_replay_limit,
        })
    }
}
