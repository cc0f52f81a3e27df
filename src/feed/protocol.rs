//! Upstream feed wire protocol.
//!
//! The feed is a message-oriented duplex connection: the client authenticates,
//! then subscribes to a named stream; the server pushes control frames and
//! batches of raw events. Messages are JSON text frames with a `type`
//! discriminator. Anything with an unrecognized `type` is ignored.

use serde::{Deserialize, Serialize};

/// Auth handshake, sent first after the transport connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMessage {
    #[serde(rename = "type")]
    pub msg_type: String, // "auth"
    #[serde(rename = "apiKey")]
    pub api_key: String,
}

impl AuthMessage {
    pub fn new(api_key: &str) -> Self {
        Self {
            msg_type: "auth".to_string(),
            api_key: api_key.to_string(),
        }
    }
}

/// Stream subscription, sent after the server acknowledges auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeMessage {
    #[serde(rename = "type")]
    pub msg_type: String, // "subscribe"
    pub subscription: SubscriptionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub stream: String,
}

impl SubscribeMessage {
    pub fn new(stream: &str) -> Self {
        Self {
            msg_type: "subscribe".to_string(),
            subscription: SubscriptionSpec {
                stream: stream.to_string(),
            },
        }
    }
}

/// Application-level keepalive frames. The server times out connections that
/// leave its pings unanswered, so pong replies must go out before any other
/// work on the message that carried the ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveMessage {
    #[serde(rename = "type")]
    pub msg_type: String, // "ping" | "pong"
}

impl KeepaliveMessage {
    pub fn ping() -> Self {
        Self {
            msg_type: "ping".to_string(),
        }
    }

    pub fn pong() -> Self {
        Self {
            msg_type: "pong".to_string(),
        }
    }
}

/// One raw event as embedded in a data frame. Only the fields the normalizer
/// extracts are modeled; everything is optional so a partial payload parses
/// and fails validation instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEvent {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub trade_id: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub size: Option<f64>,
    /// Provider event time, epoch millis (not receipt time).
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub fee: Option<f64>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
}

/// Envelope for every inbound frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Vec<FeedEvent>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Classified inbound message, ready for the manager's dispatch loop.
#[derive(Debug)]
pub enum ServerMessage {
    Connected,
    SubscriptionAck,
    Ping,
    Pong,
    Error(String),
    Data(Vec<FeedEvent>),
    Ignored(String),
}

impl ServerMessage {
    /// Classify a parsed envelope. `stream` is the subscribed stream name;
    /// data frames arrive typed with it.
    pub fn classify(envelope: ServerEnvelope, stream: &str) -> Self {
        match envelope.msg_type.as_str() {
            "connected" => ServerMessage::Connected,
            "subscriptionAck" => ServerMessage::SubscriptionAck,
            "ping" => ServerMessage::Ping,
            "pong" => ServerMessage::Pong,
            "error" => ServerMessage::Error(
                envelope.message.unwrap_or_else(|| "unspecified".to_string()),
            ),
            t if t == stream => ServerMessage::Data(envelope.data),
            other => ServerMessage::Ignored(other.to_string()),
        }
    }
}
