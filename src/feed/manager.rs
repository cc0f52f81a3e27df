//! Upstream feed connection manager.
//!
//! Owns the single outbound connection to the feed provider: auth handshake,
//! stream subscription, message receipt, liveness checks, and
//! reconnect-with-backoff. Exactly one run loop exists per process (the
//! runtime spawns it once), so "connect" is mutually exclusive with itself by
//! construction and no two upstream connections are ever live at the same
//! time.
//!
//! Messages are processed strictly in arrival order; the buffer's ordering
//! reflects provider delivery order. Every transport or protocol error is
//! non-fatal and only drives reconnection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::feed::buffer::TradeBuffer;
use crate::feed::normalizer::normalize;
use crate::feed::protocol::{
    AuthMessage, FeedEvent, KeepaliveMessage, ServerEnvelope, ServerMessage, SubscribeMessage,
};
use crate::feed::session::{reconnect_delay, FeedHealth, FeedState, StaleMonitor};
use crate::feed::writer::BatchWriter;
use crate::models::{Config, TradeRecord};

/// Control messages delivered to the run loop.
#[derive(Debug)]
pub enum FeedCommand {
    /// Tear down the current transport (or in-flight connect) and go through
    /// the normal disconnect/backoff path.
    Reconnect,
    /// Terminal: close the transport and stop. No reconnect follows.
    Shutdown,
}

/// Why a streaming session ended.
enum StreamEnd {
    /// Transport closed or errored; reconnect after backoff.
    Closed,
    /// Operator or stale-monitor requested teardown; same path as Closed.
    ForceReconnect,
    /// Process shutdown.
    Shutdown,
}

pub struct FeedManager {
    config: Config,
    buffer: Arc<TradeBuffer>,
    health: Arc<FeedHealth>,
    writer: Arc<BatchWriter>,
    live_tx: broadcast::Sender<TradeRecord>,
    cmd_tx: mpsc::Sender<FeedCommand>,
}

impl FeedManager {
    /// Spawn the run loop and return a handle for control operations.
    pub fn spawn(
        config: Config,
        buffer: Arc<TradeBuffer>,
        health: Arc<FeedHealth>,
        writer: Arc<BatchWriter>,
        live_tx: broadcast::Sender<TradeRecord>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<FeedCommand>(16);

        let manager = Arc::new(Self {
            config,
            buffer,
            health,
            writer,
            live_tx,
            cmd_tx,
        });

        let worker = manager.clone();
        tokio::spawn(async move {
            worker.run(cmd_rx).await;
        });

        manager
    }

    /// Tear down the current transport without waiting for a close event.
    /// Non-blocking; used by the admin endpoint and the stale monitor.
    pub fn force_reconnect(&self) {
        let _ = self.cmd_tx.try_send(FeedCommand::Reconnect);
    }

    /// Request terminal shutdown of the run loop.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(FeedCommand::Shutdown).await;
    }

    async fn run(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<FeedCommand>) {
        let base = Duration::from_secs(self.config.reconnect_base_secs);
        let max = Duration::from_secs(self.config.reconnect_max_secs);

        loop {
            if self.health.state() == FeedState::ShuttingDown {
                break;
            }

            self.health.set_state(FeedState::Connecting);

            match self.connect_and_stream(&mut cmd_rx).await {
                Ok(StreamEnd::Shutdown) => {
                    self.health.set_state(FeedState::ShuttingDown);
                    break;
                }
                Ok(StreamEnd::ForceReconnect) => {
                    let attempts = self.health.record_disconnect();
                    let delay = reconnect_delay(base, max, attempts);
                    warn!(attempts, delay_ms = delay.as_millis() as u64, "forced reconnect");
                    if self.wait_backoff(&mut cmd_rx, delay).await {
                        break;
                    }
                }
                Ok(StreamEnd::Closed) => {
                    let attempts = self.health.record_disconnect();
                    let delay = reconnect_delay(base, max, attempts);
                    warn!(
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "feed connection closed, reconnecting"
                    );
                    if self.wait_backoff(&mut cmd_rx, delay).await {
                        break;
                    }
                }
                Err(e) => {
                    let attempts = self.health.record_disconnect();
                    let delay = reconnect_delay(base, max, attempts);
                    error!(
                        error = %e,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "feed connection error, reconnecting"
                    );
                    if self.wait_backoff(&mut cmd_rx, delay).await {
                        break;
                    }
                }
            }
        }

        self.health.set_state(FeedState::ShuttingDown);
        info!("feed manager stopped");
    }

    /// Sleep out the backoff delay, still answering control messages.
    /// Returns true when shutdown was requested. A reconnect command while
    /// already disconnected just skips the rest of the delay.
    async fn wait_backoff(&self, cmd_rx: &mut mpsc::Receiver<FeedCommand>, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            cmd = cmd_rx.recv() => matches!(cmd, Some(FeedCommand::Shutdown) | None),
        }
    }

    /// One connection lifetime: connect, authenticate, subscribe, stream.
    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::Receiver<FeedCommand>,
    ) -> Result<StreamEnd> {
        info!(url = %self.config.feed_url, "connecting to feed");

        // A control message during the dial cancels the in-flight attempt by
        // dropping the future.
        let connect = connect_async(self.config.feed_url.as_str());
        tokio::pin!(connect);
        let (ws_stream, response) = tokio::select! {
            res = &mut connect => res.context("failed to connect to feed")?,
            cmd = cmd_rx.recv() => {
                return Ok(match cmd {
                    Some(FeedCommand::Reconnect) => StreamEnd::ForceReconnect,
                    Some(FeedCommand::Shutdown) | None => StreamEnd::Shutdown,
                });
            }
        };

        info!(status = %response.status(), "feed transport connected");
        self.health.set_state(FeedState::Authenticating);

        let (mut write, mut read) = ws_stream.split();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut last_sent_ms = now_ms;

        send_json(
            &mut write,
            &AuthMessage::new(self.config.feed_api_key.as_deref().unwrap_or_default()),
        )
        .await?;

        // Proactive half-open detection: app-level ping when nothing has been
        // sent recently. Separate, slower timer drives the stale check.
        let ping_every = Duration::from_secs(self.config.ping_interval_secs);
        let mut ping_timer = interval(ping_every);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping_timer.tick().await;

        let stale_threshold = Duration::from_secs(self.config.stale_threshold_secs);
        let mut stale_timer = interval(Duration::from_secs(self.config.health_check_secs));
        stale_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        stale_timer.tick().await;
        let mut stale_monitor = StaleMonitor::new();

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    let now = chrono::Utc::now().timestamp_millis();
                    if now - last_sent_ms >= ping_every.as_millis() as i64 {
                        send_json(&mut write, &KeepaliveMessage::ping()).await?;
                        last_sent_ms = now;
                        debug!("sent keepalive ping");
                    }
                }

                _ = stale_timer.tick() => {
                    let now = chrono::Utc::now().timestamp_millis();
                    if stale_monitor.should_force_reconnect(&self.health, now, stale_threshold) {
                        warn!(
                            threshold_secs = stale_threshold.as_secs(),
                            "no feed messages within stale threshold, forcing reconnect"
                        );
                        return Ok(StreamEnd::ForceReconnect);
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(FeedCommand::Reconnect) => {
                            info!("reconnect requested, tearing down transport");
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(StreamEnd::ForceReconnect);
                        }
                        Some(FeedCommand::Shutdown) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(StreamEnd::Shutdown);
                        }
                    }
                }

                msg = read.next() => {
                    let Some(msg) = msg else {
                        info!("feed stream ended");
                        return Ok(StreamEnd::Closed);
                    };

                    match msg {
                        Ok(Message::Text(text)) => {
                            self.handle_frame(&mut write, &text, &mut last_sent_ms).await?;
                        }
                        Ok(Message::Ping(payload)) => {
                            write
                                .send(Message::Pong(payload))
                                .await
                                .context("failed to send transport pong")?;
                        }
                        Ok(Message::Close(frame)) => {
                            info!(?frame, "feed closed by server");
                            return Ok(StreamEnd::Closed);
                        }
                        Ok(Message::Binary(data)) => {
                            debug!(bytes = data.len(), "ignoring binary feed frame");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(e).context("feed read error");
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one inbound text frame. A `ping` is answered before anything
    /// else happens; the provider times out connections with late pongs.
    async fn handle_frame<S>(
        &self,
        write: &mut S,
        text: &str,
        last_sent_ms: &mut i64,
    ) -> Result<()>
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let now = chrono::Utc::now().timestamp_millis();
        self.health.record_message(now);

        let envelope: ServerEnvelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, frame = text.get(..200).unwrap_or(text), "unparseable feed frame");
                return Ok(());
            }
        };

        match ServerMessage::classify(envelope, &self.config.feed_stream) {
            ServerMessage::Ping => {
                send_json(write, &KeepaliveMessage::pong()).await?;
                *last_sent_ms = now;
            }
            ServerMessage::Pong => {
                debug!("keepalive pong received");
            }
            ServerMessage::Connected => {
                info!("feed auth accepted, subscribing");
                send_json(write, &SubscribeMessage::new(&self.config.feed_stream)).await?;
                *last_sent_ms = now;
            }
            ServerMessage::SubscriptionAck => {
                self.health.set_state(FeedState::Subscribed);
                info!(stream = %self.config.feed_stream, "feed subscription active");
            }
            ServerMessage::Error(message) => {
                warn!(%message, "feed error frame");
            }
            ServerMessage::Data(events) => {
                self.ingest_events(events, now);
            }
            ServerMessage::Ignored(msg_type) => {
                debug!(%msg_type, "ignoring feed frame");
            }
        }

        Ok(())
    }

    /// Normalize a data batch and publish the valid records: head of the
    /// history buffer, persistence queue, live broadcast. Invalid records are
    /// dropped and counted, never retried.
    fn ingest_events(&self, events: Vec<FeedEvent>, received_at_ms: i64) {
        let mut accepted = 0u64;
        let mut rejected = 0u64;

        for event in &events {
            match normalize(event, received_at_ms) {
                Some(record) => {
                    self.buffer.insert(record.clone());
                    self.writer.enqueue(record.clone());
                    // Lagging dashboard consumers are the broadcast channel's
                    // problem, never the ingest path's.
                    let _ = self.live_tx.send(record);
                    accepted += 1;
                }
                None => {
                    rejected += 1;
                    debug!(?event, "dropping invalid feed event");
                }
            }
        }

        self.health.record_records(accepted, rejected);
    }
}

async fn send_json<S, T>(write: &mut S, value: &T) -> Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    T: Serialize,
{
    let text = serde_json::to_string(value).context("failed to serialize feed message")?;
    write
        .send(Message::Text(text))
        .await
        .context("failed to send feed message")?;
    Ok(())
}
