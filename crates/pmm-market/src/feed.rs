//! Real-time WebSocket feeds.
//!
//! Two independent feeds run concurrently:
//!
//! - Market feed (public): subscribes by token id, receives "book" snapshots
//!   and "price_change" deltas.
//! - User feed (authenticated): subscribes by condition id, receives "trade"
//!   fills and "order" lifecycle events.
//!
//! Both auto-reconnect with exponential backoff (1s → 30s cap) and
//! re-subscribe to every tracked id on reconnection. A read-idle timeout of
//! ~2 missed keep-alives detects silent server failures. Parsed events fan
//! out into a bounded channel; if the consumer falls behind, events are
//! dropped with a warning — the periodic quote tick reconciles from
//! authoritative state on the next cycle.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use pmm_common::{
    WsAuth, WsBookEvent, WsOrderEvent, WsPriceChangeEvent, WsSubscribeMsg, WsTradeEvent,
    WsUpdateMsg,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// App-level keep-alive; the server expects a "PING" text frame.
const PING_INTERVAL: Duration = Duration::from_secs(50);
/// ~2 missed pings triggers a reconnect.
const READ_TIMEOUT: Duration = Duration::from_secs(90);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Event buffer sizes. Book traffic is much heavier than fill traffic.
const MARKET_BUFFER: usize = 256;
const USER_BUFFER: usize = 64;

/// Which CLOB WebSocket channel a feed is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedChannel {
    /// Public market data, subscribed by token id.
    Market,
    /// Authenticated user data, subscribed by condition id.
    User,
}

impl FeedChannel {
    fn as_str(&self) -> &'static str {
        match self {
            FeedChannel::Market => "market",
            FeedChannel::User => "user",
        }
    }
}

/// A parsed event from either feed.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Book(WsBookEvent),
    PriceChange(WsPriceChangeEvent),
    Trade(WsTradeEvent),
    Order(WsOrderEvent),
}

/// Errors from the feed task.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket: {0}")]
    WebSocket(#[from] WsError),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("read idle timeout")]
    ReadTimeout,

    #[error("stream ended")]
    StreamEnded,

    #[error("feed is already running")]
    AlreadyRunning,
}

struct SubscriptionCmd {
    operation: &'static str,
    ids: Vec<String>,
}

/// One WebSocket feed (market or user channel).
///
/// [`WsFeed::subscribe`] / [`WsFeed::unsubscribe`] may be called from any
/// task at any time, including before [`WsFeed::run`] is started or while
/// disconnected — the tracked-id set is replayed on every (re)connection.
pub struct WsFeed {
    url: String,
    channel: FeedChannel,
    auth: Option<WsAuth>,
    subscribed: RwLock<HashSet<String>>,
    cmd_tx: mpsc::UnboundedSender<SubscriptionCmd>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionCmd>>>,
    event_tx: mpsc::Sender<FeedMessage>,
}

impl WsFeed {
    /// Create a market-channel feed and its event receiver.
    pub fn market(url: impl Into<String>) -> (Self, mpsc::Receiver<FeedMessage>) {
        Self::new(url.into(), FeedChannel::Market, None, MARKET_BUFFER)
    }

    /// Create an authenticated user-channel feed and its event receiver.
    pub fn user(url: impl Into<String>, auth: WsAuth) -> (Self, mpsc::Receiver<FeedMessage>) {
        Self::new(url.into(), FeedChannel::User, Some(auth), USER_BUFFER)
    }

    fn new(
        url: String,
        channel: FeedChannel,
        auth: Option<WsAuth>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<FeedMessage>) {
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                url,
                channel,
                auth,
                subscribed: RwLock::new(HashSet::new()),
                cmd_tx,
                cmd_rx: Mutex::new(Some(cmd_rx)),
                event_tx,
            },
            event_rx,
        )
    }

    /// Track the given ids and ask the live connection (if any) to subscribe.
    pub fn subscribe(&self, ids: &[String]) {
        {
            let mut subscribed = self.subscribed.write();
            for id in ids {
                subscribed.insert(id.clone());
            }
        }
        let _ = self.cmd_tx.send(SubscriptionCmd {
            operation: "subscribe",
            ids: ids.to_vec(),
        });
    }

    /// Stop tracking the given ids and ask the live connection to unsubscribe.
    pub fn unsubscribe(&self, ids: &[String]) {
        {
            let mut subscribed = self.subscribed.write();
            for id in ids {
                subscribed.remove(id);
            }
        }
        let _ = self.cmd_tx.send(SubscriptionCmd {
            operation: "unsubscribe",
            ids: ids.to_vec(),
        });
    }

    /// Number of ids currently tracked.
    pub fn subscription_count(&self) -> usize {
        self.subscribed.read().len()
    }

    /// Connect and maintain the feed until shutdown. Reconnects with
    /// exponential backoff on any connection failure.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), FeedError> {
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .take()
            .ok_or(FeedError::AlreadyRunning)?;

        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.run_connection(&mut cmd_rx, &mut shutdown).await {
                Ok(()) => {
                    info!(channel = self.channel.as_str(), "feed shut down");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        channel = self.channel.as_str(),
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "websocket disconnected, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.recv() => return Ok(()),
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn run_connection(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<SubscriptionCmd>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), FeedError> {
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| FeedError::ConnectTimeout)??;
        let (mut sink, mut stream) = ws.split();

        self.send_initial_subscription(&mut sink).await?;
        info!(channel = self.channel.as_str(), "websocket connected");

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }

                Some(cmd) = cmd_rx.recv() => {
                    self.send_update(&mut sink, cmd).await?;
                }

                _ = ping.tick() => {
                    sink.send(Message::Text("PING".into())).await?;
                }

                next = tokio::time::timeout(READ_TIMEOUT, stream.next()) => {
                    match next {
                        Err(_) => return Err(FeedError::ReadTimeout),
                        Ok(None) => return Err(FeedError::StreamEnded),
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(Some(Ok(msg))) => self.handle_message(msg)?,
                    }
                }
            }
        }
    }

    async fn send_initial_subscription(
        &self,
        sink: &mut futures_util::stream::SplitSink<
            WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
            Message,
        >,
    ) -> Result<(), FeedError> {
        let ids: Vec<String> = self.subscribed.read().iter().cloned().collect();

        let msg = match self.channel {
            FeedChannel::Market => WsSubscribeMsg {
                auth: None,
                channel: self.channel.as_str().to_string(),
                markets: Vec::new(),
                asset_ids: ids,
            },
            FeedChannel::User => WsSubscribeMsg {
                auth: self.auth.clone(),
                channel: self.channel.as_str().to_string(),
                markets: ids,
                asset_ids: Vec::new(),
            },
        };

        let json = serde_json::to_string(&msg).unwrap_or_default();
        sink.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn send_update(
        &self,
        sink: &mut futures_util::stream::SplitSink<
            WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
            Message,
        >,
        cmd: SubscriptionCmd,
    ) -> Result<(), FeedError> {
        let msg = match self.channel {
            FeedChannel::Market => WsUpdateMsg {
                asset_ids: cmd.ids,
                markets: Vec::new(),
                operation: cmd.operation.to_string(),
            },
            FeedChannel::User => WsUpdateMsg {
                asset_ids: Vec::new(),
                markets: cmd.ids,
                operation: cmd.operation.to_string(),
            },
        };

        let json = serde_json::to_string(&msg).unwrap_or_default();
        sink.send(Message::Text(json.into())).await?;
        Ok(())
    }

    fn handle_message(&self, msg: Message) -> Result<(), FeedError> {
        match msg {
            Message::Text(text) => {
                let text: &str = text.as_ref();
                if text == "PONG" {
                    return Ok(());
                }
                self.dispatch(text);
                Ok(())
            }
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => Ok(()),
            Message::Close(_) => Err(FeedError::StreamEnded),
        }
    }

    fn dispatch(&self, text: &str) {
        #[derive(serde::Deserialize)]
        struct Envelope {
            #[serde(default)]
            event_type: String,
        }

        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(_) => {
                debug!(channel = self.channel.as_str(), "ignoring non-event message");
                return;
            }
        };

        let parsed = match envelope.event_type.as_str() {
            "book" => serde_json::from_str::<WsBookEvent>(text)
                .map(FeedMessage::Book)
                .map_err(|e| ("book", e)),
            "price_change" => serde_json::from_str::<WsPriceChangeEvent>(text)
                .map(FeedMessage::PriceChange)
                .map_err(|e| ("price_change", e)),
            "trade" => serde_json::from_str::<WsTradeEvent>(text)
                .map(FeedMessage::Trade)
                .map_err(|e| ("trade", e)),
            "order" => serde_json::from_str::<WsOrderEvent>(text)
                .map(FeedMessage::Order)
                .map_err(|e| ("order", e)),
            "last_trade_price" | "tick_size_change" | "best_bid_ask" | "new_market"
            | "market_resolved" => {
                debug!(event = %envelope.event_type, "ignoring informational event");
                return;
            }
            other => {
                debug!(event = other, "unknown ws event type");
                return;
            }
        };

        match parsed {
            Ok(event) => {
                if self.event_tx.try_send(event).is_err() {
                    warn!(
                        channel = self.channel.as_str(),
                        "feed event channel full, dropping event"
                    );
                }
            }
            Err((kind, e)) => {
                warn!(event = kind, error = %e, "failed to parse ws event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_set_tracks_ids() {
        let (feed, _rx) = WsFeed::market("wss://example.invalid/ws");
        feed.subscribe(&["a".into(), "b".into()]);
        assert_eq!(feed.subscription_count(), 2);

        feed.subscribe(&["b".into()]);
        assert_eq!(feed.subscription_count(), 2);

        feed.unsubscribe(&["a".into()]);
        assert_eq!(feed.subscription_count(), 1);
    }

    #[test]
    fn dispatch_routes_book_events() {
        let (feed, mut rx) = WsFeed::market("wss://example.invalid/ws");
        feed.dispatch(
            r#"{"event_type":"book","asset_id":"tok","market":"m1","hash":"h","buys":[{"price":"0.4","size":"10"}],"sells":[{"price":"0.6","size":"10"}]}"#,
        );

        match rx.try_recv().unwrap() {
            FeedMessage::Book(evt) => {
                assert_eq!(evt.asset_id, "tok");
                assert_eq!(evt.buys.len(), 1);
            }
            other => panic!("expected Book, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_routes_trade_and_order_events() {
        let (feed, mut rx) = WsFeed::user(
            "wss://example.invalid/ws",
            WsAuth {
                api_key: "k".into(),
                secret: "s".into(),
                passphrase: "p".into(),
            },
        );

        feed.dispatch(
            r#"{"event_type":"trade","id":"t1","market":"m1","asset_id":"tok","side":"BUY","size":"5","price":"0.5"}"#,
        );
        feed.dispatch(
            r#"{"event_type":"order","id":"o1","market":"m1","type":"CANCELLATION"}"#,
        );

        assert!(matches!(rx.try_recv().unwrap(), FeedMessage::Trade(_)));
        match rx.try_recv().unwrap() {
            FeedMessage::Order(evt) => assert_eq!(evt.kind, "CANCELLATION"),
            other => panic!("expected Order, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_ignores_unknown_and_malformed() {
        let (feed, mut rx) = WsFeed::market("wss://example.invalid/ws");
        feed.dispatch("PONG body that is not json");
        feed.dispatch(r#"{"event_type":"new_market"}"#);
        feed.dispatch(r#"{"event_type":"mystery"}"#);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_drops_when_buffer_full() {
        let (feed, mut rx) = WsFeed::market("wss://example.invalid/ws");
        let book = r#"{"event_type":"book","asset_id":"tok","market":"m1","hash":"h","buys":[],"sells":[]}"#;
        for _ in 0..MARKET_BUFFER + 10 {
            feed.dispatch(book);
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, MARKET_BUFFER);
    }
}
