//! Core types shared across the bot.
//!
//! Wire-facing structs (REST responses, WebSocket events) keep prices and
//! sizes as strings, exactly as the CLOB API sends them, and are parsed into
//! `Decimal` at the point of use. Internal structs (`UserOrder`, `OpenOrder`,
//! `QuotePair`) are fully typed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Core enums
// ---------------------------------------------------------------------------

/// Direction of an order or fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Parse the wire representation ("BUY"/"SELL", any case).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Supported order lifecycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Good-Til-Cancelled: rests on the book until filled or cancelled.
    #[default]
    #[serde(rename = "GTC")]
    Gtc,
}

/// Price granularity of a market.
///
/// Each market has a fixed tick size that determines both the minimum price
/// increment and the USDC rounding precision for order amounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TickSize {
    /// 1 decimal — coarse markets.
    #[serde(rename = "0.1")]
    Tenth,
    /// 2 decimals — standard markets (most common).
    #[default]
    #[serde(rename = "0.01")]
    Hundredth,
    /// 3 decimals — fine-grained markets.
    #[serde(rename = "0.001")]
    Thousandth,
    /// 4 decimals — ultra-precise markets.
    #[serde(rename = "0.0001")]
    TenThousandth,
}

impl TickSize {
    /// Number of decimal places in a price at this granularity.
    pub fn decimals(&self) -> u32 {
        match self {
            TickSize::Tenth => 1,
            TickSize::Hundredth => 2,
            TickSize::Thousandth => 3,
            TickSize::TenThousandth => 4,
        }
    }

    /// Rounding precision for USDC amounts at this granularity.
    pub fn amount_decimals(&self) -> u32 {
        match self {
            TickSize::Tenth => 3,
            TickSize::Hundredth => 4,
            TickSize::Thousandth => 5,
            TickSize::TenThousandth => 6,
        }
    }

    /// The minimum price increment as a `Decimal` (e.g. 0.01).
    pub fn tick(&self) -> Decimal {
        Decimal::new(1, self.decimals())
    }

    /// Parse a tick size from its decimal string form, defaulting to 0.01
    /// for anything unrecognized.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "0.1" => TickSize::Tenth,
            "0.001" => TickSize::Thousandth,
            "0.0001" => TickSize::TenThousandth,
            _ => TickSize::Hundredth,
        }
    }

    /// Build from the numeric minimum tick the Gamma API reports.
    pub fn from_min_tick(v: f64) -> Self {
        if v >= 0.1 {
            TickSize::Tenth
        } else if v >= 0.01 {
            TickSize::Hundredth
        } else if v >= 0.001 {
            TickSize::Thousandth
        } else {
            TickSize::TenThousandth
        }
    }
}

impl std::fmt::Display for TickSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickSize::Tenth => write!(f, "0.1"),
            TickSize::Hundredth => write!(f, "0.01"),
            TickSize::Thousandth => write!(f, "0.001"),
            TickSize::TenThousandth => write!(f, "0.0001"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market metadata
// ---------------------------------------------------------------------------

/// Internal representation of a binary prediction market.
///
/// Populated from the Gamma API during scanning and handed to the strategy
/// layer for quoting. A binary market has exactly two tokens (YES and NO)
/// whose prices always sum to ~$1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketInfo {
    /// Gamma market ID.
    pub id: String,
    /// CTF condition ID — used for cancels and user-channel subscriptions.
    pub condition_id: String,
    /// Human-readable URL slug.
    pub slug: String,
    /// The prediction question, e.g. "Will X happen by Y?".
    pub question: String,

    /// CLOB token ID for the YES outcome.
    pub yes_token_id: String,
    /// CLOB token ID for the NO outcome.
    pub no_token_id: String,

    /// Price granularity (determines rounding).
    pub tick_size: TickSize,
    /// Minimum order size in tokens.
    pub min_order_size: Decimal,
    /// True for neg-risk markets (routed to a different CTF exchange).
    pub neg_risk: bool,

    pub active: bool,
    pub closed: bool,
    pub accepting_orders: bool,
    /// When the market is scheduled to resolve.
    pub end_date: Option<DateTime<Utc>>,
    /// Total USD liquidity resting on the book.
    pub liquidity: Decimal,
    /// Trailing 24-hour volume in USD.
    pub volume_24h: Decimal,

    pub best_bid: Decimal,
    pub best_ask: Decimal,
    /// best_ask - best_bid at scan time.
    pub spread: Decimal,
    pub last_trade_price: Decimal,
}

/// Emitted by the scanner to tell the engine which markets to trade and how
/// much capital each may absorb. `score` ranks opportunities when more
/// markets pass the filters than `max_markets_active` allows.
#[derive(Debug, Clone)]
pub struct MarketAllocation {
    pub market: MarketInfo,
    /// Per-market position cap in USD (from risk config).
    pub max_position_usd: Decimal,
    /// Composite opportunity score: spread × √volume × liquidity factor.
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// High-level order produced by the strategy. The exchange client converts
/// it to the CLOB wire format, integer-scaling amounts to 6-decimal USDC.
#[derive(Debug, Clone, PartialEq)]
pub struct UserOrder {
    /// Token to trade (YES or NO asset ID).
    pub token_id: String,
    /// Limit price in [0, 1].
    pub price: Decimal,
    /// Quantity in tokens.
    pub size: Decimal,
    pub side: Side,
    pub order_type: OrderType,
    /// Market's price granularity, used for amount rounding.
    pub tick_size: TickSize,
    /// Unix expiration timestamp, 0 = no expiry.
    pub expiration: i64,
    /// Fee rate in basis points.
    pub fee_rate_bps: u32,
}

/// Per-order result from the batch POST /orders endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, rename = "errorMsg")]
    pub error_msg: String,
    #[serde(default, rename = "orderID")]
    pub order_id: String,
    /// e.g. "live", "matched".
    #[serde(default)]
    pub status: String,
}

/// A live resting order on the CLOB, tracked locally by the strategy.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub id: String,
    pub status: String,
    /// Condition ID.
    pub market: String,
    /// Token ID.
    pub asset_id: String,
    pub side: Side,
    pub price: Decimal,
    pub original_size: Decimal,
    /// Cumulative filled quantity.
    pub size_matched: Decimal,
}

impl OpenOrder {
    /// Unfilled remainder still resting on the book.
    pub fn remaining(&self) -> Decimal {
        self.original_size - self.size_matched
    }
}

/// Response from DELETE /orders, /cancel-all, and /cancel-market-orders.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelResponse {
    /// IDs of successfully cancelled orders.
    #[serde(default)]
    pub canceled: Vec<String>,
}

/// The bid and ask the strategy wants resting for one market. A `None` side
/// means that side should be pulled. The reconciler compares this against
/// live orders and issues the minimal cancel+place set to converge.
#[derive(Debug, Clone)]
pub struct QuotePair {
    pub market_id: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    /// Buy YES at this price/size, `None` = no bid.
    pub bid: Option<UserOrder>,
    /// Sell YES at this price/size, `None` = no ask.
    pub ask: Option<UserOrder>,
    pub generated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// A single bid or ask level. Price and size are strings because the CLOB
/// API returns them as strings to preserve decimal precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// e.g. "0.55".
    pub price: String,
    /// e.g. "100.5".
    pub size: String,
}

impl PriceLevel {
    pub fn new(price: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            price: price.into(),
            size: size.into(),
        }
    }
}

/// REST response from GET /book for a single token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookResponse {
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub min_order_size: String,
    #[serde(default)]
    pub tick_size: String,
    #[serde(default)]
    pub neg_risk: bool,
}

// ---------------------------------------------------------------------------
// WebSocket events
// ---------------------------------------------------------------------------
// These structs map 1:1 to the JSON messages on the CLOB WebSocket.
// Market channel: "book" (full snapshot) and "price_change" (delta).
// User channel: "trade" (fill) and "order" (lifecycle).

/// Full order book snapshot from the market channel. Replaces the entire
/// local book for the given asset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsBookEvent {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub asset_id: String,
    /// Condition ID.
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub timestamp: String,
    /// Book version hash.
    #[serde(default)]
    pub hash: String,
    /// Bid levels, best first.
    #[serde(default)]
    pub buys: Vec<PriceLevel>,
    /// Ask levels, best first.
    #[serde(default)]
    pub sells: Vec<PriceLevel>,
}

/// One level update inside a price_change event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsPriceChange {
    #[serde(default)]
    pub asset_id: String,
    /// The price level that changed.
    #[serde(default)]
    pub price: String,
    /// New size at that level, "0" = removed.
    #[serde(default)]
    pub size: String,
    /// "BUY" or "SELL".
    #[serde(default)]
    pub side: String,
    /// Updated book hash.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub best_bid: String,
    #[serde(default)]
    pub best_ask: String,
}

/// Incremental order book update from the market channel. Contains one or
/// more level changes applied atomically.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsPriceChangeEvent {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub price_changes: Vec<WsPriceChange>,
}

/// Fill notification from the user channel — one of our orders matched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsTradeEvent {
    #[serde(default)]
    pub event_type: String,
    /// Trade ID.
    #[serde(default)]
    pub id: String,
    /// Condition ID.
    #[serde(default)]
    pub market: String,
    /// Token ID that traded.
    #[serde(default)]
    pub asset_id: String,
    /// Our side: "BUY" or "SELL".
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub price: String,
    /// "Yes" or "No".
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Order lifecycle notification from the user channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsOrderEvent {
    #[serde(default)]
    pub event_type: String,
    /// Order ID.
    #[serde(default)]
    pub id: String,
    /// Condition ID.
    #[serde(default)]
    pub market: String,
    /// Token ID.
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub original_size: String,
    /// Cumulative filled.
    #[serde(default)]
    pub size_matched: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub timestamp: String,
    /// "PLACEMENT", "UPDATE", or "CANCELLATION".
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Trade IDs from partial fills.
    #[serde(default)]
    pub associate_trades: Vec<String>,
}

/// L2 API credentials for authenticating the user WebSocket channel.
#[derive(Debug, Clone, Serialize)]
pub struct WsAuth {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

/// Initial subscription message sent right after connecting.
/// `auth` is required for the user channel.
#[derive(Debug, Clone, Serialize)]
pub struct WsSubscribeMsg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<WsAuth>,
    /// "market" or "user".
    #[serde(rename = "type")]
    pub channel: String,
    /// Condition IDs (user channel).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub markets: Vec<String>,
    /// Token IDs (market channel).
    #[serde(rename = "assets_ids", skip_serializing_if = "Vec::is_empty")]
    pub asset_ids: Vec<String>,
}

/// Dynamic subscribe/unsubscribe sent after the initial connection.
#[derive(Debug, Clone, Serialize)]
pub struct WsUpdateMsg {
    /// Token IDs (market channel).
    #[serde(rename = "assets_ids", skip_serializing_if = "Vec::is_empty")]
    pub asset_ids: Vec<String>,
    /// Condition IDs (user channel).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub markets: Vec<String>,
    /// "subscribe" or "unsubscribe".
    pub operation: String,
}

/// Parse a wire decimal string, returning `None` for anything malformed.
pub fn parse_decimal(s: &str) -> Option<Decimal> {
    s.trim().parse::<Decimal>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn side_parse_round_trip() {
        assert_eq!(Side::parse("BUY"), Some(Side::Buy));
        assert_eq!(Side::parse("sell"), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
        assert_eq!(Side::Buy.to_string(), "BUY");
    }

    #[test]
    fn tick_size_decimals() {
        assert_eq!(TickSize::Tenth.decimals(), 1);
        assert_eq!(TickSize::Hundredth.decimals(), 2);
        assert_eq!(TickSize::Thousandth.decimals(), 3);
        assert_eq!(TickSize::TenThousandth.decimals(), 4);

        assert_eq!(TickSize::Tenth.amount_decimals(), 3);
        assert_eq!(TickSize::TenThousandth.amount_decimals(), 6);
    }

    #[test]
    fn tick_size_tick_value() {
        assert_eq!(TickSize::Hundredth.tick(), dec!(0.01));
        assert_eq!(TickSize::TenThousandth.tick(), dec!(0.0001));
    }

    #[test]
    fn tick_size_parse_lossy_defaults() {
        assert_eq!(TickSize::parse_lossy("0.1"), TickSize::Tenth);
        assert_eq!(TickSize::parse_lossy("0.001"), TickSize::Thousandth);
        assert_eq!(TickSize::parse_lossy("bogus"), TickSize::Hundredth);
    }

    #[test]
    fn open_order_remaining() {
        let order = OpenOrder {
            id: "o1".into(),
            status: "live".into(),
            market: "m1".into(),
            asset_id: "t1".into(),
            side: Side::Buy,
            price: dec!(0.45),
            original_size: dec!(100),
            size_matched: dec!(37.5),
        };
        assert_eq!(order.remaining(), dec!(62.5));
    }

    #[test]
    fn ws_order_event_deserializes_type_field() {
        let json = r#"{"event_type":"order","id":"abc","type":"PLACEMENT","side":"BUY","price":"0.5","original_size":"10","size_matched":"0"}"#;
        let evt: WsOrderEvent = serde_json::from_str(json).unwrap();
        assert_eq!(evt.kind, "PLACEMENT");
        assert_eq!(evt.side, "BUY");
    }

    #[test]
    fn parse_decimal_rejects_garbage() {
        assert_eq!(parse_decimal("0.55"), Some(dec!(0.55)));
        assert_eq!(parse_decimal(" 1.0 "), Some(dec!(1.0)));
        assert_eq!(parse_decimal("n/a"), None);
    }

    #[test]
    fn subscribe_msg_omits_empty_fields() {
        let msg = WsSubscribeMsg {
            auth: None,
            channel: "market".into(),
            markets: vec![],
            asset_ids: vec!["123".into()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("assets_ids"));
        assert!(!json.contains("auth"));
        assert!(!json.contains("markets"));
    }
}
