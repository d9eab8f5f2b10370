//! Local order book mirror.
//!
//! [`Book`] mirrors the CLOB order book for a single binary market (YES + NO
//! tokens). It is updated from two sources:
//!
//! - REST snapshots via [`Book::apply_book_response`] (initial load)
//! - WebSocket events via [`Book::apply_book_event`] (full snapshots) and
//!   [`Book::apply_price_change`] (deltas)
//!
//! Delta events only refresh the version hash and the freshness timestamp;
//! level accuracy comes from the next full snapshot. The book is
//! concurrency-safe (one writer — the market dispatcher — plus readers under
//! a shared lock) and exposes the derived values the strategy needs: mid
//! price, best bid/ask, and staleness.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;

use pmm_common::{parse_decimal, BookResponse, PriceLevel, WsBookEvent, WsPriceChangeEvent};

/// One parsed price level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
}

/// Parsed book for a single token. Bids descend, asks ascend, best first.
#[derive(Debug, Clone, Default)]
struct TokenBook {
    bids: Vec<Level>,
    asks: Vec<Level>,
    hash: String,
}

impl TokenBook {
    fn from_levels(bids: &[PriceLevel], asks: &[PriceLevel], hash: &str) -> Self {
        let mut book = Self {
            bids: parse_levels(bids),
            asks: parse_levels(asks),
            hash: hash.to_string(),
        };
        // The server sends levels best-first; sort defensively so a
        // misordered payload cannot invert best_bid/best_ask.
        book.bids.sort_by(|a, b| b.price.cmp(&a.price));
        book.asks.sort_by(|a, b| a.price.cmp(&b.price));
        book
    }
}

fn parse_levels(levels: &[PriceLevel]) -> Vec<Level> {
    levels
        .iter()
        .filter_map(|l| {
            match (parse_decimal(&l.price), parse_decimal(&l.size)) {
                (Some(price), Some(size)) => Some(Level { price, size }),
                _ => {
                    debug!(price = %l.price, size = %l.size, "skipping unparsable level");
                    None
                }
            }
        })
        .collect()
}

#[derive(Debug, Default)]
struct BookInner {
    yes: TokenBook,
    no: TokenBook,
    /// Latest server hash per asset, updated by both snapshots and deltas.
    last_hash: HashMap<String, String>,
    /// Last time any book data arrived. `None` until the first update.
    updated: Option<DateTime<Utc>>,
}

/// Order book mirror for one market. The strategy quotes off the YES book;
/// the NO book is kept for completeness.
#[derive(Debug)]
pub struct Book {
    market_id: String,
    yes_token: String,
    no_token: String,
    inner: RwLock<BookInner>,
}

impl Book {
    pub fn new(
        market_id: impl Into<String>,
        yes_token: impl Into<String>,
        no_token: impl Into<String>,
    ) -> Self {
        Self {
            market_id: market_id.into(),
            yes_token: yes_token.into(),
            no_token: no_token.into(),
            inner: RwLock::new(BookInner::default()),
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    /// Replace the book for one token with a full WebSocket snapshot.
    pub fn apply_book_event(&self, event: &WsBookEvent) {
        self.apply_snapshot(&event.asset_id, &event.buys, &event.sells, &event.hash);
    }

    /// Apply a REST book response (initial load).
    pub fn apply_book_response(&self, resp: &BookResponse) {
        self.apply_snapshot(&resp.asset_id, &resp.bids, &resp.asks, &resp.hash);
    }

    fn apply_snapshot(&self, asset_id: &str, bids: &[PriceLevel], asks: &[PriceLevel], hash: &str) {
        let book = TokenBook::from_levels(bids, asks, hash);

        let mut inner = self.inner.write();
        if asset_id == self.yes_token {
            inner.yes = book;
        } else if asset_id == self.no_token {
            inner.no = book;
        } else {
            return;
        }
        inner.last_hash.insert(asset_id.to_string(), hash.to_string());
        inner.updated = Some(Utc::now());
    }

    /// Apply an incremental price_change event.
    ///
    /// Deltas are treated as liveness evidence only: the version hash and
    /// freshness timestamp advance, and the next full snapshot reconciles
    /// the levels.
    pub fn apply_price_change(&self, event: &WsPriceChangeEvent) {
        let mut inner = self.inner.write();
        for change in &event.price_changes {
            inner
                .last_hash
                .insert(change.asset_id.clone(), change.hash.clone());
        }
        inner.updated = Some(Utc::now());
    }

    /// Best bid and ask for the YES token. `None` if either side is empty.
    pub fn best_bid_ask(&self) -> Option<(Decimal, Decimal)> {
        let inner = self.inner.read();
        let bid = inner.yes.bids.first()?.price;
        let ask = inner.yes.asks.first()?.price;
        Some((bid, ask))
    }

    /// Mid price of the YES token: (best_bid + best_ask) / 2. This is the
    /// reference price `s` in the quoting formula.
    pub fn mid(&self) -> Option<Decimal> {
        let (bid, ask) = self.best_bid_ask()?;
        if bid.is_zero() && ask.is_zero() {
            return None;
        }
        Some((bid + ask) / Decimal::TWO)
    }

    /// True if no update has arrived within `max_age`, or ever.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let inner = self.inner.read();
        match inner.updated {
            None => true,
            Some(updated) => {
                let age = Utc::now().signed_duration_since(updated);
                // A clock-skewed future timestamp counts as fresh.
                age.to_std().map(|age| age > max_age).unwrap_or(false)
            }
        }
    }

    /// Timestamp of the last book update.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.read().updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(asset: &str, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> WsBookEvent {
        WsBookEvent {
            event_type: "book".into(),
            asset_id: asset.into(),
            market: "m1".into(),
            hash: "h1".into(),
            buys: bids.iter().map(|(p, s)| PriceLevel::new(*p, *s)).collect(),
            sells: asks.iter().map(|(p, s)| PriceLevel::new(*p, *s)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_book_has_no_mid() {
        let book = Book::new("m1", "yes", "no");
        assert!(book.best_bid_ask().is_none());
        assert!(book.mid().is_none());
    }

    #[test]
    fn mid_is_midpoint_of_best_levels() {
        let book = Book::new("m1", "yes", "no");
        book.apply_book_event(&snapshot(
            "yes",
            &[("0.48", "100"), ("0.47", "50")],
            &[("0.52", "80"), ("0.53", "20")],
        ));

        let (bid, ask) = book.best_bid_ask().unwrap();
        assert_eq!(bid, dec!(0.48));
        assert_eq!(ask, dec!(0.52));
        assert!(bid < ask);
        assert_eq!(book.mid().unwrap(), dec!(0.50));
    }

    #[test]
    fn snapshot_is_idempotent() {
        let book = Book::new("m1", "yes", "no");
        let evt = snapshot("yes", &[("0.40", "10")], &[("0.60", "10")]);
        book.apply_book_event(&evt);
        let first = book.best_bid_ask();
        book.apply_book_event(&evt);
        assert_eq!(book.best_bid_ask(), first);
    }

    #[test]
    fn snapshot_replaces_previous_levels() {
        let book = Book::new("m1", "yes", "no");
        book.apply_book_event(&snapshot("yes", &[("0.40", "10")], &[("0.60", "10")]));
        book.apply_book_event(&snapshot("yes", &[("0.45", "10")], &[("0.55", "10")]));

        let (bid, ask) = book.best_bid_ask().unwrap();
        assert_eq!(bid, dec!(0.45));
        assert_eq!(ask, dec!(0.55));
    }

    #[test]
    fn misordered_levels_are_sorted() {
        let book = Book::new("m1", "yes", "no");
        book.apply_book_event(&snapshot(
            "yes",
            &[("0.30", "10"), ("0.45", "10")],
            &[("0.70", "10"), ("0.55", "10")],
        ));

        let (bid, ask) = book.best_bid_ask().unwrap();
        assert_eq!(bid, dec!(0.45));
        assert_eq!(ask, dec!(0.55));
    }

    #[test]
    fn one_sided_book_has_no_mid() {
        let book = Book::new("m1", "yes", "no");
        book.apply_book_event(&snapshot("yes", &[("0.40", "10")], &[]));
        assert!(book.mid().is_none());
    }

    #[test]
    fn unknown_asset_is_ignored() {
        let book = Book::new("m1", "yes", "no");
        book.apply_book_event(&snapshot("other", &[("0.40", "10")], &[("0.60", "10")]));
        assert!(book.mid().is_none());
        assert!(book.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn staleness_before_and_after_update() {
        let book = Book::new("m1", "yes", "no");
        assert!(book.is_stale(Duration::from_secs(3600)));

        book.apply_book_event(&snapshot("yes", &[("0.40", "10")], &[("0.60", "10")]));
        assert!(!book.is_stale(Duration::from_secs(3600)));
        assert!(book.last_updated().is_some());
    }

    #[test]
    fn price_change_refreshes_liveness_only() {
        let book = Book::new("m1", "yes", "no");
        book.apply_book_event(&snapshot("yes", &[("0.40", "10")], &[("0.60", "10")]));
        let before = book.best_bid_ask();

        book.apply_price_change(&WsPriceChangeEvent {
            event_type: "price_change".into(),
            market: "m1".into(),
            price_changes: vec![pmm_common::WsPriceChange {
                asset_id: "yes".into(),
                price: "0.41".into(),
                size: "5".into(),
                side: "BUY".into(),
                hash: "h2".into(),
                ..Default::default()
            }],
            ..Default::default()
        });

        // Levels unchanged, freshness advanced.
        assert_eq!(book.best_bid_ask(), before);
        assert!(!book.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn unparsable_levels_are_skipped() {
        let book = Book::new("m1", "yes", "no");
        book.apply_book_event(&snapshot(
            "yes",
            &[("garbage", "10"), ("0.40", "10")],
            &[("0.60", "oops"), ("0.65", "10")],
        ));

        let (bid, ask) = book.best_bid_ask().unwrap();
        assert_eq!(bid, dec!(0.40));
        assert_eq!(ask, dec!(0.65));
    }
}
