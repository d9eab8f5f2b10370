//! Position tracking for a single market.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use pmm_common::Side;

/// Current holdings in one market. Serialized to JSON for persistence
/// across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub yes_qty: Decimal,
    pub no_qty: Decimal,
    pub avg_entry_yes: Decimal,
    pub avg_entry_no: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    #[serde(default = "default_timestamp")]
    pub last_updated: DateTime<Utc>,
}

fn default_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

/// A single execution. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub token_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub trade_id: String,
}

/// Tracks the position for one market. Thread-safe via RwLock: the quoting
/// task is the only writer, the engine reads snapshots for persistence.
///
/// Provides the inventory skew ([`Inventory::net_delta`]) that drives the
/// reservation-price adjustment in the quoting model.
#[derive(Debug)]
pub struct Inventory {
    market_id: String,
    yes_token: String,
    no_token: String,
    pos: RwLock<Position>,
}

impl Inventory {
    pub fn new(
        market_id: impl Into<String>,
        yes_token: impl Into<String>,
        no_token: impl Into<String>,
    ) -> Self {
        Self {
            market_id: market_id.into(),
            yes_token: yes_token.into(),
            no_token: no_token.into(),
            pos: RwLock::new(Position::default()),
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    /// Process a fill: update quantities and average entry prices, realize
    /// PnL when a position is reduced.
    pub fn on_fill(&self, fill: &Fill) {
        let mut guard = self.pos.write();
        let pos = &mut *guard;

        if fill.token_id == self.yes_token {
            apply_arm_fill(
                fill,
                &mut pos.yes_qty,
                &mut pos.avg_entry_yes,
                &mut pos.realized_pnl,
            );
        } else {
            apply_arm_fill(
                fill,
                &mut pos.no_qty,
                &mut pos.avg_entry_no,
                &mut pos.realized_pnl,
            );
        }

        pos.last_updated = fill.timestamp;
    }

    /// A copy of the current position.
    pub fn snapshot(&self) -> Position {
        self.pos.read().clone()
    }

    /// Inventory skew in [-1, 1]: +1 = fully long YES, -1 = fully long NO,
    /// 0 = balanced or flat. This is the `q` in the quoting model.
    pub fn net_delta(&self) -> Decimal {
        let pos = self.pos.read();
        let total = pos.yes_qty + pos.no_qty;
        if total.is_zero() {
            return Decimal::ZERO;
        }
        (pos.yes_qty - pos.no_qty) / total
    }

    /// Dollar value of all holdings. In a binary market YES is worth the mid
    /// and NO is worth (1 - mid).
    pub fn total_exposure_usd(&self, mid: Decimal) -> Decimal {
        let pos = self.pos.read();
        pos.yes_qty * mid + pos.no_qty * (Decimal::ONE - mid)
    }

    /// Recompute unrealized PnL against the given mid.
    pub fn update_mark_to_market(&self, mid: Decimal) {
        let mut pos = self.pos.write();
        let yes_unrealized = pos.yes_qty * (mid - pos.avg_entry_yes);
        let no_unrealized = pos.no_qty * ((Decimal::ONE - mid) - pos.avg_entry_no);
        pos.unrealized_pnl = yes_unrealized + no_unrealized;
    }

    /// Restore position from persistence (used on restart).
    pub fn set_position(&self, pos: Position) {
        *self.pos.write() = pos;
    }
}

/// Fold one fill into a single arm (YES or NO) of the position.
fn apply_arm_fill(fill: &Fill, qty: &mut Decimal, avg: &mut Decimal, realized: &mut Decimal) {
    match fill.side {
        Side::Buy => {
            let total_cost = *avg * *qty + fill.price * fill.size;
            *qty += fill.size;
            if *qty > Decimal::ZERO {
                *avg = total_cost / *qty;
            }
        }
        Side::Sell => {
            if *qty > Decimal::ZERO {
                let sell_qty = fill.size.min(*qty);
                *realized += (fill.price - *avg) * sell_qty;
            }
            *qty -= fill.size;
            if *qty <= Decimal::ZERO {
                *qty = Decimal::ZERO;
                *avg = Decimal::ZERO;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(side: Side, token: &str, price: Decimal, size: Decimal) -> Fill {
        Fill {
            timestamp: Utc::now(),
            side,
            token_id: token.into(),
            price,
            size,
            trade_id: "t".into(),
        }
    }

    fn inventory() -> Inventory {
        Inventory::new("m1", "yes", "no")
    }

    #[test]
    fn buy_accumulates_and_averages() {
        let inv = inventory();
        inv.on_fill(&fill(Side::Buy, "yes", dec!(0.40), dec!(100)));
        inv.on_fill(&fill(Side::Buy, "yes", dec!(0.50), dec!(100)));

        let pos = inv.snapshot();
        assert_eq!(pos.yes_qty, dec!(200));
        assert_eq!(pos.avg_entry_yes, dec!(0.45));
        assert_eq!(pos.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn sell_realizes_pnl_against_average() {
        let inv = inventory();
        inv.on_fill(&fill(Side::Buy, "yes", dec!(0.40), dec!(100)));
        inv.on_fill(&fill(Side::Sell, "yes", dec!(0.50), dec!(60)));

        let pos = inv.snapshot();
        assert_eq!(pos.yes_qty, dec!(40));
        // (0.50 - 0.40) * 60
        assert_eq!(pos.realized_pnl, dec!(6.0));
        // Average survives a partial close.
        assert_eq!(pos.avg_entry_yes, dec!(0.40));
    }

    #[test]
    fn closing_to_zero_resets_average() {
        let inv = inventory();
        inv.on_fill(&fill(Side::Buy, "yes", dec!(0.40), dec!(100)));
        inv.on_fill(&fill(Side::Sell, "yes", dec!(0.45), dec!(100)));

        let pos = inv.snapshot();
        assert_eq!(pos.yes_qty, Decimal::ZERO);
        assert_eq!(pos.avg_entry_yes, Decimal::ZERO);
        assert_eq!(pos.realized_pnl, dec!(5.0));
    }

    #[test]
    fn oversell_clamps_to_zero_and_realizes_held_qty_only() {
        let inv = inventory();
        inv.on_fill(&fill(Side::Buy, "yes", dec!(0.40), dec!(50)));
        inv.on_fill(&fill(Side::Sell, "yes", dec!(0.50), dec!(80)));

        let pos = inv.snapshot();
        assert_eq!(pos.yes_qty, Decimal::ZERO);
        assert_eq!(pos.avg_entry_yes, Decimal::ZERO);
        // Only the 50 held realize PnL.
        assert_eq!(pos.realized_pnl, dec!(5.0));
    }

    #[test]
    fn quantities_never_go_negative() {
        let inv = inventory();
        inv.on_fill(&fill(Side::Sell, "yes", dec!(0.50), dec!(10)));
        inv.on_fill(&fill(Side::Sell, "no", dec!(0.50), dec!(10)));

        let pos = inv.snapshot();
        assert_eq!(pos.yes_qty, Decimal::ZERO);
        assert_eq!(pos.no_qty, Decimal::ZERO);
        assert_eq!(pos.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn no_arm_tracks_independently() {
        let inv = inventory();
        inv.on_fill(&fill(Side::Buy, "no", dec!(0.60), dec!(50)));

        let pos = inv.snapshot();
        assert_eq!(pos.no_qty, dec!(50));
        assert_eq!(pos.avg_entry_no, dec!(0.60));
        assert_eq!(pos.yes_qty, Decimal::ZERO);
    }

    #[test]
    fn net_delta_spans_minus_one_to_one() {
        let inv = inventory();
        assert_eq!(inv.net_delta(), Decimal::ZERO);

        inv.on_fill(&fill(Side::Buy, "yes", dec!(0.50), dec!(100)));
        assert_eq!(inv.net_delta(), Decimal::ONE);

        inv.on_fill(&fill(Side::Buy, "no", dec!(0.50), dec!(100)));
        assert_eq!(inv.net_delta(), Decimal::ZERO);

        inv.on_fill(&fill(Side::Sell, "yes", dec!(0.50), dec!(100)));
        assert_eq!(inv.net_delta(), dec!(-1));
    }

    #[test]
    fn mark_to_market_matches_definition() {
        let inv = inventory();
        inv.on_fill(&fill(Side::Buy, "yes", dec!(0.40), dec!(100)));
        inv.on_fill(&fill(Side::Buy, "no", dec!(0.45), dec!(50)));

        let mid = dec!(0.55);
        inv.update_mark_to_market(mid);
        let pos = inv.snapshot();

        let expected = pos.yes_qty * (mid - pos.avg_entry_yes)
            + pos.no_qty * ((Decimal::ONE - mid) - pos.avg_entry_no);
        assert_eq!(pos.unrealized_pnl, expected);
        // 100*(0.55-0.40) + 50*(0.45-0.45)
        assert_eq!(pos.unrealized_pnl, dec!(15.0));
    }

    #[test]
    fn exposure_values_both_arms() {
        let inv = inventory();
        inv.on_fill(&fill(Side::Buy, "yes", dec!(0.40), dec!(100)));
        inv.on_fill(&fill(Side::Buy, "no", dec!(0.40), dec!(40)));

        // 100*0.55 + 40*0.45
        assert_eq!(inv.total_exposure_usd(dec!(0.55)), dec!(73.0));
    }

    #[test]
    fn set_position_restores_state() {
        let inv = inventory();
        let pos = Position {
            yes_qty: dec!(10),
            no_qty: dec!(20),
            avg_entry_yes: dec!(0.3),
            avg_entry_no: dec!(0.6),
            realized_pnl: dec!(1.5),
            unrealized_pnl: dec!(-0.5),
            last_updated: Utc::now(),
        };
        inv.set_position(pos.clone());
        assert_eq!(inv.snapshot(), pos);
        assert_eq!(inv.net_delta(), (dec!(10) - dec!(20)) / dec!(30));
    }
}
