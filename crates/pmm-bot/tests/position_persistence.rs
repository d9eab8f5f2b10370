//! Inventory and persistence working together across a simulated restart.

use chrono::Utc;
use rust_decimal_macros::dec;

use pmm_bot::store::Store;
use pmm_bot::strategy::{Fill, Inventory};
use pmm_common::Side;

fn fill(side: Side, token: &str, price: &str, size: &str) -> Fill {
    Fill {
        timestamp: Utc::now(),
        side,
        token_id: token.into(),
        price: price.parse().unwrap(),
        size: size.parse().unwrap(),
        trade_id: "t".into(),
    }
}

#[test]
fn position_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();

    // Session one: trade, mark, persist.
    let inv = Inventory::new("m1", "yes", "no");
    inv.on_fill(&fill(Side::Buy, "yes", "0.40", "100"));
    inv.on_fill(&fill(Side::Buy, "no", "0.45", "40"));
    inv.on_fill(&fill(Side::Sell, "yes", "0.50", "30"));
    inv.update_mark_to_market(dec!(0.55));

    let saved = inv.snapshot();
    store.save_position("m1", &saved).unwrap();

    // Session two: restore into a fresh inventory.
    let restored_inv = Inventory::new("m1", "yes", "no");
    let loaded = store.load_position("m1").unwrap().unwrap();
    restored_inv.set_position(loaded);

    assert_eq!(restored_inv.snapshot(), saved);
    assert_eq!(restored_inv.net_delta(), inv.net_delta());
    assert_eq!(
        restored_inv.total_exposure_usd(dec!(0.55)),
        inv.total_exposure_usd(dec!(0.55))
    );

    // PnL bookkeeping carried over: selling the rest realizes against the
    // same average entry as it would have pre-restart.
    restored_inv.on_fill(&fill(Side::Sell, "yes", "0.50", "70"));
    let pos = restored_inv.snapshot();
    assert_eq!(pos.yes_qty, dec!(0));
    assert_eq!(pos.avg_entry_yes, dec!(0));
    // (0.50 - 0.40) * 30 + (0.50 - 0.40) * 70
    assert_eq!(pos.realized_pnl, dec!(10.0));
}

#[test]
fn fresh_market_loads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    assert!(store.load_position("never-seen").unwrap().is_none());
}
