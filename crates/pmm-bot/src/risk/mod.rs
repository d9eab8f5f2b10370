//! Portfolio-level risk enforcement.
//!
//! [`RiskManager`] runs as a standalone task receiving a [`PositionReport`]
//! from each market's quoting loop every cycle and checking it against the
//! configured limits:
//!
//! - Per-market exposure: caps USD exposure in any single market
//! - Global exposure:     caps total USD exposure across all markets
//! - Daily loss:          realized + unrealized PnL below the threshold
//! - Rapid price move:    mid moved more than `kill_switch_drop_pct` within
//!   `kill_switch_window`
//!
//! A breach engages the kill switch and emits a [`KillSignal`] the engine
//! reacts to by cancelling orders (globally or per-market). The switch stays
//! engaged for `cooldown_after_kill`, during which the strategies skip
//! quoting. The kill channel is a small broadcast ring: a receiver that
//! lags simply skips stale signals, so a fresh kill reason is never occluded
//! by an old one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::RiskConfig;

const REPORT_BUFFER: usize = 100;
const KILL_BUFFER: usize = 10;
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Sent by each market's quoting task every cycle: current inventory state
/// and PnL for risk evaluation.
#[derive(Debug, Clone)]
pub struct PositionReport {
    pub market_id: String,
    pub yes_qty: Decimal,
    pub no_qty: Decimal,
    /// Current mid, used for price-movement detection.
    pub mid: Decimal,
    /// Total position value in USD.
    pub exposure_usd: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Tells the engine to cancel orders. `market = None` means cancel across
/// ALL markets (global kill).
#[derive(Debug, Clone)]
pub struct KillSignal {
    pub market: Option<String>,
    pub reason: String,
}

/// Reference price at a point in time, for detecting rapid moves. The
/// anchor resets whenever it ages past the window, so gradual drift across
/// window boundaries does not trigger — only a fast move inside one window.
#[derive(Debug, Clone, Copy)]
struct PriceAnchor {
    price: Decimal,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RiskState {
    /// Latest report per market.
    positions: HashMap<String, PositionReport>,
    total_exposure: Decimal,
    total_realized_pnl: Decimal,
    kill_switch_active: bool,
    kill_switch_until: Option<DateTime<Utc>>,
    price_anchors: HashMap<String, PriceAnchor>,
}

/// Aggregates position reports across markets and fires the kill switch on
/// limit breaches. Singleton; shared by handle.
pub struct RiskManager {
    cfg: RiskConfig,
    state: Mutex<RiskState>,
    report_tx: mpsc::Sender<PositionReport>,
    report_rx: Mutex<Option<mpsc::Receiver<PositionReport>>>,
    kill_tx: broadcast::Sender<KillSignal>,
}

impl RiskManager {
    pub fn new(cfg: RiskConfig) -> Self {
        let (report_tx, report_rx) = mpsc::channel(REPORT_BUFFER);
        let (kill_tx, _) = broadcast::channel(KILL_BUFFER);
        Self {
            cfg,
            state: Mutex::new(RiskState::default()),
            report_tx,
            report_rx: Mutex::new(Some(report_rx)),
            kill_tx,
        }
    }

    /// A receiver for kill signals. Lagged receivers skip stale signals.
    pub fn subscribe_kills(&self) -> broadcast::Receiver<KillSignal> {
        self.kill_tx.subscribe()
    }

    /// Submit a position report without blocking. Dropped with a warning if
    /// the supervisor is saturated; the next quote cycle re-reports anyway.
    pub fn report(&self, report: PositionReport) {
        if self.report_tx.try_send(report).is_err() {
            warn!("risk report channel full, dropping report");
        }
    }

    /// The monitoring loop. Processes reports serially; a periodic sweep
    /// clears an expired kill switch even when no reports arrive.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut report_rx = match self.report_rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("risk manager already running");
                return;
            }
        };

        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                Some(report) = report_rx.recv() => self.process_report(report),
                _ = ticker.tick() => self.clear_expired_kill_switch(),
            }
        }
    }

    /// Whether the kill switch is currently engaged. Lazily clears an
    /// expired switch.
    pub fn is_kill_switch_active(&self) -> bool {
        let mut state = self.state.lock();
        if !state.kill_switch_active {
            return false;
        }
        if let Some(until) = state.kill_switch_until {
            if Utc::now() > until {
                state.kill_switch_active = false;
                info!("kill switch cooldown expired");
                return false;
            }
        }
        true
    }

    /// How much additional USD exposure the given market may take on: the
    /// minimum of per-market and global headroom, floored at zero.
    pub fn remaining_budget(&self, market_id: &str) -> Decimal {
        let state = self.state.lock();

        let current = state
            .positions
            .get(market_id)
            .map(|p| p.exposure_usd)
            .unwrap_or_default();

        let per_market = self.cfg.max_position_per_market - current;
        let global = self.cfg.max_global_exposure - state.total_exposure;

        per_market.min(global).max(Decimal::ZERO)
    }

    /// Drop all state for a stopped market. Totals are recomputed on the
    /// next report.
    pub fn remove_market(&self, market_id: &str) {
        let mut state = self.state.lock();
        state.positions.remove(market_id);
        state.price_anchors.remove(market_id);
    }

    fn process_report(&self, report: PositionReport) {
        let mut state = self.state.lock();

        state
            .positions
            .insert(report.market_id.clone(), report.clone());

        // Recompute aggregates from scratch; the map is small.
        let mut total_exposure = Decimal::ZERO;
        let mut total_realized = Decimal::ZERO;
        let mut total_unrealized = Decimal::ZERO;
        for pos in state.positions.values() {
            total_exposure += pos.exposure_usd;
            total_realized += pos.realized_pnl;
            total_unrealized += pos.unrealized_pnl;
        }
        state.total_exposure = total_exposure;
        state.total_realized_pnl = total_realized;

        if report.exposure_usd > self.cfg.max_position_per_market {
            self.emit_kill(
                &mut state,
                Some(report.market_id.clone()),
                "per-market position limit breached".to_string(),
            );
        }

        if total_exposure > self.cfg.max_global_exposure {
            self.emit_kill(&mut state, None, "global exposure limit breached".to_string());
        }

        if total_realized + total_unrealized < -self.cfg.max_daily_loss {
            self.emit_kill(&mut state, None, "max daily loss breached".to_string());
        }

        self.check_price_movement(&mut state, &report);
    }

    fn check_price_movement(&self, state: &mut RiskState, report: &PositionReport) {
        let window = chrono::Duration::from_std(self.cfg.kill_switch_window).unwrap_or_else(|_| chrono::Duration::zero());

        // No anchor, or anchor older than the window: reset to the current
        // price and skip the comparison.
        let anchor = match state.price_anchors.get(&report.market_id).copied() {
            Some(a) if report.timestamp.signed_duration_since(a.timestamp) <= window => a,
            _ => {
                state.price_anchors.insert(
                    report.market_id.clone(),
                    PriceAnchor {
                        price: report.mid,
                        timestamp: report.timestamp,
                    },
                );
                return;
            }
        };
        if anchor.price.is_zero() {
            return;
        }

        let pct_change = ((report.mid - anchor.price) / anchor.price).abs();
        if pct_change > self.cfg.kill_switch_drop_pct {
            let reason = format!(
                "rapid price movement: {:.1}% in {}s",
                pct_change * Decimal::ONE_HUNDRED,
                self.cfg.kill_switch_window.as_secs(),
            );
            self.emit_kill(&mut *state, Some(report.market_id.clone()), reason);
        }
    }

    fn clear_expired_kill_switch(&self) {
        let mut state = self.state.lock();
        if state.kill_switch_active {
            if let Some(until) = state.kill_switch_until {
                if Utc::now() > until {
                    state.kill_switch_active = false;
                    info!("kill switch cooldown expired");
                }
            }
        }
    }

    /// Engage the switch, start the cooldown, and broadcast the signal.
    /// The broadcast ring keeps only the newest signals, so a stale reason
    /// can never occlude a fresh one.
    fn emit_kill(&self, state: &mut RiskState, market: Option<String>, reason: String) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.cfg.cooldown_after_kill).unwrap_or_else(|_| chrono::Duration::zero());
        state.kill_switch_active = true;
        state.kill_switch_until = Some(until);

        error!(
            market = market.as_deref().unwrap_or("ALL"),
            reason = %reason,
            cooldown_until = %until,
            "KILL SWITCH"
        );

        if self.kill_tx.send(KillSignal { market, reason }).is_err() {
            debug!("no kill-signal receivers attached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn limits() -> RiskConfig {
        RiskConfig {
            max_position_per_market: dec!(100),
            max_global_exposure: dec!(500),
            max_markets_active: 10,
            kill_switch_drop_pct: dec!(0.10),
            kill_switch_window: Duration::from_secs(60),
            max_daily_loss: dec!(50),
            cooldown_after_kill: Duration::from_secs(300),
        }
    }

    fn report(market: &str, exposure: Decimal, mid: Decimal, ts: DateTime<Utc>) -> PositionReport {
        PositionReport {
            market_id: market.into(),
            yes_qty: dec!(0),
            no_qty: dec!(0),
            mid,
            exposure_usd: exposure,
            unrealized_pnl: dec!(0),
            realized_pnl: dec!(0),
            timestamp: ts,
        }
    }

    #[test]
    fn per_market_limit_fires_named_kill() {
        let rm = RiskManager::new(limits());
        let mut kills = rm.subscribe_kills();

        rm.process_report(report("m1", dec!(150), dec!(0.50), Utc::now()));

        assert!(rm.is_kill_switch_active());
        let sig = kills.try_recv().unwrap();
        assert_eq!(sig.market.as_deref(), Some("m1"));
        assert!(sig.reason.contains("per-market"));
    }

    #[test]
    fn global_limit_fires_unscoped_kill() {
        let rm = RiskManager::new(limits());
        let mut kills = rm.subscribe_kills();

        // Six markets at 90 each: total 540 > 500.
        for i in 0..6 {
            rm.process_report(report(&format!("m{i}"), dec!(90), dec!(0.50), Utc::now()));
        }

        assert!(rm.is_kill_switch_active());
        let mut saw_global = false;
        while let Ok(sig) = kills.try_recv() {
            if sig.market.is_none() {
                saw_global = true;
                assert!(sig.reason.contains("global"));
            }
        }
        assert!(saw_global);
    }

    #[test]
    fn daily_loss_fires_unscoped_kill() {
        let rm = RiskManager::new(limits());
        let mut kills = rm.subscribe_kills();

        let mut r = report("m1", dec!(10), dec!(0.50), Utc::now());
        r.realized_pnl = dec!(-30);
        r.unrealized_pnl = dec!(-25);
        rm.process_report(r);

        assert!(rm.is_kill_switch_active());
        let sig = kills.try_recv().unwrap();
        assert!(sig.market.is_none());
        assert!(sig.reason.contains("daily loss"));
    }

    #[test]
    fn rapid_move_within_window_fires_kill() {
        let rm = RiskManager::new(limits());
        let mut kills = rm.subscribe_kills();
        let t0 = Utc::now();

        // Anchor at 0.50, then 0.35 ten seconds later: |Δ|/0.50 = 30% > 10%.
        rm.process_report(report("m1", dec!(10), dec!(0.50), t0));
        rm.process_report(report(
            "m1",
            dec!(10),
            dec!(0.35),
            t0 + chrono::Duration::seconds(10),
        ));

        assert!(rm.is_kill_switch_active());
        let sig = kills.try_recv().unwrap();
        assert_eq!(sig.market.as_deref(), Some("m1"));
        assert!(sig.reason.contains("rapid"));
    }

    #[test]
    fn anchor_resets_after_window_so_slow_drift_is_ignored() {
        let rm = RiskManager::new(limits());
        let mut kills = rm.subscribe_kills();
        let t0 = Utc::now();

        rm.process_report(report("m1", dec!(10), dec!(0.50), t0));
        // 61s later: the anchor is stale, so this resets it instead of
        // comparing, even though the cumulative move is 30%.
        rm.process_report(report(
            "m1",
            dec!(10),
            dec!(0.35),
            t0 + chrono::Duration::seconds(61),
        ));

        assert!(!rm.is_kill_switch_active());
        assert!(kills.try_recv().is_err());
    }

    #[test]
    fn cooldown_expires() {
        let mut cfg = limits();
        cfg.cooldown_after_kill = Duration::from_millis(100);
        let rm = RiskManager::new(cfg);

        rm.process_report(report("m1", dec!(150), dec!(0.50), Utc::now()));
        assert!(rm.is_kill_switch_active());

        std::thread::sleep(Duration::from_millis(150));
        assert!(!rm.is_kill_switch_active());
    }

    #[test]
    fn remaining_budget_takes_global_headroom_into_account() {
        let rm = RiskManager::new(limits());

        // Five other markets at 95 each: total 475.
        for i in 0..5 {
            rm.process_report(report(&format!("other{i}"), dec!(95), dec!(0.50), Utc::now()));
        }

        // Per-market headroom is 100, global headroom is 25.
        assert_eq!(rm.remaining_budget("m1"), dec!(25));
    }

    #[test]
    fn remaining_budget_floors_at_zero() {
        let rm = RiskManager::new(limits());
        rm.process_report(report("m1", dec!(150), dec!(0.50), Utc::now()));
        assert_eq!(rm.remaining_budget("m1"), Decimal::ZERO);
    }

    #[test]
    fn remove_market_clears_report_and_anchor() {
        let rm = RiskManager::new(limits());
        let t0 = Utc::now();
        rm.process_report(report("m1", dec!(95), dec!(0.50), t0));
        rm.remove_market("m1");

        // Budget no longer counts m1's exposure against itself; the next
        // report recomputes totals without it.
        rm.process_report(report("m2", dec!(10), dec!(0.50), t0));
        assert_eq!(rm.remaining_budget("m1"), dec!(100).min(dec!(490)));
    }

    #[test]
    fn kill_ring_keeps_newest_signals_for_lagged_receivers() {
        let rm = RiskManager::new(limits());
        let mut kills = rm.subscribe_kills();

        // Fire 15 per-market kills without draining; ring capacity is 10.
        for i in 0..15 {
            rm.process_report(report(&format!("m{i}"), dec!(150), dec!(0.50), Utc::now()));
        }

        // First read reports the lag, then the newest retained signals
        // drain in order, ending with the freshest.
        assert!(matches!(
            kills.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
        let mut last = None;
        while let Ok(sig) = kills.try_recv() {
            last = Some(sig);
        }
        assert_eq!(last.unwrap().market.as_deref(), Some("m14"));
    }

    #[tokio::test]
    async fn run_loop_processes_reports_from_channel() {
        let rm = std::sync::Arc::new(RiskManager::new(limits()));
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut kills = rm.subscribe_kills();

        let runner = rm.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        rm.report(report("m1", dec!(150), dec!(0.50), Utc::now()));

        let sig = tokio::time::timeout(Duration::from_secs(1), kills.recv())
            .await
            .expect("kill signal within 1s")
            .unwrap();
        assert_eq!(sig.market.as_deref(), Some("m1"));

        let _ = shutdown_tx.send(());
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
