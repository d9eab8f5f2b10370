//! Toxic flow detection.
//!
//! [`FlowTracker`] watches recent fills in a rolling time window to spot
//! adverse selection: fills that consistently go one direction, or arrive in
//! a burst, suggest informed traders picking off stale quotes right before
//! the price moves. When that happens the quoted spread is widened, then
//! decayed back to normal over a cooldown period.
//!
//! Time is passed in explicitly so the decay behavior is testable; the
//! quoting loop calls with `Utc::now()`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use pmm_common::Side;

use super::inventory::Fill;

/// Adverse-selection indicators computed over the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ToxicityMetrics {
    /// Fraction of fills in the dominant direction, in [0.5, 1.0] (or 0 with
    /// no fills).
    pub directional_imbalance: f64,
    /// Fills per minute.
    pub fill_velocity: f64,
    /// Composite score in [0, 1]: 60% imbalance, 40% velocity.
    pub toxicity_score: f64,
    /// True when the score exceeds the configured threshold.
    pub is_averse: bool,
}

/// Rolling-window fill tracker that converts toxicity into a spread
/// multiplier.
#[derive(Debug)]
pub struct FlowTracker {
    window: Duration,
    toxicity_threshold: f64,
    cooldown: Duration,
    max_spread_multiplier: f64,

    /// Recent fills, time-sorted by construction.
    fills: VecDeque<Fill>,
    /// Last time toxicity was detected.
    last_toxic: Option<DateTime<Utc>>,
}

impl FlowTracker {
    pub fn new(
        window: Duration,
        toxicity_threshold: f64,
        cooldown: Duration,
        max_spread_multiplier: f64,
    ) -> Self {
        Self {
            window,
            toxicity_threshold,
            cooldown,
            max_spread_multiplier,
            fills: VecDeque::with_capacity(100),
            last_toxic: None,
        }
    }

    /// Record a fill and evict entries that have aged out of the window.
    pub fn add_fill(&mut self, fill: Fill) {
        let now = fill.timestamp;
        self.fills.push_back(fill);
        self.evict_stale(now);
    }

    /// Number of fills currently in the window.
    pub fn fill_count(&self) -> usize {
        self.fills.len()
    }

    /// Single-pass prefix trim; the buffer stays time-sorted.
    fn evict_stale(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::zero());
        while let Some(front) = self.fills.front() {
            if front.timestamp > cutoff {
                break;
            }
            self.fills.pop_front();
        }
    }

    /// Compute adverse-selection metrics as of `now`.
    pub fn toxicity(&self, now: DateTime<Utc>) -> ToxicityMetrics {
        let cutoff = now - chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::zero());
        let mut buys = 0usize;
        let mut sells = 0usize;
        for fill in self.fills.iter().filter(|f| f.timestamp > cutoff) {
            match fill.side {
                Side::Buy => buys += 1,
                Side::Sell => sells += 1,
            }
        }

        let total = buys + sells;
        if total == 0 {
            return ToxicityMetrics::default();
        }

        let directional_imbalance = buys.max(sells) as f64 / total as f64;

        if total < 2 {
            let toxicity_score = 0.6 * directional_imbalance;
            return ToxicityMetrics {
                directional_imbalance,
                fill_velocity: 0.0,
                toxicity_score,
                is_averse: toxicity_score > self.toxicity_threshold,
            };
        }

        let window_minutes = self.window.as_secs_f64() / 60.0;
        let fill_velocity = total as f64 / window_minutes;
        // >3 fills/min saturates the velocity component.
        let velocity_factor = (fill_velocity / 3.0).min(1.0);

        let toxicity_score = 0.6 * directional_imbalance + 0.4 * velocity_factor;

        ToxicityMetrics {
            directional_imbalance,
            fill_velocity,
            toxicity_score,
            is_averse: toxicity_score > self.toxicity_threshold,
        }
    }

    /// The spread multiplier to apply as of `now`: 1.0 under normal flow,
    /// up to `max_spread_multiplier` under toxicity, decaying linearly back
    /// to 1.0 over the cooldown once flow normalizes.
    pub fn spread_multiplier(&mut self, now: DateTime<Utc>) -> f64 {
        self.evict_stale(now);
        let metrics = self.toxicity(now);

        if metrics.is_averse {
            self.last_toxic = Some(now);
        }

        let in_cooldown = match self.last_toxic {
            Some(last) => {
                now.signed_duration_since(last)
                    < chrono::Duration::from_std(self.cooldown).unwrap_or_else(|_| chrono::Duration::zero())
            }
            None => false,
        };

        if !metrics.is_averse && !in_cooldown {
            return 1.0;
        }

        let span = self.max_spread_multiplier - 1.0;

        if metrics.toxicity_score < self.toxicity_threshold {
            // In cooldown but no longer toxic: decay from max back to 1.0.
            let elapsed = self
                .last_toxic
                .map(|last| now.signed_duration_since(last).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(f64::MAX);
            let progress = (elapsed / self.cooldown.as_secs_f64()).min(1.0);
            return 1.0 + span * (1.0 - progress);
        }

        // Currently toxic: scale with how far past the threshold we are.
        let norm = (metrics.toxicity_score - self.toxicity_threshold)
            / (1.0 - self.toxicity_threshold);
        1.0 + span * (norm * 2.0).min(1.0)
    }

    /// Convenience for the maker's logging path.
    pub fn is_toxic(&self, now: DateTime<Utc>) -> bool {
        self.toxicity(now).is_averse
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn fill_at(ts: DateTime<Utc>, side: Side) -> Fill {
        Fill {
            timestamp: ts,
            side,
            token_id: "yes".into(),
            price: dec!(0.5),
            size: dec!(10),
            trade_id: "t".into(),
        }
    }

    fn tracker() -> FlowTracker {
        FlowTracker::new(
            Duration::from_secs(60),
            0.6,
            Duration::from_secs(120),
            3.0,
        )
    }

    #[test]
    fn empty_window_is_neutral() {
        let mut ft = tracker();
        let metrics = ft.toxicity(t0());
        assert_eq!(metrics, ToxicityMetrics::default());
        assert_eq!(ft.spread_multiplier(t0()), 1.0);
    }

    #[test]
    fn single_fill_uses_imbalance_only() {
        let mut ft = tracker();
        ft.add_fill(fill_at(t0(), Side::Buy));

        let metrics = ft.toxicity(t0());
        assert_eq!(metrics.directional_imbalance, 1.0);
        assert_eq!(metrics.fill_velocity, 0.0);
        assert!((metrics.toxicity_score - 0.6).abs() < 1e-12);
        // score == threshold, not strictly above
        assert!(!metrics.is_averse);
    }

    #[test]
    fn balanced_slow_flow_is_not_toxic() {
        let mut ft = tracker();
        ft.add_fill(fill_at(t0(), Side::Buy));
        ft.add_fill(fill_at(t0() + chrono::Duration::seconds(30), Side::Sell));

        // Imbalance 0.5, velocity 2/min: score 0.3 + 0.4·(2/3) ≈ 0.57 < 0.6.
        let metrics = ft.toxicity(t0() + chrono::Duration::seconds(31));
        assert_eq!(metrics.directional_imbalance, 0.5);
        assert_eq!(metrics.fill_velocity, 2.0);
        assert!(metrics.toxicity_score < 0.6);
        assert!(!metrics.is_averse);
    }

    #[test]
    fn balanced_burst_is_flagged_by_velocity_alone() {
        // Even perfectly two-sided flow trips the detector when it arrives
        // fast: 6 fills in a minute saturates the velocity factor.
        let mut ft = tracker();
        for i in 0..6 {
            let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
            ft.add_fill(fill_at(t0() + chrono::Duration::seconds(i), side));
        }

        let metrics = ft.toxicity(t0() + chrono::Duration::seconds(6));
        assert_eq!(metrics.directional_imbalance, 0.5);
        assert!((metrics.toxicity_score - 0.7).abs() < 1e-9);
        assert!(metrics.is_averse);
    }

    #[test]
    fn one_sided_burst_is_toxic_and_widens_spread() {
        // Five consecutive BUY fills within 5 seconds.
        let mut ft = tracker();
        for i in 0..5 {
            ft.add_fill(fill_at(t0() + chrono::Duration::seconds(i), Side::Buy));
        }
        let now = t0() + chrono::Duration::seconds(5);

        let metrics = ft.toxicity(now);
        assert_eq!(metrics.directional_imbalance, 1.0);
        assert_eq!(metrics.fill_velocity, 5.0);
        assert!(metrics.toxicity_score > 0.6);
        assert!(metrics.is_averse);

        let mult = ft.spread_multiplier(now);
        assert!(mult > 1.0 && mult <= 3.0, "multiplier {mult} out of range");
        // Score saturates at 1.0 here, so the multiplier hits the cap.
        assert!((mult - 3.0).abs() < 1e-9);
    }

    #[test]
    fn multiplier_decays_during_cooldown() {
        let mut ft = tracker();
        for i in 0..5 {
            ft.add_fill(fill_at(t0() + chrono::Duration::seconds(i), Side::Buy));
        }
        let toxic_now = t0() + chrono::Duration::seconds(5);
        assert!(ft.spread_multiplier(toxic_now) > 1.0);

        // 90s later the fills have aged out (window 60s) but cooldown (120s)
        // is still running: multiplier is between 1.0 and max, decaying.
        let later = toxic_now + chrono::Duration::seconds(90);
        let mult = ft.spread_multiplier(later);
        assert!(mult > 1.0 && mult < 3.0);
        // progress = 90/120 → 1 + 2*0.25
        assert!((mult - 1.5).abs() < 1e-9);
    }

    #[test]
    fn multiplier_returns_to_exactly_one_after_window_and_cooldown() {
        let mut ft = tracker();
        for i in 0..5 {
            ft.add_fill(fill_at(t0() + chrono::Duration::seconds(i), Side::Buy));
        }
        let toxic_now = t0() + chrono::Duration::seconds(5);
        assert!(ft.spread_multiplier(toxic_now) > 1.0);

        let after = toxic_now + chrono::Duration::seconds(121);
        assert_eq!(ft.spread_multiplier(after), 1.0);
        assert_eq!(ft.fill_count(), 0);
    }

    #[test]
    fn eviction_trims_only_aged_prefix() {
        let mut ft = tracker();
        ft.add_fill(fill_at(t0(), Side::Buy));
        ft.add_fill(fill_at(t0() + chrono::Duration::seconds(30), Side::Sell));
        assert_eq!(ft.fill_count(), 2);

        // A fill 70s in evicts the first (age 70s) but keeps the second.
        ft.add_fill(fill_at(t0() + chrono::Duration::seconds(70), Side::Sell));
        assert_eq!(ft.fill_count(), 2);
    }

    #[test]
    fn multiplier_bounded_by_max() {
        let mut ft = FlowTracker::new(Duration::from_secs(60), 0.1, Duration::from_secs(60), 5.0);
        for i in 0..50 {
            ft.add_fill(fill_at(t0() + chrono::Duration::milliseconds(i * 100), Side::Buy));
        }
        let mult = ft.spread_multiplier(t0() + chrono::Duration::seconds(5));
        assert!(mult <= 5.0);
        assert!(mult > 1.0);
    }
}
