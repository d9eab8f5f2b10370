//! The per-market quoting loop.
//!
//! [`Maker`] runs as one task per market, multiplexing three sources: the
//! periodic refresh tick, inbound trade events (fills), and inbound order
//! lifecycle events. Each tick it gates on book staleness, the kill switch,
//! and the risk budget, computes an Avellaneda-Stoikov quote pair, and
//! converges its live orders to the desired quotes with the minimal set of
//! cancel and place operations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use pmm_common::{
    parse_decimal, MarketInfo, OpenOrder, OrderType, QuotePair, Side, UserOrder, WsOrderEvent,
    WsTradeEvent,
};
use pmm_market::clob::{ClientError, Exchange};
use pmm_market::orderbook::Book;

use crate::config::StrategyConfig;
use crate::risk::{PositionReport, RiskManager};

use super::flow::FlowTracker;
use super::inventory::{Fill, Inventory};

/// Keep a live order whose remaining size is within this fraction of the
/// desired size (and whose price is within one tick).
const SIZE_TOLERANCE: Decimal = dec!(0.10);

/// Everything the pricing function needs from the current market state.
#[derive(Debug, Clone, Copy)]
pub struct QuoteInputs {
    pub mid: Decimal,
    pub remaining_budget: Decimal,
    /// Inventory skew `q` in [-1, 1].
    pub net_delta: Decimal,
    /// Spread widening from the flow tracker, in [1.0, max].
    pub flow_multiplier: f64,
}

/// Compute the desired quote pair for one tick.
///
/// The model runs in f64 (it involves `ln`), then converts back to `Decimal`
/// exactly once for tick rounding and all money math:
///
/// ```text
/// reservation = mid - q·γ·σ²·T
/// δ           = (γ·σ²·T + (2/γ)·ln(1 + γ/k)) · flow_mult
/// bid         = reservation - δ/2,  ask = reservation + δ/2
/// ```
///
/// Prices are clamped to [tick, 1-tick], the bid rounded down and the ask
/// rounded up to the tick grid, and sizes are scaled down with inventory
/// skew and capped so the combined quoted notional stays inside the
/// remaining risk budget. A side below the market's minimum order size, or
/// priced outside (0, 1), is suppressed.
///
/// Returns `None` when the inputs cannot be represented (skip the tick).
pub fn compute_quotes(
    cfg: &StrategyConfig,
    info: &MarketInfo,
    inputs: &QuoteInputs,
) -> Option<QuotePair> {
    if inputs.mid <= Decimal::ZERO {
        return None;
    }
    let mid = inputs.mid.to_f64()?;
    let q = inputs.net_delta.to_f64()?;
    let flow_mult = inputs.flow_multiplier;

    let gamma = cfg.gamma;
    let sigma = cfg.sigma;
    let k = cfg.k;
    let t = cfg.t;
    let tick_decimals = info.tick_size.decimals();
    let tick = info.tick_size.tick();
    let tick_f = 10f64.powi(-(tick_decimals as i32));
    let min_spread = f64::from(cfg.default_spread_bps) / 10_000.0 * flow_mult;

    // Reservation price shifts against inventory; spread widens with the
    // flow multiplier under adverse selection.
    let inventory_term = gamma * sigma * sigma * t;
    let reservation = mid - q * inventory_term;
    let optimal_spread = (inventory_term + (2.0 / gamma) * (1.0 + gamma / k).ln()) * flow_mult;

    let mut bid_raw = reservation - optimal_spread / 2.0;
    let mut ask_raw = reservation + optimal_spread / 2.0;

    if ask_raw - bid_raw < min_spread {
        bid_raw = reservation - min_spread / 2.0;
        ask_raw = reservation + min_spread / 2.0;
    }

    // Clamp into the valid price range and keep bid strictly below ask.
    bid_raw = bid_raw.clamp(tick_f, 1.0 - tick_f);
    ask_raw = ask_raw.clamp(tick_f, 1.0 - tick_f);
    if bid_raw >= ask_raw {
        bid_raw = ask_raw - tick_f;
    }
    if bid_raw < tick_f {
        bid_raw = tick_f;
    }

    let bid_price = Decimal::from_f64(bid_raw)?
        .round_dp_with_strategy(tick_decimals, RoundingStrategy::ToNegativeInfinity);
    let mut ask_price = Decimal::from_f64(ask_raw)?
        .round_dp_with_strategy(tick_decimals, RoundingStrategy::ToPositiveInfinity);
    if bid_price >= ask_price {
        ask_price = bid_price + tick;
    }

    // Size: shrink when heavily positioned, cap by the remaining budget.
    let size_factor = Decimal::ONE - dec!(0.5) * inputs.net_delta.abs();
    let base_size = cfg.order_size_usd / inputs.mid;
    let mut bid_size = (base_size * size_factor).max(info.min_order_size);
    let mut ask_size = bid_size;

    if bid_price > Decimal::ZERO {
        bid_size = bid_size.min(inputs.remaining_budget / bid_price);
    }
    if ask_price > Decimal::ZERO {
        ask_size = ask_size.min(inputs.remaining_budget / ask_price);
    }
    let total_notional = bid_size * bid_price + ask_size * ask_price;
    if total_notional > inputs.remaining_budget && total_notional > Decimal::ZERO {
        let scale = inputs.remaining_budget / total_notional;
        bid_size *= scale;
        ask_size *= scale;
    }

    let make_order = |price: Decimal, size: Decimal, side: Side| -> Option<UserOrder> {
        if size < info.min_order_size || price <= Decimal::ZERO || price >= Decimal::ONE {
            return None;
        }
        Some(UserOrder {
            token_id: info.yes_token_id.clone(),
            price,
            size,
            side,
            order_type: OrderType::Gtc,
            tick_size: info.tick_size,
            expiration: 0,
            fee_rate_bps: 0,
        })
    };

    Some(QuotePair {
        market_id: info.condition_id.clone(),
        yes_token_id: info.yes_token_id.clone(),
        no_token_id: info.no_token_id.clone(),
        bid: make_order(bid_price, bid_size, Side::Buy),
        ask: make_order(ask_price, ask_size, Side::Sell),
        generated_at: Utc::now(),
    })
}

/// The quoting strategy for a single market. Owns its flow tracker and its
/// view of live orders; shares the book, inventory, exchange client, and
/// risk supervisor by handle.
pub struct Maker {
    cfg: StrategyConfig,
    info: MarketInfo,
    book: Arc<Book>,
    inventory: Arc<Inventory>,
    flow: FlowTracker,
    client: Arc<dyn Exchange>,
    risk: Arc<RiskManager>,

    /// Our outstanding orders, keyed by exchange order id.
    active_orders: HashMap<String, OpenOrder>,
}

impl Maker {
    pub fn new(
        cfg: StrategyConfig,
        info: MarketInfo,
        book: Arc<Book>,
        inventory: Arc<Inventory>,
        client: Arc<dyn Exchange>,
        risk: Arc<RiskManager>,
    ) -> Self {
        let flow = FlowTracker::new(
            cfg.flow_window,
            cfg.flow_toxicity_threshold,
            cfg.flow_cooldown,
            cfg.flow_max_spread_multiplier,
        );
        Self {
            cfg,
            info,
            book,
            inventory,
            flow,
            client,
            risk,
            active_orders: HashMap::new(),
        }
    }

    /// Main loop for this market. Runs until cancellation is signalled, then
    /// issues a best-effort cancel-all for this market and exits.
    pub async fn run(
        mut self,
        mut trade_rx: mpsc::Receiver<WsTradeEvent>,
        mut order_rx: mpsc::Receiver<WsOrderEvent>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.cfg.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            market = %self.info.slug,
            tick_size = %self.info.tick_size,
            order_size = %self.cfg.order_size_usd,
            "strategy started"
        );

        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        self.cancel_all_my_orders().await;
                        info!(market = %self.info.slug, "strategy stopped");
                        return;
                    }
                }

                Some(trade) = trade_rx.recv() => self.handle_fill(trade),

                Some(order) = order_rx.recv() => self.handle_order_event(order),

                _ = ticker.tick() => self.quote_update().await,
            }
        }
    }

    /// Core per-tick logic: gates, pricing, reconciliation.
    async fn quote_update(&mut self) {
        if self.book.is_stale(self.cfg.stale_book_timeout) {
            warn!(market = %self.info.slug, "book is stale, cancelling all orders");
            self.cancel_all_my_orders().await;
            return;
        }

        let Some(mid) = self.book.mid() else {
            debug!(market = %self.info.slug, "no mid price available");
            return;
        };

        self.inventory.update_mark_to_market(mid);
        let pos = self.inventory.snapshot();
        let exposure = self.inventory.total_exposure_usd(mid);
        self.risk.report(PositionReport {
            market_id: self.info.condition_id.clone(),
            yes_qty: pos.yes_qty,
            no_qty: pos.no_qty,
            mid,
            exposure_usd: exposure,
            unrealized_pnl: pos.unrealized_pnl,
            realized_pnl: pos.realized_pnl,
            timestamp: Utc::now(),
        });

        if self.risk.is_kill_switch_active() {
            warn!(market = %self.info.slug, "kill switch active, cancelling all orders");
            self.cancel_all_my_orders().await;
            return;
        }

        let remaining = self.risk.remaining_budget(&self.info.condition_id);
        if remaining <= Decimal::ZERO {
            info!(market = %self.info.slug, "risk budget exhausted");
            self.cancel_all_my_orders().await;
            return;
        }

        let now = Utc::now();
        let flow_multiplier = self.flow.spread_multiplier(now);
        let inputs = QuoteInputs {
            mid,
            remaining_budget: remaining,
            net_delta: self.inventory.net_delta(),
            flow_multiplier,
        };
        let Some(quotes) = compute_quotes(&self.cfg, &self.info, &inputs) else {
            debug!(market = %self.info.slug, "skipping tick on malformed quote inputs");
            return;
        };

        let bid_px = quotes
            .bid
            .as_ref()
            .map(|o| o.price.to_string())
            .unwrap_or_else(|| "-".to_string());
        let ask_px = quotes
            .ask
            .as_ref()
            .map(|o| o.price.to_string())
            .unwrap_or_else(|| "-".to_string());
        debug!(
            market = %self.info.slug,
            mid = %mid,
            q = %inputs.net_delta,
            flow_spread_multiplier = flow_multiplier,
            bid = %bid_px,
            ask = %ask_px,
            "quotes computed"
        );

        if let Err(e) = self.reconcile_orders(&quotes).await {
            error!(market = %self.info.slug, error = %e, "reconcile orders failed");
        }
    }

    /// Diff desired quotes against live orders. An order is kept if its
    /// price is within one tick and its remaining size within 10% of the
    /// desired side; everything else is cancelled, and unmatched desired
    /// sides are placed via the batch endpoint.
    async fn reconcile_orders(&mut self, desired: &QuotePair) -> Result<(), ClientError> {
        let tick = self.info.tick_size.tick();

        let mut to_cancel: Vec<String> = Vec::new();
        let mut matched_bid = false;
        let mut matched_ask = false;

        for (id, order) in &self.active_orders {
            let remaining = order.remaining();
            let wanted = match order.side {
                Side::Buy => desired.bid.as_ref(),
                Side::Sell => desired.ask.as_ref(),
            };

            if let Some(want) = wanted {
                if (order.price - want.price).abs() <= tick
                    && !want.size.is_zero()
                    && ((remaining - want.size) / want.size).abs() <= SIZE_TOLERANCE
                {
                    match order.side {
                        Side::Buy => matched_bid = true,
                        Side::Sell => matched_ask = true,
                    }
                    continue;
                }
            }

            to_cancel.push(id.clone());
        }

        let mut to_place: Vec<UserOrder> = Vec::new();
        if !matched_bid {
            if let Some(bid) = &desired.bid {
                to_place.push(bid.clone());
            }
        }
        if !matched_ask {
            if let Some(ask) = &desired.ask {
                to_place.push(ask.clone());
            }
        }

        if !to_cancel.is_empty() {
            let resp = self.client.cancel_orders(&to_cancel).await?;
            for id in &resp.canceled {
                self.active_orders.remove(id);
            }
        }

        if !to_place.is_empty() {
            let results = self.client.post_orders(&to_place, self.info.neg_risk).await?;
            for (order, result) in to_place.iter().zip(results.iter()) {
                if result.success && !result.order_id.is_empty() {
                    self.active_orders.insert(
                        result.order_id.clone(),
                        OpenOrder {
                            id: result.order_id.clone(),
                            status: result.status.clone(),
                            market: self.info.condition_id.clone(),
                            asset_id: order.token_id.clone(),
                            side: order.side,
                            price: order.price,
                            original_size: order.size,
                            size_matched: Decimal::ZERO,
                        },
                    );
                } else if !result.error_msg.is_empty() {
                    error!(
                        market = %self.info.slug,
                        error = %result.error_msg,
                        side = %order.side,
                        price = %order.price,
                        "order rejected"
                    );
                }
            }
        }

        Ok(())
    }

    /// Process a fill from the user feed: update inventory, feed the flow
    /// tracker, and log when the post-fill toxicity turns averse. No direct
    /// action is taken — the next tick reads the widened multiplier.
    fn handle_fill(&mut self, trade: WsTradeEvent) {
        let (Some(price), Some(size)) = (parse_decimal(&trade.price), parse_decimal(&trade.size))
        else {
            warn!(trade_id = %trade.id, "dropping fill with unparsable price/size");
            return;
        };
        let Some(side) = Side::parse(&trade.side) else {
            warn!(trade_id = %trade.id, side = %trade.side, "dropping fill with unknown side");
            return;
        };

        let fill = Fill {
            timestamp: Utc::now(),
            side,
            token_id: trade.asset_id.clone(),
            price,
            size,
            trade_id: trade.id.clone(),
        };
        let now = fill.timestamp;

        self.inventory.on_fill(&fill);
        self.flow.add_fill(fill);

        let metrics = self.flow.toxicity(now);
        if metrics.is_averse {
            warn!(
                market = %self.info.slug,
                side = %side,
                toxicity_score = metrics.toxicity_score,
                directional_imbalance = metrics.directional_imbalance,
                fill_velocity = metrics.fill_velocity,
                fill_count = self.flow.fill_count(),
                "toxic flow detected"
            );
        }

        let pos = self.inventory.snapshot();
        info!(
            market = %self.info.slug,
            side = %side,
            price = %price,
            size = %size,
            outcome = %trade.outcome,
            yes_qty = %pos.yes_qty,
            no_qty = %pos.no_qty,
            realized_pnl = %pos.realized_pnl,
            "fill"
        );
    }

    /// Track order lifecycle events from the user feed.
    fn handle_order_event(&mut self, event: WsOrderEvent) {
        match event.kind.as_str() {
            "CANCELLATION" => {
                self.active_orders.remove(&event.id);
            }
            "UPDATE" => {
                if let Some(order) = self.active_orders.get_mut(&event.id) {
                    if let Some(matched) = parse_decimal(&event.size_matched) {
                        order.size_matched = matched;
                    }
                }
            }
            "PLACEMENT" => {
                if self.active_orders.contains_key(&event.id) {
                    return;
                }
                let Some(side) = Side::parse(&event.side) else {
                    warn!(order_id = %event.id, "ignoring placement with unknown side");
                    return;
                };
                self.active_orders.insert(
                    event.id.clone(),
                    OpenOrder {
                        id: event.id.clone(),
                        status: String::new(),
                        market: event.market,
                        asset_id: event.asset_id,
                        side,
                        price: parse_decimal(&event.price).unwrap_or_default(),
                        original_size: parse_decimal(&event.original_size).unwrap_or_default(),
                        size_matched: parse_decimal(&event.size_matched).unwrap_or_default(),
                    },
                );
            }
            other => {
                debug!(kind = other, "ignoring order event");
            }
        }
    }

    /// Best-effort cancel of everything we have resting on this market.
    async fn cancel_all_my_orders(&mut self) {
        if self.active_orders.is_empty() {
            return;
        }

        match self
            .client
            .cancel_market_orders(&self.info.condition_id)
            .await
        {
            Ok(resp) => {
                for id in &resp.canceled {
                    self.active_orders.remove(id);
                }
                info!(market = %self.info.slug, count = resp.canceled.len(), "cancelled orders");
            }
            Err(e) => {
                error!(market = %self.info.slug, error = %e, "cancel all orders failed");
            }
        }
    }

    #[cfg(test)]
    fn active_order_count(&self) -> usize {
        self.active_orders.len()
    }
}
