//! The Avellaneda-Stoikov quoting strategy and its per-market state.
//!
//! Core idea: post a bid below and an ask above a "reservation price" that
//! accounts for inventory risk. When the bot is long it lowers quotes to
//! attract sellers; when short it raises them to attract buyers.
//!
//! Per tick (every `refresh_interval`):
//!  1. Check book staleness and risk limits.
//!  2. Reservation price:  r = mid - q * γ * σ² * T
//!  3. Optimal spread:     δ = γ * σ² * T + (2/γ) * ln(1 + γ/k)
//!  4. bid = r - δ/2, ask = r + δ/2, clamped to [tick, 1-tick].
//!  5. Reconcile: cancel stale orders, place new ones via the batch API.
//!
//! The bot earns the spread when both sides fill; inventory skew (q) keeps
//! directional risk bounded, and the flow tracker widens the spread when
//! recent fills look like adverse selection.

mod flow;
mod inventory;
mod maker;

pub use flow::{FlowTracker, ToxicityMetrics};
pub use inventory::{Fill, Inventory, Position};
pub use maker::{compute_quotes, Maker, QuoteInputs};
