//! Avellaneda-Stoikov market maker for Polymarket binary prediction markets.
//!
//! The bot continuously posts two-sided limit quotes on the CLOB, earning
//! the bid-ask spread while bounding directional and loss exposure.
//!
//! ## Architecture
//!
//! - `engine`: orchestrator — wires feeds, routes events, starts/stops one
//!   quoting task per market, coordinates shutdown
//! - `strategy`: the per-market quoting loop (maker), position tracking
//!   (inventory), and adverse-selection detection (flow tracker)
//! - `risk`: singleton supervisor aggregating position reports and firing
//!   the kill switch
//! - `store`: crash-safe JSON position persistence
//! - `config`: TOML configuration with env overrides

pub mod config;
pub mod engine;
pub mod risk;
pub mod store;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use engine::Engine;
pub use risk::{KillSignal, PositionReport, RiskManager};
pub use store::Store;
pub use strategy::{Fill, FlowTracker, Inventory, Maker, Position, ToxicityMetrics};
