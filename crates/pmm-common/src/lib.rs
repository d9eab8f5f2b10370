//! Shared types for the Polymarket market-making bot.
//!
//! This crate is the common vocabulary for every layer — order sides, tick
//! sizes, market metadata, order book snapshots, and WebSocket event payloads.
//! It depends on no other workspace member, so any crate can import it.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod types;

pub use types::*;
