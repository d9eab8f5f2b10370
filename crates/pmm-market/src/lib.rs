//! Exchange-facing plumbing for the market-making bot.
//!
//! This crate contains everything that talks to (or mirrors) the CLOB:
//!
//! - `clob`: REST client for order management, behind the [`Exchange`] trait
//! - `ratelimit`: per-endpoint-category token buckets
//! - `feed`: market + user WebSocket feeds with auto-reconnect
//! - `orderbook`: the local order book mirror, one per market
//! - `discovery`: the Gamma API scanner that ranks quoting opportunities

pub mod clob;
pub mod discovery;
pub mod feed;
pub mod orderbook;
pub mod ratelimit;

pub use clob::{ApiCredentials, ClientError, ClobClient, ClobClientConfig, Exchange};
pub use discovery::{ScanResult, Scanner, ScannerConfig};
pub use feed::{FeedChannel, FeedMessage, WsFeed};
pub use orderbook::Book;
pub use ratelimit::{RateLimiter, TokenBucket};
