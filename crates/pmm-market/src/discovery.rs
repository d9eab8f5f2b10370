//! Market discovery.
//!
//! The scanner polls the Gamma API for open binary markets, filters out
//! anything untradeable, and ranks the rest by a composite opportunity
//! score:
//!
//! ```text
//! score = spread × √(volume24h) × min(liquidity / 10000, 1)
//! ```
//!
//! High-spread, high-volume, reasonably liquid markets score highest. The
//! engine watches the latest [`ScanResult`] and starts/stops per-market
//! quoting tasks to match the selection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use pmm_common::{MarketAllocation, MarketInfo, TickSize};

use crate::clob::ClientError;

const PAGE_SIZE: usize = 100;
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Raw market shape returned by the Gamma API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GammaMarket {
    pub id: String,
    pub question: String,
    pub condition_id: String,
    pub slug: String,
    pub active: bool,
    pub closed: bool,
    pub accepting_orders: bool,
    pub enable_order_book: bool,
    pub end_date: String,
    /// Decimal string, e.g. "15230.55".
    pub liquidity: String,
    pub volume24hr: f64,
    /// Token IDs as a JSON string array: `["123", "456"]`.
    pub clob_token_ids: String,
    pub neg_risk: bool,
    pub spread: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub last_trade_price: f64,
    pub order_price_min_tick_size: f64,
    pub order_min_size: f64,
}

impl GammaMarket {
    /// Convert to the internal representation. Returns `None` when the
    /// market is missing its token ids (unquotable).
    pub fn to_market_info(&self) -> Option<MarketInfo> {
        let token_ids: Vec<String> = serde_json::from_str(&self.clob_token_ids).ok()?;
        let [yes_token_id, no_token_id]: [String; 2] = token_ids.try_into().ok()?;
        if yes_token_id.is_empty() || no_token_id.is_empty() {
            return None;
        }

        Some(MarketInfo {
            id: self.id.clone(),
            condition_id: self.condition_id.clone(),
            slug: self.slug.clone(),
            question: self.question.clone(),
            yes_token_id,
            no_token_id,
            tick_size: TickSize::from_min_tick(self.order_price_min_tick_size),
            min_order_size: dec_from_f64(self.order_min_size),
            neg_risk: self.neg_risk,
            active: self.active,
            closed: self.closed,
            accepting_orders: self.accepting_orders,
            end_date: DateTime::parse_from_rfc3339(&self.end_date)
                .ok()
                .map(|d| d.with_timezone(&Utc)),
            liquidity: self.liquidity.parse().unwrap_or_default(),
            volume_24h: dec_from_f64(self.volume24hr),
            best_bid: dec_from_f64(self.best_bid),
            best_ask: dec_from_f64(self.best_ask),
            spread: dec_from_f64(self.spread),
            last_trade_price: dec_from_f64(self.last_trade_price),
        })
    }
}

fn dec_from_f64(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap_or_default()
}

/// Scanner filter thresholds and selection limits.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Gamma API base URL, e.g. `https://gamma-api.polymarket.com`.
    pub gamma_base_url: String,
    pub poll_interval: Duration,
    /// Minimum USD liquidity resting on the book.
    pub min_liquidity: Decimal,
    /// Minimum trailing 24-hour volume in USD.
    pub min_volume_24h: Decimal,
    /// Minimum quoted spread at scan time.
    pub min_spread: Decimal,
    /// Skip markets resolving further out than this.
    pub max_end_date_days: i64,
    /// Slugs to never trade.
    pub exclude_slugs: Vec<String>,
    /// Cap on simultaneously selected markets.
    pub max_markets: usize,
    /// Per-market capital allocation passed through to the engine.
    pub max_position_usd: Decimal,
}

/// Markets ranked by opportunity quality, newest scan wins.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub markets: Vec<MarketAllocation>,
    pub scanned_at: DateTime<Utc>,
}

/// Periodically polls the Gamma API and publishes the latest selection.
pub struct Scanner {
    http: reqwest::Client,
    cfg: ScannerConfig,
    result_tx: watch::Sender<Option<ScanResult>>,
}

impl Scanner {
    pub fn new(
        cfg: ScannerConfig,
    ) -> Result<(Self, watch::Receiver<Option<ScanResult>>), ClientError> {
        let http = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        let (result_tx, result_rx) = watch::channel(None);
        Ok((
            Self {
                http,
                cfg,
                result_tx,
            },
            result_rx,
        ))
    }

    /// Poll loop. Scans immediately on startup, then at `poll_interval`.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        self.scan().await;

        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => self.scan().await,
            }
        }
    }

    async fn scan(&self) {
        let markets = match self.fetch_markets().await {
            Ok(markets) => markets,
            Err(e) => {
                error!(error = %e, "scan failed");
                return;
            }
        };

        let total = markets.len();
        let filtered = self.filter_markets(markets);
        let selected = self.rank_markets(filtered);

        info!(
            total,
            selected = selected.len(),
            "scan complete"
        );

        // watch is a single-slot latest-value channel: a slow engine only
        // ever sees the newest selection.
        let _ = self.result_tx.send(Some(ScanResult {
            markets: selected,
            scanned_at: Utc::now(),
        }));
    }

    async fn fetch_markets(&self) -> Result<Vec<GammaMarket>, ClientError> {
        let base = self.cfg.gamma_base_url.trim_end_matches('/');
        let mut all = Vec::new();
        let mut offset = 0usize;

        loop {
            let resp = self
                .http
                .get(format!("{base}/markets"))
                .query(&[
                    ("limit", PAGE_SIZE.to_string()),
                    ("offset", offset.to_string()),
                    ("active", "true".to_string()),
                    ("closed", "false".to_string()),
                ])
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(ClientError::Status {
                    status: status.as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                });
            }

            let page: Vec<GammaMarket> = resp.json().await?;
            let page_len = page.len();
            all.extend(page);

            if page_len < PAGE_SIZE {
                return Ok(all);
            }
            offset += PAGE_SIZE;
        }
    }

    /// Hard filters: tradeable state, excluded slugs, liquidity, volume,
    /// spread, resolution window, and token ids present.
    pub fn filter_markets(&self, markets: Vec<GammaMarket>) -> Vec<MarketInfo> {
        let now = Utc::now();
        let max_end = now + chrono::Duration::days(self.cfg.max_end_date_days);

        markets
            .into_iter()
            .filter_map(|raw| {
                if !raw.active || raw.closed || !raw.accepting_orders || !raw.enable_order_book {
                    return None;
                }
                if self
                    .cfg
                    .exclude_slugs
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(&raw.slug))
                {
                    debug!(slug = %raw.slug, "market excluded by config");
                    return None;
                }

                let info = raw.to_market_info()?;

                if info.liquidity < self.cfg.min_liquidity
                    || info.volume_24h < self.cfg.min_volume_24h
                    || info.spread < self.cfg.min_spread
                {
                    return None;
                }
                match info.end_date {
                    Some(end) if end > now && end <= max_end => Some(info),
                    _ => None,
                }
            })
            .collect()
    }

    /// Score, sort descending, and cap at `max_markets`.
    pub fn rank_markets(&self, markets: Vec<MarketInfo>) -> Vec<MarketAllocation> {
        let mut ranked: Vec<MarketAllocation> = markets
            .into_iter()
            .map(|market| {
                let score = opportunity_score(&market);
                MarketAllocation {
                    market,
                    max_position_usd: self.cfg.max_position_usd,
                    score,
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(self.cfg.max_markets);
        ranked
    }
}

/// Composite ranking: spread × √volume × liquidity factor (capped at 1).
pub fn opportunity_score(market: &MarketInfo) -> f64 {
    let spread = market.spread.to_f64().unwrap_or(0.0);
    let volume = market.volume_24h.to_f64().unwrap_or(0.0).max(0.0);
    let liquidity = market.liquidity.to_f64().unwrap_or(0.0);

    spread * volume.sqrt() * (liquidity / 10_000.0).min(1.0)
}
