//! Configuration for the market-making bot.
//!
//! Loaded from a TOML file (default: `config/bot.toml`), with sensitive
//! fields overridable via `PMM_*` environment variables. The raw TOML shape
//! is deserialized first, then converted into typed config with proper
//! `Duration` and `Decimal` fields.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// When true, mutating exchange calls log instead of executing.
    pub dry_run: bool,
    pub log_level: String,
    pub api: ApiConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub scanner: ScannerSettings,
    pub store: StoreConfig,
}

/// Exchange endpoints and optional pre-provisioned L2 credentials.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub clob_base_url: String,
    pub gamma_base_url: String,
    pub ws_market_url: String,
    pub ws_user_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,
}

/// Tuning for the Avellaneda-Stoikov quoting model.
///
/// - `gamma`: risk aversion. Higher shifts quotes harder against inventory.
/// - `sigma`: estimated price volatility.
/// - `k`: order arrival intensity. Higher k = tighter optimal spread.
/// - `t`: time horizon.
/// - `default_spread_bps`: minimum spread floor in basis points.
/// - `order_size_usd`: target notional per quoted side.
/// - `refresh_interval`: how often quotes are recomputed and reconciled.
/// - `stale_book_timeout`: cancel everything if the book goes quiet this long.
///
/// Flow detection:
/// - `flow_window`: rolling window for tracking fills.
/// - `flow_toxicity_threshold`: score above this widens the spread.
/// - `flow_cooldown`: stay widened this long after toxicity clears.
/// - `flow_max_spread_multiplier`: cap on the widening factor.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub gamma: f64,
    pub sigma: f64,
    pub k: f64,
    pub t: f64,
    pub default_spread_bps: u32,
    pub order_size_usd: Decimal,
    pub refresh_interval: Duration,
    pub stale_book_timeout: Duration,

    pub flow_window: Duration,
    pub flow_toxicity_threshold: f64,
    pub flow_cooldown: Duration,
    pub flow_max_spread_multiplier: f64,
}

/// Hard limits that trigger the kill switch.
///
/// - `max_position_per_market`: USD exposure cap for any single market.
/// - `max_global_exposure`: USD exposure cap across all markets combined.
/// - `max_markets_active`: cap on simultaneously traded markets.
/// - `kill_switch_drop_pct`: price move fraction that fires the kill switch.
/// - `kill_switch_window`: window for measuring that move.
/// - `max_daily_loss`: combined realized + unrealized loss cap.
/// - `cooldown_after_kill`: how long the switch stays engaged after firing.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_position_per_market: Decimal,
    pub max_global_exposure: Decimal,
    pub max_markets_active: usize,
    pub kill_switch_drop_pct: Decimal,
    pub kill_switch_window: Duration,
    pub max_daily_loss: Decimal,
    pub cooldown_after_kill: Duration,
}

/// Market discovery thresholds.
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub poll_interval: Duration,
    pub min_liquidity: Decimal,
    pub min_volume_24h: Decimal,
    pub min_spread: Decimal,
    pub max_end_date_days: i64,
    pub exclude_slugs: Vec<String>,
}

/// Where positions are persisted.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: String,
}

// ---------------------------------------------------------------------------
// Raw TOML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlConfig {
    general: TomlGeneral,
    api: TomlApi,
    strategy: TomlStrategy,
    risk: TomlRisk,
    scanner: TomlScanner,
    store: TomlStore,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlGeneral {
    dry_run: bool,
    log_level: String,
}

impl Default for TomlGeneral {
    fn default() -> Self {
        Self {
            dry_run: false,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlApi {
    clob_base_url: String,
    gamma_base_url: String,
    ws_market_url: String,
    ws_user_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    api_passphrase: Option<String>,
}

impl Default for TomlApi {
    fn default() -> Self {
        Self {
            clob_base_url: "https://clob.polymarket.com".to_string(),
            gamma_base_url: "https://gamma-api.polymarket.com".to_string(),
            ws_market_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            ws_user_url: "wss://ws-subscriptions-clob.polymarket.com/ws/user".to_string(),
            api_key: None,
            api_secret: None,
            api_passphrase: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlStrategy {
    gamma: f64,
    sigma: f64,
    k: f64,
    t: f64,
    default_spread_bps: u32,
    order_size_usd: f64,
    refresh_interval_secs: u64,
    stale_book_timeout_secs: u64,
    flow_window_secs: u64,
    flow_toxicity_threshold: f64,
    flow_cooldown_secs: u64,
    flow_max_spread_multiplier: f64,
}

impl Default for TomlStrategy {
    fn default() -> Self {
        Self {
            gamma: 0.5,
            sigma: 0.2,
            k: 10.0,
            t: 0.5,
            default_spread_bps: 100,
            order_size_usd: 50.0,
            refresh_interval_secs: 5,
            stale_book_timeout_secs: 30,
            flow_window_secs: 60,
            flow_toxicity_threshold: 0.6,
            flow_cooldown_secs: 120,
            flow_max_spread_multiplier: 3.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlRisk {
    max_position_per_market: f64,
    max_global_exposure: f64,
    max_markets_active: usize,
    kill_switch_drop_pct: f64,
    kill_switch_window_sec: u64,
    max_daily_loss: f64,
    cooldown_after_kill_secs: u64,
}

impl Default for TomlRisk {
    fn default() -> Self {
        Self {
            max_position_per_market: 100.0,
            max_global_exposure: 500.0,
            max_markets_active: 5,
            kill_switch_drop_pct: 0.10,
            kill_switch_window_sec: 60,
            max_daily_loss: 50.0,
            cooldown_after_kill_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlScanner {
    poll_interval_secs: u64,
    min_liquidity: f64,
    min_volume_24h: f64,
    min_spread: f64,
    max_end_date_days: i64,
    exclude_slugs: Vec<String>,
}

impl Default for TomlScanner {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            min_liquidity: 1000.0,
            min_volume_24h: 500.0,
            min_spread: 0.02,
            max_end_date_days: 30,
            exclude_slugs: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlStore {
    data_dir: String,
}

impl Default for TomlStore {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
        }
    }
}

fn f64_to_decimal(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap_or_default()
}

impl From<TomlConfig> for Config {
    fn from(toml: TomlConfig) -> Self {
        Self {
            dry_run: toml.general.dry_run,
            log_level: toml.general.log_level,
            api: ApiConfig {
                clob_base_url: toml.api.clob_base_url,
                gamma_base_url: toml.api.gamma_base_url,
                ws_market_url: toml.api.ws_market_url,
                ws_user_url: toml.api.ws_user_url,
                api_key: toml.api.api_key,
                api_secret: toml.api.api_secret,
                api_passphrase: toml.api.api_passphrase,
            },
            strategy: StrategyConfig {
                gamma: toml.strategy.gamma,
                sigma: toml.strategy.sigma,
                k: toml.strategy.k,
                t: toml.strategy.t,
                default_spread_bps: toml.strategy.default_spread_bps,
                order_size_usd: f64_to_decimal(toml.strategy.order_size_usd),
                refresh_interval: Duration::from_secs(toml.strategy.refresh_interval_secs),
                stale_book_timeout: Duration::from_secs(toml.strategy.stale_book_timeout_secs),
                flow_window: Duration::from_secs(toml.strategy.flow_window_secs),
                flow_toxicity_threshold: toml.strategy.flow_toxicity_threshold,
                flow_cooldown: Duration::from_secs(toml.strategy.flow_cooldown_secs),
                flow_max_spread_multiplier: toml.strategy.flow_max_spread_multiplier,
            },
            risk: RiskConfig {
                max_position_per_market: f64_to_decimal(toml.risk.max_position_per_market),
                max_global_exposure: f64_to_decimal(toml.risk.max_global_exposure),
                max_markets_active: toml.risk.max_markets_active,
                kill_switch_drop_pct: f64_to_decimal(toml.risk.kill_switch_drop_pct),
                kill_switch_window: Duration::from_secs(toml.risk.kill_switch_window_sec),
                max_daily_loss: f64_to_decimal(toml.risk.max_daily_loss),
                cooldown_after_kill: Duration::from_secs(toml.risk.cooldown_after_kill_secs),
            },
            scanner: ScannerSettings {
                poll_interval: Duration::from_secs(toml.scanner.poll_interval_secs),
                min_liquidity: f64_to_decimal(toml.scanner.min_liquidity),
                min_volume_24h: f64_to_decimal(toml.scanner.min_volume_24h),
                min_spread: f64_to_decimal(toml.scanner.min_spread),
                max_end_date_days: toml.scanner.max_end_date_days,
                exclude_slugs: toml.scanner.exclude_slugs,
            },
            store: StoreConfig {
                data_dir: toml.store.data_dir,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        TomlConfig::default().into()
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: TomlConfig = toml::from_str(content).context("failed to parse TOML config")?;
        Ok(raw.into())
    }

    /// Apply environment variable overrides for sensitive fields.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("PMM_API_KEY") {
            self.api.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("PMM_API_SECRET") {
            self.api.api_secret = Some(secret);
        }
        if let Ok(pass) = std::env::var("PMM_API_PASSPHRASE") {
            self.api.api_passphrase = Some(pass);
        }
        if let Ok(v) = std::env::var("PMM_DRY_RUN") {
            if v == "true" || v == "1" {
                self.dry_run = true;
            }
        }
    }

    /// Check required fields and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.api.clob_base_url.is_empty() {
            bail!("api.clob_base_url is required");
        }
        if self.api.gamma_base_url.is_empty() {
            bail!("api.gamma_base_url is required");
        }
        if self.strategy.gamma <= 0.0 {
            bail!("strategy.gamma must be > 0");
        }
        if self.strategy.k <= 0.0 {
            bail!("strategy.k must be > 0");
        }
        if self.strategy.order_size_usd <= Decimal::ZERO {
            bail!("strategy.order_size_usd must be > 0");
        }
        if self.strategy.refresh_interval.is_zero() {
            bail!("strategy.refresh_interval_secs must be > 0");
        }
        if self.strategy.flow_max_spread_multiplier < 1.0 {
            bail!("strategy.flow_max_spread_multiplier must be >= 1.0");
        }
        if self.risk.max_position_per_market <= Decimal::ZERO {
            bail!("risk.max_position_per_market must be > 0");
        }
        if self.risk.max_global_exposure <= Decimal::ZERO {
            bail!("risk.max_global_exposure must be > 0");
        }
        if self.risk.max_markets_active == 0 {
            bail!("risk.max_markets_active must be > 0");
        }
        if !self.dry_run && self.api.api_key.is_none() {
            bail!("api.api_key is required for live trading (set PMM_API_KEY)");
        }
        Ok(())
    }
}
