//! CLOB REST client for order management.
//!
//! All order traffic goes through the [`Exchange`] trait so the strategy and
//! engine can run against a mock in tests. The real implementation,
//! [`ClobClient`], wraps `reqwest` with:
//!
//! - per-category token-bucket rate limiting (orders / cancels / book reads)
//! - bounded retry with exponential backoff on transport errors and 5xx
//! - a dry-run mode where mutating calls log and return fake successes
//!
//! Amounts crossing the wire are integer-scaled to 6-decimal USDC units at
//! the market's tick precision; see [`price_to_amounts`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::RequestBuilder;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use pmm_common::{
    BookResponse, CancelResponse, OrderResponse, OrderType, Side, TickSize, UserOrder, WsAuth,
};

use crate::ratelimit::RateLimiter;

/// Maximum orders per batch POST.
const MAX_BATCH_SIZE: usize = 15;
/// Retries after the initial attempt on transport/5xx failures.
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the REST client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("batch limit is {MAX_BATCH_SIZE} orders, got {0}")]
    BatchTooLarge(usize),
}

/// Pre-provisioned L2 API credentials. Request signing happens upstream of
/// this bot; the client only attaches the key material as headers and feeds
/// the user WebSocket subscription.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl ApiCredentials {
    /// Payload for the authenticated user WebSocket channel.
    pub fn ws_auth(&self) -> WsAuth {
        WsAuth {
            api_key: self.api_key.clone(),
            secret: self.secret.clone(),
            passphrase: self.passphrase.clone(),
        }
    }
}

/// Order-management surface of the exchange.
///
/// The batch place call accepts at most 15 orders and reports per-order
/// success/failure rather than failing the whole batch.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Fetch the L2 book for a single token.
    async fn get_order_book(&self, token_id: &str) -> Result<BookResponse, ClientError>;

    /// Place up to 15 orders in one batch.
    async fn post_orders(
        &self,
        orders: &[UserOrder],
        neg_risk: bool,
    ) -> Result<Vec<OrderResponse>, ClientError>;

    /// Cancel specific orders by ID.
    async fn cancel_orders(&self, order_ids: &[String]) -> Result<CancelResponse, ClientError>;

    /// Cancel every order resting on one market.
    async fn cancel_market_orders(
        &self,
        condition_id: &str,
    ) -> Result<CancelResponse, ClientError>;

    /// Emergency cancel across all markets.
    async fn cancel_all(&self) -> Result<CancelResponse, ClientError>;
}

/// Configuration for [`ClobClient`].
#[derive(Debug, Clone)]
pub struct ClobClientConfig {
    /// CLOB REST base URL, e.g. `https://clob.polymarket.com`.
    pub base_url: String,
    /// L2 credentials; `None` restricts the client to public endpoints.
    pub credentials: Option<ApiCredentials>,
    /// When true, mutating calls return fake successes without touching the
    /// exchange.
    pub dry_run: bool,
}

/// CLOB REST API client.
pub struct ClobClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<ApiCredentials>,
    limiter: RateLimiter,
    dry_run: bool,
}

impl ClobClient {
    pub fn new(cfg: ClobClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            credentials: cfg.credentials,
            limiter: RateLimiter::new(),
            dry_run: cfg.dry_run,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach credential headers when available. Public endpoints (book
    /// reads) work without them.
    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(creds) => req
                .header("POLY-API-KEY", &creds.api_key)
                .header("POLY-PASSPHRASE", &creds.passphrase)
                .header("POLY-TIMESTAMP", Utc::now().timestamp().to_string()),
            None => req,
        }
    }

    /// Send a request, retrying on transport errors and 5xx responses with
    /// exponential backoff. 4xx responses fail immediately.
    async fn execute<T, F>(&self, build: F) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut last_err: Option<ClientError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() {
                        let body = resp.text().await.unwrap_or_default();
                        warn!(status = status.as_u16(), attempt, "server error, retrying");
                        last_err = Some(ClientError::Status {
                            status: status.as_u16(),
                            body,
                        });
                        continue;
                    }
                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(ClientError::Status {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    return Ok(resp.json::<T>().await?);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "transport error, retrying");
                    last_err = Some(ClientError::Transport(e));
                }
            }
        }

        Err(last_err.unwrap_or(ClientError::Status {
            status: 0,
            body: "request retries exhausted".to_string(),
        }))
    }
}

#[async_trait]
impl Exchange for ClobClient {
    async fn get_order_book(&self, token_id: &str) -> Result<BookResponse, ClientError> {
        self.limiter.book.acquire().await;
        self.execute(|| {
            self.http
                .get(self.url("/book"))
                .query(&[("token_id", token_id)])
        })
        .await
    }

    async fn post_orders(
        &self,
        orders: &[UserOrder],
        neg_risk: bool,
    ) -> Result<Vec<OrderResponse>, ClientError> {
        if orders.is_empty() {
            return Ok(Vec::new());
        }
        if orders.len() > MAX_BATCH_SIZE {
            return Err(ClientError::BatchTooLarge(orders.len()));
        }
        if self.dry_run {
            info!(count = orders.len(), "DRY-RUN: would post orders");
            return Ok(orders
                .iter()
                .enumerate()
                .map(|(i, _)| OrderResponse {
                    success: true,
                    error_msg: String::new(),
                    order_id: format!("dry-run-{i}"),
                    status: "live".to_string(),
                })
                .collect());
        }

        self.limiter.order.acquire().await;

        let owner = self
            .credentials
            .as_ref()
            .map(|c| c.api_key.clone())
            .unwrap_or_default();
        let payloads: Vec<OrderPayload> = orders
            .iter()
            .map(|o| OrderPayload::from_user_order(o, &owner, neg_risk))
            .collect();

        self.execute(|| {
            self.with_auth(self.http.post(self.url("/orders")))
                .json(&payloads)
        })
        .await
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<CancelResponse, ClientError> {
        if order_ids.is_empty() {
            return Ok(CancelResponse::default());
        }
        if self.dry_run {
            info!(count = order_ids.len(), "DRY-RUN: would cancel orders");
            return Ok(CancelResponse {
                canceled: order_ids.to_vec(),
            });
        }

        self.limiter.cancel.acquire().await;

        #[derive(Serialize)]
        struct CancelPayload<'a> {
            #[serde(rename = "orderIDs")]
            order_ids: &'a [String],
        }

        let result: CancelResponse = self
            .execute(|| {
                self.with_auth(self.http.delete(self.url("/orders")))
                    .json(&CancelPayload { order_ids })
            })
            .await?;

        info!(count = result.canceled.len(), "orders cancelled");
        Ok(result)
    }

    async fn cancel_market_orders(
        &self,
        condition_id: &str,
    ) -> Result<CancelResponse, ClientError> {
        if self.dry_run {
            info!(market = condition_id, "DRY-RUN: would cancel market orders");
            return Ok(CancelResponse::default());
        }

        self.limiter.cancel.acquire().await;

        #[derive(Serialize)]
        struct MarketPayload<'a> {
            market: &'a str,
        }

        self.execute(|| {
            self.with_auth(self.http.delete(self.url("/cancel-market-orders")))
                .json(&MarketPayload {
                    market: condition_id,
                })
        })
        .await
    }

    async fn cancel_all(&self) -> Result<CancelResponse, ClientError> {
        if self.dry_run {
            info!("DRY-RUN: would cancel all orders");
            return Ok(CancelResponse::default());
        }

        self.limiter.cancel.acquire().await;

        let result: CancelResponse = self
            .execute(|| self.with_auth(self.http.delete(self.url("/cancel-all"))))
            .await?;

        warn!(count = result.canceled.len(), "all orders cancelled");
        Ok(result)
    }
}

/// Wire shape for one order in the batch POST body.
#[derive(Debug, Serialize)]
struct OrderPayload {
    order: WireOrder,
    /// API key of the order owner.
    owner: String,
    #[serde(rename = "orderType")]
    order_type: OrderType,
    #[serde(rename = "negRisk")]
    neg_risk: bool,
}

#[derive(Debug, Serialize)]
struct WireOrder {
    #[serde(rename = "tokenId")]
    token_id: String,
    price: String,
    side: Side,
    /// What the maker gives, in 1e-6 USDC/token units.
    #[serde(rename = "makerAmount")]
    maker_amount: String,
    /// What the maker receives, in 1e-6 units.
    #[serde(rename = "takerAmount")]
    taker_amount: String,
    expiration: String,
    #[serde(rename = "feeRateBps")]
    fee_rate_bps: String,
}

impl OrderPayload {
    fn from_user_order(order: &UserOrder, owner: &str, neg_risk: bool) -> Self {
        let (maker_amount, taker_amount) =
            price_to_amounts(order.price, order.size, order.side, order.tick_size);

        Self {
            order: WireOrder {
                token_id: order.token_id.clone(),
                price: order.price.to_string(),
                side: order.side,
                maker_amount: maker_amount.to_string(),
                taker_amount: taker_amount.to_string(),
                expiration: order.expiration.to_string(),
                fee_rate_bps: order.fee_rate_bps.to_string(),
            },
            owner: owner.to_string(),
            order_type: order.order_type,
            neg_risk,
        }
    }
}

/// Convert a human-readable price/size into integer maker/taker amounts.
///
/// Sizes are rounded to 2 decimals, USDC notional to the tick's amount
/// precision, then both are scaled to 1e6 integer units:
///
/// - BUY:  maker gives USDC (price × size), receives `size` tokens
/// - SELL: maker gives `size` tokens, receives USDC
pub fn price_to_amounts(
    price: Decimal,
    size: Decimal,
    side: Side,
    tick_size: TickSize,
) -> (i64, i64) {
    let size = size.round_dp(2);
    let usdc = (price * size).round_dp(tick_size.amount_decimals());

    let scale = Decimal::from(1_000_000u32);
    let usdc_units = (usdc * scale).round().to_i64().unwrap_or(0);
    let size_units = (size * scale).round().to_i64().unwrap_or(0);

    match side {
        Side::Buy => (usdc_units, size_units),
        Side::Sell => (size_units, usdc_units),
    }
}
