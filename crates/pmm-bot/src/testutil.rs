//! Shared test doubles for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use pmm_common::{BookResponse, CancelResponse, OrderResponse, PriceLevel, UserOrder};
use pmm_market::clob::{ClientError, Exchange};

/// In-memory [`Exchange`] that records every call and tracks live order ids
/// so market-wide cancels behave like the real thing.
#[derive(Default)]
pub struct MockExchange {
    placed: Mutex<Vec<Vec<UserOrder>>>,
    cancelled: Mutex<Vec<Vec<String>>>,
    market_cancels: Mutex<Vec<String>>,
    cancel_all_calls: AtomicUsize,
    books: Mutex<HashMap<String, BookResponse>>,
    live: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_book(&self, token_id: &str, bids: &[(&str, &str)], asks: &[(&str, &str)]) {
        let resp = BookResponse {
            asset_id: token_id.to_string(),
            bids: bids.iter().map(|(p, s)| PriceLevel::new(*p, *s)).collect(),
            asks: asks.iter().map(|(p, s)| PriceLevel::new(*p, *s)).collect(),
            hash: "mock".to_string(),
            ..Default::default()
        };
        self.books.lock().insert(token_id.to_string(), resp);
    }

    pub fn placed_batches(&self) -> usize {
        self.placed.lock().len()
    }

    pub fn placed_orders(&self) -> Vec<UserOrder> {
        self.placed.lock().iter().flatten().cloned().collect()
    }

    pub fn cancel_batches(&self) -> usize {
        self.cancelled.lock().len()
    }

    pub fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().iter().flatten().cloned().collect()
    }

    pub fn market_cancel_calls(&self) -> usize {
        self.market_cancels.lock().len()
    }

    pub fn cancel_all_calls(&self) -> usize {
        self.cancel_all_calls.load(Ordering::SeqCst)
    }

    pub fn live_order_count(&self) -> usize {
        self.live.lock().len()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn get_order_book(&self, token_id: &str) -> Result<BookResponse, ClientError> {
        Ok(self
            .books
            .lock()
            .get(token_id)
            .cloned()
            .unwrap_or_else(|| BookResponse {
                asset_id: token_id.to_string(),
                ..Default::default()
            }))
    }

    async fn post_orders(
        &self,
        orders: &[UserOrder],
        _neg_risk: bool,
    ) -> Result<Vec<OrderResponse>, ClientError> {
        self.placed.lock().push(orders.to_vec());

        let mut live = self.live.lock();
        Ok(orders
            .iter()
            .map(|_| {
                let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                live.insert(id.clone());
                OrderResponse {
                    success: true,
                    error_msg: String::new(),
                    order_id: id,
                    status: "live".to_string(),
                }
            })
            .collect())
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<CancelResponse, ClientError> {
        self.cancelled.lock().push(order_ids.to_vec());
        let mut live = self.live.lock();
        for id in order_ids {
            live.remove(id);
        }
        Ok(CancelResponse {
            canceled: order_ids.to_vec(),
        })
    }

    async fn cancel_market_orders(
        &self,
        condition_id: &str,
    ) -> Result<CancelResponse, ClientError> {
        self.market_cancels.lock().push(condition_id.to_string());
        let canceled: Vec<String> = self.live.lock().drain().collect();
        Ok(CancelResponse { canceled })
    }

    async fn cancel_all(&self) -> Result<CancelResponse, ClientError> {
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        let canceled: Vec<String> = self.live.lock().drain().collect();
        Ok(CancelResponse { canceled })
    }
}
