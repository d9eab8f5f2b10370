//! The central orchestrator.
//!
//! The engine wires every subsystem together:
//!
//! 1. The scanner discovers wide-spread markets.
//! 2. The engine starts/stops a quoting task per market
//!    ([`Engine::reconcile_markets`]).
//! 3. Each market slot gets a [`Book`] mirror, an [`Inventory`], and a
//!    [`Maker`] task with bounded trade/order channels.
//! 4. Two WebSocket dispatchers route feed events to the owning slot.
//! 5. The risk supervisor watches every market and can trigger the kill
//!    switch, which the engine answers with per-market or global stops.
//!
//! Lifecycle: `new() → run() → [until shutdown is triggered] → stop()`.
//! Unknown-market events are dropped silently (stale subscriptions); full
//! per-slot channels drop with a warning — the next quote tick reconciles
//! from authoritative exchange state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pmm_common::{
    MarketAllocation, MarketInfo, WsAuth, WsBookEvent, WsOrderEvent, WsPriceChangeEvent,
    WsTradeEvent,
};
use pmm_market::clob::Exchange;
use pmm_market::discovery::{ScanResult, Scanner, ScannerConfig};
use pmm_market::feed::{FeedMessage, WsFeed};
use pmm_market::orderbook::Book;

use crate::config::Config;
use crate::risk::{KillSignal, RiskManager};
use crate::store::Store;
use crate::strategy::{Inventory, Maker};

/// Per-slot trade/order channel capacity.
const SLOT_BUFFER: usize = 64;
/// Timeout for the exchange-level cancel-all safety net on a global kill.
const KILL_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for awaiting each task during shutdown.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One actively traded market: its state, channels, and quoting task.
struct MarketSlot {
    info: MarketInfo,
    book: Arc<Book>,
    inventory: Arc<Inventory>,
    trade_tx: mpsc::Sender<WsTradeEvent>,
    order_tx: mpsc::Sender<WsOrderEvent>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Orchestrates all components of the market-making system. Owns the slot
/// table and the token→market index; everything else is shared by handle.
pub struct Engine {
    cfg: Config,
    client: Arc<dyn Exchange>,
    mkt_feed: Arc<WsFeed>,
    usr_feed: Arc<WsFeed>,
    mkt_events: Mutex<Option<mpsc::Receiver<FeedMessage>>>,
    usr_events: Mutex<Option<mpsc::Receiver<FeedMessage>>>,
    scanner: Arc<Scanner>,
    scan_rx: watch::Receiver<Option<ScanResult>>,
    risk: Arc<RiskManager>,
    store: Store,

    /// condition id → running market.
    slots: RwLock<HashMap<String, MarketSlot>>,
    /// token id → condition id, so market events (keyed by token) can be
    /// routed to the owning slot. Lifecycle is the single writer; the
    /// dispatchers read without contending with it.
    token_map: DashMap<String, String>,

    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Wire all engine components. Fails only on unrecoverable setup
    /// problems (bad store directory, malformed URLs).
    pub fn new(cfg: Config, client: Arc<dyn Exchange>) -> Result<Self> {
        let store = Store::open(&cfg.store.data_dir)
            .with_context(|| format!("failed to open store at {}", cfg.store.data_dir))?;

        let (mkt_feed, mkt_events) = WsFeed::market(cfg.api.ws_market_url.clone());
        let auth = WsAuth {
            api_key: cfg.api.api_key.clone().unwrap_or_default(),
            secret: cfg.api.api_secret.clone().unwrap_or_default(),
            passphrase: cfg.api.api_passphrase.clone().unwrap_or_default(),
        };
        let (usr_feed, usr_events) = WsFeed::user(cfg.api.ws_user_url.clone(), auth);

        let (scanner, scan_rx) = Scanner::new(ScannerConfig {
            gamma_base_url: cfg.api.gamma_base_url.clone(),
            poll_interval: cfg.scanner.poll_interval,
            min_liquidity: cfg.scanner.min_liquidity,
            min_volume_24h: cfg.scanner.min_volume_24h,
            min_spread: cfg.scanner.min_spread,
            max_end_date_days: cfg.scanner.max_end_date_days,
            exclude_slugs: cfg.scanner.exclude_slugs.clone(),
            max_markets: cfg.risk.max_markets_active,
            max_position_usd: cfg.risk.max_position_per_market,
        })
        .context("failed to build scanner")?;

        let risk = Arc::new(RiskManager::new(cfg.risk.clone()));
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            cfg,
            client,
            mkt_feed: Arc::new(mkt_feed),
            usr_feed: Arc::new(usr_feed),
            mkt_events: Mutex::new(Some(mkt_events)),
            usr_events: Mutex::new(Some(usr_events)),
            scanner: Arc::new(scanner),
            scan_rx,
            risk,
            store,
            slots: RwLock::new(HashMap::new()),
            token_map: DashMap::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Ask the engine to shut down. Safe to call from any task (e.g. a
    /// signal handler).
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run until shutdown is triggered, then stop cleanly.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // Subscribe before starting so a trigger racing startup is not lost.
        let mut shutdown = self.shutdown_tx.subscribe();
        self.start();

        let _ = shutdown.recv().await;

        self.stop().await;
        Ok(())
    }

    /// Launch all background tasks: feeds, scanner, risk supervisor, event
    /// dispatchers, and the lifecycle loop.
    fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let feed = self.mkt_feed.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = feed.run(shutdown).await {
                error!(error = %e, "market feed error");
            }
        }));

        let feed = self.usr_feed.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = feed.run(shutdown).await {
                error!(error = %e, "user feed error");
            }
        }));

        let scanner = self.scanner.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            scanner.run(shutdown).await;
        }));

        let risk = self.risk.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            risk.run(shutdown).await;
        }));

        if let Some(rx) = self.mkt_events.lock().take() {
            let engine = self.clone();
            tasks.push(tokio::spawn(async move {
                engine.dispatch_market_events(rx).await;
            }));
        }
        if let Some(rx) = self.usr_events.lock().take() {
            let engine = self.clone();
            tasks.push(tokio::spawn(async move {
                engine.dispatch_user_events(rx).await;
            }));
        }

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            engine.manage_markets().await;
        }));

        info!("engine started");
    }

    /// Graceful shutdown: stop every market (each maker cancels its own
    /// orders on the way out), fire a bounded cancel-all as a safety net,
    /// persist final positions, and wait for all tasks to finish.
    async fn stop(&self) {
        info!("shutting down...");

        let _ = self.shutdown_tx.send(());

        // Safety net: cancel everything on the exchange.
        match tokio::time::timeout(self.cfg.strategy.stale_book_timeout, self.client.cancel_all())
            .await
        {
            Ok(Ok(resp)) => debug!(count = resp.canceled.len(), "cancel-all safety net done"),
            Ok(Err(e)) => error!(error = %e, "failed to cancel all orders on shutdown"),
            Err(_) => error!("cancel-all timed out on shutdown"),
        }

        // Stop every slot: persists positions and signals the maker tasks.
        {
            let mut slots = self.slots.write().await;
            let ids: Vec<String> = slots.keys().cloned().collect();
            for id in ids {
                self.stop_market_locked(&mut slots, &id);
            }
        }

        // Wait for all tasks (bounded per task).
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("task did not finish within shutdown timeout");
            }
        }

        info!("shutdown complete");
    }

    /// The lifecycle loop: react to scanner selections and kill signals.
    async fn manage_markets(self: Arc<Self>) {
        let mut scan_rx = self.scan_rx.clone();
        let mut kill_rx = self.risk.subscribe_kills();
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,

                changed = scan_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let latest = scan_rx.borrow_and_update().clone();
                    if let Some(result) = latest {
                        self.reconcile_markets(result).await;
                    }
                }

                kill = kill_rx.recv() => match kill {
                    Ok(sig) => self.handle_kill_signal(sig).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "kill receiver lagged, stale signals skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Diff the desired market set against running slots: stop what is no
    /// longer selected, start what is newly selected.
    pub async fn reconcile_markets(&self, result: ScanResult) {
        let desired: HashMap<String, MarketAllocation> = result
            .markets
            .into_iter()
            .map(|alloc| (alloc.market.condition_id.clone(), alloc))
            .collect();

        let mut slots = self.slots.write().await;

        let current: Vec<String> = slots.keys().cloned().collect();
        for id in current {
            if !desired.contains_key(&id) {
                self.stop_market_locked(&mut slots, &id);
            }
        }

        for (id, alloc) in desired {
            if !slots.contains_key(&id) {
                self.start_market_locked(&mut slots, alloc).await;
            }
        }
    }

    async fn start_market_locked(
        &self,
        slots: &mut HashMap<String, MarketSlot>,
        alloc: MarketAllocation,
    ) {
        let info = alloc.market;
        if info.yes_token_id.is_empty() || info.no_token_id.is_empty() {
            warn!(slug = %info.slug, "skipping market with missing token ids");
            return;
        }

        let book = Arc::new(Book::new(
            info.condition_id.clone(),
            info.yes_token_id.clone(),
            info.no_token_id.clone(),
        ));
        let inventory = Arc::new(Inventory::new(
            info.condition_id.clone(),
            info.yes_token_id.clone(),
            info.no_token_id.clone(),
        ));

        // Restore position from persistence.
        match self.store.load_position(&info.condition_id) {
            Ok(Some(pos)) => inventory.set_position(pos),
            Ok(None) => {}
            Err(e) => warn!(market = %info.condition_id, error = %e, "failed to load position"),
        }

        let (trade_tx, trade_rx) = mpsc::channel(SLOT_BUFFER);
        let (order_tx, order_rx) = mpsc::channel(SLOT_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.token_map
            .insert(info.yes_token_id.clone(), info.condition_id.clone());
        self.token_map
            .insert(info.no_token_id.clone(), info.condition_id.clone());

        self.mkt_feed
            .subscribe(&[info.yes_token_id.clone(), info.no_token_id.clone()]);
        self.usr_feed.subscribe(&[info.condition_id.clone()]);

        // Fetch initial book snapshots before the strategy starts quoting.
        for token_id in [&info.yes_token_id, &info.no_token_id] {
            match self.client.get_order_book(token_id).await {
                Ok(resp) => book.apply_book_response(&resp),
                Err(e) => error!(token = %token_id, error = %e, "failed to get initial book"),
            }
        }

        let maker = Maker::new(
            self.cfg.strategy.clone(),
            info.clone(),
            book.clone(),
            inventory.clone(),
            self.client.clone(),
            self.risk.clone(),
        );
        let task = tokio::spawn(async move {
            maker.run(trade_rx, order_rx, cancel_rx).await;
        });

        info!(
            slug = %info.slug,
            condition_id = %info.condition_id,
            score = alloc.score,
            "market started"
        );

        slots.insert(
            info.condition_id.clone(),
            MarketSlot {
                info,
                book,
                inventory,
                trade_tx,
                order_tx,
                cancel_tx,
                task,
            },
        );
    }

    fn stop_market_locked(&self, slots: &mut HashMap<String, MarketSlot>, condition_id: &str) {
        let Some(slot) = slots.remove(condition_id) else {
            return;
        };

        // The maker cancels its own live orders on the way out.
        let _ = slot.cancel_tx.send(true);

        if let Err(e) = self
            .store
            .save_position(condition_id, &slot.inventory.snapshot())
        {
            error!(market = %condition_id, error = %e, "failed to save position on stop");
        }

        self.mkt_feed.unsubscribe(&[
            slot.info.yes_token_id.clone(),
            slot.info.no_token_id.clone(),
        ]);
        self.usr_feed.unsubscribe(&[condition_id.to_string()]);

        self.risk.remove_market(condition_id);

        self.token_map.remove(&slot.info.yes_token_id);
        self.token_map.remove(&slot.info.no_token_id);

        // Awaited (bounded) during shutdown.
        self.tasks.lock().push(slot.task);

        info!(slug = %slot.info.slug, "market stopped");
    }

    async fn handle_kill_signal(&self, kill: KillSignal) {
        error!(
            market = kill.market.as_deref().unwrap_or("ALL"),
            reason = %kill.reason,
            "KILL SIGNAL received"
        );

        match kill.market {
            Some(id) => {
                let mut slots = self.slots.write().await;
                self.stop_market_locked(&mut slots, &id);
            }
            None => {
                {
                    let mut slots = self.slots.write().await;
                    let ids: Vec<String> = slots.keys().cloned().collect();
                    for id in ids {
                        self.stop_market_locked(&mut slots, &id);
                    }
                }
                // Safety net on a global kill.
                match tokio::time::timeout(KILL_CANCEL_TIMEOUT, self.client.cancel_all()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(error = %e, "failed to cancel all orders"),
                    Err(_) => error!("global cancel-all timed out"),
                }
            }
        }
    }

    /// Route market-feed events to the owning slot's book. Events for
    /// unknown tokens are stale subscriptions and dropped silently.
    async fn dispatch_market_events(self: Arc<Self>, mut rx: mpsc::Receiver<FeedMessage>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                event = rx.recv() => match event {
                    None => return,
                    Some(FeedMessage::Book(evt)) => self.route_book_event(evt).await,
                    Some(FeedMessage::PriceChange(evt)) => self.route_price_change(evt).await,
                    Some(_) => debug!("unexpected event type on market feed"),
                },
            }
        }
    }

    async fn route_book_event(&self, evt: WsBookEvent) {
        let Some(condition_id) = self.token_map.get(&evt.asset_id).map(|e| e.value().clone())
        else {
            return;
        };
        let slots = self.slots.read().await;
        if let Some(slot) = slots.get(&condition_id) {
            slot.book.apply_book_event(&evt);
        }
    }

    async fn route_price_change(&self, evt: WsPriceChangeEvent) {
        let Some(first) = evt.price_changes.first() else {
            return;
        };
        let Some(condition_id) = self.token_map.get(&first.asset_id).map(|e| e.value().clone())
        else {
            return;
        };
        let slots = self.slots.read().await;
        if let Some(slot) = slots.get(&condition_id) {
            slot.book.apply_price_change(&evt);
        }
    }

    /// Route user-feed events into the owning slot's bounded channels.
    async fn dispatch_user_events(self: Arc<Self>, mut rx: mpsc::Receiver<FeedMessage>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                event = rx.recv() => match event {
                    None => return,
                    Some(FeedMessage::Trade(evt)) => self.route_trade(evt).await,
                    Some(FeedMessage::Order(evt)) => self.route_order(evt).await,
                    Some(_) => debug!("unexpected event type on user feed"),
                },
            }
        }
    }

    async fn route_trade(&self, evt: WsTradeEvent) {
        let slots = self.slots.read().await;
        if let Some(slot) = slots.get(&evt.market) {
            if slot.trade_tx.try_send(evt).is_err() {
                warn!("trade channel full, dropping event");
            }
        }
    }

    async fn route_order(&self, evt: WsOrderEvent) {
        let slots = self.slots.read().await;
        if let Some(slot) = slots.get(&evt.market) {
            if slot.order_tx.try_send(evt).is_err() {
                warn!("order channel full, dropping event");
            }
        }
    }

    #[cfg(test)]
    async fn active_market_ids(&self) -> Vec<String> {
        self.slots.read().await.keys().cloned().collect()
    }
}
