//! The Coordinator API.
//!
//! Defines the core functionality of the settlement coordinator. It owns the
//! match registry and per-order swap accounting, runs the supervisor loop
//! that fans in block notifications from every asset backend, advances
//! confirmation times, arms and fires the two inaction sweeps, and drives
//! the graceful-shutdown sequence that fences handlers, drains the helper
//! threads and snapshots live state.
//!
//! Lock order, outer to inner: match registry, match state, swap status.
//! The order-swap tracker has its own mutex, taken only with no other lock
//! held. Backend and database calls are never made under the registry write
//! lock.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    asset::{Asset, BackendError, BlockUpdate, CoinLocker},
    auth::AuthManager,
    market::{AccountId, AssetId, LimitOrder, MatchId, MatchStatus, OrderId, Side},
    storage::Storage,
    utill::{now_ms, HEART_BEAT_INTERVAL},
};

use super::{
    config::CoordinatorConfig,
    error::CoordinatorError,
    handlers::{HandlerArgs, WaiterKey},
    orders::OrderSwapTracker,
    tracker::{MatchRegistry, MatchTracker},
    waiter::TickerQueue,
};

/// Buffer for the block fan-in channel. Backends block when the supervisor
/// falls this far behind.
const BLOCK_CHANNEL_CAPACITY: usize = 32;

/// Hook called with a limit order to be removed from the matching book.
/// Returns whether the order was still booked.
pub type UnbookHook = Box<dyn Fn(&LimitOrder) -> bool + Send + Sync>;

pub(crate) struct ThreadPool {
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_thread(&self, handle: JoinHandle<()>) {
        let mut threads = self.threads.lock().expect("thread pool poisoned");
        threads.push(handle);
    }

    pub(crate) fn join_all_threads(&self) -> Result<(), CoordinatorError> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| CoordinatorError::MutexPoison)?;

        log::info!("Joining {} threads", threads.len());
        while let Some(thread) = threads.pop() {
            let thread_name = thread
                .thread()
                .name()
                .unwrap_or("unnamed")
                .to_string();
            match thread.join() {
                Ok(_) => log::info!("Thread {} joined", thread_name),
                Err(e) => log::error!("Error {:?} while joining thread {}", e, thread_name),
            }
        }
        Ok(())
    }
}

/// Events arriving at the supervisor loop.
enum LoopEvent {
    Block { asset: AssetId, update: BlockUpdate },
    InactionTick,
    StorageFatal,
}

/// A user-facing view of one live match, for reconnecting clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchStatusReport {
    pub match_id: MatchId,
    pub status: MatchStatus,
    /// The side the queried user is on.
    pub side: Side,
}

/// The settlement coordinator.
pub struct Coordinator {
    pub(crate) cfg: CoordinatorConfig,
    pub(crate) assets: HashMap<AssetId, Arc<Asset>>,
    pub(crate) coin_lockers: HashMap<AssetId, Arc<dyn CoinLocker>>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) auth: Arc<dyn AuthManager>,
    pub(crate) unbook_hook: UnbookHook,
    pub(crate) registry: MatchRegistry,
    pub(crate) order_tracker: OrderSwapTracker,
    /// Pairs negotiation with matching so a concurrent swap completion
    /// cannot mark an order complete between matching and tracking.
    pub(crate) matching_mtx: Mutex<()>,
    /// Arguments of every in-flight coin waiter, for the snapshot.
    pub(crate) live_waiters: Mutex<HashMap<WaiterKey, HandlerArgs>>,
    pub(crate) waiter_queue: TickerQueue,
    /// Shutdown fence. Handlers hold it in read mode for validation and
    /// waiter enqueueing; the supervisor write-locks it to set the stop
    /// flag, making all in-flight enqueues visible before the queue drains.
    pub(crate) handler_fence: RwLock<bool>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) data_dir: PathBuf,
    thread_pool: ThreadPool,
}

impl Coordinator {
    /// Initializes a Coordinator.
    ///
    /// `tx_wait_expiration_ms` is clamped to `broadcast_timeout_ms` here; a
    /// coin waiter must never outlive the deadline that would revoke its
    /// match.
    pub fn new(
        mut cfg: CoordinatorConfig,
        data_dir: PathBuf,
        assets: Vec<Asset>,
        coin_lockers: HashMap<AssetId, Arc<dyn CoinLocker>>,
        storage: Arc<dyn Storage>,
        auth: Arc<dyn AuthManager>,
        unbook_hook: UnbookHook,
    ) -> Result<Self, CoordinatorError> {
        if cfg.tx_wait_expiration_ms > cfg.broadcast_timeout_ms {
            log::warn!(
                "tx_wait_expiration_ms {} exceeds broadcast_timeout_ms {}, clamping",
                cfg.tx_wait_expiration_ms,
                cfg.broadcast_timeout_ms
            );
            cfg.tx_wait_expiration_ms = cfg.broadcast_timeout_ms;
        }

        std::fs::create_dir_all(&data_dir)?;

        let mut asset_map = HashMap::new();
        for asset in assets {
            log::info!(
                "configuring asset {} ({}) with swap conf {}",
                asset.id,
                asset.symbol,
                asset.swap_conf
            );
            if asset_map.insert(asset.id, Arc::new(asset)).is_some() {
                return Err(CoordinatorError::General("duplicate asset id"));
            }
        }

        let recheck = Duration::from_millis(cfg.recheck_interval_ms.max(1));
        Ok(Coordinator {
            cfg,
            assets: asset_map,
            coin_lockers,
            storage,
            auth,
            unbook_hook,
            registry: MatchRegistry::new(),
            order_tracker: OrderSwapTracker::new(),
            matching_mtx: Mutex::new(()),
            live_waiters: Mutex::new(HashMap::new()),
            waiter_queue: TickerQueue::new(recheck),
            handler_fence: RwLock::new(false),
            shutdown: AtomicBool::new(false),
            data_dir,
            thread_pool: ThreadPool::new(),
        })
    }

    /// The effective transaction-wait expiration after clamping.
    pub fn tx_wait_expiration_ms(&self) -> u64 {
        self.cfg.tx_wait_expiration_ms
    }

    /// Number of live matches under settlement.
    pub fn live_match_count(&self) -> usize {
        self.registry.len()
    }

    /// Current status of the given matches as far as they involve the user.
    /// Unknown or foreign match ids are omitted.
    pub fn user_swap_status(&self, user: AccountId, mids: &[MatchId]) -> Vec<MatchStatusReport> {
        mids.iter()
            .filter_map(|mid| {
                let tracker = self.registry.get(mid)?;
                let side = if tracker.detail.maker.user == user {
                    Side::Maker
                } else if tracker.detail.taker.user() == user {
                    Side::Taker
                } else {
                    return None;
                };
                Some(MatchStatusReport {
                    match_id: *mid,
                    status: tracker.status(),
                    side,
                })
            })
            .collect()
    }

    /// Match ids of every live match involving the user.
    pub fn user_match_ids(&self, user: AccountId) -> Vec<MatchId> {
        self.registry.user_match_ids(user)
    }

    /// Whether any live match involves the order.
    pub fn order_has_active_swaps(&self, oid: &OrderId) -> bool {
        self.registry.order_has_active(oid)
    }

    /// Fence off the handlers and cancel the helper threads. [Self::run]
    /// returns after the next heartbeat, completing the shutdown sequence.
    pub fn stop(&self) {
        {
            let mut stop = self.handler_fence.write().expect("handler fence poisoned");
            *stop = true;
        }
        self.shutdown.store(true, Relaxed);
        log::info!("coordinator stop requested");
    }

    /// Run the supervisor until [Self::stop]. Spawns the block fan-in
    /// threads, the event-based inaction ticker, the coin-waiter ticker and
    /// the storage fatal watcher, then processes block notifications and
    /// deadlines on the calling thread. On return all helper threads are
    /// joined and a state snapshot has been written.
    pub fn run(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        let (tx, rx) = mpsc::sync_channel::<LoopEvent>(BLOCK_CHANNEL_CAPACITY);

        // Storage fatal watcher. Fail closed: a dying database must stop
        // settlement rather than let matches advance unrecorded.
        let fatal_rx = self.storage.fatal_channel();
        let fatal_tx = tx.clone();
        let me = self.clone();
        let handle = std::thread::Builder::new()
            .name("storage-fatal-watcher".to_string())
            .spawn(move || loop {
                match fatal_rx.recv_timeout(HEART_BEAT_INTERVAL) {
                    Ok(()) => {
                        let _ = fatal_tx.send(LoopEvent::StorageFatal);
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if me.shutdown.load(Relaxed) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        self.thread_pool.add_thread(handle);

        // One block fan-in thread per configured asset.
        for asset in self.assets.values() {
            let block_rx = asset.backend.block_channel();
            let block_tx = tx.clone();
            let me = self.clone();
            let asset_id = asset.id;
            let symbol = asset.symbol.clone();
            let handle = std::thread::Builder::new()
                .name(format!("block-fanin-{}", symbol))
                .spawn(move || loop {
                    match block_rx.recv_timeout(HEART_BEAT_INTERVAL) {
                        Ok(update) => {
                            if block_tx
                                .send(LoopEvent::Block {
                                    asset: asset_id,
                                    update,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if me.shutdown.load(Relaxed) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            log::warn!("[{}] block channel closed", symbol);
                            break;
                        }
                    }
                })?;
            self.thread_pool.add_thread(handle);
        }

        // Event-based inaction ticker, at a quarter of the timeout.
        let tick_interval = Duration::from_millis((self.cfg.broadcast_timeout_ms / 4).max(1));
        let tick_tx = tx.clone();
        let me = self.clone();
        let handle = std::thread::Builder::new()
            .name("inaction-ticker".to_string())
            .spawn(move || {
                let nap = HEART_BEAT_INTERVAL.min(tick_interval);
                let mut elapsed = Duration::from_millis(0);
                while !me.shutdown.load(Relaxed) {
                    std::thread::sleep(nap);
                    elapsed += nap;
                    if elapsed >= tick_interval {
                        elapsed = Duration::from_millis(0);
                        if tick_tx.send(LoopEvent::InactionTick).is_err() {
                            break;
                        }
                    }
                }
            })?;
        self.thread_pool.add_thread(handle);

        // The coin-waiter ticker.
        let me = self.clone();
        let handle = std::thread::Builder::new()
            .name("coin-waiter-queue".to_string())
            .spawn(move || me.waiter_queue.run(&me.shutdown))?;
        self.thread_pool.add_thread(handle);

        drop(tx);
        log::info!(
            "coordinator running with {} assets, broadcast timeout {}ms",
            self.assets.len(),
            self.cfg.broadcast_timeout_ms
        );

        // Deadlines for block-based inaction sweeps, armed one broadcast
        // timeout after each processed block.
        let mut deadlines: BinaryHeap<Reverse<(u64, AssetId)>> = BinaryHeap::new();

        loop {
            if self.shutdown.load(Relaxed) {
                break;
            }

            let now = now_ms();
            while let Some(&Reverse((due, asset))) = deadlines.peek() {
                if due > now {
                    break;
                }
                deadlines.pop();
                self.check_inaction_block_based(asset);
            }

            let wait = deadlines
                .peek()
                .map(|r| Duration::from_millis((r.0).0.saturating_sub(now)))
                .unwrap_or(HEART_BEAT_INTERVAL)
                .min(HEART_BEAT_INTERVAL);

            match rx.recv_timeout(wait) {
                Ok(LoopEvent::Block { asset, update }) => {
                    self.process_block(asset, &update);
                    // Arm the derived deadline only after the block is fully
                    // processed.
                    deadlines.push(Reverse((
                        now_ms() + self.cfg.broadcast_timeout_ms,
                        asset,
                    )));
                }
                Ok(LoopEvent::InactionTick) => self.check_inaction_event_based(),
                Ok(LoopEvent::StorageFatal) => {
                    log::error!(
                        "storage signalled a fatal error: {:?}; shutting down",
                        self.storage.last_error()
                    );
                    self.stop();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.stop();
        self.thread_pool.join_all_threads()?;

        // Handlers are fenced and the waiter queue has stopped; live state
        // is stable for the snapshot.
        match self.write_snapshot() {
            Ok(path) => log::info!("state snapshot written to {}", path.display()),
            Err(e) => log::error!("failed to write state snapshot: {:?}", e),
        }

        log::info!("coordinator stopped");
        Ok(())
    }

    /// Advance confirmation state for every match touched by a new block on
    /// the asset.
    fn process_block(&self, asset_id: AssetId, update: &BlockUpdate) {
        if let Some(err) = &update.err {
            log::warn!("block note for asset {} carried error: {}", asset_id, err);
            return;
        }
        let asset = match self.assets.get(&asset_id) {
            Some(asset) => asset.clone(),
            None => return,
        };
        log::debug!("[{}] processing block at {}", asset.symbol, update.time);

        for tracker in self.registry.all() {
            // Pin the status while confirming so a concurrent init cannot
            // slip between the check and the update.
            let state = tracker.state.read().expect("match state poisoned");
            let side = match state.status {
                MatchStatus::MakerSwapCast => Side::Maker,
                MatchStatus::TakerSwapCast => Side::Taker,
                _ => continue,
            };

            let mut swap_status = tracker.swap_status(side).write().expect("swap status poisoned");
            if swap_status.swap_asset != asset_id || swap_status.swap_confirm_time != 0 {
                continue;
            }
            let coin_id = match &swap_status.swap {
                Some(contract) => contract.coin_id.clone(),
                None => continue,
            };

            match asset.backend.confirmations(&coin_id) {
                Ok(confs) if confs >= asset.swap_conf => {
                    swap_status.swap_confirm_time = update.time;
                    log::info!(
                        "[{}] {} swap for match {} reached {} confirmations",
                        asset.symbol,
                        side,
                        tracker.detail.id,
                        confs
                    );
                    drop(swap_status);
                    drop(state);
                    self.unlock_funding_coins(&tracker, side);
                }
                Ok(_) => {}
                Err(BackendError::CoinNotFound) => log::warn!(
                    "[{}] cast swap coin for match {} not found",
                    asset.symbol,
                    tracker.detail.id
                ),
                Err(e) => log::warn!(
                    "[{}] confirmation query failed for match {}: {}",
                    asset.symbol,
                    tracker.detail.id,
                    e
                ),
            }
        }
    }

    /// Release the funding coins backing the given side's order.
    pub(crate) fn unlock_funding_coins(&self, tracker: &MatchTracker, side: Side) {
        let asset_id = tracker.detail.swap_asset(side);
        let oid = tracker.detail.order_id(side);
        if let Some(locker) = self.coin_lockers.get(&asset_id) {
            locker.unlock_order_coins(&oid);
        }
    }

    /// Block-based inaction sweep for one asset: revoke matches whose next
    /// actor sat on a confirmed counterparty swap for a full broadcast
    /// timeout.
    fn check_inaction_block_based(&self, asset_id: AssetId) {
        let bto = self.cfg.broadcast_timeout_ms;
        let now = now_ms();
        let stalled = self.registry.sweep(|tracker| match tracker.status() {
            MatchStatus::MakerSwapCast => {
                let ss = tracker.maker_status.read().expect("swap status poisoned");
                ss.swap_asset == asset_id
                    && ss.swap_confirm_time != 0
                    && now.saturating_sub(ss.swap_confirm_time) >= bto
            }
            MatchStatus::TakerSwapCast => {
                let ss = tracker.taker_status.read().expect("swap status poisoned");
                ss.swap_asset == asset_id
                    && ss.swap_confirm_time != 0
                    && now.saturating_sub(ss.swap_confirm_time) >= bto
            }
            _ => false,
        });

        for tracker in stalled {
            self.revoke_match_tracker(tracker);
        }
    }

    /// Event-based inaction sweep: revoke matches whose next actor never
    /// responded to the match itself or to the maker's redemption. A zero
    /// event time means not yet observed and never triggers.
    fn check_inaction_event_based(&self) {
        let bto = self.cfg.broadcast_timeout_ms;
        let now = now_ms();
        let stalled = self.registry.sweep(|tracker| match tracker.status() {
            MatchStatus::NewlyMatched => now.saturating_sub(tracker.time) >= bto,
            MatchStatus::MakerRedeemed => {
                let redeem_time = tracker
                    .maker_status
                    .read()
                    .expect("swap status poisoned")
                    .redeem_time;
                redeem_time != 0 && now.saturating_sub(redeem_time) >= bto
            }
            _ => false,
        });

        for tracker in stalled {
            self.revoke_match_tracker(tracker);
        }
    }

    /// Account a finished swap for the order, failed or not, and record the
    /// order's successful completion when this was the last one. Serialized
    /// against negotiation so a completion cannot race a new match for the
    /// same order.
    pub(crate) fn swap_done(&self, oid: OrderId, user: AccountId, failed: bool) {
        let _guard = self.matching_mtx.lock().expect("matching mutex poisoned");
        if self.order_tracker.dec_active(oid, failed) {
            let now = now_ms();
            if let Err(e) = self.storage.set_order_complete_time(oid, now) {
                log::error!("failed to record completion time for order {}: {}", oid, e);
            }
            self.auth.record_completed_order(user, oid, now);
            log::info!("order {} successfully completed", oid);
        }
    }
}
