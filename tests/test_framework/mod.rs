//! A framework to write functional tests for the swap coordinator.
//!
//! Spawns a coordinator over two mock asset backends (a base and a quote
//! chain), a recording storage, a recording auth manager that plays both
//! parties' acknowledgement behavior, and mock coin lockers. Tests drive the
//! protocol by feeding contracts, redemptions and blocks to the backends and
//! client messages to the handlers, then assert on the recorded effects.
//!
//! Checkout `tests/standard_swap.rs` for a full happy-path settlement.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use swapd::{
    asset::{Asset, Backend, BackendError, BlockUpdate, CoinLocker, Contract, Redemption},
    auth::{AckHandler, AuthError, AuthManager, NoActionStep, RequestError},
    coordinator::{config::CoordinatorConfig, Coordinator},
    market::{
        AccountId, AssetId, CancelOrder, CoinId, LimitOrder, MatchId, MatchSet, OrderId,
        TakerOrder, RATE_ENCODING_FACTOR,
    },
    now_ms,
    protocol::messages::{Acknowledgement, Init, MsgError, Redeem, Request},
    storage::{Storage, StorageError},
};

/// Base asset id of the test market.
pub const BASE: AssetId = 42;
/// Quote asset id of the test market.
pub const QUOTE: AssetId = 0;
/// Rate of the test market: quote atoms per base unit.
pub const TEST_RATE: u64 = 150_000;
/// Fee rate both mock backends report.
pub const TEST_FEE_RATE: u64 = 10;

pub fn mock_sig(payload: &[u8]) -> Vec<u8> {
    let mut sig = b"sig:".to_vec();
    sig.extend_from_slice(payload);
    sig
}

/// A programmable mock chain backend.
pub struct TestBackend {
    symbol: &'static str,
    contracts: Mutex<HashMap<CoinId, Contract>>,
    redemptions: Mutex<HashMap<CoinId, Redemption>>,
    confs: Mutex<HashMap<CoinId, u32>>,
    /// Remaining probes that report CoinNotFound before a contract lookup
    /// succeeds.
    not_found: Mutex<HashMap<CoinId, u32>>,
    /// Total contract probes per coin.
    pub probes: Mutex<HashMap<CoinId, u32>>,
    fee_rate: Mutex<u64>,
    valid_secret: Mutex<Vec<u8>>,
    block_tx: Mutex<Option<Sender<BlockUpdate>>>,
}

impl TestBackend {
    pub fn new(symbol: &'static str) -> Arc<Self> {
        Arc::new(TestBackend {
            symbol,
            contracts: Mutex::new(HashMap::new()),
            redemptions: Mutex::new(HashMap::new()),
            confs: Mutex::new(HashMap::new()),
            not_found: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            fee_rate: Mutex::new(TEST_FEE_RATE),
            valid_secret: Mutex::new(vec![7; 32]),
            block_tx: Mutex::new(None),
        })
    }

    /// Make a contract discoverable after `not_found_times` failing probes.
    pub fn add_contract(&self, contract: Contract, not_found_times: u32) {
        if not_found_times > 0 {
            self.not_found
                .lock()
                .unwrap()
                .insert(contract.coin_id.clone(), not_found_times);
        }
        self.contracts
            .lock()
            .unwrap()
            .insert(contract.coin_id.clone(), contract);
    }

    pub fn add_redemption(&self, redemption: Redemption) {
        self.redemptions
            .lock()
            .unwrap()
            .insert(redemption.coin_id.clone(), redemption);
    }

    pub fn set_confs(&self, coin_id: &[u8], confs: u32) {
        self.confs.lock().unwrap().insert(coin_id.to_vec(), confs);
    }

    pub fn set_fee_rate(&self, rate: u64) {
        *self.fee_rate.lock().unwrap() = rate;
    }

    pub fn probe_count(&self, coin_id: &[u8]) -> u32 {
        *self.probes.lock().unwrap().get(coin_id).unwrap_or(&0)
    }

    /// Deliver a block notification to the coordinator.
    pub fn send_block(&self, time: u64) {
        if let Some(tx) = self.block_tx.lock().unwrap().as_ref() {
            tx.send(BlockUpdate { time, err: None }).unwrap();
        }
    }
}

impl Backend for TestBackend {
    fn validate_coin_id(&self, coin_id: &[u8]) -> Result<(), BackendError> {
        if coin_id.is_empty() {
            return Err(BackendError::InvalidCoin("empty coin id"));
        }
        Ok(())
    }

    fn validate_contract(&self, script: &[u8]) -> Result<(), BackendError> {
        if script.is_empty() {
            return Err(BackendError::InvalidCoin("empty contract script"));
        }
        Ok(())
    }

    fn contract(&self, coin_id: &[u8], _script: &[u8]) -> Result<Contract, BackendError> {
        *self
            .probes
            .lock()
            .unwrap()
            .entry(coin_id.to_vec())
            .or_insert(0) += 1;
        {
            let mut not_found = self.not_found.lock().unwrap();
            if let Some(remaining) = not_found.get_mut(coin_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::CoinNotFound);
                }
            }
        }
        self.contracts
            .lock()
            .unwrap()
            .get(coin_id)
            .cloned()
            .ok_or(BackendError::CoinNotFound)
    }

    fn redemption(&self, coin_id: &[u8], contract_coin: &[u8]) -> Result<Redemption, BackendError> {
        let redemptions = self.redemptions.lock().unwrap();
        let redemption = redemptions.get(coin_id).ok_or(BackendError::CoinNotFound)?;
        if redemption.contract_coin != contract_coin {
            return Err(BackendError::InvalidCoin("does not spend the contract"));
        }
        Ok(redemption.clone())
    }

    fn validate_secret(&self, secret: &[u8], _contract: &[u8]) -> bool {
        *self.valid_secret.lock().unwrap() == secret
    }

    fn confirmations(&self, coin_id: &[u8]) -> Result<u32, BackendError> {
        self.confs
            .lock()
            .unwrap()
            .get(coin_id)
            .copied()
            .ok_or(BackendError::CoinNotFound)
    }

    fn unspent(&self, _coin_id: &[u8]) -> Result<bool, BackendError> {
        Ok(true)
    }

    fn fee_rate(&self) -> Result<u64, BackendError> {
        Ok(*self.fee_rate.lock().unwrap())
    }

    fn synced(&self) -> Result<bool, BackendError> {
        Ok(true)
    }

    fn block_channel(&self) -> Receiver<BlockUpdate> {
        let (tx, rx) = mpsc::channel();
        *self.block_tx.lock().unwrap() = Some(tx);
        rx
    }
}

/// A storage that records every call.
pub struct TestStorage {
    fatal_tx: Mutex<Option<Sender<()>>>,
    pub state_hash: Mutex<Option<Vec<u8>>>,
    pub inserted: Mutex<Vec<MatchId>>,
    pub inactive: Mutex<Vec<MatchId>>,
    pub canceled_orders: Mutex<Vec<OrderId>>,
    pub revoked_orders: Mutex<Vec<OrderId>>,
    pub completed_orders: Mutex<Vec<OrderId>>,
    /// (match, is_maker) of every saved contract.
    pub contracts: Mutex<Vec<(MatchId, bool)>>,
    /// (match, is_maker) of every saved redemption.
    pub redeems: Mutex<Vec<(MatchId, bool)>>,
    pub match_acks: Mutex<Vec<(MatchId, bool)>>,
    pub audit_acks: Mutex<Vec<(MatchId, bool)>>,
    pub redeem_acks: Mutex<Vec<MatchId>>,
}

impl TestStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(TestStorage {
            fatal_tx: Mutex::new(None),
            state_hash: Mutex::new(None),
            inserted: Mutex::new(Vec::new()),
            inactive: Mutex::new(Vec::new()),
            canceled_orders: Mutex::new(Vec::new()),
            revoked_orders: Mutex::new(Vec::new()),
            completed_orders: Mutex::new(Vec::new()),
            contracts: Mutex::new(Vec::new()),
            redeems: Mutex::new(Vec::new()),
            match_acks: Mutex::new(Vec::new()),
            audit_acks: Mutex::new(Vec::new()),
            redeem_acks: Mutex::new(Vec::new()),
        })
    }

    pub fn trigger_fatal(&self) {
        if let Some(tx) = self.fatal_tx.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }
}

impl Storage for TestStorage {
    fn last_error(&self) -> Option<String> {
        None
    }

    fn fatal_channel(&self) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        *self.fatal_tx.lock().unwrap() = Some(tx);
        rx
    }

    fn insert_match(&self, m: &swapd::market::Match) -> Result<(), StorageError> {
        self.inserted.lock().unwrap().push(m.id);
        Ok(())
    }

    fn set_match_inactive(&self, mid: MatchId) -> Result<(), StorageError> {
        self.inactive.lock().unwrap().push(mid);
        Ok(())
    }

    fn cancel_order(&self, order: &LimitOrder, _t_ms: u64) -> Result<(), StorageError> {
        self.canceled_orders.lock().unwrap().push(order.id);
        Ok(())
    }

    fn revoke_order(&self, order: &LimitOrder) -> Result<(), StorageError> {
        self.revoked_orders.lock().unwrap().push(order.id);
        Ok(())
    }

    fn set_order_complete_time(&self, oid: OrderId, _t_ms: u64) -> Result<(), StorageError> {
        self.completed_orders.lock().unwrap().push(oid);
        Ok(())
    }

    fn save_contract_maker(
        &self,
        mid: MatchId,
        _contract: &[u8],
        _coin_id: &[u8],
        _t_ms: u64,
    ) -> Result<(), StorageError> {
        self.contracts.lock().unwrap().push((mid, true));
        Ok(())
    }

    fn save_contract_taker(
        &self,
        mid: MatchId,
        _contract: &[u8],
        _coin_id: &[u8],
        _t_ms: u64,
    ) -> Result<(), StorageError> {
        self.contracts.lock().unwrap().push((mid, false));
        Ok(())
    }

    fn save_redeem_maker(
        &self,
        mid: MatchId,
        _coin_id: &[u8],
        _secret: &[u8],
        _t_ms: u64,
    ) -> Result<(), StorageError> {
        self.redeems.lock().unwrap().push((mid, true));
        Ok(())
    }

    fn save_redeem_taker(
        &self,
        mid: MatchId,
        _coin_id: &[u8],
        _t_ms: u64,
    ) -> Result<(), StorageError> {
        self.redeems.lock().unwrap().push((mid, false));
        Ok(())
    }

    fn save_match_ack_maker(&self, mid: MatchId, _sig: &[u8]) -> Result<(), StorageError> {
        self.match_acks.lock().unwrap().push((mid, true));
        Ok(())
    }

    fn save_match_ack_taker(&self, mid: MatchId, _sig: &[u8]) -> Result<(), StorageError> {
        self.match_acks.lock().unwrap().push((mid, false));
        Ok(())
    }

    fn save_audit_ack_maker(&self, mid: MatchId, _sig: &[u8]) -> Result<(), StorageError> {
        self.audit_acks.lock().unwrap().push((mid, true));
        Ok(())
    }

    fn save_audit_ack_taker(&self, mid: MatchId, _sig: &[u8]) -> Result<(), StorageError> {
        self.audit_acks.lock().unwrap().push((mid, false));
        Ok(())
    }

    fn save_redeem_ack_taker(&self, mid: MatchId, _sig: &[u8]) -> Result<(), StorageError> {
        self.redeem_acks.lock().unwrap().push(mid);
        Ok(())
    }

    fn state_hash(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.state_hash.lock().unwrap().clone())
    }

    fn set_state_hash(&self, hash: &[u8]) -> Result<(), StorageError> {
        *self.state_hash.lock().unwrap() = Some(hash.to_vec());
        Ok(())
    }
}

/// An auth manager that records everything and plays both parties: every
/// outgoing request is immediately acknowledged with a valid signature,
/// unless acking is switched off.
pub struct TestAuth {
    pub respond_to_requests: Mutex<bool>,
    pub requests: Mutex<Vec<(AccountId, Request)>>,
    pub responses: Mutex<Vec<(AccountId, u64, Result<Acknowledgement, MsgError>)>>,
    pub cancels: Mutex<Vec<(AccountId, OrderId, OrderId)>>,
    pub completed: Mutex<Vec<(AccountId, OrderId)>>,
    pub successes: Mutex<Vec<(AccountId, MatchId, u64)>>,
    /// (user, step, match, reference time) of every penalty.
    pub inactions: Mutex<Vec<(AccountId, NoActionStep, MatchId, u64)>>,
}

impl TestAuth {
    pub fn new() -> Arc<Self> {
        Arc::new(TestAuth {
            respond_to_requests: Mutex::new(true),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            successes: Mutex::new(Vec::new()),
            inactions: Mutex::new(Vec::new()),
        })
    }

    /// The deferred outcome delivered for a client message, if any yet.
    pub fn response_for(&self, msg_id: u64) -> Option<Result<Acknowledgement, MsgError>> {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .find(|(_, id, _)| *id == msg_id)
            .map(|(_, _, resp)| resp.clone())
    }

    pub fn request_count(&self, route: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, req)| req.route() == route)
            .count()
    }

    fn acks_for(req: &Request) -> Vec<Acknowledgement> {
        match req {
            Request::Match(params) => params
                .iter()
                .map(|p| Acknowledgement {
                    match_id: p.match_id,
                    sig: mock_sig(&p.payload()),
                })
                .collect(),
            Request::Audit(audit) => vec![Acknowledgement {
                match_id: audit.match_id,
                sig: mock_sig(&audit.payload()),
            }],
            Request::Redemption(redemption) => vec![Acknowledgement {
                match_id: redemption.match_id,
                sig: mock_sig(&redemption.payload()),
            }],
            Request::RevokeMatch(revoke) => vec![Acknowledgement {
                match_id: revoke.match_id,
                sig: mock_sig(&revoke.payload()),
            }],
        }
    }
}

impl AuthManager for TestAuth {
    fn auth(&self, _user: AccountId, payload: &[u8], sig: &[u8]) -> Result<(), AuthError> {
        if sig == mock_sig(payload).as_slice() {
            Ok(())
        } else {
            Err(AuthError::InvalidSignature)
        }
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        mock_sig(payload)
    }

    fn send(&self, user: AccountId, req: Request) -> Result<(), AuthError> {
        self.requests.lock().unwrap().push((user, req));
        Ok(())
    }

    fn request_with_timeout(
        &self,
        user: AccountId,
        req: Request,
        _timeout_ms: u64,
        handler: AckHandler,
    ) -> Result<(), AuthError> {
        let acks = Self::acks_for(&req);
        self.requests.lock().unwrap().push((user, req));
        if *self.respond_to_requests.lock().unwrap() {
            handler(Ok(acks));
        } else {
            handler(Err(RequestError::Timeout));
        }
        Ok(())
    }

    fn respond(&self, user: AccountId, msg_id: u64, resp: Result<Acknowledgement, MsgError>) {
        self.responses.lock().unwrap().push((user, msg_id, resp));
    }

    fn record_cancel(&self, user: AccountId, oid: OrderId, target: OrderId, _t_ms: u64) {
        self.cancels.lock().unwrap().push((user, oid, target));
    }

    fn record_completed_order(&self, user: AccountId, oid: OrderId, _t_ms: u64) {
        self.completed.lock().unwrap().push((user, oid));
    }

    fn swap_success(&self, user: AccountId, mid: MatchId, value: u64, _t_ms: u64) {
        self.successes.lock().unwrap().push((user, mid, value));
    }

    fn inaction(
        &self,
        user: AccountId,
        step: NoActionStep,
        mid: MatchId,
        _value: u64,
        ref_time_ms: u64,
        _oid: OrderId,
    ) {
        self.inactions
            .lock()
            .unwrap()
            .push((user, step, mid, ref_time_ms));
    }
}

/// A coin locker recording lock/unlock calls.
pub struct TestCoinLocker {
    pub locked: Mutex<Vec<OrderId>>,
    pub unlocked: Mutex<Vec<OrderId>>,
}

impl TestCoinLocker {
    pub fn new() -> Arc<Self> {
        Arc::new(TestCoinLocker {
            locked: Mutex::new(Vec::new()),
            unlocked: Mutex::new(Vec::new()),
        })
    }
}

impl CoinLocker for TestCoinLocker {
    fn lock_order_coins(&self, order: &LimitOrder) {
        self.locked.lock().unwrap().push(order.id);
    }

    fn unlock_order_coins(&self, order_id: &OrderId) {
        self.unlocked.lock().unwrap().push(*order_id);
    }
}

/// All mock collaborators, shareable across a coordinator restart.
#[derive(Clone)]
pub struct TestDeps {
    pub base_backend: Arc<TestBackend>,
    pub quote_backend: Arc<TestBackend>,
    pub storage: Arc<TestStorage>,
    pub auth: Arc<TestAuth>,
    pub base_locker: Arc<TestCoinLocker>,
    pub quote_locker: Arc<TestCoinLocker>,
    pub unbooked: Arc<Mutex<Vec<OrderId>>>,
    pub data_dir: Arc<tempfile::TempDir>,
}

impl TestDeps {
    pub fn new() -> Self {
        TestDeps {
            base_backend: TestBackend::new("dcr"),
            quote_backend: TestBackend::new("btc"),
            storage: TestStorage::new(),
            auth: TestAuth::new(),
            base_locker: TestCoinLocker::new(),
            quote_locker: TestCoinLocker::new(),
            unbooked: Arc::new(Mutex::new(Vec::new())),
            data_dir: Arc::new(tempfile::tempdir().unwrap()),
        }
    }
}

/// Coordinator timings suitable for the tests: short deadlines, fast probes.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        broadcast_timeout_ms: 800,
        tx_wait_expiration_ms: 600,
        recheck_interval_ms: 25,
        lock_time_maker_ms: 200,
        lock_time_taker_ms: 100,
        allow_partial_restore: false,
        ignore_state: false,
    }
}

pub fn build_coordinator(cfg: CoordinatorConfig, deps: &TestDeps) -> Arc<Coordinator> {
    let assets = vec![
        Asset {
            id: BASE,
            symbol: "dcr".to_string(),
            swap_conf: 1,
            max_fee_rate: 100,
            backend: deps.base_backend.clone() as Arc<dyn Backend>,
        },
        Asset {
            id: QUOTE,
            symbol: "btc".to_string(),
            swap_conf: 1,
            max_fee_rate: 100,
            backend: deps.quote_backend.clone() as Arc<dyn Backend>,
        },
    ];
    let mut lockers: HashMap<AssetId, Arc<dyn CoinLocker>> = HashMap::new();
    lockers.insert(BASE, deps.base_locker.clone() as Arc<dyn CoinLocker>);
    lockers.insert(QUOTE, deps.quote_locker.clone() as Arc<dyn CoinLocker>);
    let unbooked = deps.unbooked.clone();
    Arc::new(
        Coordinator::new(
            cfg,
            deps.data_dir.path().to_path_buf(),
            assets,
            lockers,
            deps.storage.clone(),
            deps.auth.clone(),
            Box::new(move |lo| {
                unbooked.lock().unwrap().push(lo.id);
                true
            }),
        )
        .unwrap(),
    )
}

/// A running coordinator plus its mocks.
pub struct TestRig {
    pub deps: TestDeps,
    pub coordinator: Arc<Coordinator>,
    handle: Option<JoinHandle<()>>,
}

impl TestRig {
    pub fn start(cfg: CoordinatorConfig) -> TestRig {
        Self::start_with(cfg, TestDeps::new())
    }

    /// Start a coordinator over existing mocks, restoring any snapshot in
    /// the shared data dir first.
    pub fn start_with(cfg: CoordinatorConfig, deps: TestDeps) -> TestRig {
        let coordinator = build_coordinator(cfg, &deps);
        coordinator.restore_state(None).unwrap();
        let runner = coordinator.clone();
        let handle = thread::Builder::new()
            .name("coordinator-supervisor".to_string())
            .spawn(move || {
                if let Err(e) = runner.run() {
                    panic!("coordinator run failed: {:?}", e);
                }
            })
            .unwrap();
        TestRig {
            deps,
            coordinator,
            handle: Some(handle),
        }
    }

    /// Graceful shutdown; the snapshot is written before this returns.
    pub fn stop(mut self) -> TestDeps {
        self.coordinator.stop();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
        self.deps.clone()
    }
}

/// A limit order on the test market. The tag doubles as order id, user id
/// and address salt.
pub fn limit_order(tag: u8, sell: bool) -> LimitOrder {
    LimitOrder {
        id: OrderId([tag; 32]),
        user: AccountId([tag; 32]),
        base: BASE,
        quote: QUOTE,
        sell,
        quantity: RATE_ENCODING_FACTOR,
        rate: TEST_RATE,
        swap_address: format!("swap-addr-{}", tag),
        funding_coins: vec![vec![tag, 0xf0]],
    }
}

pub fn match_set(maker: &LimitOrder, taker: &LimitOrder) -> MatchSet {
    MatchSet {
        taker: TakerOrder::Limit(taker.clone()),
        makers: vec![maker.clone()],
        amounts: vec![maker.quantity],
        rates: vec![maker.rate],
        base: BASE,
        quote: QUOTE,
        epoch_end: now_ms(),
    }
}

pub fn cancel_set(maker: &LimitOrder, cancel: &CancelOrder) -> MatchSet {
    MatchSet {
        taker: TakerOrder::Cancel(cancel.clone()),
        makers: vec![maker.clone()],
        amounts: vec![maker.quantity],
        rates: vec![maker.rate],
        base: BASE,
        quote: QUOTE,
        epoch_end: now_ms(),
    }
}

/// Negotiate the sets under the matching guard. All involved orders are
/// treated as taking their final swap.
pub fn negotiate(rig: &TestRig, sets: &[MatchSet]) {
    let guard = rig.coordinator.begin_matching();
    rig.coordinator.negotiate(&guard, sets, &|_| true).unwrap();
}

/// The single live match id for the user.
pub fn only_match_id(rig: &TestRig, user: AccountId) -> MatchId {
    let mids = rig.coordinator.user_match_ids(user);
    assert_eq!(mids.len(), 1, "expected exactly one live match");
    mids[0]
}

pub fn init_bytes(order: &LimitOrder, mid: MatchId, coin_id: &[u8], contract: &[u8]) -> Vec<u8> {
    let mut init = Init {
        order_id: order.id,
        match_id: mid,
        coin_id: coin_id.to_vec(),
        contract: contract.to_vec(),
        sig: Vec::new(),
    };
    init.sig = mock_sig(&init.payload());
    serde_json::to_vec(&init).unwrap()
}

pub fn redeem_bytes(order: &LimitOrder, mid: MatchId, coin_id: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut redeem = Redeem {
        order_id: order.id,
        match_id: mid,
        coin_id: coin_id.to_vec(),
        secret: secret.to_vec(),
        sig: Vec::new(),
    };
    redeem.sig = mock_sig(&redeem.payload());
    serde_json::to_vec(&redeem).unwrap()
}

/// A contract passing the coordinator's validations for the given recipient
/// and value.
pub fn valid_contract(recipient: &str, value: u64, coin_id: &[u8], script: &[u8]) -> Contract {
    Contract {
        coin_id: coin_id.to_vec(),
        script: script.to_vec(),
        recipient: recipient.to_string(),
        refund_address: "refund-addr".to_string(),
        value,
        lock_time: now_ms() / 1000 + 1_000_000,
        fee_rate: TEST_FEE_RATE,
    }
}

pub const MAKER_COIN: &[u8] = b"maker-contract-coin";
pub const MAKER_SCRIPT: &[u8] = b"maker-contract-script";
pub const TAKER_COIN: &[u8] = b"taker-contract-coin";
pub const TAKER_SCRIPT: &[u8] = b"taker-contract-script";
pub const MAKER_REDEEM_COIN: &[u8] = b"maker-redeem-coin";
pub const SECRET: [u8; 32] = [7; 32];

/// Drive a fresh match through both contract postings and confirmations,
/// leaving it in TakerSwapCast. Uses message ids 1 (maker init) and 2
/// (taker init).
pub fn drive_to_taker_swap_cast(
    rig: &TestRig,
    maker: &LimitOrder,
    taker: &LimitOrder,
) -> MatchId {
    negotiate(rig, &[match_set(maker, taker)]);
    let mid = only_match_id(rig, maker.user);

    rig.deps.base_backend.add_contract(
        valid_contract(&taker.swap_address, maker.quantity, MAKER_COIN, MAKER_SCRIPT),
        0,
    );
    rig.coordinator
        .handle_init(maker.user, 1, &init_bytes(maker, mid, MAKER_COIN, MAKER_SCRIPT))
        .unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        matches!(rig.deps.auth.response_for(1), Some(Ok(_)))
    }));

    rig.deps.base_backend.set_confs(MAKER_COIN, 1);
    rig.deps.base_backend.send_block(now_ms());
    assert!(wait_for(Duration::from_secs(2), || {
        rig.deps
            .base_locker
            .unlocked
            .lock()
            .unwrap()
            .contains(&maker.id)
    }));

    let quote_value = swapd::market::base_to_quote(taker.rate, taker.quantity);
    rig.deps.quote_backend.add_contract(
        valid_contract(&maker.swap_address, quote_value, TAKER_COIN, TAKER_SCRIPT),
        0,
    );
    rig.coordinator
        .handle_init(taker.user, 2, &init_bytes(taker, mid, TAKER_COIN, TAKER_SCRIPT))
        .unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        matches!(rig.deps.auth.response_for(2), Some(Ok(_)))
    }));

    rig.deps.quote_backend.set_confs(TAKER_COIN, 1);
    rig.deps.quote_backend.send_block(now_ms());
    assert!(wait_for(Duration::from_secs(2), || {
        rig.deps
            .quote_locker
            .unlocked
            .lock()
            .unwrap()
            .contains(&taker.id)
    }));

    mid
}

/// Continue from TakerSwapCast through the maker's redemption, leaving the
/// match in MakerRedeemed. Uses message id 3.
pub fn drive_to_maker_redeemed(rig: &TestRig, maker: &LimitOrder, taker: &LimitOrder) -> MatchId {
    let mid = drive_to_taker_swap_cast(rig, maker, taker);
    rig.deps.quote_backend.add_redemption(Redemption {
        coin_id: MAKER_REDEEM_COIN.to_vec(),
        contract_coin: TAKER_COIN.to_vec(),
    });
    rig.coordinator
        .handle_redeem(maker.user, 3, &redeem_bytes(maker, mid, MAKER_REDEEM_COIN, &SECRET))
        .unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        matches!(rig.deps.auth.response_for(3), Some(Ok(_)))
    }));
    mid
}

/// Poll a condition until it holds or the timeout passes.
pub fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
