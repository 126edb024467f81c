//! Per-asset view of a blockchain.
//!
//! The coordinator never talks to a node directly. Each configured asset
//! carries a [Backend] handle through which contracts and redemptions are
//! looked up by coin id, confirmations are counted, and block arrivals are
//! delivered. Backends are implemented by the per-chain driver crates and
//! injected at construction.

use std::sync::{mpsc::Receiver, Arc};

use crate::market::{AssetId, CoinId, LimitOrder, OrderId};

/// Errors a backend lookup can produce.
///
/// `CoinNotFound` is not a failure: the transaction may simply not have
/// reached the mempool yet, and the caller is expected to retry until its
/// own deadline passes.
#[derive(Debug)]
pub enum BackendError {
    /// The coin is not known to the chain (yet).
    CoinNotFound,
    /// The coin id or script is structurally invalid for this asset.
    InvalidCoin(&'static str),
    /// Node-level failure, with driver detail.
    Backend(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::CoinNotFound => write!(f, "coin not found"),
            BackendError::InvalidCoin(s) => write!(f, "invalid coin: {}", s),
            BackendError::Backend(s) => write!(f, "backend error: {}", s),
        }
    }
}

impl std::error::Error for BackendError {}

/// An on-chain swap contract as resolved by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub coin_id: CoinId,
    pub script: Vec<u8>,
    /// Address the contract pays to on successful redemption.
    pub recipient: String,
    /// Address the contract refunds to after the lock time.
    pub refund_address: String,
    /// Contract value in atoms.
    pub value: u64,
    /// Absolute lock time, unix seconds.
    pub lock_time: u64,
    /// Fee rate paid by the contract transaction, atoms per byte.
    pub fee_rate: u64,
}

/// A transaction spending a swap contract, as resolved by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub coin_id: CoinId,
    /// The contract coin this redemption spends.
    pub contract_coin: CoinId,
}

/// A block arrival notification from a backend.
#[derive(Debug, Clone)]
pub struct BlockUpdate {
    /// Block time, milliseconds.
    pub time: u64,
    /// Set when the backend saw a chain error instead of a usable block.
    pub err: Option<String>,
}

/// The narrow chain interface the coordinator consumes per asset.
///
/// All methods may block on node I/O. None may be called while the caller
/// holds the match registry write lock.
pub trait Backend: Send + Sync {
    /// Structural check of a client-supplied coin id.
    fn validate_coin_id(&self, coin_id: &[u8]) -> Result<(), BackendError>;

    /// Structural check of a client-supplied contract script.
    fn validate_contract(&self, script: &[u8]) -> Result<(), BackendError>;

    /// Resolve a swap contract from its coin id and script.
    fn contract(&self, coin_id: &[u8], script: &[u8]) -> Result<Contract, BackendError>;

    /// Resolve a redemption of `contract_coin` from its coin id. Errors with
    /// `CoinNotFound` until the spending transaction is visible, and
    /// `InvalidCoin` if the coin does not spend the contract.
    fn redemption(&self, coin_id: &[u8], contract_coin: &[u8]) -> Result<Redemption, BackendError>;

    /// Whether the secret is the preimage committed to by the contract.
    fn validate_secret(&self, secret: &[u8], contract: &[u8]) -> bool;

    /// Confirmation count for a coin.
    fn confirmations(&self, coin_id: &[u8]) -> Result<u32, BackendError>;

    /// Whether the coin is still unspent.
    fn unspent(&self, coin_id: &[u8]) -> Result<bool, BackendError>;

    /// Current optimal fee rate, atoms per byte.
    fn fee_rate(&self) -> Result<u64, BackendError>;

    /// Whether the backend considers its node synced.
    fn synced(&self) -> Result<bool, BackendError>;

    /// Channel of block arrivals. Called once, at coordinator startup.
    fn block_channel(&self) -> Receiver<BlockUpdate>;
}

/// A configured asset.
#[derive(Clone)]
pub struct Asset {
    pub id: AssetId,
    pub symbol: String,
    /// Confirmations required before the counterparty's clock starts.
    pub swap_conf: u32,
    /// Hard ceiling on the fee rate settlement will require.
    pub max_fee_rate: u64,
    pub backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Asset")
            .field("id", &self.id)
            .field("symbol", &self.symbol)
            .field("swap_conf", &self.swap_conf)
            .field("max_fee_rate", &self.max_fee_rate)
            .finish()
    }
}

/// Funding-coin locks for one asset.
///
/// Coins backing an order are locked when the match is taken on and released
/// when the order's swap is confirmed or the match is revoked.
pub trait CoinLocker: Send + Sync {
    fn lock_order_coins(&self, order: &LimitOrder);
    fn unlock_order_coins(&self, order_id: &OrderId);
}
