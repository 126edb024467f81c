//! The persistent storage interface consumed by the coordinator.
//!
//! The database itself lives outside this crate. Settlement needs a small
//! set of writes (match rows, contract and redemption artifacts, ack
//! signatures, order completion times) plus the state-file hash used to
//! verify snapshots across restarts.

use std::sync::mpsc::Receiver;

use crate::market::{LimitOrder, Match, MatchId, OrderId};

/// A storage failure.
#[derive(Debug)]
pub enum StorageError {
    /// The backing store is unusable. The coordinator treats this as fatal.
    GeneralFailure(String),
    /// A request-specific failure; the operation may be retried.
    Db(String),
}

impl StorageError {
    pub fn is_general_failure(&self) -> bool {
        matches!(self, StorageError::GeneralFailure(_))
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::GeneralFailure(s) => write!(f, "storage general failure: {}", s),
            StorageError::Db(s) => write!(f, "storage error: {}", s),
        }
    }
}

impl std::error::Error for StorageError {}

/// Swap-related persistence.
///
/// Implementations must be safe to call from the handler, sweep and waiter
/// threads concurrently.
pub trait Storage: Send + Sync {
    /// The most recent unrecoverable error, if any.
    fn last_error(&self) -> Option<String>;

    /// Channel signalled once on unrecoverable storage failure. Called once,
    /// at coordinator startup. The coordinator stops accepting work when it
    /// fires.
    fn fatal_channel(&self) -> Receiver<()>;

    fn insert_match(&self, m: &Match) -> Result<(), StorageError>;

    /// Mark a match inactive (revoked or otherwise finished abnormally).
    fn set_match_inactive(&self, mid: MatchId) -> Result<(), StorageError>;

    /// Record an order as canceled at the given time.
    fn cancel_order(&self, order: &LimitOrder, t_ms: u64) -> Result<(), StorageError>;

    /// Record an order as revoked for cause.
    fn revoke_order(&self, order: &LimitOrder) -> Result<(), StorageError>;

    fn set_order_complete_time(&self, oid: OrderId, t_ms: u64) -> Result<(), StorageError>;

    fn save_contract_maker(
        &self,
        mid: MatchId,
        contract: &[u8],
        coin_id: &[u8],
        t_ms: u64,
    ) -> Result<(), StorageError>;

    fn save_contract_taker(
        &self,
        mid: MatchId,
        contract: &[u8],
        coin_id: &[u8],
        t_ms: u64,
    ) -> Result<(), StorageError>;

    /// The maker's redemption reveals the swap secret, stored alongside.
    fn save_redeem_maker(
        &self,
        mid: MatchId,
        coin_id: &[u8],
        secret: &[u8],
        t_ms: u64,
    ) -> Result<(), StorageError>;

    fn save_redeem_taker(&self, mid: MatchId, coin_id: &[u8], t_ms: u64)
        -> Result<(), StorageError>;

    fn save_match_ack_maker(&self, mid: MatchId, sig: &[u8]) -> Result<(), StorageError>;
    fn save_match_ack_taker(&self, mid: MatchId, sig: &[u8]) -> Result<(), StorageError>;
    fn save_audit_ack_maker(&self, mid: MatchId, sig: &[u8]) -> Result<(), StorageError>;
    fn save_audit_ack_taker(&self, mid: MatchId, sig: &[u8]) -> Result<(), StorageError>;
    fn save_redeem_ack_taker(&self, mid: MatchId, sig: &[u8]) -> Result<(), StorageError>;

    /// The hash of the last snapshot written, used to detect a truncated or
    /// tampered state file on restore.
    fn state_hash(&self) -> Result<Option<Vec<u8>>, StorageError>;
    fn set_state_hash(&self, hash: &[u8]) -> Result<(), StorageError>;
}
