//! The authentication and messaging interface consumed by the coordinator.
//!
//! Signature primitives, client connections and the reputation ledger are
//! owned by the auth manager. Settlement verifies client signatures, signs
//! its own notifications, sends requests that solicit acknowledgements, and
//! reports score-relevant events through this trait. The transport registers
//! [`crate::coordinator::Coordinator::handle_init`] and
//! [`crate::coordinator::Coordinator::handle_redeem`] as the route handlers
//! for the two client-originated messages.

use crate::{
    market::{AccountId, MatchId, OrderId},
    protocol::messages::{Acknowledgement, MsgError, Request},
};

/// Errors from auth operations.
#[derive(Debug)]
pub enum AuthError {
    UnknownUser,
    InvalidSignature,
    Send(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::UnknownUser => write!(f, "unknown user"),
            AuthError::InvalidSignature => write!(f, "invalid signature"),
            AuthError::Send(s) => write!(f, "send error: {}", s),
        }
    }
}

impl std::error::Error for AuthError {}

/// Why a request's acknowledgement never arrived.
#[derive(Debug)]
pub enum RequestError {
    Timeout,
    Send(String),
}

/// Inaction labels reported to the scoring subsystem when a match is
/// revoked. The label identifies the missed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoActionStep {
    NoSwapAsMaker,
    NoSwapAsTaker,
    NoRedeemAsMaker,
    NoRedeemAsTaker,
}

impl std::fmt::Display for NoActionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Callback invoked with the acknowledgements from a request, or the reason
/// none arrived.
pub type AckHandler = Box<dyn FnOnce(Result<Vec<Acknowledgement>, RequestError>) + Send>;

pub trait AuthManager: Send + Sync {
    /// Verify a user's signature over a serialized payload.
    fn auth(&self, user: AccountId, payload: &[u8], sig: &[u8]) -> Result<(), AuthError>;

    /// Sign a payload with the server key.
    fn sign(&self, payload: &[u8]) -> Vec<u8>;

    /// Fire-and-forget notification.
    fn send(&self, user: AccountId, req: Request) -> Result<(), AuthError>;

    /// Send a request soliciting acknowledgements. The handler runs on the
    /// transport's dispatcher when the response arrives or the timeout
    /// passes, never while the caller holds coordinator locks.
    fn request_with_timeout(
        &self,
        user: AccountId,
        req: Request,
        timeout_ms: u64,
        handler: AckHandler,
    ) -> Result<(), AuthError>;

    /// Deliver the deferred outcome of a client request (init/redeem are
    /// answered only once their coin is found or the wait expires).
    fn respond(&self, user: AccountId, msg_id: u64, resp: Result<Acknowledgement, MsgError>);

    /// Record a cancellation against the canceling user's rate.
    fn record_cancel(&self, user: AccountId, oid: OrderId, target: OrderId, t_ms: u64);

    /// Record an order that completed all its swaps successfully.
    fn record_completed_order(&self, user: AccountId, oid: OrderId, t_ms: u64);

    /// Credit a successfully completed swap step.
    fn swap_success(&self, user: AccountId, mid: MatchId, value: u64, t_ms: u64);

    /// Penalize the at-fault user of a revoked match.
    fn inaction(
        &self,
        user: AccountId,
        step: NoActionStep,
        mid: MatchId,
        value: u64,
        ref_time_ms: u64,
        oid: OrderId,
    );
}
