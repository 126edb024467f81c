//! The swap coordinator.
//!
//! Supervises every match produced by the matching engine through the
//! four-step HTLC negotiation: records matches and collects the parties'
//! acknowledgements, validates init and redeem messages against the chains,
//! tracks confirmations block by block, enforces the broadcast-timeout
//! deadlines, ascribes fault on revocation, and snapshots all live state for
//! crash recovery.

pub mod api;
pub mod config;
pub mod error;
mod handlers;
mod negotiate;
mod orders;
mod revoke;
mod snapshot;
mod tracker;
mod waiter;

pub use api::{Coordinator, MatchStatusReport};
pub use negotiate::MatchingGuard;
pub use orders::OrderSwapStat;
