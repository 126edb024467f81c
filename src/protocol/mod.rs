//! Wire messages and client-facing error codes for swap negotiation.

pub mod messages;
