//! Swap negotiation messages.
//!
//! Messages are communicated between the coordinator and the two parties of
//! a match. The full settlement conversation for one match:
//!
//! ```shell
//! ********* Contract phase *********
//! Maker -> Server: [Init] (maker's contract coin id + script)
//! Server -> Maker: [Acknowledgement] (once the coin is found and valid)
//! Server -> Taker: [Audit] (maker's contract for inspection)
//! Taker -> Server: [Acknowledgement]
//! Taker -> Server: [Init] (after the maker's swap confirms)
//! Server -> Taker: [Acknowledgement]
//! Server -> Maker: [Audit]
//! Maker -> Server: [Acknowledgement]
//!
//! ********* Redemption phase *********
//! Maker -> Server: [Redeem] (spends taker's contract, reveals the secret)
//! Server -> Maker: [Acknowledgement]
//! Server -> Taker: [Redemption] (the revealed secret)
//! Taker -> Server: [Acknowledgement]
//! Taker -> Server: [Redeem] (spends maker's contract)
//! Server -> Taker: [Acknowledgement]
//! ```
//!
//! Every signature, client or server, covers the message's [payload] bytes.
//! Acknowledgement signatures are retained as the party's proof of having
//! seen the request.
//!
//! [payload]: Init::payload

use serde::{Deserialize, Serialize};

use crate::market::{CoinId, MatchId, OrderId, Side};

/// Defines the length of a swap secret.
pub const SECRET_LEN: usize = 32;

/// Client-facing error codes, stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ParseError,
    SignatureError,
    UnknownMatch,
    SettlementSequenceError,
    ContractError,
    RedemptionError,
    TransactionUndiscovered,
    UnknownMarketError,
    TryAgainLaterError,
}

impl ErrorCode {
    pub fn wire_code(self) -> u16 {
        match self {
            ErrorCode::ParseError => 1,
            ErrorCode::SignatureError => 2,
            ErrorCode::UnknownMatch => 3,
            ErrorCode::SettlementSequenceError => 4,
            ErrorCode::ContractError => 5,
            ErrorCode::RedemptionError => 6,
            ErrorCode::TransactionUndiscovered => 7,
            ErrorCode::UnknownMarketError => 8,
            ErrorCode::TryAgainLaterError => 9,
        }
    }
}

/// An error returned to the originating client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgError {
    pub code: ErrorCode,
    pub detail: String,
}

impl MsgError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        MsgError {
            code,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for MsgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({}): {}", self.code, self.code.wire_code(), self.detail)
    }
}

impl std::error::Error for MsgError {}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Notification that a party has broadcast their swap contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Init {
    pub order_id: OrderId,
    pub match_id: MatchId,
    pub coin_id: CoinId,
    pub contract: Vec<u8>,
    pub sig: Vec<u8>,
}

impl Init {
    /// The bytes the signature covers.
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.order_id.0);
        buf.extend_from_slice(&self.match_id.0);
        put_bytes(&mut buf, &self.coin_id);
        put_bytes(&mut buf, &self.contract);
        buf
    }
}

/// Notification that a party has redeemed the counterparty's contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redeem {
    pub order_id: OrderId,
    pub match_id: MatchId,
    pub coin_id: CoinId,
    pub secret: Vec<u8>,
    pub sig: Vec<u8>,
}

impl Redeem {
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.order_id.0);
        buf.extend_from_slice(&self.match_id.0);
        put_bytes(&mut buf, &self.coin_id);
        put_bytes(&mut buf, &self.secret);
        buf
    }
}

/// Request to a party to audit the counterparty's freshly found contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub order_id: OrderId,
    pub match_id: MatchId,
    /// First-sighting time of the contract, milliseconds.
    pub time: u64,
    pub coin_id: CoinId,
    pub contract: Vec<u8>,
    pub sig: Vec<u8>,
}

impl Audit {
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.order_id.0);
        buf.extend_from_slice(&self.match_id.0);
        buf.extend_from_slice(&self.time.to_be_bytes());
        put_bytes(&mut buf, &self.coin_id);
        put_bytes(&mut buf, &self.contract);
        buf
    }
}

/// Request to the taker carrying the maker's redemption and the revealed
/// secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub order_id: OrderId,
    pub match_id: MatchId,
    pub coin_id: CoinId,
    pub secret: Vec<u8>,
    /// First-sighting time of the redemption, milliseconds.
    pub time: u64,
    pub sig: Vec<u8>,
}

impl Redemption {
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.order_id.0);
        buf.extend_from_slice(&self.match_id.0);
        put_bytes(&mut buf, &self.coin_id);
        put_bytes(&mut buf, &self.secret);
        buf.extend_from_slice(&self.time.to_be_bytes());
        buf
    }
}

/// Notification that a match has been revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeMatch {
    pub order_id: OrderId,
    pub match_id: MatchId,
    pub sig: Vec<u8>,
}

impl RevokeMatch {
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.order_id.0);
        buf.extend_from_slice(&self.match_id.0);
        buf
    }
}

/// One party's view of a new match, sent when the matching engine pairs the
/// orders. Batched per user when an epoch produces several matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchParams {
    pub order_id: OrderId,
    pub match_id: MatchId,
    pub quantity: u64,
    pub rate: u64,
    /// Counterparty swap address the receiving party must pay to.
    pub address: String,
    pub server_time: u64,
    pub fee_rate_base: u64,
    pub fee_rate_quote: u64,
    /// Which side of the match the receiving party is.
    pub side: Side,
    pub sig: Vec<u8>,
}

impl MatchParams {
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.order_id.0);
        buf.extend_from_slice(&self.match_id.0);
        buf.extend_from_slice(&self.quantity.to_be_bytes());
        buf.extend_from_slice(&self.rate.to_be_bytes());
        put_bytes(&mut buf, self.address.as_bytes());
        buf.extend_from_slice(&self.server_time.to_be_bytes());
        buf.extend_from_slice(&self.fee_rate_base.to_be_bytes());
        buf.extend_from_slice(&self.fee_rate_quote.to_be_bytes());
        buf.push(match self.side {
            Side::Maker => 0,
            Side::Taker => 1,
        });
        buf
    }
}

/// A party's signed acknowledgement of a request, or the server's signed
/// acceptance of an init/redeem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub match_id: MatchId,
    pub sig: Vec<u8>,
}

/// A request from the coordinator to a party. All solicit acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Match(Vec<MatchParams>),
    Audit(Audit),
    Redemption(Redemption),
    RevokeMatch(RevokeMatch),
}

impl Request {
    pub fn route(&self) -> &'static str {
        match self {
            Request::Match(_) => "match",
            Request::Audit(_) => "audit",
            Request::Redemption(_) => "redemption",
            Request::RevokeMatch(_) => "revoke_match",
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.route())
    }
}
