//! Orders, matches and the settlement state machine.
//!
//! These are the coordinator's views of the matching engine's output. Orders
//! carry only what settlement needs: the owning account, the trade direction,
//! the swap address funds must be sent to, and the funding coins backing the
//! order. A [Match] pairs a booked maker order with an incoming taker order at
//! a specific quantity and rate.

use serde::{Deserialize, Serialize};

use crate::utill::{sha256, to_hex};

/// Assets are identified by an unsigned integer id, assigned by the operator.
pub type AssetId = u32;

/// An opaque, backend-interpreted coin identifier (typically txid:vout).
pub type CoinId = Vec<u8>;

/// Rates are encoded as quote atoms per `RATE_ENCODING_FACTOR` base atoms.
pub const RATE_ENCODING_FACTOR: u64 = 100_000_000;

/// Convert a base-asset quantity to the quote-asset amount at the given rate.
pub fn base_to_quote(rate: u64, base: u64) -> u64 {
    ((rate as u128 * base as u128) / RATE_ENCODING_FACTOR as u128) as u64
}

/// A 32-byte order identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OrderId(pub [u8; 32]);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", to_hex(&self.0))
    }
}

impl std::fmt::Debug for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// A 32-byte account identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 32]);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", to_hex(&self.0))
    }
}

impl std::fmt::Debug for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// A 32-byte match identifier, derived from the paired orders.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MatchId(pub [u8; 32]);

impl std::fmt::Display for MatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", to_hex(&self.0))
    }
}

impl std::fmt::Debug for MatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// The two parties of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Maker,
    Taker,
}

impl Side {
    pub fn counter(self) -> Side {
        match self {
            Side::Maker => Side::Taker,
            Side::Taker => Side::Maker,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Maker => write!(f, "maker"),
            Side::Taker => write!(f, "taker"),
        }
    }
}

/// Settlement status of a match.
///
/// The status only ever moves forward along
/// `NewlyMatched → MakerSwapCast → TakerSwapCast → MakerRedeemed →
/// MatchComplete`. Cancel-taker matches are created directly in
/// `MatchComplete` and never tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    /// The match was just made, no contract has been broadcast.
    NewlyMatched,
    /// The maker's contract has been seen on-chain.
    MakerSwapCast,
    /// The taker's contract has been seen on-chain.
    TakerSwapCast,
    /// The maker has redeemed the taker's contract, revealing the secret.
    MakerRedeemed,
    /// The taker has redeemed the maker's contract. Terminal.
    MatchComplete,
}

impl MatchStatus {
    /// The status after the current step's pending action completes, `None`
    /// for the terminal state.
    pub fn next(self) -> Option<MatchStatus> {
        match self {
            MatchStatus::NewlyMatched => Some(MatchStatus::MakerSwapCast),
            MatchStatus::MakerSwapCast => Some(MatchStatus::TakerSwapCast),
            MatchStatus::TakerSwapCast => Some(MatchStatus::MakerRedeemed),
            MatchStatus::MakerRedeemed => Some(MatchStatus::MatchComplete),
            MatchStatus::MatchComplete => None,
        }
    }

    /// The party whose action is pending in this status, `None` for the
    /// terminal state.
    pub fn next_actor(self) -> Option<Side> {
        match self {
            MatchStatus::NewlyMatched => Some(Side::Maker),
            MatchStatus::MakerSwapCast => Some(Side::Taker),
            MatchStatus::TakerSwapCast => Some(Side::Maker),
            MatchStatus::MakerRedeemed => Some(Side::Taker),
            MatchStatus::MatchComplete => None,
        }
    }

    /// Whether the pending action is posting a contract (as opposed to
    /// redeeming one).
    pub fn expects_init(self) -> bool {
        matches!(self, MatchStatus::NewlyMatched | MatchStatus::MakerSwapCast)
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A booked limit order, as settlement sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub id: OrderId,
    pub user: AccountId,
    pub base: AssetId,
    pub quote: AssetId,
    /// True when the order sells the base asset.
    pub sell: bool,
    pub quantity: u64,
    pub rate: u64,
    /// Address on the funded asset's counter-chain where the counterparty's
    /// contract must pay.
    pub swap_address: String,
    /// Coins backing the order, locked for the life of the negotiation.
    pub funding_coins: Vec<CoinId>,
}

impl LimitOrder {
    /// The asset this order contributes to a swap.
    pub fn funding_asset(&self) -> AssetId {
        if self.sell {
            self.base
        } else {
            self.quote
        }
    }
}

/// A cancellation order targeting a booked limit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub id: OrderId,
    pub user: AccountId,
    pub target: OrderId,
}

/// The taker side of a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TakerOrder {
    Limit(LimitOrder),
    Cancel(CancelOrder),
}

impl TakerOrder {
    pub fn id(&self) -> OrderId {
        match self {
            TakerOrder::Limit(lo) => lo.id,
            TakerOrder::Cancel(co) => co.id,
        }
    }

    pub fn user(&self) -> AccountId {
        match self {
            TakerOrder::Limit(lo) => lo.user,
            TakerOrder::Cancel(co) => co.user,
        }
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, TakerOrder::Cancel(_))
    }

    /// The underlying trade order. `None` for cancellations.
    pub fn trade(&self) -> Option<&LimitOrder> {
        match self {
            TakerOrder::Limit(lo) => Some(lo),
            TakerOrder::Cancel(_) => None,
        }
    }
}

/// An immutable pairing of a maker and a taker order produced by the matching
/// engine, annotated with the fee rates settlement will require.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub maker: LimitOrder,
    pub taker: TakerOrder,
    pub quantity: u64,
    pub rate: u64,
    pub base: AssetId,
    pub quote: AssetId,
    /// End of the matching cycle that produced this match, milliseconds.
    pub epoch_end: u64,
    pub fee_rate_base: u64,
    pub fee_rate_quote: u64,
    /// Status the match was created in. Live status is tracked separately.
    pub status: MatchStatus,
}

impl Match {
    pub fn new(
        maker: LimitOrder,
        taker: TakerOrder,
        quantity: u64,
        rate: u64,
        epoch_end: u64,
        fee_rate_base: u64,
        fee_rate_quote: u64,
    ) -> Self {
        let status = if taker.is_cancel() {
            MatchStatus::MatchComplete
        } else {
            MatchStatus::NewlyMatched
        };
        let id = Self::compute_id(&maker.id, &taker.id(), quantity, rate, epoch_end);
        let (base, quote) = (maker.base, maker.quote);
        Match {
            id,
            maker,
            taker,
            quantity,
            rate,
            base,
            quote,
            epoch_end,
            fee_rate_base,
            fee_rate_quote,
            status,
        }
    }

    fn compute_id(
        maker: &OrderId,
        taker: &OrderId,
        quantity: u64,
        rate: u64,
        epoch_end: u64,
    ) -> MatchId {
        let mut buf = Vec::with_capacity(32 + 32 + 8 + 8 + 8);
        buf.extend_from_slice(&maker.0);
        buf.extend_from_slice(&taker.0);
        buf.extend_from_slice(&quantity.to_be_bytes());
        buf.extend_from_slice(&rate.to_be_bytes());
        buf.extend_from_slice(&epoch_end.to_be_bytes());
        MatchId(sha256(&buf))
    }

    /// User owning the given side of the match.
    pub fn user(&self, side: Side) -> AccountId {
        match side {
            Side::Maker => self.maker.user,
            Side::Taker => self.taker.user(),
        }
    }

    /// Order id for the given side of the match.
    pub fn order_id(&self, side: Side) -> OrderId {
        match side {
            Side::Maker => self.maker.id,
            Side::Taker => self.taker.id(),
        }
    }

    /// Asset the given side contracts. The maker's side decides: maker-sell
    /// means the maker contracts base and the taker contracts quote.
    pub fn swap_asset(&self, side: Side) -> AssetId {
        match (side, self.maker.sell) {
            (Side::Maker, true) | (Side::Taker, false) => self.base,
            (Side::Maker, false) | (Side::Taker, true) => self.quote,
        }
    }

    /// The expected contract value for the given side's swap.
    pub fn swap_value(&self, side: Side) -> u64 {
        if self.swap_asset(side) == self.base {
            self.quantity
        } else {
            base_to_quote(self.rate, self.quantity)
        }
    }
}

/// A taker order matched against one or more makers within one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSet {
    pub taker: TakerOrder,
    pub makers: Vec<LimitOrder>,
    pub amounts: Vec<u64>,
    pub rates: Vec<u64>,
    pub base: AssetId,
    pub quote: AssetId,
    /// End of the matching cycle, milliseconds.
    pub epoch_end: u64,
}

impl MatchSet {
    /// Expand the set into one [Match] per maker.
    pub fn matches(&self, fee_rate_base: u64, fee_rate_quote: u64) -> Vec<Match> {
        self.makers
            .iter()
            .zip(self.amounts.iter().zip(self.rates.iter()))
            .map(|(maker, (&quantity, &rate))| {
                Match::new(
                    maker.clone(),
                    self.taker.clone(),
                    quantity,
                    rate,
                    self.epoch_end,
                    fee_rate_base,
                    fee_rate_quote,
                )
            })
            .collect()
    }
}
