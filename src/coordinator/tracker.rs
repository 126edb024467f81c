//! Live match tracking.
//!
//! The registry is the process-local index of every match under settlement,
//! keyed by match id and, for client lookups, by user. It exclusively owns
//! the trackers; the user index holds ids only, so sweeps can delete without
//! tombstoning. Each tracker serializes its own mutations through a state
//! lock plus one lock per party's swap status.
//!
//! Lock order, outer to inner: registry, match state, swap status. Backend
//! and database calls are never made while holding the registry write lock.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use crate::{
    asset::{Asset, Contract, Redemption},
    market::{AccountId, Match, MatchId, MatchStatus, OrderId, Side},
    protocol::messages::{ErrorCode, MsgError},
};

use super::api::Coordinator;

/// One party's progress through the swap, owned by the parent tracker.
#[derive(Debug, Default)]
pub(crate) struct SwapStatus {
    /// Asset this party contracts on.
    pub(crate) swap_asset: u32,
    /// Asset this party redeems on (the counterparty's swap asset).
    pub(crate) redeem_asset: u32,
    /// First sighting of the party's contract, milliseconds. Zero until.
    pub(crate) swap_time: u64,
    /// Time of the block that took the contract to its required depth.
    /// Zero until.
    pub(crate) swap_confirm_time: u64,
    /// First sighting of the party's redemption. Zero until.
    pub(crate) redeem_time: u64,
    pub(crate) swap: Option<Contract>,
    pub(crate) redemption: Option<Redemption>,
}

/// Mutable match state: settlement status plus collected acknowledgement
/// signatures.
#[derive(Debug)]
pub(crate) struct MatchState {
    pub(crate) status: MatchStatus,
    pub(crate) maker_match_ack: Option<Vec<u8>>,
    pub(crate) taker_match_ack: Option<Vec<u8>>,
    pub(crate) maker_audit_ack: Option<Vec<u8>>,
    pub(crate) taker_audit_ack: Option<Vec<u8>>,
    pub(crate) taker_redeem_ack: Option<Vec<u8>>,
}

/// A match under settlement.
pub(crate) struct MatchTracker {
    pub(crate) detail: Match,
    /// When the coordinator first saw the match, milliseconds.
    pub(crate) time: u64,
    /// Reference time for contract lock-time floors: the end of the epoch
    /// that produced the match.
    pub(crate) match_time: u64,
    pub(crate) state: RwLock<MatchState>,
    pub(crate) maker_status: RwLock<SwapStatus>,
    pub(crate) taker_status: RwLock<SwapStatus>,
}

impl MatchTracker {
    pub(crate) fn new(detail: Match, now: u64) -> Self {
        let match_time = detail.epoch_end;
        let maker_swap_asset = detail.swap_asset(Side::Maker);
        let taker_swap_asset = detail.swap_asset(Side::Taker);
        let status = detail.status;
        MatchTracker {
            detail,
            time: now,
            match_time,
            state: RwLock::new(MatchState {
                status,
                maker_match_ack: None,
                taker_match_ack: None,
                maker_audit_ack: None,
                taker_audit_ack: None,
                taker_redeem_ack: None,
            }),
            maker_status: RwLock::new(SwapStatus {
                swap_asset: maker_swap_asset,
                redeem_asset: taker_swap_asset,
                ..Default::default()
            }),
            taker_status: RwLock::new(SwapStatus {
                swap_asset: taker_swap_asset,
                redeem_asset: maker_swap_asset,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn swap_status(&self, side: Side) -> &RwLock<SwapStatus> {
        match side {
            Side::Maker => &self.maker_status,
            Side::Taker => &self.taker_status,
        }
    }

    pub(crate) fn status(&self) -> MatchStatus {
        self.state.read().expect("match state poisoned").status
    }

    /// Whether the order is one of this match's parties.
    pub(crate) fn involves_order(&self, oid: &OrderId) -> bool {
        self.detail.maker.id == *oid || self.detail.taker.id() == *oid
    }
}

#[derive(Default)]
struct RegistryInner {
    matches: HashMap<MatchId, Arc<MatchTracker>>,
    user_matches: HashMap<AccountId, HashSet<MatchId>>,
}

impl RegistryInner {
    fn unindex(&mut self, user: AccountId, mid: &MatchId) {
        if let Some(set) = self.user_matches.get_mut(&user) {
            set.remove(mid);
            if set.is_empty() {
                self.user_matches.remove(&user);
            }
        }
    }
}

/// Process-local index of live matches.
pub(crate) struct MatchRegistry {
    inner: RwLock<RegistryInner>,
}

impl MatchRegistry {
    pub(crate) fn new() -> Self {
        MatchRegistry {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub(crate) fn insert(&self, tracker: Arc<MatchTracker>) {
        let mid = tracker.detail.id;
        let maker = tracker.detail.maker.user;
        let taker = tracker.detail.taker.user();
        let mut inner = self.inner.write().expect("registry poisoned");
        inner.user_matches.entry(maker).or_default().insert(mid);
        inner.user_matches.entry(taker).or_default().insert(mid);
        inner.matches.insert(mid, tracker);
    }

    pub(crate) fn get(&self, mid: &MatchId) -> Option<Arc<MatchTracker>> {
        self.inner
            .read()
            .expect("registry poisoned")
            .matches
            .get(mid)
            .cloned()
    }

    /// Run a closure against a live tracker while holding the registry read
    /// lock, so a concurrent sweep cannot observe the match between the
    /// membership check and the closure's mutations. The closure must not
    /// block on I/O.
    pub(crate) fn with_tracker<R>(
        &self,
        mid: &MatchId,
        f: impl FnOnce(&Arc<MatchTracker>) -> R,
    ) -> Option<R> {
        let inner = self.inner.read().expect("registry poisoned");
        inner.matches.get(mid).map(f)
    }

    pub(crate) fn remove(&self, mid: &MatchId) -> Option<Arc<MatchTracker>> {
        let mut inner = self.inner.write().expect("registry poisoned");
        let tracker = inner.matches.remove(mid)?;
        inner.unindex(tracker.detail.maker.user, mid);
        inner.unindex(tracker.detail.taker.user(), mid);
        Some(tracker)
    }

    /// Copies of all live trackers, in no particular order.
    pub(crate) fn all(&self) -> Vec<Arc<MatchTracker>> {
        self.inner
            .read()
            .expect("registry poisoned")
            .matches
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn user_match_ids(&self, user: AccountId) -> Vec<MatchId> {
        self.inner
            .read()
            .expect("registry poisoned")
            .user_matches
            .get(&user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn order_has_active(&self, oid: &OrderId) -> bool {
        self.inner
            .read()
            .expect("registry poisoned")
            .matches
            .values()
            .any(|t| t.involves_order(oid))
    }

    /// Atomically select and delete every tracker the predicate accepts.
    /// Runs entirely under the registry write lock so concurrent sweeps are
    /// serialized and no handler can observe a selected match afterwards.
    /// The predicate must not block.
    pub(crate) fn sweep<F>(&self, select: F) -> Vec<Arc<MatchTracker>>
    where
        F: Fn(&MatchTracker) -> bool,
    {
        let mut inner = self.inner.write().expect("registry poisoned");
        let selected: Vec<MatchId> = inner
            .matches
            .values()
            .filter(|t| select(t))
            .map(|t| t.detail.id)
            .collect();
        let mut removed = Vec::with_capacity(selected.len());
        for mid in &selected {
            if let Some(tracker) = inner.matches.remove(mid) {
                inner.unindex(tracker.detail.maker.user, mid);
                inner.unindex(tracker.detail.taker.user(), mid);
                removed.push(tracker);
            }
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().expect("registry poisoned").matches.len()
    }
}

/// A party in the context of one settlement step.
#[derive(Debug, Clone)]
pub(crate) struct StepActor {
    pub(crate) user: AccountId,
    pub(crate) order_id: OrderId,
    pub(crate) swap_address: String,
    pub(crate) side: Side,
}

/// Everything the handlers need to know about the step a match is waiting
/// on: who acts, on which chain, with what expected value and lock time.
pub(crate) struct StepInformation {
    pub(crate) tracker: Arc<MatchTracker>,
    pub(crate) actor: StepActor,
    pub(crate) counterparty: StepActor,
    pub(crate) asset: Arc<Asset>,
    /// Whether the acting asset is the market's base asset.
    pub(crate) is_base_asset: bool,
    pub(crate) step: MatchStatus,
    /// Expected contract value. Zero for redeem steps.
    pub(crate) check_val: u64,
    /// Minimum acceptable contract lock time, milliseconds. Zero for redeem
    /// steps.
    pub(crate) lock_time_floor_ms: u64,
    /// The event the actor's deadline runs from, milliseconds.
    pub(crate) last_event: u64,
}

impl Coordinator {
    fn step_actor(&self, tracker: &MatchTracker, side: Side) -> StepActor {
        let detail = &tracker.detail;
        let swap_address = match side {
            Side::Maker => detail.maker.swap_address.clone(),
            Side::Taker => detail
                .taker
                .trade()
                .map(|lo| lo.swap_address.clone())
                .unwrap_or_default(),
        };
        StepActor {
            user: detail.user(side),
            order_id: detail.order_id(side),
            swap_address,
            side,
        }
    }

    /// Resolve the pending step of a match for a claiming user: who must act
    /// next, on which chain, with what expected value and lock time.
    ///
    /// Fails with `UnknownMatch` when the match is gone or the user is not a
    /// party, and `SettlementSequenceError` when the user is not the
    /// expected actor or the previous step has not finished confirming.
    pub(crate) fn step_information(
        &self,
        mid: MatchId,
        user: AccountId,
    ) -> Result<StepInformation, MsgError> {
        let tracker = self
            .registry
            .get(&mid)
            .ok_or_else(|| MsgError::new(ErrorCode::UnknownMatch, format!("no match {}", mid)))?;
        let detail = &tracker.detail;

        if user != detail.maker.user && user != detail.taker.user() {
            return Err(MsgError::new(
                ErrorCode::UnknownMatch,
                format!("no match {} for this account", mid),
            ));
        }

        let status = tracker.status();
        let actor_side = status.next_actor().ok_or_else(|| {
            MsgError::new(
                ErrorCode::SettlementSequenceError,
                "match already complete",
            )
        })?;

        // The counterparty's swap must be fully confirmed before the next
        // step opens, and the deadline for that step runs from the
        // confirming (or first-sighting) event.
        let last_event = match status {
            MatchStatus::NewlyMatched => tracker.time,
            MatchStatus::MakerSwapCast => {
                let confirmed = tracker.maker_status.read().expect("swap status poisoned");
                if confirmed.swap_confirm_time == 0 {
                    return Err(MsgError::new(
                        ErrorCode::SettlementSequenceError,
                        "maker swap not confirmed",
                    ));
                }
                confirmed.swap_confirm_time
            }
            MatchStatus::TakerSwapCast => {
                let confirmed = tracker.taker_status.read().expect("swap status poisoned");
                if confirmed.swap_confirm_time == 0 {
                    return Err(MsgError::new(
                        ErrorCode::SettlementSequenceError,
                        "taker swap not confirmed",
                    ));
                }
                confirmed.swap_confirm_time
            }
            MatchStatus::MakerRedeemed => tracker
                .maker_status
                .read()
                .expect("swap status poisoned")
                .redeem_time,
            MatchStatus::MatchComplete => unreachable!("next_actor returned None"),
        };

        if user != detail.user(actor_side) {
            return Err(MsgError::new(
                ErrorCode::SettlementSequenceError,
                format!("expecting the {} to act in status {}", actor_side, status),
            ));
        }

        let (asset_id, check_val, lock_time_floor_ms) = if status.expects_init() {
            let lock_time = match actor_side {
                Side::Maker => self.cfg.lock_time_maker_ms,
                Side::Taker => self.cfg.lock_time_taker_ms,
            };
            (
                detail.swap_asset(actor_side),
                detail.swap_value(actor_side),
                tracker.match_time + lock_time,
            )
        } else {
            // Redemption is always on the counterparty's swap asset.
            (detail.swap_asset(actor_side.counter()), 0, 0)
        };

        let asset = self.assets.get(&asset_id).cloned().ok_or_else(|| {
            MsgError::new(
                ErrorCode::UnknownMarketError,
                format!("asset {} not configured", asset_id),
            )
        })?;

        Ok(StepInformation {
            actor: self.step_actor(&tracker, actor_side),
            counterparty: self.step_actor(&tracker, actor_side.counter()),
            asset,
            is_base_asset: asset_id == detail.base,
            step: status,
            check_val,
            lock_time_floor_ms,
            last_event,
            tracker,
        })
    }
}
