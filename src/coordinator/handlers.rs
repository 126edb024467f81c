//! Collection of the client message handlers.
//!
//! Implements parsing, authentication and validation for the two
//! client-originated settlement messages, `init` and `redeem`. A valid
//! message does not advance the match by itself: the referenced coin must
//! first be discovered on-chain, so each handler registers a coin waiter
//! that probes the asset backend until the coin appears or the wait expires.
//! The deferred outcome is delivered through the auth manager, and the
//! counterparty receives the matching audit or redemption request.
//!
//! A validation failure is terminal for the waiter but never revokes the
//! match; the sender may retry until the inaction deadline does.

use std::{collections::hash_map::Entry, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    asset::BackendError,
    market::{AccountId, MatchStatus, Side},
    protocol::messages::{
        Acknowledgement, Audit, ErrorCode, Init, MsgError, Redeem, Redemption, Request, SECRET_LEN,
    },
    utill::now_ms,
};

use super::{
    api::Coordinator,
    tracker::StepInformation,
    waiter::{TryStatus, Waiter},
};

/// Identifies an in-flight coin waiter: the client-supplied message id plus
/// the sending user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct WaiterKey {
    pub(crate) user: AccountId,
    pub(crate) msg_id: u64,
}

/// Which handler a persisted message replays through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WaiterRoute {
    Init,
    Redeem,
}

/// Everything needed to replay an init or redeem through full validation
/// after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HandlerArgs {
    pub(crate) user: AccountId,
    pub(crate) msg_id: u64,
    pub(crate) route: WaiterRoute,
    pub(crate) raw: Vec<u8>,
}

impl Coordinator {
    /// Handle an `init` message: a party announcing their swap contract.
    ///
    /// On success the request is accepted and a coin waiter is queued; the
    /// acknowledgement or error is delivered later through the auth
    /// manager's respond path once the contract is found and validated.
    pub fn handle_init(
        self: &Arc<Self>,
        user: AccountId,
        msg_id: u64,
        raw: &[u8],
    ) -> Result<(), MsgError> {
        let stop = self.handler_fence.read().expect("handler fence poisoned");
        if *stop {
            return Err(MsgError::new(
                ErrorCode::TryAgainLaterError,
                "server is shutting down",
            ));
        }

        let init: Init = serde_json::from_slice(raw)
            .map_err(|e| MsgError::new(ErrorCode::ParseError, format!("invalid init: {}", e)))?;
        self.auth
            .auth(user, &init.payload(), &init.sig)
            .map_err(|_| MsgError::new(ErrorCode::SignatureError, "signature validation failed"))?;

        let step = self.step_information(init.match_id, user)?;
        if !step.step.expects_init() {
            return Err(MsgError::new(
                ErrorCode::SettlementSequenceError,
                format!("not expecting a contract in status {}", step.step),
            ));
        }
        if init.order_id != step.actor.order_id {
            return Err(MsgError::new(
                ErrorCode::ParseError,
                "order id does not belong to this match",
            ));
        }

        step.asset
            .backend
            .validate_coin_id(&init.coin_id)
            .map_err(|e| MsgError::new(ErrorCode::ContractError, format!("bad coin id: {}", e)))?;
        step.asset
            .backend
            .validate_contract(&init.contract)
            .map_err(|e| {
                MsgError::new(ErrorCode::ContractError, format!("bad contract script: {}", e))
            })?;

        let now = now_ms();
        let expiration = (now + self.cfg.tx_wait_expiration_ms)
            .min(step.last_event + self.cfg.broadcast_timeout_ms);

        let key = WaiterKey { user, msg_id };
        self.register_waiter(
            key,
            HandlerArgs {
                user,
                msg_id,
                route: WaiterRoute::Init,
                raw: raw.to_vec(),
            },
        )?;

        log::info!(
            "[{}] queueing contract waiter for {} of match {}",
            step.asset.symbol,
            step.actor.side,
            init.match_id
        );
        let me = Arc::clone(self);
        let expired = Arc::clone(self);
        self.waiter_queue.wait(Waiter {
            expiration,
            try_fn: Box::new(move || me.process_init(&init, &step, key)),
            expire_fn: Box::new(move || expired.waiter_expired(key)),
        });
        Ok(())
    }

    /// Handle a `redeem` message: a party announcing their redemption of
    /// the counterparty's contract.
    pub fn handle_redeem(
        self: &Arc<Self>,
        user: AccountId,
        msg_id: u64,
        raw: &[u8],
    ) -> Result<(), MsgError> {
        let stop = self.handler_fence.read().expect("handler fence poisoned");
        if *stop {
            return Err(MsgError::new(
                ErrorCode::TryAgainLaterError,
                "server is shutting down",
            ));
        }

        let redeem: Redeem = serde_json::from_slice(raw)
            .map_err(|e| MsgError::new(ErrorCode::ParseError, format!("invalid redeem: {}", e)))?;
        self.auth
            .auth(user, &redeem.payload(), &redeem.sig)
            .map_err(|_| MsgError::new(ErrorCode::SignatureError, "signature validation failed"))?;
        if redeem.secret.len() != SECRET_LEN {
            return Err(MsgError::new(
                ErrorCode::ParseError,
                format!("secret must be {} bytes", SECRET_LEN),
            ));
        }

        let step = self.step_information(redeem.match_id, user)?;
        if step.step.expects_init() {
            return Err(MsgError::new(
                ErrorCode::SettlementSequenceError,
                format!("not expecting a redemption in status {}", step.step),
            ));
        }
        if redeem.order_id != step.actor.order_id {
            return Err(MsgError::new(
                ErrorCode::ParseError,
                "order id does not belong to this match",
            ));
        }

        step.asset
            .backend
            .validate_coin_id(&redeem.coin_id)
            .map_err(|e| {
                MsgError::new(ErrorCode::RedemptionError, format!("bad coin id: {}", e))
            })?;

        let now = now_ms();
        let expiration = (now + self.cfg.tx_wait_expiration_ms)
            .min(step.last_event + self.cfg.broadcast_timeout_ms);

        let key = WaiterKey { user, msg_id };
        self.register_waiter(
            key,
            HandlerArgs {
                user,
                msg_id,
                route: WaiterRoute::Redeem,
                raw: raw.to_vec(),
            },
        )?;

        log::info!(
            "[{}] queueing redemption waiter for {} of match {}",
            step.asset.symbol,
            step.actor.side,
            redeem.match_id
        );
        let me = Arc::clone(self);
        let expired = Arc::clone(self);
        self.waiter_queue.wait(Waiter {
            expiration,
            try_fn: Box::new(move || me.process_redeem(&redeem, &step, key)),
            expire_fn: Box::new(move || expired.waiter_expired(key)),
        });
        Ok(())
    }

    fn register_waiter(&self, key: WaiterKey, args: HandlerArgs) -> Result<(), MsgError> {
        let mut live = self.live_waiters.lock().expect("live waiters poisoned");
        match live.entry(key) {
            Entry::Occupied(_) => Err(MsgError::new(
                ErrorCode::ParseError,
                "duplicate message id",
            )),
            Entry::Vacant(slot) => {
                slot.insert(args);
                Ok(())
            }
        }
    }

    fn waiter_expired(&self, key: WaiterKey) {
        self.live_waiters
            .lock()
            .expect("live waiters poisoned")
            .remove(&key);
        log::info!(
            "coin waiter for user {} msg {} expired undiscovered",
            key.user,
            key.msg_id
        );
        self.auth.respond(
            key.user,
            key.msg_id,
            Err(MsgError::new(
                ErrorCode::TransactionUndiscovered,
                "transaction was not found before the deadline",
            )),
        );
    }

    /// Deliver a terminal validation failure and retire the waiter.
    fn fail_waiter(&self, key: WaiterKey, err: MsgError) -> TryStatus {
        self.live_waiters
            .lock()
            .expect("live waiters poisoned")
            .remove(&key);
        log::info!("rejecting msg {} from {}: {}", key.msg_id, key.user, err);
        self.auth.respond(key.user, key.msg_id, Err(err));
        TryStatus::Done
    }

    /// One probe for an announced contract. Runs on the waiter queue.
    fn process_init(&self, init: &Init, step: &StepInformation, key: WaiterKey) -> TryStatus {
        let asset = &step.asset;
        let mid = step.tracker.detail.id;
        let actor_side = step.actor.side;

        let contract = match asset.backend.contract(&init.coin_id, &init.contract) {
            Ok(contract) => contract,
            Err(BackendError::CoinNotFound) => return TryStatus::TryAgain,
            Err(e) => {
                return self.fail_waiter(
                    key,
                    MsgError::new(ErrorCode::ContractError, format!("contract lookup failed: {}", e)),
                )
            }
        };

        if contract.recipient != step.counterparty.swap_address {
            return self.fail_waiter(
                key,
                MsgError::new(
                    ErrorCode::ContractError,
                    format!(
                        "contract pays to {}, not the counterparty's swap address",
                        contract.recipient
                    ),
                ),
            );
        }
        if contract.value != step.check_val {
            return self.fail_waiter(
                key,
                MsgError::new(
                    ErrorCode::ContractError,
                    format!(
                        "contract value {} does not match the expected {}",
                        contract.value, step.check_val
                    ),
                ),
            );
        }
        let required_fee_rate = if step.is_base_asset {
            step.tracker.detail.fee_rate_base
        } else {
            step.tracker.detail.fee_rate_quote
        };
        if contract.fee_rate < required_fee_rate {
            return self.fail_waiter(
                key,
                MsgError::new(
                    ErrorCode::ContractError,
                    format!(
                        "contract fee rate {} below the required {}",
                        contract.fee_rate, required_fee_rate
                    ),
                ),
            );
        }
        // Lock time floor in whole seconds, milliseconds dropped.
        if contract.lock_time < step.lock_time_floor_ms / 1000 {
            return self.fail_waiter(
                key,
                MsgError::new(
                    ErrorCode::ContractError,
                    format!(
                        "contract lock time {} below the required {}",
                        contract.lock_time,
                        step.lock_time_floor_ms / 1000
                    ),
                ),
            );
        }

        let swap_time = now_ms();
        let store_result = match actor_side {
            Side::Maker => {
                self.storage
                    .save_contract_maker(mid, &init.contract, &init.coin_id, swap_time)
            }
            Side::Taker => {
                self.storage
                    .save_contract_taker(mid, &init.contract, &init.coin_id, swap_time)
            }
        };
        if let Err(e) = store_result {
            log::error!("failed to persist contract for match {}: {}; retrying", mid, e);
            return TryStatus::TryAgain;
        }

        // Under the registry lock, make sure the match was not revoked while
        // the contract was being persisted, then advance.
        let advanced = self.registry.with_tracker(&mid, |tracker| {
            let mut state = tracker.state.write().expect("match state poisoned");
            if state.status != step.step {
                return Err(MsgError::new(
                    ErrorCode::SettlementSequenceError,
                    format!("match advanced to {} during validation", state.status),
                ));
            }
            let mut swap_status = tracker
                .swap_status(actor_side)
                .write()
                .expect("swap status poisoned");
            swap_status.swap = Some(contract.clone());
            swap_status.swap_time = swap_time;
            drop(swap_status);
            state.status = step.step.next().expect("init steps have a next status");
            Ok(state.status)
        });
        let new_status = match advanced {
            None => {
                return self.fail_waiter(
                    key,
                    MsgError::new(
                        ErrorCode::UnknownMatch,
                        "match was revoked before the contract was found",
                    ),
                )
            }
            Some(Err(e)) => return self.fail_waiter(key, e),
            Some(Ok(status)) => status,
        };

        self.live_waiters
            .lock()
            .expect("live waiters poisoned")
            .remove(&key);
        let ack = Acknowledgement {
            match_id: mid,
            sig: self.auth.sign(&init.payload()),
        };
        self.auth.respond(key.user, key.msg_id, Ok(ack));
        log::info!(
            "[{}] {} contract for match {} accepted, status now {}",
            asset.symbol,
            actor_side,
            mid,
            new_status
        );

        // Hand the contract to the counterparty for audit.
        let mut audit = Audit {
            order_id: step.counterparty.order_id,
            match_id: mid,
            time: swap_time,
            coin_id: init.coin_id.clone(),
            contract: init.contract.clone(),
            sig: Vec::new(),
        };
        audit.sig = self.auth.sign(&audit.payload());
        let payload = audit.payload();
        let cp_user = step.counterparty.user;
        let cp_side = step.counterparty.side;
        let tracker = step.tracker.clone();
        let auth = self.auth.clone();
        let storage = self.storage.clone();
        let send_result = self.auth.request_with_timeout(
            cp_user,
            Request::Audit(audit),
            self.cfg.broadcast_timeout_ms,
            Box::new(move |resp| match resp {
                Ok(acks) => {
                    for ack in acks {
                        if let Err(e) = auth.auth(cp_user, &payload, &ack.sig) {
                            log::warn!("bad audit ack signature from {}: {}", cp_user, e);
                            continue;
                        }
                        {
                            let mut state = tracker.state.write().expect("match state poisoned");
                            match cp_side {
                                Side::Maker => state.maker_audit_ack = Some(ack.sig.clone()),
                                Side::Taker => state.taker_audit_ack = Some(ack.sig.clone()),
                            }
                        }
                        let store_result = match cp_side {
                            Side::Maker => storage.save_audit_ack_maker(mid, &ack.sig),
                            Side::Taker => storage.save_audit_ack_taker(mid, &ack.sig),
                        };
                        if let Err(e) = store_result {
                            log::error!("failed to persist audit ack for match {}: {}", mid, e);
                        }
                    }
                }
                Err(e) => log::warn!("no audit ack from {} for match {}: {:?}", cp_user, mid, e),
            }),
        );
        if let Err(e) = send_result {
            log::warn!("failed to send audit request to {}: {}", cp_user, e);
        }

        TryStatus::Done
    }

    /// One probe for an announced redemption. Runs on the waiter queue.
    fn process_redeem(&self, redeem: &Redeem, step: &StepInformation, key: WaiterKey) -> TryStatus {
        let asset = &step.asset;
        let mid = step.tracker.detail.id;
        let actor_side = step.actor.side;
        let cp_side = actor_side.counter();

        // The counterparty contract this redemption must spend.
        let cp_contract = {
            let swap_status = step
                .tracker
                .swap_status(cp_side)
                .read()
                .expect("swap status poisoned");
            match &swap_status.swap {
                Some(contract) => contract.clone(),
                None => {
                    return self.fail_waiter(
                        key,
                        MsgError::new(
                            ErrorCode::SettlementSequenceError,
                            "counterparty contract not recorded",
                        ),
                    )
                }
            }
        };

        if !asset.backend.validate_secret(&redeem.secret, &cp_contract.script) {
            return self.fail_waiter(
                key,
                MsgError::new(
                    ErrorCode::RedemptionError,
                    "revealed secret does not match the contract's hash",
                ),
            );
        }

        let redemption = match asset.backend.redemption(&redeem.coin_id, &cp_contract.coin_id) {
            Ok(redemption) => redemption,
            Err(BackendError::CoinNotFound) => return TryStatus::TryAgain,
            Err(e) => {
                return self.fail_waiter(
                    key,
                    MsgError::new(
                        ErrorCode::RedemptionError,
                        format!("redemption lookup failed: {}", e),
                    ),
                )
            }
        };

        let redeem_time = now_ms();
        let store_result = match actor_side {
            Side::Maker => {
                self.storage
                    .save_redeem_maker(mid, &redeem.coin_id, &redeem.secret, redeem_time)
            }
            Side::Taker => self.storage.save_redeem_taker(mid, &redeem.coin_id, redeem_time),
        };
        if let Err(e) = store_result {
            log::error!(
                "failed to persist redemption for match {}: {}; retrying",
                mid,
                e
            );
            return TryStatus::TryAgain;
        }

        let advanced = self.registry.with_tracker(&mid, |tracker| {
            let mut state = tracker.state.write().expect("match state poisoned");
            if state.status != step.step {
                return Err(MsgError::new(
                    ErrorCode::SettlementSequenceError,
                    format!("match advanced to {} during validation", state.status),
                ));
            }
            let mut swap_status = tracker
                .swap_status(actor_side)
                .write()
                .expect("swap status poisoned");
            swap_status.redemption = Some(redemption.clone());
            swap_status.redeem_time = redeem_time;
            drop(swap_status);
            state.status = step.step.next().expect("redeem steps have a next status");
            Ok(state.status)
        });
        let new_status = match advanced {
            None => {
                return self.fail_waiter(
                    key,
                    MsgError::new(
                        ErrorCode::UnknownMatch,
                        "match was revoked before the redemption was found",
                    ),
                )
            }
            Some(Err(e)) => return self.fail_waiter(key, e),
            Some(Ok(status)) => status,
        };
        let is_final = new_status == MatchStatus::MatchComplete;

        let detail = &step.tracker.detail;
        // A self-match is credited a single success, on completion only.
        let self_match = detail.maker.user == detail.taker.user();
        if !self_match || is_final {
            self.auth
                .swap_success(key.user, mid, detail.quantity, redeem_time);
        }

        if is_final {
            self.registry.remove(&mid);
            log::info!("match {} complete", mid);
            self.swap_done(detail.maker.id, detail.maker.user, false);
            self.swap_done(detail.taker.id(), detail.taker.user(), false);
        }

        self.live_waiters
            .lock()
            .expect("live waiters poisoned")
            .remove(&key);
        let ack = Acknowledgement {
            match_id: mid,
            sig: self.auth.sign(&redeem.payload()),
        };
        self.auth.respond(key.user, key.msg_id, Ok(ack));
        log::info!(
            "[{}] {} redemption for match {} accepted, status now {}",
            asset.symbol,
            actor_side,
            mid,
            new_status
        );

        // Forward the revealed secret to the taker.
        if actor_side == Side::Maker {
            let mut redemption_msg = Redemption {
                order_id: step.counterparty.order_id,
                match_id: mid,
                coin_id: redeem.coin_id.clone(),
                secret: redeem.secret.clone(),
                time: redeem_time,
                sig: Vec::new(),
            };
            redemption_msg.sig = self.auth.sign(&redemption_msg.payload());
            let payload = redemption_msg.payload();
            let timeout = (redeem_time + self.cfg.broadcast_timeout_ms).saturating_sub(now_ms());
            let cp_user = step.counterparty.user;
            let tracker = step.tracker.clone();
            let auth = self.auth.clone();
            let storage = self.storage.clone();
            let send_result = self.auth.request_with_timeout(
                cp_user,
                Request::Redemption(redemption_msg),
                timeout,
                Box::new(move |resp| match resp {
                    Ok(acks) => {
                        for ack in acks {
                            if let Err(e) = auth.auth(cp_user, &payload, &ack.sig) {
                                log::warn!("bad redemption ack signature from {}: {}", cp_user, e);
                                continue;
                            }
                            tracker
                                .state
                                .write()
                                .expect("match state poisoned")
                                .taker_redeem_ack = Some(ack.sig.clone());
                            if let Err(e) = storage.save_redeem_ack_taker(mid, &ack.sig) {
                                log::error!(
                                    "failed to persist redemption ack for match {}: {}",
                                    mid,
                                    e
                                );
                            }
                        }
                    }
                    Err(e) => log::warn!(
                        "no redemption ack from {} for match {}: {:?}",
                        cp_user,
                        mid,
                        e
                    ),
                }),
            );
            if let Err(e) = send_result {
                log::warn!("failed to send redemption request to {}: {}", cp_user, e);
            }
        }

        TryStatus::Done
    }
}
