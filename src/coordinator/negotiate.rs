//! Negotiation entry from the matching engine.
//!
//! Each epoch the market hands over its match sets while holding the
//! matching guard. New matches are persisted, their funding coins locked,
//! trackers registered, and both parties notified with a batched `match`
//! request whose acknowledgement signatures are collected and stored.
//! Cancel-taker matches execute immediately: the target order is removed
//! and no tracker is created.

use std::{
    collections::HashMap,
    sync::{Arc, MutexGuard},
};

use crate::{
    asset::Asset,
    market::{AccountId, LimitOrder, MatchSet, OrderId, Side, TakerOrder},
    protocol::messages::{MatchParams, Request},
    utill::now_ms,
};

use super::{api::Coordinator, error::CoordinatorError, tracker::MatchTracker};

/// Proof that the caller holds the matching coordination lock.
///
/// The market acquires this before running the matching cycle and drops it
/// after [Coordinator::negotiate] returns, so a swap completing concurrently
/// cannot mark an order complete between matching and tracking.
pub struct MatchingGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

impl Coordinator {
    /// Acquire the matching coordination lock.
    pub fn begin_matching(&self) -> MatchingGuard<'_> {
        MatchingGuard(self.matching_mtx.lock().expect("matching mutex poisoned"))
    }

    /// Take on a cycle's match sets. `final_swap` reports whether an order
    /// can take no further matches after this cycle (fully executed or not
    /// booked).
    pub fn negotiate(
        &self,
        _matching: &MatchingGuard<'_>,
        match_sets: &[MatchSet],
        final_swap: &dyn Fn(&OrderId) -> bool,
    ) -> Result<(), CoordinatorError> {
        let now = now_ms();
        let mut canceled_orders: Vec<OrderId> = Vec::new();
        let mut per_user: HashMap<AccountId, Vec<(MatchParams, Side, Arc<MatchTracker>)>> =
            HashMap::new();

        for set in match_sets {
            let (base_asset, quote_asset) =
                match (self.assets.get(&set.base), self.assets.get(&set.quote)) {
                    (Some(base), Some(quote)) => (base.clone(), quote.clone()),
                    _ => {
                        log::warn!(
                            "skipping match set on unsupported market {}-{}",
                            set.base,
                            set.quote
                        );
                        continue;
                    }
                };
            let fee_rate_base = self.optimal_fee_rate(&base_asset);
            let fee_rate_quote = self.optimal_fee_rate(&quote_asset);

            // Lock the order-backing coins for trades. Released when the
            // swap confirms or the match is revoked. Cancels settle
            // immediately and lock nothing.
            if !set.taker.is_cancel() {
                if let Some(taker_lo) = set.taker.trade() {
                    self.lock_order_coins(taker_lo);
                }
                for maker in &set.makers {
                    self.lock_order_coins(maker);
                }
            }

            for m in set.matches(fee_rate_base, fee_rate_quote) {
                if let Err(e) = self.storage.insert_match(&m) {
                    log::error!("failed to insert match {}: {}", m.id, e);
                    if e.is_general_failure() {
                        return Err(e.into());
                    }
                    continue;
                }

                if let TakerOrder::Cancel(cancel) = &m.taker {
                    log::info!("order {} canceled by {}", m.maker.id, cancel.id);
                    if let Err(e) = self.storage.cancel_order(&m.maker, set.epoch_end) {
                        log::error!("failed to record cancellation of {}: {}", m.maker.id, e);
                    }
                    self.auth
                        .record_cancel(cancel.user, cancel.id, m.maker.id, set.epoch_end);
                    canceled_orders.push(m.maker.id);
                    continue;
                }

                let tracker = Arc::new(MatchTracker::new(m.clone(), now));
                self.order_tracker
                    .inc_active(m.maker.id, final_swap(&m.maker.id));
                self.order_tracker
                    .inc_active(m.taker.id(), final_swap(&m.taker.id()));
                self.registry.insert(tracker.clone());
                log::info!(
                    "tracking new match {}, {} at rate {}",
                    m.id,
                    m.quantity,
                    m.rate
                );

                for side in [Side::Maker, Side::Taker] {
                    let counterparty_address = match side.counter() {
                        Side::Maker => m.maker.swap_address.clone(),
                        Side::Taker => m
                            .taker
                            .trade()
                            .map(|lo| lo.swap_address.clone())
                            .unwrap_or_default(),
                    };
                    let mut params = MatchParams {
                        order_id: m.order_id(side),
                        match_id: m.id,
                        quantity: m.quantity,
                        rate: m.rate,
                        address: counterparty_address,
                        server_time: now,
                        fee_rate_base: m.fee_rate_base,
                        fee_rate_quote: m.fee_rate_quote,
                        side,
                        sig: Vec::new(),
                    };
                    params.sig = self.auth.sign(&params.payload());
                    per_user
                        .entry(m.user(side))
                        .or_default()
                        .push((params, side, tracker.clone()));
                }
            }
        }

        // Flag canceled orders after all matches are processed, so any
        // concurrently-active swap involving them is properly penalized.
        for oid in canceled_orders {
            self.order_tracker.canceled(oid);
        }

        for (user, entries) in per_user {
            self.request_match_acks(user, entries);
        }
        Ok(())
    }

    /// Send the batched match request to one user and collect the
    /// acknowledgement signatures, validated against the solicited payloads
    /// and persisted as the party's proof.
    fn request_match_acks(
        &self,
        user: AccountId,
        entries: Vec<(MatchParams, Side, Arc<MatchTracker>)>,
    ) {
        let req = Request::Match(entries.iter().map(|(params, _, _)| params.clone()).collect());
        let auth = self.auth.clone();
        let storage = self.storage.clone();
        let result = self.auth.request_with_timeout(
            user,
            req,
            self.cfg.broadcast_timeout_ms,
            Box::new(move |resp| {
                let acks = match resp {
                    Ok(acks) => acks,
                    Err(e) => {
                        log::warn!("no match acks from {}: {:?}", user, e);
                        return;
                    }
                };
                for ack in acks {
                    let entry = entries
                        .iter()
                        .find(|(params, _, _)| params.match_id == ack.match_id);
                    let (params, side, tracker) = match entry {
                        Some(entry) => entry,
                        None => {
                            log::warn!("unsolicited match ack {} from {}", ack.match_id, user);
                            continue;
                        }
                    };
                    if let Err(e) = auth.auth(user, &params.payload(), &ack.sig) {
                        log::warn!(
                            "bad match ack signature from {} for {}: {}",
                            user,
                            ack.match_id,
                            e
                        );
                        continue;
                    }
                    {
                        let mut state = tracker.state.write().expect("match state poisoned");
                        match side {
                            Side::Maker => state.maker_match_ack = Some(ack.sig.clone()),
                            Side::Taker => state.taker_match_ack = Some(ack.sig.clone()),
                        }
                    }
                    let store_result = match side {
                        Side::Maker => storage.save_match_ack_maker(ack.match_id, &ack.sig),
                        Side::Taker => storage.save_match_ack_taker(ack.match_id, &ack.sig),
                    };
                    if let Err(e) = store_result {
                        log::error!("failed to persist match ack for {}: {}", ack.match_id, e);
                    }
                }
            }),
        );
        if let Err(e) = result {
            log::warn!("failed to send match request to {}: {}", user, e);
        }
    }

    /// The fee rate settlement will require on the asset: the backend's
    /// optimal rate, never above the asset's maximum, falling back to the
    /// maximum when the backend cannot answer.
    fn optimal_fee_rate(&self, asset: &Asset) -> u64 {
        match asset.backend.fee_rate() {
            Ok(0) => {
                log::warn!(
                    "[{}] backend reported a zero fee rate, using the maximum {}",
                    asset.symbol,
                    asset.max_fee_rate
                );
                asset.max_fee_rate
            }
            Ok(rate) => rate.min(asset.max_fee_rate),
            Err(e) => {
                log::warn!(
                    "[{}] fee rate query failed ({}), using the maximum {}",
                    asset.symbol,
                    e,
                    asset.max_fee_rate
                );
                asset.max_fee_rate
            }
        }
    }

    fn lock_order_coins(&self, order: &LimitOrder) {
        if let Some(locker) = self.coin_lockers.get(&order.funding_asset()) {
            locker.lock_order_coins(order);
        }
    }
}
