//! Revocation and failure ascription.
//!
//! When a match dies, exactly one party is at fault: the one whose next
//! action was pending in the status the match died in. Revocation unbooks
//! and penalizes that party, settles the accounting for both, notifies both
//! parties, and releases the funding coins.

use std::sync::Arc;

use crate::{
    auth::NoActionStep,
    market::{LimitOrder, MatchStatus, Side},
    protocol::messages::{Request, RevokeMatch},
};

use super::{api::Coordinator, tracker::MatchTracker};

/// The at-fault party and scoring label for a match dying in the given
/// status. `None` for a completed match, which cannot be revoked.
pub(crate) fn fault_and_step(status: MatchStatus) -> Option<(Side, NoActionStep)> {
    match status {
        MatchStatus::NewlyMatched => Some((Side::Maker, NoActionStep::NoSwapAsMaker)),
        MatchStatus::MakerSwapCast => Some((Side::Taker, NoActionStep::NoSwapAsTaker)),
        MatchStatus::TakerSwapCast => Some((Side::Maker, NoActionStep::NoRedeemAsMaker)),
        MatchStatus::MakerRedeemed => Some((Side::Taker, NoActionStep::NoRedeemAsTaker)),
        MatchStatus::MatchComplete => None,
    }
}

impl Coordinator {
    /// Revoke a match already removed from the registry by one of the
    /// inaction sweeps.
    pub(crate) fn revoke_match_tracker(&self, tracker: Arc<MatchTracker>) {
        let detail = &tracker.detail;
        let mid = detail.id;
        let status = tracker.status();

        let (fault_side, step) = match fault_and_step(status) {
            Some(v) => v,
            None => {
                log::error!("attempted to revoke completed match {}", mid);
                return;
            }
        };

        // Reference time for the penalty: the event the missed deadline ran
        // from.
        let ref_time = match status {
            MatchStatus::NewlyMatched => tracker.match_time,
            MatchStatus::MakerSwapCast => {
                tracker
                    .maker_status
                    .read()
                    .expect("swap status poisoned")
                    .swap_time
            }
            MatchStatus::TakerSwapCast => {
                tracker
                    .taker_status
                    .read()
                    .expect("swap status poisoned")
                    .swap_time
            }
            MatchStatus::MakerRedeemed => {
                tracker
                    .maker_status
                    .read()
                    .expect("swap status poisoned")
                    .redeem_time
            }
            MatchStatus::MatchComplete => unreachable!("handled above"),
        };

        log::warn!(
            "revoking match {} in status {}: {} at fault ({})",
            mid,
            status,
            fault_side,
            step
        );

        if let Err(e) = self.storage.set_match_inactive(mid) {
            log::error!("failed to mark match {} inactive: {}", mid, e);
        }

        let at_fault_user = detail.user(fault_side);
        let at_fault_oid = detail.order_id(fault_side);

        // Unbook the at-fault order if it is still on the book, and flag its
        // tracker so it can never be reported successfully complete.
        let at_fault_order: Option<&LimitOrder> = match fault_side {
            Side::Maker => Some(&detail.maker),
            Side::Taker => detail.taker.trade(),
        };
        if let Some(lo) = at_fault_order {
            if (self.unbook_hook)(lo) {
                log::info!("unbooked at-fault order {} of match {}", lo.id, mid);
                if let Err(e) = self.storage.revoke_order(lo) {
                    log::error!("failed to revoke order {}: {}", lo.id, e);
                }
                self.order_tracker.canceled(lo.id);
            }
        }

        self.swap_done(at_fault_oid, at_fault_user, true);
        let cp_side = fault_side.counter();
        self.swap_done(detail.order_id(cp_side), detail.user(cp_side), false);

        self.auth.inaction(
            at_fault_user,
            step,
            mid,
            detail.quantity,
            ref_time,
            at_fault_oid,
        );

        for side in [Side::Maker, Side::Taker] {
            let user = detail.user(side);
            let mut msg = RevokeMatch {
                order_id: detail.order_id(side),
                match_id: mid,
                sig: Vec::new(),
            };
            msg.sig = self.auth.sign(&msg.payload());
            let payload = msg.payload();
            let auth = self.auth.clone();
            let result = self.auth.request_with_timeout(
                user,
                Request::RevokeMatch(msg),
                self.cfg.broadcast_timeout_ms,
                Box::new(move |resp| match resp {
                    Ok(acks) => {
                        for ack in acks {
                            if let Err(e) = auth.auth(user, &payload, &ack.sig) {
                                log::warn!("bad revoke ack signature from {}: {}", user, e);
                            }
                        }
                    }
                    Err(e) => log::warn!("no revoke ack from {}: {:?}", user, e),
                }),
            );
            if let Err(e) = result {
                log::warn!("failed to send revoke_match to {}: {}", user, e);
            }
        }

        self.unlock_funding_coins(&tracker, Side::Maker);
        self.unlock_funding_coins(&tracker, Side::Taker);
    }
}
