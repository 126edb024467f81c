//! Per-order accounting of active swaps.
//!
//! An order may settle through several concurrent matches. This tracker
//! counts them and remembers whether the order has left the book and whether
//! any of its swaps failed by its owner's fault, which together decide when
//! an order is successfully complete: no active swaps, off the book, and no
//! failure on record.

use std::{collections::HashMap, sync::Mutex};

use serde::{Deserialize, Serialize};

use crate::market::OrderId;

/// Swap accounting for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderSwapStat {
    /// Number of swaps currently settling for this order.
    pub swap_count: u32,
    /// The order can take no further matches. Never transitions back to
    /// false.
    pub off_book: bool,
    /// A swap involving this order was aborted by the owner's fault.
    pub has_failed: bool,
}

pub(crate) struct OrderSwapTracker {
    order_matches: Mutex<HashMap<OrderId, OrderSwapStat>>,
}

impl OrderSwapTracker {
    pub(crate) fn new() -> Self {
        OrderSwapTracker {
            order_matches: Mutex::new(HashMap::new()),
        }
    }

    /// Count a new active swap for the order. `off_book` marks this as the
    /// order's final swap; a true value sticks for the life of the entry.
    pub(crate) fn inc_active(&self, oid: OrderId, off_book: bool) {
        let mut orders = self.order_matches.lock().expect("order tracker poisoned");
        let stat = orders.entry(oid).or_default();
        stat.swap_count += 1;
        if off_book {
            stat.off_book = true;
        }
    }

    /// Count a finished swap for the order, failed or not. Returns true
    /// exactly when this decrement makes the order successfully complete:
    /// zero active swaps, off the book, and no failure on record.
    ///
    /// Entries reaching zero are dropped, except a failed entry for an order
    /// still on the book, which is retained so a later cancellation still
    /// observes the failure.
    pub(crate) fn dec_active(&self, oid: OrderId, failed: bool) -> bool {
        let mut orders = self.order_matches.lock().expect("order tracker poisoned");
        let stat = match orders.get_mut(&oid) {
            Some(stat) => stat,
            None => {
                log::error!(
                    "dec_active called for order {} with no active swaps",
                    oid
                );
                return false;
            }
        };

        if stat.swap_count == 0 {
            // A retained failed entry. Only `canceled` should resolve it,
            // but a late decrement while off-book must not underflow.
            log::error!("dec_active underflow for order {}", oid);
            return false;
        }
        stat.swap_count -= 1;
        if failed {
            stat.has_failed = true;
        }

        let complete = stat.swap_count == 0 && stat.off_book && !stat.has_failed;
        if stat.swap_count == 0 && !(stat.has_failed && !stat.off_book) {
            orders.remove(&oid);
        }
        complete
    }

    /// Mark an order canceled. No-op when the order never had an active
    /// swap. A retained failed entry with no remaining swaps is resolved
    /// (and dropped) here; the cancellation has observed the failure.
    pub(crate) fn canceled(&self, oid: OrderId) {
        let mut orders = self.order_matches.lock().expect("order tracker poisoned");
        if let Some(stat) = orders.get_mut(&oid) {
            stat.off_book = true;
            stat.has_failed = true;
            if stat.swap_count == 0 {
                orders.remove(&oid);
            }
        }
    }

    /// Stable, key-ordered copy of all entries for the snapshot.
    pub(crate) fn snapshot(&self) -> Vec<(OrderId, OrderSwapStat)> {
        let orders = self.order_matches.lock().expect("order tracker poisoned");
        let mut stats: Vec<_> = orders.iter().map(|(oid, stat)| (*oid, *stat)).collect();
        stats.sort_by_key(|(oid, _)| *oid);
        stats
    }

    pub(crate) fn restore(&self, stats: Vec<(OrderId, OrderSwapStat)>) {
        let mut orders = self.order_matches.lock().expect("order tracker poisoned");
        orders.clear();
        orders.extend(stats);
    }
}
