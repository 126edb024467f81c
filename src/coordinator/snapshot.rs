//! Durable snapshot of live settlement state.
//!
//! On graceful shutdown, after the handlers are fenced and the waiter queue
//! has stopped, all match trackers, order-swap stats and in-flight waiter
//! arguments are written to a single state file: a magic header and version,
//! a length-prefixed CBOR body. The file's hash is recorded in the database
//! so the next start can detect a truncated or tampered file. Contracts and
//! redemptions are not serialized; only their coin ids and scripts are, and
//! restore rehydrates them through the asset backends. Persisted waiters are
//! replayed through the real handlers, which revalidates and re-enqueues
//! them naturally.

use std::{
    convert::TryInto,
    fs,
    path::PathBuf,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    market::{AssetId, CoinId, Match, MatchStatus, OrderId, Side},
    utill::{now_ms, sha256, to_hex},
};

use super::{
    api::Coordinator,
    error::CoordinatorError,
    handlers::{HandlerArgs, WaiterKey, WaiterRoute},
    orders::OrderSwapStat,
    tracker::{MatchTracker, SwapStatus},
};

const STATE_FILE_MAGIC: &[u8; 8] = b"SWAPDSTA";
const STATE_FILE_VERSION: u32 = 1;
const STATE_FILE_HEADER_LEN: usize = 8 + 4 + 4;
const STATE_FILE_PREFIX: &str = "state-";
const STATE_FILE_SUFFIX: &str = ".dat";

/// One party's swap progress in asset-agnostic form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SwapStatusData {
    swap_asset: AssetId,
    redeem_asset: AssetId,
    swap_time: u64,
    swap_confirm_time: u64,
    redeem_time: u64,
    swap_coin: Option<CoinId>,
    contract_script: Option<Vec<u8>>,
    redeem_coin: Option<CoinId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AckSigsData {
    maker_match: Option<Vec<u8>>,
    taker_match: Option<Vec<u8>>,
    maker_audit: Option<Vec<u8>>,
    taker_audit: Option<Vec<u8>>,
    taker_redeem: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MatchData {
    detail: Match,
    time: u64,
    match_time: u64,
    status: MatchStatus,
    maker: SwapStatusData,
    taker: SwapStatusData,
    sigs: AckSigsData,
}

/// The snapshot body. Collections are key-ordered so identical state
/// produces identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct State {
    version: u32,
    assets: Vec<AssetId>,
    matches: Vec<MatchData>,
    order_stats: Vec<(OrderId, OrderSwapStat)>,
    live_waiters: Vec<(WaiterKey, HandlerArgs)>,
}

fn encode_state(state: &State) -> Result<Vec<u8>, CoordinatorError> {
    let body = serde_cbor::to_vec(state)?;
    let mut bytes = Vec::with_capacity(STATE_FILE_HEADER_LEN + body.len());
    bytes.extend_from_slice(STATE_FILE_MAGIC);
    bytes.extend_from_slice(&STATE_FILE_VERSION.to_be_bytes());
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn decode_state(bytes: &[u8]) -> Result<State, CoordinatorError> {
    if bytes.len() < STATE_FILE_HEADER_LEN {
        return Err(CoordinatorError::Snapshot("state file too short".to_string()));
    }
    if &bytes[..8] != STATE_FILE_MAGIC {
        return Err(CoordinatorError::Snapshot("bad state file magic".to_string()));
    }
    let version = u32::from_be_bytes(bytes[8..12].try_into().expect("slice of 4"));
    if version != STATE_FILE_VERSION {
        return Err(CoordinatorError::Snapshot(format!(
            "unsupported state file version {}",
            version
        )));
    }
    let body_len = u32::from_be_bytes(bytes[12..16].try_into().expect("slice of 4")) as usize;
    let body = bytes
        .get(STATE_FILE_HEADER_LEN..STATE_FILE_HEADER_LEN + body_len)
        .ok_or_else(|| CoordinatorError::Snapshot("truncated state file".to_string()))?;
    Ok(serde_cbor::from_slice(body)?)
}

fn snapshot_swap_status(status: &SwapStatus) -> SwapStatusData {
    SwapStatusData {
        swap_asset: status.swap_asset,
        redeem_asset: status.redeem_asset,
        swap_time: status.swap_time,
        swap_confirm_time: status.swap_confirm_time,
        redeem_time: status.redeem_time,
        swap_coin: status.swap.as_ref().map(|c| c.coin_id.clone()),
        contract_script: status.swap.as_ref().map(|c| c.script.clone()),
        redeem_coin: status.redemption.as_ref().map(|r| r.coin_id.clone()),
    }
}

fn snapshot_match(tracker: &MatchTracker) -> MatchData {
    let state = tracker.state.read().expect("match state poisoned");
    let maker = tracker.maker_status.read().expect("swap status poisoned");
    let taker = tracker.taker_status.read().expect("swap status poisoned");
    MatchData {
        detail: tracker.detail.clone(),
        time: tracker.time,
        match_time: tracker.match_time,
        status: state.status,
        maker: snapshot_swap_status(&maker),
        taker: snapshot_swap_status(&taker),
        sigs: AckSigsData {
            maker_match: state.maker_match_ack.clone(),
            taker_match: state.taker_match_ack.clone(),
            maker_audit: state.maker_audit_ack.clone(),
            taker_audit: state.taker_audit_ack.clone(),
            taker_redeem: state.taker_redeem_ack.clone(),
        },
    }
}

impl Coordinator {
    /// Write the state file, record its hash in the database, and prune
    /// older snapshots. Must only run once the handlers are fenced and the
    /// waiter queue has stopped.
    pub(crate) fn write_snapshot(&self) -> Result<PathBuf, CoordinatorError> {
        let mut matches: Vec<MatchData> = self
            .registry
            .all()
            .iter()
            .map(|tracker| snapshot_match(tracker))
            .collect();
        matches.sort_by_key(|data| data.detail.id);

        let mut live_waiters: Vec<(WaiterKey, HandlerArgs)> = self
            .live_waiters
            .lock()
            .expect("live waiters poisoned")
            .iter()
            .map(|(key, args)| (*key, args.clone()))
            .collect();
        live_waiters.sort_by_key(|(key, _)| *key);

        let mut assets: Vec<AssetId> = self.assets.keys().copied().collect();
        assets.sort_unstable();

        let state = State {
            version: STATE_FILE_VERSION,
            assets,
            matches,
            order_stats: self.order_tracker.snapshot(),
            live_waiters,
        };

        let bytes = encode_state(&state)?;
        let name = format!("{}{}{}", STATE_FILE_PREFIX, now_ms(), STATE_FILE_SUFFIX);
        let path = self.data_dir.join(&name);
        let tmp_path = self.data_dir.join(format!("{}.tmp", name));
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &path)?;

        // File hash and database record go together; a mismatch on restore
        // means the file cannot be trusted.
        let hash = sha256(&bytes);
        self.storage.set_state_hash(&hash)?;
        log::info!(
            "snapshot {} written with {} matches, hash {}",
            name,
            state.matches.len(),
            to_hex(&hash)
        );

        self.prune_old_snapshots(&path);
        Ok(path)
    }

    fn prune_old_snapshots(&self, keep: &PathBuf) {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("could not scan data dir for old snapshots: {}", e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path == *keep {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if name.starts_with(STATE_FILE_PREFIX) && name.ends_with(STATE_FILE_SUFFIX) {
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("could not remove old snapshot {}: {}", path.display(), e);
                }
            }
        }
    }

    fn newest_snapshot(&self) -> Result<Option<PathBuf>, CoordinatorError> {
        let mut newest: Option<(u64, PathBuf)> = None;
        for entry in fs::read_dir(&self.data_dir)?.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let stamp = match name
                .strip_prefix(STATE_FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(STATE_FILE_SUFFIX))
                .and_then(|stamp| stamp.parse::<u64>().ok())
            {
                Some(stamp) => stamp,
                None => continue,
            };
            if newest.as_ref().map(|(t, _)| stamp > *t).unwrap_or(true) {
                newest = Some((stamp, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    /// Restore live state from a snapshot before [Coordinator::run].
    ///
    /// With an explicit path, that file is loaded as given. Otherwise, and
    /// unless suppressed by configuration, the newest snapshot in the data
    /// directory is loaded, but only if its hash matches the one recorded in
    /// the database; a mismatch is fatal. Returns whether a snapshot was
    /// loaded.
    pub fn restore_state(
        self: &Arc<Self>,
        explicit: Option<&std::path::Path>,
    ) -> Result<bool, CoordinatorError> {
        let (path, verify_hash) = match explicit {
            Some(path) => (path.to_path_buf(), false),
            None => {
                if self.cfg.ignore_state {
                    return Ok(false);
                }
                match self.newest_snapshot()? {
                    Some(path) => (path, true),
                    None => return Ok(false),
                }
            }
        };
        log::info!("restoring settlement state from {}", path.display());

        let bytes = fs::read(&path)?;
        if verify_hash {
            let computed = sha256(&bytes);
            match self.storage.state_hash()? {
                Some(recorded) if recorded == computed => {}
                Some(_) => {
                    return Err(CoordinatorError::Snapshot(format!(
                        "state file {} does not match the recorded hash",
                        path.display()
                    )))
                }
                None => {
                    return Err(CoordinatorError::Snapshot(
                        "no state hash recorded for the discovered state file".to_string(),
                    ))
                }
            }
        }

        let state = decode_state(&bytes)?;
        for asset_id in &state.assets {
            if !self.assets.contains_key(asset_id) {
                if self.cfg.allow_partial_restore {
                    log::warn!(
                        "asset {} missing from the configuration, its matches will be skipped",
                        asset_id
                    );
                } else {
                    return Err(CoordinatorError::Snapshot(format!(
                        "snapshot requires asset {} which is not configured",
                        asset_id
                    )));
                }
            }
        }

        let mut restored = 0;
        for data in &state.matches {
            match self.rehydrate_match(data) {
                Ok(tracker) => {
                    self.registry.insert(tracker);
                    restored += 1;
                }
                Err(e) => {
                    if self.cfg.allow_partial_restore {
                        log::warn!("skipping match {}: {:?}", data.detail.id, e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        self.order_tracker.restore(state.order_stats);

        // Replay persisted waiters through the real handlers; that
        // revalidates the messages and re-enqueues the probes naturally.
        for (key, args) in state.live_waiters {
            let result = match args.route {
                WaiterRoute::Init => self.handle_init(args.user, args.msg_id, &args.raw),
                WaiterRoute::Redeem => self.handle_redeem(args.user, args.msg_id, &args.raw),
            };
            if let Err(e) = result {
                log::warn!(
                    "dropping persisted waiter for msg {} from {}: {}",
                    key.msg_id,
                    key.user,
                    e
                );
            }
        }

        log::info!("restored {} matches from snapshot", restored);
        Ok(true)
    }

    fn rehydrate_match(&self, data: &MatchData) -> Result<Arc<MatchTracker>, CoordinatorError> {
        for asset_id in [data.maker.swap_asset, data.taker.swap_asset] {
            if !self.assets.contains_key(&asset_id) {
                return Err(CoordinatorError::Snapshot(format!(
                    "asset {} not configured",
                    asset_id
                )));
            }
        }

        let tracker = MatchTracker::new(data.detail.clone(), data.time);
        {
            let mut state = tracker.state.write().expect("match state poisoned");
            state.status = data.status;
            state.maker_match_ack = data.sigs.maker_match.clone();
            state.taker_match_ack = data.sigs.taker_match.clone();
            state.maker_audit_ack = data.sigs.maker_audit.clone();
            state.taker_audit_ack = data.sigs.taker_audit.clone();
            state.taker_redeem_ack = data.sigs.taker_redeem.clone();
        }
        *tracker.maker_status.write().expect("swap status poisoned") =
            self.rehydrate_swap_status(&data.maker, &data.taker)?;
        *tracker.taker_status.write().expect("swap status poisoned") =
            self.rehydrate_swap_status(&data.taker, &data.maker)?;
        Ok(Arc::new(tracker))
    }

    /// Rebuild one party's swap status, asking the backends to resolve the
    /// stored coin ids again.
    fn rehydrate_swap_status(
        &self,
        own: &SwapStatusData,
        counterparty: &SwapStatusData,
    ) -> Result<SwapStatus, CoordinatorError> {
        let mut status = SwapStatus {
            swap_asset: own.swap_asset,
            redeem_asset: own.redeem_asset,
            swap_time: own.swap_time,
            swap_confirm_time: own.swap_confirm_time,
            redeem_time: own.redeem_time,
            swap: None,
            redemption: None,
        };

        if let (Some(coin_id), Some(script)) = (&own.swap_coin, &own.contract_script) {
            let asset = self.assets.get(&own.swap_asset).ok_or_else(|| {
                CoordinatorError::Snapshot(format!("asset {} not configured", own.swap_asset))
            })?;
            status.swap = Some(asset.backend.contract(coin_id, script).map_err(|e| {
                CoordinatorError::Snapshot(format!("contract rehydration failed: {}", e))
            })?);
        }

        if let Some(redeem_coin) = &own.redeem_coin {
            let asset = self.assets.get(&own.redeem_asset).ok_or_else(|| {
                CoordinatorError::Snapshot(format!("asset {} not configured", own.redeem_asset))
            })?;
            let contract_coin = counterparty.swap_coin.as_ref().ok_or_else(|| {
                CoordinatorError::Snapshot(
                    "redemption recorded without a counterparty contract".to_string(),
                )
            })?;
            status.redemption = Some(
                asset
                    .backend
                    .redemption(redeem_coin, contract_coin)
                    .map_err(|e| {
                        CoordinatorError::Snapshot(format!("redemption rehydration failed: {}", e))
                    })?,
            );
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{AccountId, LimitOrder, TakerOrder};

    fn test_state() -> State {
        let maker = LimitOrder {
            id: OrderId([1; 32]),
            user: AccountId([2; 32]),
            base: 42,
            quote: 0,
            sell: true,
            quantity: 100,
            rate: 5,
            swap_address: "maker-addr".to_string(),
            funding_coins: vec![vec![1, 2]],
        };
        let taker = LimitOrder {
            id: OrderId([3; 32]),
            user: AccountId([4; 32]),
            base: 42,
            quote: 0,
            sell: false,
            quantity: 100,
            rate: 5,
            swap_address: "taker-addr".to_string(),
            funding_coins: vec![vec![3, 4]],
        };
        let detail = Match::new(maker, TakerOrder::Limit(taker), 100, 5, 1_000, 10, 20);
        State {
            version: STATE_FILE_VERSION,
            assets: vec![0, 42],
            matches: vec![MatchData {
                time: 1_234,
                match_time: 1_000,
                status: MatchStatus::MakerSwapCast,
                maker: SwapStatusData {
                    swap_asset: 42,
                    redeem_asset: 0,
                    swap_time: 1_500,
                    swap_confirm_time: 0,
                    redeem_time: 0,
                    swap_coin: Some(vec![0xaa]),
                    contract_script: Some(vec![0xbb]),
                    redeem_coin: None,
                },
                taker: SwapStatusData {
                    swap_asset: 0,
                    redeem_asset: 42,
                    swap_time: 0,
                    swap_confirm_time: 0,
                    redeem_time: 0,
                    swap_coin: None,
                    contract_script: None,
                    redeem_coin: None,
                },
                sigs: AckSigsData {
                    maker_match: Some(vec![9, 9]),
                    taker_match: None,
                    maker_audit: None,
                    taker_audit: None,
                    taker_redeem: None,
                },
                detail,
            }],
            order_stats: vec![(
                OrderId([1; 32]),
                OrderSwapStat {
                    swap_count: 1,
                    off_book: false,
                    has_failed: false,
                },
            )],
            live_waiters: vec![(
                WaiterKey {
                    user: AccountId([4; 32]),
                    msg_id: 7,
                },
                HandlerArgs {
                    user: AccountId([4; 32]),
                    msg_id: 7,
                    route: WaiterRoute::Init,
                    raw: vec![1, 2, 3],
                },
            )],
        }
    }

    #[test]
    fn test_state_round_trip() {
        let state = test_state();
        let bytes = encode_state(&state).unwrap();
        let back = decode_state(&bytes).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_identical_state_identical_bytes() {
        let a = encode_state(&test_state()).unwrap();
        let b = encode_state(&test_state()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = encode_state(&test_state()).unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(
            decode_state(&bytes),
            Err(CoordinatorError::Snapshot(_))
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut bytes = encode_state(&test_state()).unwrap();
        bytes[11] = 99;
        assert!(matches!(
            decode_state(&bytes),
            Err(CoordinatorError::Snapshot(_))
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let bytes = encode_state(&test_state()).unwrap();
        assert!(decode_state(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_state(&bytes[..10]).is_err());
    }
}
