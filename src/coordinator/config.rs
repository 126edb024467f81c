//! Coordinator configuration. Controlling deadlines and restore behavior.

use std::{io, path::Path};

use std::io::Write;

use crate::utill::{get_swapd_dir, parse_field, parse_toml};

/// Coordinator configuration, controlling settlement deadlines and snapshot
/// restore behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Grace period a party has to act after the triggering event,
    /// milliseconds.
    pub broadcast_timeout_ms: u64,
    /// How long a coin waiter keeps probing for an announced transaction,
    /// milliseconds. Clamped to `broadcast_timeout_ms` at coordinator
    /// construction.
    pub tx_wait_expiration_ms: u64,
    /// Interval between coin-waiter probes, milliseconds.
    pub recheck_interval_ms: u64,
    /// Minimum maker contract lock time past the match time, milliseconds.
    pub lock_time_maker_ms: u64,
    /// Minimum taker contract lock time past the match time, milliseconds.
    pub lock_time_taker_ms: u64,
    /// Skip snapshot matches whose assets are no longer configured instead
    /// of aborting startup.
    pub allow_partial_restore: bool,
    /// Do not look for a snapshot in the data directory on startup.
    pub ignore_state: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            broadcast_timeout_ms: 5 * 60 * 1000,
            tx_wait_expiration_ms: 60 * 1000,
            recheck_interval_ms: 3 * 1000,
            lock_time_maker_ms: 24 * 60 * 60 * 1000,
            lock_time_taker_ms: 8 * 60 * 60 * 1000,
            allow_partial_restore: false,
            ignore_state: false,
        }
    }
}

impl CoordinatorConfig {
    /// Constructs a [CoordinatorConfig] from a specified config file. Or
    /// create default configs and load them.
    ///
    /// The config file should exist at the provided location. Or else, a new
    /// default config will be written there and loaded. If no path is
    /// provided, the default data-dir location is used.
    ///
    /// Default data-dir for linux: `~/.swapd`
    /// Default config location: `~/.swapd/config.toml`.
    pub fn new(config_path: Option<&Path>) -> io::Result<Self> {
        let default_config_path = get_swapd_dir().join("config.toml");

        let config_path = config_path.unwrap_or(&default_config_path);
        let default_config = Self::default();

        // Creates a default config file at the specified path if it doesn't exist or is empty.
        if !config_path.exists() || std::fs::metadata(config_path)?.len() == 0 {
            log::warn!(
                "Coordinator config file not found, creating default config file at path: {}",
                config_path.display()
            );

            default_config.write_to_file(config_path)?;
        }

        let config_map = parse_toml(config_path)?;

        log::info!(
            "Successfully loaded config file from : {}",
            config_path.display()
        );

        Ok(CoordinatorConfig {
            broadcast_timeout_ms: parse_field(
                config_map.get("broadcast_timeout_ms"),
                default_config.broadcast_timeout_ms,
            ),
            tx_wait_expiration_ms: parse_field(
                config_map.get("tx_wait_expiration_ms"),
                default_config.tx_wait_expiration_ms,
            ),
            recheck_interval_ms: parse_field(
                config_map.get("recheck_interval_ms"),
                default_config.recheck_interval_ms,
            ),
            lock_time_maker_ms: parse_field(
                config_map.get("lock_time_maker_ms"),
                default_config.lock_time_maker_ms,
            ),
            lock_time_taker_ms: parse_field(
                config_map.get("lock_time_taker_ms"),
                default_config.lock_time_taker_ms,
            ),
            allow_partial_restore: parse_field(
                config_map.get("allow_partial_restore"),
                default_config.allow_partial_restore,
            ),
            ignore_state: parse_field(config_map.get("ignore_state"), default_config.ignore_state),
        })
    }

    // Method to serialize the CoordinatorConfig into a TOML string and write it to a file.
    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        let toml_data = format!(
            "broadcast_timeout_ms = {}
tx_wait_expiration_ms = {}
recheck_interval_ms = {}
lock_time_maker_ms = {}
lock_time_taker_ms = {}
allow_partial_restore = {}
ignore_state = {}",
            self.broadcast_timeout_ms,
            self.tx_wait_expiration_ms,
            self.recheck_interval_ms,
            self.lock_time_maker_ms,
            self.lock_time_taker_ms,
            self.allow_partial_restore,
            self.ignore_state,
        );

        std::fs::create_dir_all(path.parent().expect("Path should NOT be root!"))?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(toml_data.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
