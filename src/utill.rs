//! Various utility and helper functions used across the coordinator.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Once,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bitcoin::hashes::{sha256, Hash};
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

/// Interval for the supervisor's idle wakeups and shutdown polls.
#[cfg(feature = "integration-test")]
pub const HEART_BEAT_INTERVAL: Duration = Duration::from_millis(100);
#[cfg(not(feature = "integration-test"))]
pub const HEART_BEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Current UTC time in milliseconds since the unix epoch. All protocol
/// timestamps are millisecond-truncated.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    let hex_chars: Vec<char> = "0123456789abcdef".chars().collect();
    let mut hex_string = String::new();

    for &byte in bytes {
        let high_nibble = (byte >> 4) & 0xF;
        let low_nibble = byte & 0xF;
        hex_string.push(hex_chars[high_nibble as usize]);
        hex_string.push(hex_chars[low_nibble as usize]);
    }

    hex_string
}

/// Sha256 digest of arbitrary bytes, used for match ids and state-file
/// integrity hashes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(bytes).to_byte_array()
}

/// Default data directory for the coordinator. Linux: `~/.swapd`.
pub fn get_swapd_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory expected")
        .join(".swapd")
}

/// Parse a flat `key = value` TOML file into a string map. Section headers
/// and comments are skipped; values keep everything after the first `=`.
pub(crate) fn parse_toml(path: &Path) -> std::io::Result<HashMap<String, String>> {
    let content = fs::read_to_string(path)?;
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok(map)
}

/// Parse a config field from the map, falling back to the default on a
/// missing key or an unparsable value.
pub(crate) fn parse_field<T: FromStr>(value: Option<&String>, default: T) -> T {
    value
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

static LOGGER_INIT: Once = Once::new();

/// Initializes a global logger with a console appender and, when a data
/// directory is given, a `debug.log` file appender. Safe to call more than
/// once; only the first call takes effect.
pub fn setup_logger(filter: log::LevelFilter, data_dir: Option<PathBuf>) {
    LOGGER_INIT.call_once(|| {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(
                "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}",
            )))
            .build();

        let mut config_builder =
            Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));
        let mut root_builder = Root::builder().appender("stdout");

        if let Some(dir) = data_dir {
            let log_path = dir.join("debug.log");
            match FileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(
                    "{d(%Y-%m-%d %H:%M:%S)} {l} {t} - {m}{n}",
                )))
                .build(log_path)
            {
                Ok(file) => {
                    config_builder = config_builder
                        .appender(Appender::builder().build("file", Box::new(file)));
                    root_builder = root_builder.appender("file");
                }
                Err(e) => eprintln!("could not create log file appender: {:?}", e),
            }
        }

        let config = config_builder
            .build(root_builder.build(filter))
            .expect("logger config expected");
        let _ = log4rs::init_config(config);
    });
}
