//! Session configuration.

use std::path::PathBuf;

use crate::layout::{HeaderIdentity, RING_MAGIC, RING_VERSION};
use crate::record::TerminatorPolicy;

/// Default device node.
pub const DEFAULT_DEVICE_PATH: &str = "/proc/zlog";

/// Default mapping order: 16 pages (64 KiB on 4 KiB pages).
pub const DEFAULT_MEM_ORDER: usize = 16;

/// Environment variable overriding [`RingConfig::path`].
pub const ENV_PATH: &str = "ZLOG_PATH";
/// Environment variable overriding [`RingConfig::mem_order`].
pub const ENV_MEM_ORDER: &str = "ZLOG_MEM_ORDER";
/// Environment variable setting [`RingConfig::seed`].
pub const ENV_SEED: &str = "ZLOG_SEED";
/// Environment variable overriding [`RingConfig::magic`].
pub const ENV_MAGIC: &str = "ZLOG_MAGIC";
/// Environment variable overriding [`RingConfig::version`].
pub const ENV_VERSION: &str = "ZLOG_VERSION";

/// Parse a header byte written as decimal (`90`) or hex (`0x5a`).
pub fn parse_header_byte(value: &str) -> Option<u8> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Configuration for opening a ring session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Device node to open.
    pub path: PathBuf,
    /// Mapping size as a multiple of the page size. Must match the ring's
    /// allocated size exactly.
    pub mem_order: usize,
    /// Expected header magic.
    pub magic: u8,
    /// Expected header version.
    pub version: u8,
    /// Handling of payloads without a terminator.
    pub terminator: TerminatorPolicy,
    /// Seed for owner-id generation; `None` uses OS entropy.
    pub seed: Option<u64>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DEVICE_PATH),
            mem_order: DEFAULT_MEM_ORDER,
            magic: RING_MAGIC,
            version: RING_VERSION,
            terminator: TerminatorPolicy::default(),
            seed: None,
        }
    }
}

impl RingConfig {
    /// Defaults overlaid with `ZLOG_PATH`, `ZLOG_MEM_ORDER`, `ZLOG_SEED`,
    /// `ZLOG_MAGIC` and `ZLOG_VERSION`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_PATH) {
            config.path = PathBuf::from(path);
        }
        if let Some(order) = lookup(ENV_MEM_ORDER) {
            config.mem_order = order
                .trim()
                .parse()
                .ok()
                .filter(|&n: &usize| n > 0)
                .ok_or(ConfigError::Invalid {
                    key: ENV_MEM_ORDER,
                    value: order,
                })?;
        }
        if let Some(seed) = lookup(ENV_SEED) {
            config.seed = Some(seed.trim().parse().map_err(|_| ConfigError::Invalid {
                key: ENV_SEED,
                value: seed.clone(),
            })?);
        }
        if let Some(magic) = lookup(ENV_MAGIC) {
            config.magic = parse_header_byte(&magic).ok_or(ConfigError::Invalid {
                key: ENV_MAGIC,
                value: magic,
            })?;
        }
        if let Some(version) = lookup(ENV_VERSION) {
            config.version = parse_header_byte(&version).ok_or(ConfigError::Invalid {
                key: ENV_VERSION,
                value: version,
            })?;
        }

        Ok(config)
    }

    pub fn identity(&self) -> HeaderIdentity {
        HeaderIdentity {
            magic: self.magic,
            version: self.version,
        }
    }
}

/// Errors from reading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value could not be parsed.
    Invalid { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { key, value } => write!(f, "invalid value for {}: {:?}", key, value),
        }
    }
}

impl std::error::Error for ConfigError {}
