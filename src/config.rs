// Configuration schema for the peer messaging core.

use std::{
    env, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    quota::QuotaLimits,
    sched::SchedulerLimits,
    wire::{ENCRYPTED_OVERHEAD, MAX_MESSAGE_SIZE, SUB_HEADER_LEN},
};

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Configuration loaded at startup. Every section may be omitted.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub frame: FrameConfig,
    pub queue: QueueConfig,
    pub handshake: HandshakeConfig,
    pub bandwidth: BandwidthConfig,
    pub clients: ClientConfig,
}

impl Config {
    /// Loads configuration from `PEERCORE_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("PEERCORE_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.frame.validate().map_err(ConfigError::Validation)?;
        self.queue.validate().map_err(ConfigError::Validation)?;
        self.handshake.validate().map_err(ConfigError::Validation)?;
        self.bandwidth.validate().map_err(ConfigError::Validation)?;
        if self.clients.max_notify_queue == 0 {
            return Err(ConfigError::Validation(
                "clients.max_notify_queue must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_limits(&self) -> SchedulerLimits {
        SchedulerLimits {
            max_entries: self.queue.max_entries,
            frame_size: self.frame.target_size,
            expiry_grace: Duration::from_millis(self.queue.expiry_grace_ms),
            max_cork_delay: Duration::from_millis(self.queue.max_cork_delay_ms),
        }
    }

    pub fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            global_target_bpm: self.bandwidth.global_target_out_bpm,
            min_bpm_per_peer: self.bandwidth.min_bpm_per_peer,
            min_bpm_change: self.bandwidth.min_bpm_change,
            idle_timeout: Duration::from_millis(self.bandwidth.idle_timeout_ms),
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Frame sizing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FrameConfig {
    /// Plaintext budget of one encrypted frame; also the corking reference.
    pub target_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            target_size: 63 * KIB as usize,
        }
    }
}

impl FrameConfig {
    fn validate(&self) -> Result<(), String> {
        if self.target_size <= SUB_HEADER_LEN {
            return Err("frame.target_size must exceed the sub-message header".into());
        }
        if self.target_size + ENCRYPTED_OVERHEAD > MAX_MESSAGE_SIZE {
            return Err(format!(
                "frame.target_size must be <= {}",
                MAX_MESSAGE_SIZE - ENCRYPTED_OVERHEAD
            ));
        }
        Ok(())
    }
}

/// Plaintext queue bounds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_entries: usize,
    /// How long past its deadline a message may still be sent.
    pub expiry_grace_ms: u64,
    /// Longest a small batch is held back waiting for company.
    pub max_cork_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: 16,
            expiry_grace_ms: 1_000,
            max_cork_delay_ms: 1_000,
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("queue.max_entries must be > 0".into());
        }
        Ok(())
    }
}

/// Key exchange timing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HandshakeConfig {
    /// First SET_KEY retry interval; doubles on every retry.
    pub initial_retry_ms: u64,
    /// Deadline given to handshake frames on the transmit queue.
    pub control_deadline_ms: u64,
    /// Frames stamped further in the past are dropped.
    pub max_message_age_secs: u64,
    pub lookup_timeout_ms: u64,
    /// Inbound silence after which a confirmed session gets a keepalive PING.
    pub keepalive_interval_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            initial_retry_ms: 3_000,
            control_deadline_ms: 10_000,
            max_message_age_secs: 86_400,
            lookup_timeout_ms: 30_000,
            keepalive_interval_ms: 150_000,
        }
    }
}

impl HandshakeConfig {
    fn validate(&self) -> Result<(), String> {
        if self.initial_retry_ms == 0 {
            return Err("handshake.initial_retry_ms must be > 0".into());
        }
        if self.max_message_age_secs == 0 {
            return Err("handshake.max_message_age_secs must be > 0".into());
        }
        if self.keepalive_interval_ms == 0 {
            return Err("handshake.keepalive_interval_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn initial_retry(&self) -> Duration {
        Duration::from_millis(self.initial_retry_ms)
    }

    pub fn control_deadline(&self) -> Duration {
        Duration::from_millis(self.control_deadline_ms)
    }

    pub fn max_message_age(&self) -> Duration {
        Duration::from_secs(self.max_message_age_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Bandwidth budget, all rates in bytes per minute.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Initial inbound quota and outbound limit of a new session.
    pub default_bpm: u32,
    pub min_bpm_per_peer: u32,
    pub global_target_out_bpm: u32,
    /// Window backlog cap in minutes of the current rate.
    pub backlog_minutes: u32,
    pub min_bpm_change: u32,
    pub quota_period_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            default_bpm: 2 * MIB,
            min_bpm_per_peer: 64 * KIB,
            global_target_out_bpm: 64 * MIB,
            backlog_minutes: 5,
            min_bpm_change: 32,
            quota_period_ms: 5_000,
            idle_timeout_ms: 300_000,
        }
    }
}

impl BandwidthConfig {
    fn validate(&self) -> Result<(), String> {
        if self.default_bpm == 0 {
            return Err("bandwidth.default_bpm must be > 0".into());
        }
        if self.global_target_out_bpm < self.min_bpm_per_peer {
            return Err("bandwidth.global_target_out_bpm must be >= min_bpm_per_peer".into());
        }
        if self.backlog_minutes == 0 {
            return Err("bandwidth.backlog_minutes must be > 0".into());
        }
        if self.quota_period_ms == 0 {
            return Err("bandwidth.quota_period_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn quota_period(&self) -> Duration {
        Duration::from_millis(self.quota_period_ms)
    }
}

/// Local client limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Non-critical notifications beyond this many per client are dropped.
    pub max_notify_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_notify_queue: 32,
        }
    }
}

const KIB: u32 = 1024;
const MIB: u32 = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scheduler_limits(), SchedulerLimits::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let input = r#"
            [queue]
            max_entries = 4

            [bandwidth]
            min_bpm_per_peer = 1000
        "#;
        let cfg = Config::from_toml_str(input).expect("parse");
        assert_eq!(cfg.queue.max_entries, 4);
        assert_eq!(cfg.queue.expiry_grace_ms, 1_000);
        assert_eq!(cfg.bandwidth.min_bpm_per_peer, 1_000);
        assert_eq!(cfg.bandwidth.default_bpm, 2 * MIB);
    }

    #[test]
    fn oversized_frame_rejected() {
        let input = r#"
            [frame]
            target_size = 65535
        "#;
        match Config::from_toml_str(input).unwrap_err() {
            ConfigError::Validation(msg) => assert!(msg.contains("frame.target_size")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn global_budget_below_minimum_rejected() {
        let input = r#"
            [bandwidth]
            global_target_out_bpm = 10
            min_bpm_per_peer = 100
        "#;
        assert!(matches!(
            Config::from_toml_str(input),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn reader_and_str_agree() {
        let input = "[clients]\nmax_notify_queue = 3\n";
        let from_reader = Config::from_reader(input.as_bytes()).expect("reader");
        let from_str: Config = input.parse().expect("str");
        assert_eq!(from_reader, from_str);
        assert_eq!(from_str.clients.max_notify_queue, 3);
    }

    #[test]
    fn missing_file_reports_path() {
        match Config::from_path("/nonexistent/peercore.toml") {
            Err(ConfigError::Io { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/peercore.toml"))
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
