//! Configuration loading (spec §6).
//!
//! Follows `forwarder::config`'s `Raw*` shadow-struct pattern: every field
//! on the raw struct is `Option<T>` so a partial TOML file deserialises
//! without error, then `RawConfig::into_config` applies defaults and
//! rejects invalid values. `DATABASE_URL` / `MONITOR_DATABASE_URL` are read
//! from the environment rather than the TOML file, mirroring
//! `services/server/src/main.rs`; `RUST_LOG` likewise stays an environment
//! variable, not a config key.

use crate::error::ConfigError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rusty-timer-relay/relay.toml";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub clt_sub_port: u16,
    pub log_sub_port: u16,
    pub log_pub_port: u16,
    pub mm_snd_port: u16,

    pub inpoll_timeout: Duration,
    pub outpoll_timeout: Duration,
    pub broadcast_period: Duration,
    pub promote_timeout: Duration,
    pub negotiate_period: Duration,
    pub negotiation_timeout: Duration,
    pub mm_warn_timeout: Duration,
    pub cache_period: Duration,
    pub stats_period: Duration,

    pub max_send_attempts: u32,
    pub warn_limit: usize,
    pub drop_limit: usize,

    pub dont_promote: bool,
    pub warn_no_standby: bool,
    pub handle_unexpected_writes: bool,

    pub metrics_bind_addr: SocketAddr,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bind_addr: Option<String>,
    clt_sub_port: Option<u16>,
    log_sub_port: Option<u16>,
    log_pub_port: Option<u16>,
    mm_snd_port: Option<u16>,

    inpoll_timeout_ms: Option<u64>,
    outpoll_timeout_ms: Option<u64>,
    broadcast_period_ms: Option<u64>,
    promote_timeout_ms: Option<u64>,
    negotiate_period_ms: Option<u64>,
    negotiation_timeout_ms: Option<u64>,
    mm_warn_timeout_ms: Option<u64>,
    cache_period_ms: Option<u64>,
    stats_period_ms: Option<u64>,

    max_send_attempts: Option<u32>,
    warn_limit: Option<usize>,
    drop_limit: Option<usize>,

    dont_promote: Option<u8>,
    warn_no_standby: Option<u8>,
    handle_unexpected_writes: Option<u8>,

    metrics_bind_addr: Option<String>,
}

fn parse_bool_key(value: Option<u8>, key: &str) -> Result<bool, ConfigError> {
    match value {
        None | Some(0) => Ok(false),
        Some(1) => Ok(true),
        Some(other) => Err(ConfigError::InvalidValue(format!(
            "{key} must be 0 or 1, got {other}"
        ))),
    }
}

fn parse_addr(value: Option<String>, key: &str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = value.unwrap_or_else(|| default.to_owned());
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{key} is not a valid socket address: {raw}")))
}

impl RawConfig {
    fn into_config(self) -> Result<RelayConfig, ConfigError> {
        Ok(RelayConfig {
            bind_addr: parse_addr(self.bind_addr, "bind_addr", "0.0.0.0:0")?,
            clt_sub_port: self.clt_sub_port.unwrap_or(5555),
            log_sub_port: self.log_sub_port.unwrap_or(5556),
            log_pub_port: self.log_pub_port.unwrap_or(5557),
            mm_snd_port: self.mm_snd_port.unwrap_or(5558),

            inpoll_timeout: Duration::from_millis(self.inpoll_timeout_ms.unwrap_or(100)),
            outpoll_timeout: Duration::from_millis(self.outpoll_timeout_ms.unwrap_or(100)),
            broadcast_period: Duration::from_millis(self.broadcast_period_ms.unwrap_or(200)),
            promote_timeout: Duration::from_millis(self.promote_timeout_ms.unwrap_or(1000)),
            negotiate_period: Duration::from_millis(self.negotiate_period_ms.unwrap_or(200)),
            negotiation_timeout: Duration::from_millis(self.negotiation_timeout_ms.unwrap_or(500)),
            mm_warn_timeout: Duration::from_millis(self.mm_warn_timeout_ms.unwrap_or(2000)),
            cache_period: Duration::from_millis(self.cache_period_ms.unwrap_or(60_000)),
            stats_period: Duration::from_millis(self.stats_period_ms.unwrap_or(10_000)),

            max_send_attempts: self.max_send_attempts.unwrap_or(3),
            warn_limit: self.warn_limit.unwrap_or(100),
            drop_limit: self.drop_limit.unwrap_or(200),

            dont_promote: parse_bool_key(self.dont_promote, "dont_promote")?,
            warn_no_standby: parse_bool_key(self.warn_no_standby, "warn_no_standby")?,
            handle_unexpected_writes: parse_bool_key(
                self.handle_unexpected_writes,
                "handle_unexpected_writes",
            )?,

            metrics_bind_addr: parse_addr(
                self.metrics_bind_addr,
                "metrics_bind_addr",
                "0.0.0.0:9100",
            )?,
        })
    }
}

/// Load configuration from the default path, falling back to all defaults
/// if the file doesn't exist — matching `forwarder::config::load_config`'s
/// "missing file is not an error" behaviour for optional deployments.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => load_config_from_str(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RawConfig::default().into_config(),
        Err(e) => Err(ConfigError::Io(e.to_string())),
    }
}

pub fn load_config_from_str(contents: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    raw.into_config()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_falls_back_to_documented_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.clt_sub_port, 5555);
        assert_eq!(config.max_send_attempts, 3);
        assert!(!config.dont_promote);
    }

    #[test]
    fn partial_config_overrides_only_the_given_keys() {
        let config = load_config_from_str("clt_sub_port = 7000\ndont_promote = 1\n").unwrap();
        assert_eq!(config.clt_sub_port, 7000);
        assert!(config.dont_promote);
        assert_eq!(config.log_sub_port, 5556);
    }

    #[test]
    fn boolean_keys_reject_values_other_than_zero_or_one() {
        let err = load_config_from_str("dont_promote = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn duration_keys_are_parsed_as_milliseconds() {
        let config = load_config_from_str("promote_timeout_ms = 2500\n").unwrap();
        assert_eq!(config.promote_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = load_config_from_str("not valid toml =====").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = load_config_from_path(Path::new("/nonexistent/relay.toml")).unwrap();
        assert_eq!(config.clt_sub_port, 5555);
    }
}
