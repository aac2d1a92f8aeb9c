//! Environment-driven configuration.
//!
//! Every option comes from a `RYUK_*` variable with a built-in default.
//! Parse failures are fatal at startup; out-of-range values are rejected
//! with a message naming the offending variable.

use std::time::Duration;

use thiserror::Error;

/// Error raised for a malformed or out-of-range `RYUK_*` variable.
#[derive(Error, Debug)]
#[error("{var}: {message}")]
pub struct ConfigError {
    pub var: &'static str,
    pub message: String,
}

/// Reaper configuration, immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// TCP bind port; 0 requests an OS-assigned port.
    pub port: u16,
    /// How long to wait for the first client before giving up.
    pub connection_timeout: Duration,
    /// Idle window after the last client leaves before pruning starts.
    pub reconnection_timeout: Duration,
    /// Bound on each runtime API call.
    pub request_timeout: Duration,
    /// Delete attempts per resource kind.
    pub remove_retries: u32,
    /// Clock-skew tolerance added to the prune start; typically negative.
    pub retry_offset: chrono::Duration,
    /// Wait between change-detected recomputations of the plan.
    pub changes_retry_interval: Duration,
    /// Grace period between a shutdown signal and the forced prune.
    pub shutdown_timeout: Duration,
    /// Enable debug-level logs.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            connection_timeout: Duration::from_secs(60),
            reconnection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            remove_retries: 10,
            retry_offset: chrono::Duration::seconds(-1),
            changes_retry_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(600),
            verbose: false,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read the configuration through `lookup`.
    ///
    /// Tests use this seam to avoid mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("RYUK_PORT") {
            config.port = raw.trim().parse().map_err(|_| ConfigError {
                var: "RYUK_PORT",
                message: format!("invalid port {raw:?} (expected 0-65535)"),
            })?;
        }

        config.connection_timeout =
            duration_var(&lookup, "RYUK_CONNECTION_TIMEOUT", config.connection_timeout)?;
        config.reconnection_timeout = duration_var(
            &lookup,
            "RYUK_RECONNECTION_TIMEOUT",
            config.reconnection_timeout,
        )?;
        config.request_timeout =
            duration_var(&lookup, "RYUK_REQUEST_TIMEOUT", config.request_timeout)?;

        if let Some(raw) = lookup("RYUK_REMOVE_RETRIES") {
            let retries: u32 = raw.trim().parse().map_err(|_| ConfigError {
                var: "RYUK_REMOVE_RETRIES",
                message: format!("invalid count {raw:?}"),
            })?;
            if retries == 0 {
                return Err(ConfigError {
                    var: "RYUK_REMOVE_RETRIES",
                    message: "must be at least 1".to_string(),
                });
            }
            config.remove_retries = retries;
        }

        if let Some(raw) = lookup("RYUK_RETRY_OFFSET") {
            config.retry_offset =
                parse_signed_duration(&raw).map_err(|message| ConfigError {
                    var: "RYUK_RETRY_OFFSET",
                    message,
                })?;
        }

        config.changes_retry_interval = duration_var(
            &lookup,
            "RYUK_CHANGES_RETRY_INTERVAL",
            config.changes_retry_interval,
        )?;
        config.shutdown_timeout =
            duration_var(&lookup, "RYUK_SHUTDOWN_TIMEOUT", config.shutdown_timeout)?;

        if let Some(raw) = lookup("RYUK_VERBOSE") {
            config.verbose = parse_bool(&raw).map_err(|message| ConfigError {
                var: "RYUK_VERBOSE",
                message,
            })?;
        }

        Ok(config)
    }
}

fn duration_var<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => parse_duration(&raw).map_err(|message| ConfigError { var, message }),
        None => Ok(default),
    }
}

/// Parse a human-friendly non-negative duration (`100ms`, `5s`, `10m`,
/// `2h`; a bare number means seconds).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s.starts_with('-') {
        return Err(format!("duration must not be negative: {s}"));
    }

    let (num_str, suffix) = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| (&s[..i], &s[i..]))
        .unwrap_or((s, ""));

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration {s:?}"))?;

    match suffix.trim() {
        "ms" => Ok(Duration::from_millis(num)),
        "" | "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 3600)),
        other => Err(format!("unknown duration suffix {other:?}")),
    }
}

/// Parse a duration that may carry a leading `-`; the retry offset is
/// typically negative.
fn parse_signed_duration(s: &str) -> Result<chrono::Duration, String> {
    let s = s.trim();
    let (negative, magnitude) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let unsigned = parse_duration(magnitude)?;
    let signed =
        chrono::Duration::from_std(unsigned).map_err(|_| format!("duration out of range: {s}"))?;
    Ok(if negative { -signed } else { signed })
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(format!("invalid boolean {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    // --- Defaults ---

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 8080);
        assert_eq!(config.connection_timeout, Duration::from_secs(60));
        assert_eq!(config.reconnection_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.remove_retries, 10);
        assert_eq!(config.retry_offset, chrono::Duration::seconds(-1));
        assert_eq!(config.changes_retry_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(600));
        assert!(!config.verbose);
    }

    // --- Variable parsing ---

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup_from(&[
            ("RYUK_PORT", "0"),
            ("RYUK_CONNECTION_TIMEOUT", "5s"),
            ("RYUK_RECONNECTION_TIMEOUT", "100ms"),
            ("RYUK_REQUEST_TIMEOUT", "30s"),
            ("RYUK_REMOVE_RETRIES", "3"),
            ("RYUK_RETRY_OFFSET", "-2s"),
            ("RYUK_CHANGES_RETRY_INTERVAL", "500ms"),
            ("RYUK_SHUTDOWN_TIMEOUT", "1m"),
            ("RYUK_VERBOSE", "true"),
        ]))
        .unwrap();

        assert_eq!(config.port, 0);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnection_timeout, Duration::from_millis(100));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.remove_retries, 3);
        assert_eq!(config.retry_offset, chrono::Duration::seconds(-2));
        assert_eq!(config.changes_retry_interval, Duration::from_millis(500));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert!(config.verbose);
    }

    #[test]
    fn rejects_bad_port() {
        let err = Config::from_lookup(lookup_from(&[("RYUK_PORT", "70000")])).unwrap_err();
        assert_eq!(err.var, "RYUK_PORT");
    }

    #[test]
    fn rejects_negative_timeout() {
        let err =
            Config::from_lookup(lookup_from(&[("RYUK_CONNECTION_TIMEOUT", "-5s")])).unwrap_err();
        assert_eq!(err.var, "RYUK_CONNECTION_TIMEOUT");
        assert!(err.message.contains("negative"));
    }

    #[test]
    fn rejects_zero_retries() {
        let err = Config::from_lookup(lookup_from(&[("RYUK_REMOVE_RETRIES", "0")])).unwrap_err();
        assert_eq!(err.var, "RYUK_REMOVE_RETRIES");
    }

    #[test]
    fn rejects_bad_bool() {
        let err = Config::from_lookup(lookup_from(&[("RYUK_VERBOSE", "yes")])).unwrap_err();
        assert_eq!(err.var, "RYUK_VERBOSE");
    }

    // --- Duration syntax ---

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn duration_rejects_unknown_suffix() {
        assert!(parse_duration("5 fortnights").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
    }

    #[test]
    fn signed_duration_accepts_leading_minus() {
        assert_eq!(
            parse_signed_duration("-1s").unwrap(),
            chrono::Duration::seconds(-1)
        );
        assert_eq!(
            parse_signed_duration("250ms").unwrap(),
            chrono::Duration::milliseconds(250)
        );
    }
}
