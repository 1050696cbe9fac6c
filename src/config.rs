// ABOUTME: Bridge configuration shared by the LSP and DAP endpoints
// ABOUTME: Builder defaults, PSBRIDGE_* environment overrides, and optional TOML file loading
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "config-file")]
use serde::Deserialize;
#[cfg(feature = "config-file")]
use tracing::debug;

use crate::transport::TransportKind;
use crate::types::BridgeError;

/// Quiet period before diagnostics run after an edit (750 ms)
pub const DEFAULT_DIAGNOSTICS_DELAY: Duration = Duration::from_millis(750);

/// Longest time buffered output waits before it is flushed (25 ms)
pub const DEFAULT_OUTPUT_FLUSH_INTERVAL: Duration = Duration::from_millis(25);

/// Timeout for completion and hover lookups (5 seconds)
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for watch and hover evaluations in the debugger (10 seconds)
pub const DEFAULT_EVALUATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for one engine subprocess command (120 seconds)
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

/// Configuration for one bridge process
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Transport the endpoint listens on
    pub transport: TransportKind,
    /// Debounce before diagnostics run
    pub diagnostics_delay: Duration,
    /// Maximum latency of buffered engine output
    pub output_flush_interval: Duration,
    /// Timeout for completion and hover engine calls
    pub request_timeout: Duration,
    /// Timeout for must-await debugger evaluations
    pub evaluate_timeout: Duration,
    /// Timeout for one engine subprocess command
    pub command_timeout: Duration,
    /// Explicit path to the `pwsh` binary
    pub pwsh_path: Option<PathBuf>,
    /// Environment variable keys passed through to the engine subprocess
    pub allowed_env_keys: Vec<String>,
    /// Working directory for the engine subprocess
    pub working_directory: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            diagnostics_delay: DEFAULT_DIAGNOSTICS_DELAY,
            output_flush_interval: DEFAULT_OUTPUT_FLUSH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            evaluate_timeout: DEFAULT_EVALUATE_TIMEOUT,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            pwsh_path: None,
            allowed_env_keys: default_allowed_env_keys(),
            working_directory: None,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `PSBRIDGE_*` environment variables
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::default().apply_env(|key| env::var(key).ok())
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, BridgeError> {
        if let Some(value) = lookup("PSBRIDGE_DIAGNOSTICS_DELAY_MS") {
            self.diagnostics_delay = parse_millis(&value)
                .map_err(|e| invalid("PSBRIDGE_DIAGNOSTICS_DELAY_MS", &value, &e))?;
        }
        if let Some(value) = lookup("PSBRIDGE_OUTPUT_FLUSH_MS") {
            self.output_flush_interval =
                parse_millis(&value).map_err(|e| invalid("PSBRIDGE_OUTPUT_FLUSH_MS", &value, &e))?;
        }
        if let Some(value) = lookup("PSBRIDGE_REQUEST_TIMEOUT_SECS") {
            self.request_timeout = parse_timeout(&value)
                .map_err(|e| invalid("PSBRIDGE_REQUEST_TIMEOUT_SECS", &value, &e))?;
        }
        if let Some(value) = lookup("PSBRIDGE_EVALUATE_TIMEOUT_SECS") {
            self.evaluate_timeout = parse_timeout(&value)
                .map_err(|e| invalid("PSBRIDGE_EVALUATE_TIMEOUT_SECS", &value, &e))?;
        }
        if let Some(value) = lookup("PSBRIDGE_COMMAND_TIMEOUT_SECS") {
            self.command_timeout = parse_timeout(&value)
                .map_err(|e| invalid("PSBRIDGE_COMMAND_TIMEOUT_SECS", &value, &e))?;
        }
        if let Some(value) = lookup("PSBRIDGE_PWSH") {
            self.pwsh_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("PSBRIDGE_ALLOWED_ENV_KEYS") {
            self.allowed_env_keys = parse_env_keys(&value);
        }
        if let Some(value) = lookup("PSBRIDGE_WORKING_DIR") {
            self.working_directory = Some(PathBuf::from(value));
        }
        Ok(self)
    }

    /// Set the transport
    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Set the diagnostics debounce
    #[must_use]
    pub const fn with_diagnostics_delay(mut self, delay: Duration) -> Self {
        self.diagnostics_delay = delay;
        self
    }

    /// Set the output flush interval
    #[must_use]
    pub const fn with_output_flush_interval(mut self, interval: Duration) -> Self {
        self.output_flush_interval = interval;
        self
    }

    /// Set the completion and hover timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the debugger evaluation timeout
    #[must_use]
    pub const fn with_evaluate_timeout(mut self, timeout: Duration) -> Self {
        self.evaluate_timeout = timeout;
        self
    }

    /// Set the `pwsh` binary path
    #[must_use]
    pub fn with_pwsh_path(mut self, path: PathBuf) -> Self {
        self.pwsh_path = Some(path);
        self
    }

    /// Set the engine working directory
    #[must_use]
    pub fn with_working_directory(mut self, dir: PathBuf) -> Self {
        self.working_directory = Some(dir);
        self
    }
}

fn invalid(key: &str, value: &str, err: &ParseIntError) -> BridgeError {
    BridgeError::config(format!("Invalid value '{value}' for {key}: {err}"))
}

/// Default set of environment variable keys safe to pass through to the engine
#[must_use]
pub fn default_allowed_env_keys() -> Vec<String> {
    [
        "HOME",
        "PATH",
        "TERM",
        "USER",
        "LANG",
        "PSModulePath",
        "USERPROFILE",
        "SystemRoot",
        "TEMP",
        "TMP",
    ]
    .iter()
    .map(|k| (*k).to_owned())
    .collect()
}

/// Parse a comma-separated list of environment variable keys
#[must_use]
pub fn parse_env_keys(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Parse a timeout value from a string (in seconds)
pub fn parse_timeout(input: &str) -> Result<Duration, ParseIntError> {
    input.trim().parse::<u64>().map(Duration::from_secs)
}

/// Parse a duration value from a string (in milliseconds)
pub fn parse_millis(input: &str) -> Result<Duration, ParseIntError> {
    input.trim().parse::<u64>().map(Duration::from_millis)
}

// ============================================================================
// Config File
// ============================================================================

/// On-disk configuration; every field is optional
#[cfg(feature = "config-file")]
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    /// Diagnostics debounce in milliseconds
    pub diagnostics_delay_ms: Option<u64>,
    /// Output flush interval in milliseconds
    pub output_flush_ms: Option<u64>,
    /// Completion and hover timeout in seconds
    pub request_timeout_secs: Option<u64>,
    /// Debugger evaluation timeout in seconds
    pub evaluate_timeout_secs: Option<u64>,
    /// Engine subprocess timeout in seconds
    pub command_timeout_secs: Option<u64>,
    /// Path to `pwsh`
    pub pwsh: Option<PathBuf>,
    /// Environment keys passed to the engine
    pub allowed_env_keys: Option<Vec<String>>,
    /// Engine working directory
    pub working_directory: Option<PathBuf>,
}

#[cfg(feature = "config-file")]
impl BridgeConfig {
    /// Default config file path: `<config dir>/psbridge/config.toml`
    pub fn default_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("psbridge").join("config.toml"))
    }

    /// Load a config file over the defaults; a missing default file is not an error
    pub fn load_file(self, path: Option<&std::path::Path>) -> Result<Self, BridgeError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_file_path() {
                Some(p) => (p, false),
                None => return Ok(self),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(BridgeError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(self);
        }

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            BridgeError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let file: ConfigFile = toml::from_str(&contents).map_err(|e| {
            BridgeError::config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(self.merge_file(file))
    }

    /// Overlay values present in a parsed config file
    #[must_use]
    pub fn merge_file(mut self, file: ConfigFile) -> Self {
        if let Some(ms) = file.diagnostics_delay_ms {
            self.diagnostics_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.output_flush_ms {
            self.output_flush_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.evaluate_timeout_secs {
            self.evaluate_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.command_timeout_secs {
            self.command_timeout = Duration::from_secs(secs);
        }
        if file.pwsh.is_some() {
            self.pwsh_path = file.pwsh;
        }
        if let Some(keys) = file.allowed_env_keys {
            self.allowed_env_keys = keys;
        }
        if file.working_directory.is_some() {
            self.working_directory = file.working_directory;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.diagnostics_delay, Duration::from_millis(750));
        assert_eq!(config.transport, TransportKind::Stdio);
        assert!(config.allowed_env_keys.contains(&"PATH".to_owned()));
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = BridgeConfig::default()
            .apply_env(lookup(&[
                ("PSBRIDGE_DIAGNOSTICS_DELAY_MS", "100"),
                ("PSBRIDGE_PWSH", "/opt/pwsh"),
                ("PSBRIDGE_ALLOWED_ENV_KEYS", "HOME, PATH ,"),
            ]))
            .expect("valid env");
        assert_eq!(config.diagnostics_delay, Duration::from_millis(100));
        assert_eq!(config.pwsh_path, Some(PathBuf::from("/opt/pwsh")));
        assert_eq!(config.allowed_env_keys, vec!["HOME", "PATH"]);
    }

    #[test]
    fn invalid_env_value_is_a_config_error() {
        let err = BridgeConfig::default()
            .apply_env(lookup(&[("PSBRIDGE_REQUEST_TIMEOUT_SECS", "soon")]))
            .expect_err("invalid");
        assert_eq!(err.kind, crate::types::ErrorKind::Config);
        assert!(err.message.contains("PSBRIDGE_REQUEST_TIMEOUT_SECS"));
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_timeout(" 3 ").expect("secs"), Duration::from_secs(3));
        assert_eq!(parse_millis("20").expect("ms"), Duration::from_millis(20));
        assert!(parse_env_keys(" , ").is_empty());
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn config_file_values_overlay_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
diagnostics_delay_ms = 250
pwsh = "/usr/local/bin/pwsh"
"#,
        )
        .expect("parse");
        let config = BridgeConfig::default().merge_file(file);
        assert_eq!(config.diagnostics_delay, Duration::from_millis(250));
        assert_eq!(config.pwsh_path, Some(PathBuf::from("/usr/local/bin/pwsh")));
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn explicit_missing_config_file_is_an_error() {
        let err = BridgeConfig::default()
            .load_file(Some(std::path::Path::new("/nonexistent/psbridge.toml")))
            .expect_err("missing");
        assert!(err.message.contains("not found"));
    }
}
