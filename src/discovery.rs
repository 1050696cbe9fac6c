// ABOUTME: Locates the PowerShell binary used by the default engine and analyzer
// ABOUTME: Probes an explicit path, the PSBRIDGE_PWSH override, then PATH in priority order
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::types::BridgeError;

/// Environment variable overriding binary discovery
pub const PWSH_ENV_OVERRIDE: &str = "PSBRIDGE_PWSH";

/// Binaries probed on `PATH`, cross-platform edition first
const DISCOVERY_ORDER: &[&str] = &["pwsh", "powershell"];

/// Find the PowerShell binary
///
/// Resolution order:
/// 1. `explicit`, when given (from `--pwsh` or the config file)
/// 2. The `PSBRIDGE_PWSH` environment variable
/// 3. `pwsh`, then `powershell`, on `PATH`
pub fn discover_pwsh(explicit: Option<&Path>) -> Result<PathBuf, BridgeError> {
    if let Some(path) = explicit {
        return resolve_binary("pwsh", Some(&path.to_string_lossy()));
    }
    if let Ok(value) = env::var(PWSH_ENV_OVERRIDE) {
        return resolve_binary("pwsh", Some(&value));
    }

    for name in DISCOVERY_ORDER {
        match resolve_binary(name, None) {
            Ok(path) => {
                debug!(binary = name, path = %path.display(), "Discovered PowerShell");
                return Ok(path);
            }
            Err(_) => debug!(binary = name, "Not on PATH, trying next"),
        }
    }

    Err(BridgeError::config(
        "No PowerShell found. Install pwsh or set PSBRIDGE_PWSH",
    ))
}

/// Resolve a binary by name, preferring an explicit override path
///
/// An override must exist; it is never silently replaced by a `PATH` lookup.
pub fn resolve_binary(name: &str, env_override: Option<&str>) -> Result<PathBuf, BridgeError> {
    if let Some(override_path) = env_override {
        let path = PathBuf::from(override_path);
        if path.exists() {
            debug!(binary = name, path = %path.display(), "Resolved via override");
            return Ok(path);
        }
        return Err(BridgeError::config(format!(
            "Override points to non-existent path: {override_path}"
        )));
    }

    which::which(name)
        .map_err(|e| BridgeError::not_found(format!("binary '{name}' on PATH ({e})")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_to_missing_path_is_an_error() {
        let err = resolve_binary("pwsh", Some("/nonexistent/bin/pwsh")).expect_err("missing");
        assert!(err.message.contains("non-existent"));
    }

    #[test]
    fn existing_override_wins() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let path = file.path().to_string_lossy().into_owned();
        let resolved = resolve_binary("pwsh", Some(&path)).expect("resolved");
        assert_eq!(resolved, file.path());
    }

    #[test]
    fn explicit_path_is_checked_first() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let resolved = discover_pwsh(Some(file.path())).expect("resolved");
        assert_eq!(resolved, file.path());
    }

    #[test]
    fn unknown_binary_is_not_found() {
        let err = resolve_binary("psbridge-definitely-not-installed", None).expect_err("absent");
        assert!(err.message.contains("Not found"));
    }
}
