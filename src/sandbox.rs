// ABOUTME: Environment sandboxing for engine and analyzer subprocesses
// ABOUTME: Clears the environment, whitelists keys, and pins the working directory
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::env;
use std::io;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::config::default_allowed_env_keys;

/// Policy controlling the subprocess execution environment
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    /// Environment variable keys to pass through from the host
    pub allowed_env_keys: Vec<String>,
    /// Working directory for the subprocess
    pub working_directory: PathBuf,
    /// Extra variables set on every subprocess
    pub extra_env: Vec<(String, String)>,
}

impl SandboxPolicy {
    /// Create a policy with the default key list
    #[must_use]
    pub fn new(working_directory: PathBuf) -> Self {
        Self {
            allowed_env_keys: default_allowed_env_keys(),
            working_directory,
            extra_env: Vec::new(),
        }
    }

    /// Replace the allowed environment keys
    #[must_use]
    pub fn with_env_keys(mut self, keys: Vec<String>) -> Self {
        self.allowed_env_keys = keys;
        self
    }

    /// Set a variable on every subprocess regardless of the host environment
    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.extra_env.push((key.to_owned(), value.to_owned()));
        self
    }
}

/// Apply the policy to a command before it is spawned
///
/// Host variables outside the allow list never reach the child; `extra_env`
/// entries win over host values with the same key.
pub fn apply_sandbox(cmd: &mut Command, policy: &SandboxPolicy) {
    let (present, absent): (Vec<_>, Vec<_>) = policy
        .allowed_env_keys
        .iter()
        .map(|key| (key.as_str(), env::var(key).ok()))
        .partition(|(_, value)| value.is_some());

    cmd.env_clear()
        .envs(present.iter().filter_map(|(key, value)| Some((*key, value.as_deref()?))))
        .envs(policy.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&policy.working_directory);

    let missing: Vec<&str> = absent.into_iter().map(|(key, _)| key).collect();
    debug!(
        cwd = %policy.working_directory.display(),
        passed = present.len(),
        extra = policy.extra_env.len(),
        ?missing,
        "Sandboxed subprocess environment"
    );
}

/// Build a policy, falling back to the current directory when `working_dir`
/// is absent or does not exist
pub fn build_policy(
    working_dir: Option<&Path>,
    allowed_env_keys: &[String],
) -> io::Result<SandboxPolicy> {
    let dir = match working_dir {
        Some(p) if p.is_dir() => p.to_path_buf(),
        _ => env::current_dir()?,
    };
    Ok(SandboxPolicy::new(dir).with_env_keys(allowed_env_keys.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_standard_keys() {
        let policy = SandboxPolicy::new(PathBuf::from("/tmp"));
        assert!(policy.allowed_env_keys.iter().any(|k| k == "PATH"));
        assert!(policy.extra_env.is_empty());
    }

    #[test]
    fn missing_working_directory_falls_back_to_cwd() {
        let policy = build_policy(Some(Path::new("/nonexistent/psbridge/xyz")), &[])
            .expect("policy");
        assert_eq!(
            policy.working_directory,
            env::current_dir().expect("cwd")
        );
    }

    #[test]
    fn existing_working_directory_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = vec!["HOME".to_owned()];
        let policy = build_policy(Some(dir.path()), &keys).expect("policy");
        assert_eq!(policy.working_directory, dir.path());
        assert_eq!(policy.allowed_env_keys, keys);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn only_allowed_keys_reach_the_child() {
        let policy = SandboxPolicy::new(env::temp_dir())
            .with_env_keys(vec!["PATH".to_owned()])
            .with_env("PSBRIDGE_MARKER", "on");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "env"]);
        apply_sandbox(&mut cmd, &policy);

        let output = crate::process::run_command(&mut cmd, None, std::time::Duration::from_secs(5), 0)
            .await
            .expect("ran");
        let text = output.stdout_text();
        assert!(text.contains("PSBRIDGE_MARKER=on"));
        assert!(!text.contains("HOME="));
    }
}
