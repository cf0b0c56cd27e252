//! Process-wide settings read once from the environment (§5 ambient
//! config). Grounded on the teacher's `config.rs`, which reads a handful of
//! `DOCKER_PUSHER_*` variables at startup into an immutable struct rather
//! than consulting `std::env` scattered through the codebase.

use std::time::Duration;

const ENV_HTTP_TIMEOUT_MS: &str = "CONTAINERIZE_HTTP_TIMEOUT_MS";
const ENV_SEND_CREDENTIALS_OVER_HTTP: &str = "CONTAINERIZE_SEND_CREDENTIALS_OVER_HTTP";
const ENV_SERIALIZE: &str = "CONTAINERIZE_SERIALIZE";
const ENV_CROSS_REPOSITORY_BLOB_MOUNTS: &str = "CONTAINERIZE_CROSS_REPOSITORY_BLOB_MOUNTS";
const ENV_DISABLE_USER_AGENT: &str = "CONTAINERIZE_DISABLE_USER_AGENT";

/// Read once at process start; nothing here changes for the lifetime of a
/// build, so it's captured by value rather than re-read from `std::env` at
/// every call site.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_timeout: Duration,
    pub send_credentials_over_http: bool,
    /// Forces the worker pool down to one task at a time; useful for
    /// reproducing registry-side ordering bugs.
    pub serialize: bool,
    pub cross_repository_blob_mounts: bool,
    pub disable_user_agent: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            http_timeout: Duration::from_millis(read_u64(ENV_HTTP_TIMEOUT_MS, 20_000)),
            send_credentials_over_http: read_bool(ENV_SEND_CREDENTIALS_OVER_HTTP, false),
            serialize: read_bool(ENV_SERIALIZE, false),
            cross_repository_blob_mounts: read_bool(ENV_CROSS_REPOSITORY_BLOB_MOUNTS, true),
            disable_user_agent: read_bool(ENV_DISABLE_USER_AGENT, false),
        }
    }

    /// `containerize/<version> (<os>; <arch>)`, or an empty string when
    /// disabled — some registries rate-limit differently based on
    /// recognizing a client's User-Agent, so a deployment may want to
    /// suppress it.
    pub fn user_agent(&self) -> String {
        if self.disable_user_agent {
            return String::new();
        }
        format!("containerize/{} ({}; {})", env!("CARGO_PKG_VERSION"), std::env::consts::OS, std::env::consts::ARCH)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

fn read_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn read_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_is_empty_when_disabled() {
        let settings = Settings { disable_user_agent: true, ..Settings::from_env() };
        assert_eq!(settings.user_agent(), "");
    }

    #[test]
    fn user_agent_carries_crate_version_when_enabled() {
        let settings = Settings { disable_user_agent: false, ..Settings::from_env() };
        assert!(settings.user_agent().starts_with("containerize/"));
    }
}
