//! Authentication (C6): WWW-Authenticate parsing, bearer-token exchange,
//! the credential retriever chain, a token cache keyed by (registry, scope),
//! registry alias groups, and registry mirrors for base-image pulls.
//! Grounded on the teacher's `registry/auth.rs` (challenge parsing,
//! `basic_auth` token exchange) and `registry/token_manager.rs` (caching
//! tokens instead of re-authenticating per request).

use crate::error::{BuildError, Result, UnauthorizedReason};
use crate::model::{Authorization, Credential, CredentialRetriever};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A parsed `WWW-Authenticate` challenge (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer { realm: String, service: String, scope: Option<String> },
    Basic { realm: Option<String> },
}

/// Parses a `WWW-Authenticate` header value. Accepts `Bearer` and `Basic`
/// schemes; anything else is reported as a configuration error since the
/// core has no fallback authentication mechanism.
pub fn parse_challenge(header: &str) -> Result<Challenge> {
    if let Some(params) = header.strip_prefix("Bearer ") {
        let fields = parse_auth_params(params);
        let realm = fields.get("realm").cloned().ok_or_else(|| {
            BuildError::Configuration("Bearer challenge missing realm".to_string())
        })?;
        let service = fields.get("service").cloned().unwrap_or_default();
        let scope = fields.get("scope").cloned();
        return Ok(Challenge::Bearer { realm, service, scope });
    }
    if header.starts_with("Basic") {
        let fields = parse_auth_params(header.strip_prefix("Basic").unwrap_or("").trim_start());
        return Ok(Challenge::Basic { realm: fields.get("realm").cloned() });
    }
    Err(BuildError::Configuration(format!("unsupported WWW-Authenticate scheme: {}", header)))
}

fn parse_auth_params(params: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for param in params.split(',') {
        let param = param.trim();
        if let Some((key, value)) = param.split_once('=') {
            fields.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
        }
    }
    fields
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Caches bearer tokens per `(registry host, scope)` so a multi-blob push
/// doesn't re-authenticate for every request; entries are treated as expired
/// a few seconds early to avoid racing the server's own clock.
pub struct TokenCache {
    entries: Mutex<HashMap<(String, String), CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    fn get(&self, registry: &str, scope: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries.get(&(registry.to_string(), scope.to_string())).and_then(|cached| {
            if cached.expires_at > Instant::now() {
                Some(cached.token.clone())
            } else {
                None
            }
        })
    }

    fn put(&self, registry: &str, scope: &str, token: String, lifetime: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            (registry.to_string(), scope.to_string()),
            CachedToken { token, expires_at: Instant::now() + lifetime.saturating_sub(Duration::from_secs(5)) },
        );
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Known alias groups for the same logical registry (§4.6): pulling from
/// any of these hostnames is treated as pulling from Docker Hub.
pub const DOCKER_HUB_ALIASES: &[&str] =
    &["docker.io", "registry-1.docker.io", "index.docker.io", "registry.hub.docker.com"];

pub fn canonical_registry_host(host: &str) -> &str {
    if DOCKER_HUB_ALIASES.contains(&host) {
        "registry-1.docker.io"
    } else {
        host
    }
}

/// Resolves a credential for `registry` by trying each retriever in order
/// (§4.6); the first to return `Some` wins. `None` means "proceed
/// anonymously" — it is the caller's job to turn a later 401 into
/// [`UnauthorizedReason::CredentialsNotSent`].
pub async fn resolve_credential(retrievers: &[Box<dyn CredentialRetriever>]) -> Result<Option<Credential>> {
    for retriever in retrievers {
        if let Some(credential) = retriever.retrieve().await? {
            return Ok(Some(credential));
        }
    }
    Ok(None)
}

pub struct Authenticator {
    client: reqwest::Client,
    cache: TokenCache,
}

impl Authenticator {
    /// Owns a plain `reqwest::Client` for token-endpoint calls, independent
    /// of the registry's own failover ladder — the auth realm is a distinct
    /// host that's out of scope for the ladder's insecure-registry rules.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, cache: TokenCache::new() }
    }

    /// Exchanges a parsed Bearer challenge for a token, honoring the cache.
    /// On a rejected credential the caller should surface
    /// `RegistryUnauthorized { reason: CredentialsRejected }`; this function
    /// itself only distinguishes "no credential offered" via its `Option`
    /// argument.
    pub async fn authorize(
        &self,
        registry_host: &str,
        challenge: &Challenge,
        credential: Option<&Credential>,
    ) -> Result<Authorization> {
        match challenge {
            Challenge::Basic { .. } => match credential {
                Some(Credential::UserPassword { username, password }) => Ok(Authorization::basic(username, password)),
                Some(Credential::IdentityToken(token)) => Ok(Authorization::Bearer(token.clone())),
                None => Err(BuildError::RegistryUnauthorized {
                    server: registry_host.to_string(),
                    image: None,
                    reason: UnauthorizedReason::CredentialsNotSent,
                }),
            },
            Challenge::Bearer { realm, service, scope } => {
                let scope_key = scope.clone().unwrap_or_default();
                if let Some(cached) = self.cache.get(registry_host, &scope_key) {
                    return Ok(Authorization::Bearer(cached));
                }

                let mut request = self.client.get(realm);
                if !service.is_empty() {
                    request = request.query(&[("service", service.as_str())]);
                }
                if let Some(scope) = scope {
                    request = request.query(&[("scope", scope.as_str())]);
                }
                request = match credential {
                    Some(Credential::UserPassword { username, password }) => request.basic_auth(username, Some(password)),
                    Some(Credential::IdentityToken(token)) => request.bearer_auth(token),
                    None => request,
                };

                let response = request.send().await?;
                if !response.status().is_success() {
                    let reason = if credential.is_none() {
                        UnauthorizedReason::CredentialsNotSent
                    } else {
                        UnauthorizedReason::CredentialsRejected
                    };
                    return Err(BuildError::RegistryUnauthorized { server: registry_host.to_string(), image: None, reason });
                }

                let parsed: TokenResponse = response.json().await?;
                let token = parsed
                    .token
                    .or(parsed.access_token)
                    .ok_or_else(|| BuildError::Configuration("token endpoint response had no token field".to_string()))?;

                let lifetime = parsed.expires_in.map(Duration::from_secs).unwrap_or(DEFAULT_TOKEN_LIFETIME);
                self.cache.put(registry_host, &scope_key, token.clone(), lifetime);
                Ok(Authorization::Bearer(token))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge_with_scope() {
        let challenge = parse_challenge(r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:foo:pull""#).unwrap();
        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.example.com/token".to_string(),
                service: "registry.example.com".to_string(),
                scope: Some("repository:foo:pull".to_string()),
            }
        );
    }

    #[test]
    fn parses_basic_challenge() {
        let challenge = parse_challenge(r#"Basic realm="registry""#).unwrap();
        assert_eq!(challenge, Challenge::Basic { realm: Some("registry".to_string()) });
    }

    #[test]
    fn rejects_unsupported_scheme() {
        assert!(parse_challenge("Digest realm=\"x\"").is_err());
    }

    #[test]
    fn docker_hub_aliases_canonicalize() {
        for alias in DOCKER_HUB_ALIASES {
            assert_eq!(canonical_registry_host(alias), "registry-1.docker.io");
        }
        assert_eq!(canonical_registry_host("ghcr.io"), "ghcr.io");
    }

    struct CountingRetriever {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        result: Option<Credential>,
    }

    #[async_trait::async_trait]
    impl CredentialRetriever for CountingRetriever {
        async fn retrieve(&self) -> Result<Option<Credential>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    #[tokio::test]
    async fn retriever_chain_stops_at_first_hit() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let retrievers: Vec<Box<dyn CredentialRetriever>> = vec![
            Box::new(CountingRetriever { calls: calls.clone(), result: None }),
            Box::new(CountingRetriever {
                calls: calls.clone(),
                result: Some(Credential::UserPassword { username: "u".to_string(), password: "p".to_string() }),
            }),
        ];
        let result = resolve_credential(&retrievers).await.unwrap();
        assert!(matches!(result, Some(Credential::UserPassword { .. })));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn token_cache_expires() {
        let cache = TokenCache::new();
        cache.put("reg", "scope", "tok".to_string(), Duration::from_secs(0));
        assert_eq!(cache.get("reg", "scope"), None);
    }
}
