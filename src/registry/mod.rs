//! Registry client (C7): manifest pull/push, blob existence/pull/push with
//! chunked-upload fallback, and cross-repository blob mount. Grounded on the
//! teacher's `registry/transport.rs` (URL shapes, status-to-error mapping)
//! and `registry/auth.rs` (the unauthenticated-probe-then-authenticate
//! dance), rebuilt on top of [`crate::http::HttpClient`]'s failover ladder
//! and [`crate::auth::Authenticator`]'s token cache.

use crate::auth::{self, Authenticator};
use crate::cache::BlobCache;
use crate::digest::{BlobDescriptor, Digest};
use crate::error::{BuildError, Result};
use crate::http::{build_ladder, HttpClient, PreparedRequest, Rung};
use crate::manifest::{self, ImageManifest, ManifestVariant};
use crate::model::{Authorization, Credential, CredentialRetriever};
use reqwest::{Method, StatusCode};

/// Registries reject monolithic PUTs above this size with 413; the chunked
/// fallback then uploads in fixed windows of this size.
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

pub struct RegistryClient {
    host: String,
    repository: String,
    ladder: Vec<Rung>,
    http: HttpClient,
    authenticator: Authenticator,
    credential: Option<Credential>,
}

pub struct PulledManifest {
    pub manifest: ImageManifest,
    pub raw: Vec<u8>,
    pub digest: Digest,
}

impl RegistryClient {
    pub async fn new(
        host: &str,
        repository: &str,
        allow_insecure_registries: bool,
        send_credentials_over_http: bool,
        credential_retrievers: &[Box<dyn CredentialRetriever>],
    ) -> Result<Self> {
        let host = auth::canonical_registry_host(host).to_string();
        let ladder = build_ladder(&host, allow_insecure_registries);
        let http = HttpClient::new(None, send_credentials_over_http)?;
        let auth_client = reqwest::Client::builder()
            .build()
            .map_err(|e| BuildError::Configuration(format!("failed to build auth client: {}", e)))?;
        let credential = auth::resolve_credential(credential_retrievers).await?;
        Ok(Self {
            host,
            repository: repository.to_string(),
            ladder,
            http,
            authenticator: Authenticator::new(auth_client),
            credential,
        })
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!("/v2/{}/manifests/{}", self.repository, reference)
    }

    fn blob_url(&self, digest: &Digest) -> String {
        format!("/v2/{}/blobs/{}", self.repository, digest)
    }

    fn upload_init_url(&self) -> String {
        format!("/v2/{}/blobs/uploads/", self.repository)
    }

    /// Sends one request across the failover ladder, retrying exactly once
    /// with a fresh Authorization header when the first attempt comes back
    /// 401 with a challenge — the unauthenticated-probe-then-authenticate
    /// pattern the teacher's `Auth::login` uses, generalized to any verb.
    /// Returns the response alongside whether `Authorization` was stripped
    /// off the request that produced it (§4.5) — callers thread this into
    /// [`Self::map_status`] so a 401/403 on a stripped request is reported as
    /// "no credentials sent" rather than "credentials rejected".
    async fn authorized_call(
        &self,
        method: Method,
        path: &str,
        extra_headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    ) -> Result<(reqwest::Response, bool)> {
        let build = |rung: &Rung| PreparedRequest {
            method: method.clone(),
            url: format!("{}{}", rung.base_url(), path),
            headers: extra_headers.clone(),
            body: body.clone(),
        };
        let (response, stripped) = self.http.send_with_failover(&self.ladder, build).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok((response, stripped));
        }

        let challenge_header = response
            .headers()
            .get("www-authenticate")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| BuildError::RegistryUnauthorized {
                server: self.host.clone(),
                image: Some(self.repository.clone()),
                reason: if stripped { crate::error::UnauthorizedReason::CredentialsNotSent } else { crate::error::UnauthorizedReason::CredentialsRejected },
            })?;
        let challenge = auth::parse_challenge(&challenge_header)?;
        let authorization = self.authenticator.authorize(&self.host, &challenge, self.credential.as_ref()).await?;

        let mut headers = extra_headers;
        headers.push(("Authorization".to_string(), authorization.header_value()));
        let build = |rung: &Rung| PreparedRequest {
            method: method.clone(),
            url: format!("{}{}", rung.base_url(), path),
            headers: headers.clone(),
            body: body.clone(),
        };
        self.http.send_with_failover(&self.ladder, build).await
    }

    /// Pulls the manifest for `reference`, following the OCI index/Docker
    /// manifest-list layer exactly once if one is returned in place of a
    /// single-platform manifest.
    pub async fn pull_manifest(&self, reference: &str, platform: &crate::model::Platform) -> Result<PulledManifest> {
        // An index resolves to a single platform-specific digest at most
        // once; looping rather than recursing keeps the future's size finite.
        let mut reference = reference.to_string();
        loop {
            let headers = vec![("Accept".to_string(), manifest::manifest_accept_header())];
            let (response, stripped) = self.authorized_call(Method::GET, &self.manifest_url(&reference), headers, None).await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.bytes().await.unwrap_or_default();
                return Err(self.map_status(status, &body, "pull manifest", stripped).await);
            }

            let content_type = response.headers().get("content-type").and_then(|h| h.to_str().ok()).map(|s| s.to_string());
            let body = response.bytes().await?.to_vec();

            match manifest::sniff_manifest(&body, content_type.as_deref())? {
                ManifestVariant::Single(manifest) => {
                    let digest = Digest::from_hex(&hex::encode(sha256(&body)))?;
                    return Ok(PulledManifest { manifest, raw: body, digest });
                }
                ManifestVariant::Index(index) => {
                    let chosen = index
                        .select(platform)
                        .ok_or_else(|| BuildError::ManifestFormat("manifest index has no entries".to_string()))?;
                    reference = chosen.digest.as_str().to_string();
                }
            }
        }
    }

    pub async fn push_manifest(&self, reference: &str, body: &[u8], media_type: &str) -> Result<()> {
        let headers = vec![("Content-Type".to_string(), media_type.to_string())];
        let (response, stripped) = self.authorized_call(Method::PUT, &self.manifest_url(reference), headers, Some(body.to_vec())).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let error_body = response.bytes().await.unwrap_or_default();
            Err(self.map_status(status, &error_body, "push manifest", stripped).await)
        }
    }

    /// §4.7: a `BLOB_UNKNOWN` 404 on a HEAD is "not found", not an error —
    /// returns `Ok(false)`. Any other non-success status (a 5xx, a 401 the
    /// retry-once in [`Self::authorized_call`] couldn't clear, ...) is a
    /// real failure and propagates so the pipeline's transient-error retry
    /// can see it, rather than being silently folded into "doesn't exist".
    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        let (response, stripped) = self.authorized_call(Method::HEAD, &self.blob_url(digest), vec![], None).await?;
        if response.status().is_success() {
            Ok(true)
        } else if response.status() == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            Err(self.map_status(status, &body, "check blob existence", stripped).await)
        }
    }

    /// Pulls a blob directly into the content-addressed cache, streaming the
    /// response body without buffering the whole thing first.
    pub async fn pull_blob_to_cache(&self, digest: &Digest, cache: &BlobCache) -> Result<BlobDescriptor> {
        let (response, stripped) = self.authorized_call(Method::GET, &self.blob_url(digest), vec![], None).await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            return Err(self.map_status(status, &body, "pull blob", stripped).await);
        }
        let bytes = response.bytes().await?;
        let descriptor = cache.put(&bytes).await?;
        if &descriptor.digest != digest {
            return Err(BuildError::DigestMismatch { expected: digest.to_string(), computed: descriptor.digest.to_string() });
        }
        Ok(descriptor)
    }

    /// Attempts a cross-repository mount before falling back to a full
    /// upload (§4.7). Returns `true` if the mount succeeded.
    pub async fn mount_blob(&self, digest: &Digest, source_repository: &str) -> Result<bool> {
        let path = format!("/v2/{}/blobs/uploads/?mount={}&from={}", self.repository, digest, source_repository);
        let (response, stripped) = self.authorized_call(Method::POST, &path, vec![], None).await?;
        match response.status().as_u16() {
            201 => Ok(true),
            202 => Ok(false),
            other => {
                let status = StatusCode::from_u16(other).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let body = response.bytes().await.unwrap_or_default();
                Err(self.map_status(status, &body, "mount blob", stripped).await)
            }
        }
    }

    /// Pushes a blob's bytes, skipping entirely if the registry already has
    /// it. Monolithic PUT is tried first; a 413 triggers the chunked-PATCH
    /// fallback at [`CHUNK_SIZE`]-byte windows (§4.7).
    pub async fn push_blob(&self, descriptor: &BlobDescriptor, data: &[u8]) -> Result<()> {
        if self.blob_exists(&descriptor.digest).await? {
            return Ok(());
        }

        let (init, init_stripped) = self.authorized_call(Method::POST, &self.upload_init_url(), vec![], None).await?;
        if !init.status().is_success() {
            let status = init.status();
            let body = init.bytes().await.unwrap_or_default();
            return Err(self.map_status(status, &body, "initiate blob upload", init_stripped).await);
        }
        let location = init
            .headers()
            .get("location")
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| BuildError::Registry {
                action: "initiate blob upload".to_string(),
                image: Some(self.repository.clone()),
                entries: vec![],
                transient: false,
            })?
            .to_string();

        let monolithic_path = format!("{}{}digest={}", location, if location.contains('?') { "&" } else { "?" }, descriptor.digest);
        let headers = vec![("Content-Type".to_string(), "application/octet-stream".to_string())];
        let (response, stripped) = self.authorized_call(Method::PUT, &monolithic_path, headers, Some(data.to_vec())).await?;

        if response.status().is_success() {
            return verify_content_digest(&response, &descriptor.digest);
        }
        if response.status() != StatusCode::PAYLOAD_TOO_LARGE {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            return Err(self.map_status(status, &body, "upload blob", stripped).await);
        }

        self.push_blob_chunked(location, descriptor, data).await
    }

    async fn push_blob_chunked(&self, mut location: String, descriptor: &BlobDescriptor, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(CHUNK_SIZE) {
            let start = chunk.as_ptr() as usize - data.as_ptr() as usize;
            let end = start + chunk.len() - 1;
            let headers = vec![
                ("Content-Type".to_string(), "application/octet-stream".to_string()),
                ("Content-Range".to_string(), format!("{}-{}", start, end)),
            ];
            let (response, stripped) = self.authorized_call(Method::PATCH, &location, headers, Some(chunk.to_vec())).await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.bytes().await.unwrap_or_default();
                return Err(self.map_status(status, &body, "upload blob chunk", stripped).await);
            }
            location = response
                .headers()
                .get("location")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string())
                .unwrap_or(location);
        }

        let finalize_path = format!("{}{}digest={}", location, if location.contains('?') { "&" } else { "?" }, descriptor.digest);
        let (response, stripped) = self.authorized_call(Method::PUT, &finalize_path, vec![], None).await?;
        if response.status().is_success() {
            verify_content_digest(&response, &descriptor.digest)
        } else {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            Err(self.map_status(status, &body, "finalize chunked blob upload", stripped).await)
        }
    }

    async fn map_status(&self, status: StatusCode, body: &[u8], action: &str, credentials_stripped: bool) -> BuildError {
        HttpClient::status_to_error(action, Some(self.repository.clone()), status, body, credentials_stripped).await
    }
}

/// §4.7 point 3: verify the registry's own `Docker-Content-Digest` response
/// header agrees with what was pushed. A registry omitting the header
/// entirely is treated as success — the header is a confirmation, not every
/// registry implementation sends it, and its absence is not itself evidence
/// of corruption.
fn verify_content_digest(response: &reqwest::Response, expected: &Digest) -> Result<()> {
    match response.headers().get("docker-content-digest").and_then(|h| h.to_str().ok()) {
        Some(value) => {
            let reported = Digest::parse(value.to_string())?;
            if &reported == expected {
                Ok(())
            } else {
                Err(BuildError::DigestMismatch { expected: expected.to_string(), computed: reported.to_string() })
            }
        }
        None => Ok(()),
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    use sha2::{Digest as _, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ranges_are_contiguous() {
        let data = vec![0u8; CHUNK_SIZE * 2 + 10];
        let mut prev_end: Option<usize> = None;
        for chunk in data.chunks(CHUNK_SIZE) {
            let start = unsafe { chunk.as_ptr().offset_from(data.as_ptr()) as usize };
            let end = start + chunk.len() - 1;
            if let Some(p) = prev_end {
                assert_eq!(start, p + 1);
            }
            prev_end = Some(end);
        }
        assert_eq!(prev_end, Some(data.len() - 1));
    }
}
