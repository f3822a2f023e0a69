use crate::constants::{
    DOCKER_CONTENT_DIGEST_HEADER, HTTP_TIMEOUT_SECS, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_DOCKER_MANIFEST_V1, MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED,
    MEDIA_TYPE_DOCKER_MANIFEST_V2,
};
use crate::error::{Result, ScanError};
use crate::oci::utils::sha256_digest;
use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::MediaType;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Which flavour of manifest a request negotiates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestRequestKind {
    /// Schema v2, manifest list, OCI manifest and OCI index
    SchemaV2,
    /// Legacy signed schema v1
    SchemaV1,
    /// Cosign signature artifacts, stored as OCI manifests
    CosignSignature,
}

impl ManifestRequestKind {
    pub fn accept_types(&self) -> Vec<String> {
        match self {
            Self::SchemaV2 => vec![
                MEDIA_TYPE_DOCKER_MANIFEST_V2.to_string(),
                MEDIA_TYPE_DOCKER_MANIFEST_LIST.to_string(),
                MediaType::ImageManifest.to_string(),
                MediaType::ImageIndex.to_string(),
            ],
            Self::SchemaV1 => vec![
                MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED.to_string(),
                MEDIA_TYPE_DOCKER_MANIFEST_V1.to_string(),
            ],
            Self::CosignSignature => vec![MediaType::ImageManifest.to_string()],
        }
    }
}

/// A manifest body together with the digest the registry reported for it.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub digest: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// The registry HTTP surface the resolver and layer fetcher depend on.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Registry base URL, e.g. `https://quay.io`
    fn endpoint(&self) -> &str;

    async fn manifest(
        &self,
        name: &str,
        reference: &str,
        kind: ManifestRequestKind,
    ) -> Result<ManifestResponse>;

    async fn blob(&self, name: &str, digest: &str) -> Result<Bytes>;

    /// Health check against `/v2/`; returns the HTTP status code
    async fn ping(&self) -> Result<u16>;
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut challenge = BearerChallenge::default();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let after_key = after_key.trim_start();
        let (value, remaining) = if let Some(quoted) = after_key.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            match after_key.find(',') {
                Some(end) => (&after_key[..end], &after_key[end..]),
                None => (after_key, ""),
            }
        };

        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = value.to_string(),
            "service" => challenge.service = Some(value.to_string()),
            "scope" => challenge.scope = Some(value.to_string()),
            _ => {}
        }
        rest = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    if challenge.realm.is_empty() {
        None
    } else {
        Some(challenge)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry client speaking the distribution HTTP API.
pub struct RegistryClient {
    client: Client,
    endpoint: String,
    base_url: String, // e.g., https://index.docker.io/v2
    username: Option<String>,
    password: Option<String>,
    token: Mutex<Option<String>>,
}

impl RegistryClient {
    pub fn new(registry: &str) -> Result<Self> {
        let endpoint = normalize_endpoint(registry);
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| ScanError::transport(&endpoint, e))?;

        Ok(Self {
            client,
            base_url: format!("{}/v2", endpoint),
            endpoint,
            username: None,
            password: None,
            token: Mutex::new(None),
        })
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        if !username.is_empty() {
            self.username = Some(username.to_string());
            self.password = Some(password.to_string());
        }
        self
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        if let Some(ref t) = *self.token.lock() {
            return rb.bearer_auth(t);
        }
        match self.username {
            Some(ref u) => rb.basic_auth(u, self.password.as_ref()),
            None => rb,
        }
    }

    /// Sends a GET, answering one auth challenge if the registry issues it.
    async fn get(&self, url: &str, accept: &[String]) -> Result<Response> {
        let build = || {
            let mut rb = self.client.get(url);
            if !accept.is_empty() {
                rb = rb.header(ACCEPT, accept.join(", "));
            }
            self.authorize(rb)
        };

        let resp = build()
            .send()
            .await
            .map_err(|e| ScanError::transport(&self.endpoint, e))?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);

        match challenge {
            Some(challenge) => {
                let token = self.fetch_token(&challenge).await?;
                self.set_token(&token);
                build()
                    .send()
                    .await
                    .map_err(|e| ScanError::transport(&self.endpoint, e))
            }
            None => Ok(resp),
        }
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String> {
        tracing::debug!(realm = %challenge.realm, scope = ?challenge.scope, "Requesting registry token");

        let mut query = Vec::new();
        if let Some(ref service) = challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(ref scope) = challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let mut rb = self.client.get(&challenge.realm).query(&query);
        if let Some(ref u) = self.username {
            rb = rb.basic_auth(u, self.password.as_ref());
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| ScanError::transport(&challenge.realm, e))?;
        if !resp.status().is_success() {
            return Err(ScanError::protocol(
                &challenge.realm,
                format!("token request failed: {}", resp.status()),
            ));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ScanError::protocol(&challenge.realm, e))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| ScanError::protocol(&challenge.realm, "token response without token"))
    }
}

#[async_trait]
impl RegistryTransport for RegistryClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn manifest(
        &self,
        name: &str,
        reference: &str,
        kind: ManifestRequestKind,
    ) -> Result<ManifestResponse> {
        let url = format!("{}/{}/manifests/{}", self.base_url, name, reference);
        let resp = self.get(&url, &kind.accept_types()).await?;

        if !resp.status().is_success() {
            return Err(ScanError::protocol(
                format!("{}:{}", name, reference),
                format!("manifest request failed: {}", resp.status()),
            ));
        }

        let header_digest = resp
            .headers()
            .get(DOCKER_CONTENT_DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|e| ScanError::transport(&self.endpoint, e))?;

        let digest = header_digest.unwrap_or_else(|| sha256_digest(&body));
        crate::log_manifest_fetch!(name, reference, kind, digest);

        Ok(ManifestResponse {
            digest,
            content_type,
            body,
        })
    }

    async fn blob(&self, name: &str, digest: &str) -> Result<Bytes> {
        let url = format!("{}/{}/blobs/{}", self.base_url, name, digest);
        let resp = self.get(&url, &[]).await?;

        if !resp.status().is_success() {
            return Err(ScanError::protocol(
                format!("{}@{}", name, digest),
                format!("blob request failed: {}", resp.status()),
            ));
        }

        resp.bytes()
            .await
            .map_err(|e| ScanError::transport(&self.endpoint, e))
    }

    async fn ping(&self) -> Result<u16> {
        let url = format!("{}/", self.base_url);
        let resp = self.get(&url, &[]).await?;
        Ok(resp.status().as_u16())
    }
}

/// Pings `/v2/` before any manifest work. Any answer below 500 counts as
/// reachable, since unauthenticated pings commonly get 401.
pub async fn check_reachable(transport: &dyn RegistryTransport) -> Result<u16> {
    let status = transport.ping().await?;
    if status >= 500 {
        return Err(ScanError::protocol(
            transport.endpoint(),
            format!("registry ping answered {}", status),
        ));
    }
    tracing::debug!(registry = %transport.endpoint(), status, "Registry reachable");
    Ok(status)
}

/// Adds a scheme when missing and drops trailing slashes.
pub fn normalize_endpoint(registry: &str) -> String {
    let registry = registry.trim().trim_end_matches('/');
    if registry.contains("://") {
        registry.to_string()
    } else {
        format!("https://{}", registry)
    }
}
