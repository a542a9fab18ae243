//! OCI distribution registry client.
//!
//! Speaks just enough of the distribution API to publish an index: blob
//! existence checks, monolithic blob uploads and manifest uploads, with
//! bearer-token or basic authentication negotiated from the registry's
//! `WWW-Authenticate` challenge.

use async_trait::async_trait;
use kiln_core::manifest::{Blob, Registry};
use kiln_core::{Error, ImageDigest, ImageName, RegistryCredentials, Result};
use reqwest::header::{CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";

#[derive(Debug, Clone)]
enum Auth {
    Anonymous,
    Basic(RegistryCredentials),
    Bearer(String),
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Challenge {
    scheme: String,
    params: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Registry client over the OCI distribution HTTP API.
pub struct DistributionRegistry {
    client: reqwest::Client,
    credentials: RwLock<HashMap<String, RegistryCredentials>>,
    auth: RwLock<HashMap<String, Auth>>,
}

impl DistributionRegistry {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            credentials: RwLock::new(HashMap::new()),
            auth: RwLock::new(HashMap::new()),
        }
    }

    /// Seed credentials without contacting the registry.
    pub async fn with_credentials(self, registry: &str, credentials: RegistryCredentials) -> Self {
        self.credentials
            .write()
            .await
            .insert(registry.to_string(), credentials);
        self
    }

    fn base_url(registry: &str) -> String {
        let host = if registry == DOCKER_HUB {
            DOCKER_HUB_API
        } else {
            registry
        };
        let scheme = if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, host)
    }

    /// Authentication for `repository` on `registry`, negotiated on first use.
    async fn authorize(&self, registry: &str, repository: &str) -> Result<Auth> {
        let cache_key = format!("{}/{}", registry, repository);
        if let Some(auth) = self.auth.read().await.get(&cache_key) {
            return Ok(auth.clone());
        }

        let credentials = self.credentials.read().await.get(registry).cloned();
        let scope = format!("repository:{}:pull,push", repository);
        let auth = self.negotiate(registry, credentials, Some(&scope)).await?;

        self.auth.write().await.insert(cache_key, auth.clone());
        Ok(auth)
    }

    async fn negotiate(
        &self,
        registry: &str,
        credentials: Option<RegistryCredentials>,
        scope: Option<&str>,
    ) -> Result<Auth> {
        let url = format!("{}/v2/", Self::base_url(registry));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Publish(format!("{}: {}", registry, e)))?;

        if response.status().is_success() {
            return Ok(Auth::Anonymous);
        }
        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(Error::Publish(format!(
                "{} answered {} to the version check",
                registry,
                response.status()
            )));
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
            .ok_or_else(|| {
                Error::Publish(format!("{} sent no usable authentication challenge", registry))
            })?;

        match challenge.scheme.as_str() {
            "basic" => {
                let credentials = credentials.ok_or_else(|| {
                    Error::Publish(format!("{} requires credentials", registry))
                })?;
                Ok(Auth::Basic(credentials))
            }
            "bearer" => {
                let token = self
                    .fetch_token(registry, &challenge, credentials.as_ref(), scope)
                    .await?;
                Ok(Auth::Bearer(token))
            }
            other => Err(Error::Publish(format!(
                "{} uses unsupported auth scheme '{}'",
                registry, other
            ))),
        }
    }

    async fn fetch_token(
        &self,
        registry: &str,
        challenge: &Challenge,
        credentials: Option<&RegistryCredentials>,
        scope: Option<&str>,
    ) -> Result<String> {
        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| Error::Publish(format!("{} challenge has no realm", registry)))?;

        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = challenge.params.get("service") {
            query.push(("service", service));
        }
        if let Some(scope) = scope {
            query.push(("scope", scope));
        }

        let mut request = self.client.get(realm).query(&query);
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Publish(format!("token request to {} failed: {}", realm, e)))?;
        if !response.status().is_success() {
            return Err(Error::Publish(format!(
                "authentication against {} failed: {}",
                registry,
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Publish(format!("invalid token response: {}", e)))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Error::Publish(format!("{} returned an empty token", registry)))
    }

    async fn request(
        &self,
        image: &ImageName,
        build: impl Fn(&reqwest::Client) -> RequestBuilder,
    ) -> Result<reqwest::Response> {
        let auth = self.authorize(image.registry(), image.repository()).await?;
        let request = match &auth {
            Auth::Anonymous => build(&self.client),
            Auth::Basic(credentials) => {
                build(&self.client).basic_auth(&credentials.username, Some(&credentials.token))
            }
            Auth::Bearer(token) => build(&self.client).bearer_auth(token),
        };
        request
            .send()
            .await
            .map_err(|e| Error::Publish(format!("{}: {}", image.registry(), e)))
    }

    async fn blob_exists(&self, image: &ImageName, digest: &ImageDigest) -> Result<bool> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            Self::base_url(image.registry()),
            image.repository(),
            digest
        );
        let response = self.request(image, |c| c.head(&url)).await?;
        Ok(response.status().is_success())
    }
}

impl Default for DistributionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for DistributionRegistry {
    fn name(&self) -> &'static str {
        "distribution"
    }

    async fn login(&self, registry: &str, credentials: &RegistryCredentials) -> Result<()> {
        // Negotiating without a scope checks the credentials themselves.
        self.negotiate(registry, Some(credentials.clone()), None)
            .await?;
        self.credentials
            .write()
            .await
            .insert(registry.to_string(), credentials.clone());
        self.auth
            .write()
            .await
            .retain(|key, _| !key.starts_with(&format!("{}/", registry)));

        info!(registry = %registry, username = %credentials.username, "Registry credentials accepted");
        Ok(())
    }

    async fn push_blob(&self, image: &ImageName, blob: &Blob) -> Result<()> {
        let digest = blob.digest();
        if self.blob_exists(image, &digest).await? {
            debug!(digest = %digest, "Blob already present");
            return Ok(());
        }

        let base = Self::base_url(image.registry());
        let start_url = format!("{}/v2/{}/blobs/uploads/", base, image.repository());
        let response = self.request(image, |c| c.post(&start_url)).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Error::Publish(format!(
                "starting blob upload to {} failed: {}",
                image,
                response.status()
            )));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Publish("blob upload has no Location".to_string()))?;
        let upload_url = resolve_location(&base, location);

        let response = self
            .request(image, |c| {
                c.put(&upload_url)
                    .query(&[("digest", digest.as_str())])
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(blob.data.clone())
            })
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::Publish(format!(
                "uploading blob {} to {} failed: {}",
                digest,
                image,
                response.status()
            )));
        }

        debug!(digest = %digest, size = blob.data.len(), "Blob uploaded");
        Ok(())
    }

    async fn push_manifest(
        &self,
        image: &ImageName,
        reference: &str,
        media_type: &str,
        body: &[u8],
    ) -> Result<ImageDigest> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            Self::base_url(image.registry()),
            image.repository(),
            reference
        );
        let response = self
            .request(image, |c| {
                c.put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(body.to_vec())
            })
            .await?;

        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Publish(format!(
                "pushing manifest {}:{} failed: {} {}",
                image,
                reference,
                status,
                detail.trim()
            )));
        }

        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| ImageDigest::parse(v).ok())
            .unwrap_or_else(|| ImageDigest::of(body));

        debug!(image = %image, reference = %reference, digest = %digest, "Manifest pushed");
        Ok(digest)
    }
}

/// Upload locations may be absolute or relative to the registry.
fn resolve_location(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{}{}", base, location)
    }
}

/// Parse `Bearer realm="…",service="…",scope="…"`. Quoted values may contain commas.
fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
    if scheme.is_empty() {
        return None;
    }

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
            value
        } else {
            chars.by_ref().take_while(|c| *c != ',').collect()
        };

        params.insert(key.trim().to_ascii_lowercase(), value);
    }

    Some(Challenge {
        scheme: scheme.to_ascii_lowercase(),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:example/atlas:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, "bearer");
        assert_eq!(challenge.params["realm"], "https://ghcr.io/token");
        assert_eq!(challenge.params["service"], "ghcr.io");
        assert_eq!(challenge.params["scope"], "repository:example/atlas:pull,push");
    }

    #[test]
    fn test_parse_basic_challenge() {
        let challenge = parse_challenge(r#"Basic realm="Registry Realm""#).unwrap();
        assert_eq!(challenge.scheme, "basic");
        assert_eq!(challenge.params["realm"], "Registry Realm");

        assert!(parse_challenge("").is_none());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(DistributionRegistry::base_url("ghcr.io"), "https://ghcr.io");
        assert_eq!(
            DistributionRegistry::base_url("docker.io"),
            "https://registry-1.docker.io"
        );
        assert_eq!(
            DistributionRegistry::base_url("localhost:5000"),
            "http://localhost:5000"
        );
    }

    #[test]
    fn test_resolve_location() {
        assert_eq!(
            resolve_location("https://ghcr.io", "/v2/example/atlas/blobs/uploads/abc?_state=x"),
            "https://ghcr.io/v2/example/atlas/blobs/uploads/abc?_state=x"
        );
        assert_eq!(
            resolve_location("https://ghcr.io", "https://upload.ghcr.io/u/1"),
            "https://upload.ghcr.io/u/1"
        );
    }

    #[tokio::test]
    #[ignore = "requires a registry at localhost:5000 (docker run -p 5000:5000 registry:2)"]
    async fn test_push_to_local_registry() {
        use kiln_core::manifest::{ImageManifest, OCI_MANIFEST_MEDIA_TYPE, empty_config_blob};

        let registry = DistributionRegistry::new();
        let image = ImageName::parse("localhost:5000/kiln/test").unwrap();

        let config = empty_config_blob();
        registry.push_blob(&image, &config).await.unwrap();
        // Second push is skipped by the existence check.
        registry.push_blob(&image, &config).await.unwrap();

        let manifest = ImageManifest::artifact(vec![]);
        let body = manifest.to_bytes().unwrap();
        let digest = registry
            .push_manifest(&image, "latest", OCI_MANIFEST_MEDIA_TYPE, &body)
            .await
            .unwrap();
        assert_eq!(digest, ImageDigest::of(&body));
    }
}
