use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::Secret;
use kube::{api::Api, client::Client};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;

use crate::api::{Bundle, BundleSource, ImageSource, ResolvedSource};
use crate::error::{AppError, AppResult};
use crate::store::ContentStore;
use crate::unpack::{secret_value, UnpackResult, Unpacker};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// A parsed image reference: `[host/]path[:tag][@sha256:hex]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> AppResult<Self> {
        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.starts_with("sha256:") {
                    return Err(AppError::InvalidInput(format!(
                        "unsupported digest algorithm in {:?}",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon comes after the last path separator; anything before
        // that is a registry port.
        let (name, tag) = match name.rsplit_once(':') {
            Some((head, tail)) if !tail.contains('/') => (head, Some(tail.to_string())),
            _ => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            _ => {
                // Bare repositories resolve against Docker Hub.
                let repository = if name.contains('/') {
                    name.to_string()
                } else {
                    format!("library/{}", name)
                };
                ("docker.io".to_string(), repository)
            }
        };

        if repository.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "image reference {:?} has no repository",
                reference
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Hostname to speak the distribution API to.
    fn api_host(&self) -> &str {
        if self.registry == "docker.io" {
            "registry-1.docker.io"
        } else {
            &self.registry
        }
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!(
            "https://{}/v2/{}/manifests/{}",
            self.api_host(),
            self.repository,
            reference
        )
    }

    fn blob_url(&self, digest: &str) -> String {
        format!(
            "https://{}/v2/{}/blobs/{}",
            self.api_host(),
            self.repository,
            digest
        )
    }

    /// The repo part of the pinned form, close to how the user wrote it.
    pub fn repo(&self) -> String {
        let repository = if self.registry == "docker.io" {
            self.repository.trim_start_matches("library/")
        } else {
            &self.repository
        };
        format!("{}/{}", self.registry, repository)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<PlatformDescriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlatformDescriptor {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    architecture: Option<String>,
}

/// Credentials parsed out of a dockerconfigjson pull secret.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Resolve credentials for `registry` from a dockerconfigjson payload, the
/// way a cluster keychain would.
pub fn credentials_for(config_json: &str, registry: &str) -> AppResult<RegistryCredentials> {
    #[derive(Deserialize)]
    struct DockerConfig {
        #[serde(default)]
        auths: std::collections::BTreeMap<String, AuthEntry>,
    }
    #[derive(Deserialize)]
    struct AuthEntry {
        #[serde(default)]
        auth: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    }

    let config: DockerConfig = serde_json::from_str(config_json)?;
    let aliases = [
        registry.to_string(),
        format!("https://{}", registry),
        match registry {
            "docker.io" => "https://index.docker.io/v1/".to_string(),
            other => other.to_string(),
        },
    ];
    for alias in aliases {
        if let Some(entry) = config.auths.get(&alias) {
            if let Some(auth) = &entry.auth {
                let decoded = BASE64
                    .decode(auth)
                    .map_err(|e| AppError::Registry(format!("invalid auth entry: {}", e)))?;
                let decoded = String::from_utf8(decoded)
                    .map_err(|e| AppError::Registry(format!("invalid auth entry: {}", e)))?;
                let (username, password) = decoded.split_once(':').ok_or_else(|| {
                    AppError::Registry("auth entry is not username:password".to_string())
                })?;
                return Ok(RegistryCredentials {
                    username: Some(username.to_string()),
                    password: Some(password.to_string()),
                });
            }
            return Ok(RegistryCredentials {
                username: entry.username.clone(),
                password: entry.password.clone(),
            });
        }
    }
    Ok(RegistryCredentials::default())
}

/// True for directory names that look like a sha256 hex digest.
fn is_digest_dir(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|c| c.is_ascii_hexdigit())
}

/// Fetches an OCI image, pins it to a digest and materializes its layers
/// under a digest-keyed cache directory inside the content store.
pub struct ImageUnpacker {
    client: Client,
    namespace: String,
}

impl ImageUnpacker {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn keychain(&self, image: &ImageSource, reference: &ImageReference) -> AppResult<RegistryCredentials> {
        let Some(pull_secret) = &image.pull_secret else {
            return Ok(RegistryCredentials::default());
        };
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api.get(pull_secret).await?;
        let config = secret_value(&secret, ".dockerconfigjson").ok_or_else(|| {
            AppError::Registry(format!(
                "pull secret {} has no .dockerconfigjson key",
                pull_secret
            ))
        })?;
        credentials_for(&config, &reference.registry)
    }

    /// GET with distribution-API auth: on a 401 bearer challenge, fetch a
    /// token from the advertised realm and retry once.
    async fn registry_get(
        &self,
        http: &reqwest::Client,
        url: &str,
        accept: Option<&str>,
        creds: &RegistryCredentials,
        token: &mut Option<String>,
    ) -> AppResult<reqwest::Response> {
        for attempt in 0..2 {
            let mut request = http.get(url);
            if let Some(accept) = accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            if let Some(token) = token.as_deref() {
                request = request.bearer_auth(token);
            } else if let Some(username) = &creds.username {
                request = request.basic_auth(username, creds.password.as_deref());
            }
            let response = request.send().await?;

            if response.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                let challenge = response
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                *token = Some(self.fetch_token(http, &challenge, creds).await?);
                continue;
            }
            return Ok(response);
        }
        unreachable!("registry_get retries exactly once")
    }

    async fn fetch_token(
        &self,
        http: &reqwest::Client,
        challenge: &str,
        creds: &RegistryCredentials,
    ) -> AppResult<String> {
        let params = parse_bearer_challenge(challenge)?;
        let realm = params
            .iter()
            .find(|(k, _)| k == "realm")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| AppError::Registry("bearer challenge without realm".to_string()))?;

        let mut request = http.get(&realm);
        for (key, value) in params.iter().filter(|(k, _)| k != "realm") {
            request = request.query(&[(key.as_str(), value.as_str())]);
        }
        if let Some(username) = &creds.username {
            request = request.basic_auth(username, creds.password.as_deref());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AppError::Registry(format!(
                "token endpoint {} returned {}",
                realm,
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }
        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| AppError::Registry("token endpoint returned no token".to_string()))
    }

    async fn unpack_image(
        &self,
        image: &ImageSource,
        store: &ContentStore,
    ) -> AppResult<UnpackResult> {
        let reference = ImageReference::parse(&image.image_ref)?;
        let creds = self.keychain(image, &reference).await?;

        let mut builder = reqwest::Client::builder();
        if image.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;
        let mut token = None;

        // Pinned references whose content is already cached never touch the
        // network again.
        if let Some(digest) = &reference.digest {
            let hex = digest.trim_start_matches("sha256:");
            let cached = store.resolve(hex)?;
            if cached.is_dir() {
                return Ok(UnpackResult::unpacked(
                    ResolvedSource::Image {
                        image_ref: format!("{}@{}", reference.repo(), digest),
                    },
                    "image content cached",
                )
                .with_root(cached));
            }
        }

        let manifest_ref = reference
            .digest
            .clone()
            .or_else(|| reference.tag.clone())
            .unwrap_or_else(|| "latest".to_string());
        let response = self
            .registry_get(
                &http,
                &reference.manifest_url(&manifest_ref),
                Some(MANIFEST_ACCEPT),
                &creds,
                &mut token,
            )
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Registry(format!(
                "manifest fetch for {} returned {}",
                image.image_ref,
                response.status()
            )));
        }

        let header_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        let digest =
            header_digest.unwrap_or_else(|| format!("sha256:{:x}", Sha256::digest(&body)));
        let hex = digest.trim_start_matches("sha256:").to_string();

        let cached = store.resolve(&hex)?;
        if cached.is_dir() {
            return Ok(UnpackResult::unpacked(
                ResolvedSource::Image {
                    image_ref: format!("{}@{}", reference.repo(), digest),
                },
                "image content cached",
            )
            .with_root(cached));
        }

        // New digest: drop stale cache directories from previous templates.
        for entry in fs::read_dir(store.root())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && is_digest_dir(&name) && name != hex {
                fs::remove_dir_all(entry.path())?;
            }
        }

        let mut manifest: ManifestDocument = serde_json::from_slice(&body)?;
        if !manifest.manifests.is_empty() {
            // Multi-arch index: prefer linux/amd64, fall back to the first.
            let chosen = manifest
                .manifests
                .iter()
                .find(|m| {
                    m.platform.as_ref().is_some_and(|p| {
                        p.os.as_deref() == Some("linux")
                            && p.architecture.as_deref() == Some("amd64")
                    })
                })
                .or_else(|| manifest.manifests.first())
                .map(|m| m.digest.clone())
                .ok_or_else(|| AppError::Registry("image index has no manifests".to_string()))?;
            let response = self
                .registry_get(
                    &http,
                    &reference.manifest_url(&chosen),
                    Some(MANIFEST_ACCEPT),
                    &creds,
                    &mut token,
                )
                .await?;
            if !response.status().is_success() {
                return Err(AppError::Registry(format!(
                    "platform manifest {} returned {}",
                    chosen,
                    response.status()
                )));
            }
            manifest = serde_json::from_slice(&response.bytes().await?)?;
        }

        fs::create_dir_all(&cached)?;
        let applied = self
            .apply_layers(&http, &reference, &manifest, &creds, &mut token, store, &hex)
            .await;
        if let Err(err) = applied {
            // Never leave a half-written digest directory behind.
            if cached.exists() {
                let _ = fs::remove_dir_all(&cached);
            }
            return Err(err);
        }

        Ok(UnpackResult::unpacked(
            ResolvedSource::Image {
                image_ref: format!("{}@{}", reference.repo(), digest),
            },
            "image unpacked",
        )
        .with_root(cached))
    }

    async fn apply_layers(
        &self,
        http: &reqwest::Client,
        reference: &ImageReference,
        manifest: &ManifestDocument,
        creds: &RegistryCredentials,
        token: &mut Option<String>,
        store: &ContentStore,
        hex: &str,
    ) -> AppResult<()> {
        if manifest.layers.is_empty() {
            return Err(AppError::Registry("image manifest has no layers".to_string()));
        }
        for layer in &manifest.layers {
            let response = self
                .registry_get(http, &reference.blob_url(&layer.digest), None, creds, token)
                .await?;
            if !response.status().is_success() {
                return Err(AppError::Registry(format!(
                    "layer {} returned {}",
                    layer.digest,
                    response.status()
                )));
            }
            let bytes = response.bytes().await?;
            let media_type = layer.media_type.as_deref().unwrap_or_default();
            if media_type.ends_with("gzip") || media_type.is_empty() {
                store.copy_tar_archive(GzDecoder::new(&bytes[..]), hex)?;
            } else if media_type.ends_with("tar") {
                store.copy_tar_archive(&bytes[..], hex)?;
            } else {
                return Err(AppError::Registry(format!(
                    "unsupported layer media type {:?}",
                    media_type
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Unpacker for ImageUnpacker {
    async fn unpack(
        &self,
        _bundle: &Bundle,
        source: &BundleSource,
        store: &ContentStore,
    ) -> AppResult<UnpackResult> {
        let BundleSource::Image { image } = source else {
            panic!("image unpacker invoked on source kind {:?}", source.kind());
        };

        let pinned = image.image_ref.contains("@sha256:");
        match self.unpack_image(image, store).await {
            Ok(result) => Ok(result),
            // A digest reference can never start resolving later.
            Err(err) if pinned => Err(AppError::unrecoverable(err)),
            Err(err) => Err(err),
        }
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."` into pairs.
fn parse_bearer_challenge(header: &str) -> AppResult<Vec<(String, String)>> {
    let rest = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Registry(format!("unsupported auth challenge {:?}", header)))?;
    let mut params = Vec::new();
    for part in rest.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.push((key.to_string(), value.trim_matches('"').to_string()));
        }
    }
    Ok(params)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_reference() {
        let parsed = ImageReference::parse("example.io/team/bundle:v1").unwrap();
        assert_eq!(parsed.registry, "example.io");
        assert_eq!(parsed.repository, "team/bundle");
        assert_eq!(parsed.tag.as_deref(), Some("v1"));
        assert!(parsed.digest.is_none());
    }

    #[test]
    fn parses_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let parsed =
            ImageReference::parse(&format!("registry:5000/bundle@{}", digest)).unwrap();
        assert_eq!(parsed.registry, "registry:5000");
        assert_eq!(parsed.repository, "bundle");
        assert_eq!(parsed.digest.as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn bare_names_default_to_docker_hub() {
        let parsed = ImageReference::parse("busybox:1.36").unwrap();
        assert_eq!(parsed.registry, "docker.io");
        assert_eq!(parsed.repository, "library/busybox");
        assert_eq!(parsed.api_host(), "registry-1.docker.io");
    }

    #[test]
    fn rejects_non_sha256_digests() {
        assert!(ImageReference::parse("example.io/bundle@md5:abcd").is_err());
    }

    #[test]
    fn digest_dirs_are_recognized() {
        assert!(is_digest_dir(&"a1".repeat(32)));
        assert!(!is_digest_dir("manifests"));
        assert!(!is_digest_dir(&"z".repeat(64)));
    }

    #[test]
    fn keychain_resolves_base64_auth() {
        let config = format!(
            r#"{{"auths":{{"example.io":{{"auth":"{}"}}}}}}"#,
            BASE64.encode("user:pass")
        );
        let creds = credentials_for(&config, "example.io").unwrap();
        assert_eq!(creds.username.as_deref(), Some("user"));
        assert_eq!(creds.password.as_deref(), Some("pass"));
    }

    #[test]
    fn keychain_falls_back_to_docker_hub_alias() {
        let config = r#"{"auths":{"https://index.docker.io/v1/":{"username":"u","password":"p"}}}"#;
        let creds = credentials_for(config, "docker.io").unwrap();
        assert_eq!(creds.username.as_deref(), Some("u"));
    }

    #[test]
    fn unknown_registry_yields_anonymous() {
        let creds = credentials_for(r#"{"auths":{}}"#, "example.io").unwrap();
        assert_eq!(creds, RegistryCredentials::default());
    }

    #[test]
    fn bearer_challenge_parsing() {
        let params = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example.io/token",service="registry",scope="repository:bundle:pull""#,
        )
        .unwrap();
        assert!(params.contains(&("realm".to_string(), "https://auth.example.io/token".to_string())));
        assert!(params.contains(&("scope".to_string(), "repository:bundle:pull".to_string())));
    }
}
