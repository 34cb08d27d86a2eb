use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::error::{AppError, AppResult};

const SECRET_TYPE: &str = "core.bale.dev/release.v1";
const LABEL_RELEASE_NAME: &str = "core.bale.dev/release-name";
const LABEL_RELEASE_VERSION: &str = "core.bale.dev/release-version";
const LABEL_RELEASE_STATUS: &str = "core.bale.dev/release-status";

/// Release versions kept around for history before pruning.
const MAX_RELEASE_HISTORY: usize = 10;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    Superseded,
}

impl ReleaseStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Superseded => "superseded",
        }
    }
}

/// One stored revision of a release: the desired object set at a point in
/// time plus its outcome.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub version: u32,
    pub status: ReleaseStatus,
    pub manifest: Vec<DynamicObject>,
}

/// Persists releases as Secrets in the install namespace, one Secret per
/// version, the payload gzipped JSON. This is the orchestrator's native
/// release storage; nothing else remembers what a BundleDeployment installed.
#[derive(Clone)]
pub struct ReleaseStore {
    client: Client,
}

impl ReleaseStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secret_name(name: &str, version: u32) -> String {
        format!("bale.release.v1.{}.v{}", name, version)
    }

    fn encode(release: &Release) -> AppResult<Vec<u8>> {
        let json = serde_json::to_vec(release)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    fn decode(secret: &Secret) -> AppResult<Release> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get("release"))
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "release secret {:?} has no release payload",
                    secret.metadata.name
                ))
            })?;
        let mut decoder = GzDecoder::new(&data.0[..]);
        let mut json = Vec::new();
        decoder.read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }

    async fn list_versions(&self, namespace: &str, name: &str) -> AppResult<Vec<Secret>> {
        let params =
            ListParams::default().labels(&format!("{}={}", LABEL_RELEASE_NAME, name));
        let mut secrets = self.secrets(namespace).list(&params).await?.items;
        secrets.sort_by_key(|s| version_of(s));
        Ok(secrets)
    }

    /// The most recent stored revision, regardless of its outcome.
    pub async fn latest(&self, namespace: &str, name: &str) -> AppResult<Option<Release>> {
        let secrets = self.list_versions(namespace, name).await?;
        match secrets.last() {
            Some(secret) => Ok(Some(Self::decode(secret)?)),
            None => Ok(None),
        }
    }

    /// Persist a new revision and supersede the previous deployed one.
    pub async fn save(&self, release: &Release) -> AppResult<()> {
        let api = self.secrets(&release.namespace);
        let previous = self.list_versions(&release.namespace, &release.name).await?;

        let labels: BTreeMap<String, String> = [
            (LABEL_RELEASE_NAME.to_string(), release.name.clone()),
            (
                LABEL_RELEASE_VERSION.to_string(),
                release.version.to_string(),
            ),
            (
                LABEL_RELEASE_STATUS.to_string(),
                release.status.as_str().to_string(),
            ),
        ]
        .into_iter()
        .collect();

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(Self::secret_name(&release.name, release.version)),
                namespace: Some(release.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(
                [("release".to_string(), ByteString(Self::encode(release)?))]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        api.create(&PostParams::default(), &secret).await?;

        if release.status == ReleaseStatus::Deployed {
            for old in &previous {
                if status_of(old) == Some(ReleaseStatus::Deployed) {
                    self.mark(&release.namespace, old, ReleaseStatus::Superseded)
                        .await?;
                }
            }
        }

        // Prune everything beyond the history window, oldest first.
        let total = previous.len() + 1;
        if total > MAX_RELEASE_HISTORY {
            for stale in previous.iter().take(total - MAX_RELEASE_HISTORY) {
                if let Some(name) = &stale.metadata.name {
                    api.delete(name, &DeleteParams::default()).await.ok();
                }
            }
        }
        Ok(())
    }

    async fn mark(&self, namespace: &str, secret: &Secret, status: ReleaseStatus) -> AppResult<()> {
        let Some(name) = &secret.metadata.name else {
            return Ok(());
        };
        let mut release = Self::decode(secret)?;
        release.status = status;
        let patch = serde_json::json!({
            "metadata": { "labels": { LABEL_RELEASE_STATUS: status.as_str() } },
            "data": { "release": BASE64.encode(Self::encode(&release)?) },
        });
        self.secrets(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Next version number for a release.
    pub async fn next_version(&self, namespace: &str, name: &str) -> AppResult<u32> {
        let secrets = self.list_versions(namespace, name).await?;
        Ok(secrets.last().map(|s| version_of(s) + 1).unwrap_or(1))
    }

    /// Drop every stored revision of a release.
    pub async fn delete_all(&self, namespace: &str, name: &str) -> AppResult<()> {
        let api = self.secrets(namespace);
        for secret in self.list_versions(namespace, name).await? {
            if let Some(name) = &secret.metadata.name {
                match api.delete(name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

fn version_of(secret: &Secret) -> u32 {
    secret
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_RELEASE_VERSION))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn status_of(secret: &Secret) -> Option<ReleaseStatus> {
    match secret
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_RELEASE_STATUS))
        .map(String::as_str)
    {
        Some("deployed") => Some(ReleaseStatus::Deployed),
        Some("failed") => Some(ReleaseStatus::Failed),
        Some("superseded") => Some(ReleaseStatus::Superseded),
        _ => None,
    }
}
