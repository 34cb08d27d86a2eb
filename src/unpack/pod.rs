use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, LocalObjectReference, Pod, PodSpec,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, LogParams, ObjectMeta, PostParams, ResourceExt};
use kube::client::Client;
use serde::Deserialize;

use crate::api::{Bundle, BundleSource, ImageSource, ResolvedSource};
use crate::error::{AppError, AppResult};
use crate::store::ContentStore;
use crate::unpack::{UnpackResult, Unpacker};

/// Deterministic pod name; the orchestrator's uniqueness constraint makes
/// concurrent reconciles coalesce on one pod.
pub fn unpack_pod_name(provisioner: &str, bundle_name: &str) -> String {
    format!("{}-unpack-bundle-{}", provisioner, bundle_name)
}

/// On success the unpack container prints exactly this document to stdout.
#[derive(Debug, Deserialize)]
struct PodOutput {
    /// base64-encoded tar.gz of the bundle filesystem
    content: String,
}

/// Unpacks an image source by scheduling an unpack Pod in the system
/// namespace and polling its phase across reconciles.
pub struct PodUnpacker {
    client: Client,
    namespace: String,
    /// Short provisioner name used as the pod name prefix.
    provisioner: String,
    /// Image providing the `/bale-unpack` helper binary.
    unpack_image: String,
}

impl PodUnpacker {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        provisioner: impl Into<String>,
        unpack_image: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            provisioner: provisioner.into(),
            unpack_image: unpack_image.into(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn build_pod(&self, bundle: &Bundle, image: &ImageSource) -> Pod {
        let restricted = SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let labels = [
            (crate::api::LABEL_OWNER_KIND.to_string(), "Bundle".to_string()),
            (crate::api::LABEL_OWNER_NAME.to_string(), bundle.name_any()),
        ]
        .into_iter()
        .collect();

        Pod {
            metadata: ObjectMeta {
                name: Some(unpack_pod_name(&self.provisioner, &bundle.name_any())),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                owner_references: Some(vec![OwnerReference {
                    api_version: format!("{}/v1alpha2", crate::api::GROUP),
                    kind: "Bundle".to_string(),
                    name: bundle.name_any(),
                    uid: bundle.metadata.uid.clone().unwrap_or_default(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                automount_service_account_token: Some(false),
                restart_policy: Some("Never".to_string()),
                image_pull_secrets: image.pull_secret.as_ref().map(|name| {
                    vec![LocalObjectReference {
                        name: name.clone(),
                    }]
                }),
                init_containers: Some(vec![Container {
                    name: "install-unpacker".to_string(),
                    image: Some(self.unpack_image.clone()),
                    command: Some(vec![
                        "cp".to_string(),
                        "-Rv".to_string(),
                        "/bale-unpack".to_string(),
                        "/util/bale-unpack".to_string(),
                    ]),
                    security_context: Some(restricted.clone()),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "util".to_string(),
                        mount_path: "/util".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }]),
                containers: vec![Container {
                    name: "unpack-bundle".to_string(),
                    image: Some(image.image_ref.clone()),
                    command: Some(vec![
                        "/util/bale-unpack".to_string(),
                        "--bundle-dir".to_string(),
                        "/".to_string(),
                    ]),
                    security_context: Some(restricted),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "util".to_string(),
                        mount_path: "/util".to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "util".to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn handle_succeeded(
        &self,
        pod: &Pod,
        store: &ContentStore,
    ) -> AppResult<UnpackResult> {
        let name = pod.name_any();
        let logs = self.pods().logs(&name, &LogParams::default()).await?;
        let output: PodOutput = serde_json::from_str(&logs).map_err(|e| {
            AppError::Archive(format!("unpack pod {} wrote malformed output: {}", name, e))
        })?;
        let archive = BASE64
            .decode(output.content.trim())
            .map_err(|e| AppError::Archive(format!("decoding unpack pod output: {}", e)))?;
        store.copy_tar_archive(GzDecoder::new(&archive[..]), "")?;

        let resolved = resolved_from_image_id(pod).ok_or_else(|| {
            AppError::Internal(format!("unpack pod {} has no resolved imageID", name))
        })?;
        Ok(UnpackResult::unpacked(
            ResolvedSource::Image {
                image_ref: resolved,
            },
            "image unpacked",
        ))
    }
}

/// The kubelet reports the exact pulled artifact in the container status
/// imageID; that is the pin.
fn resolved_from_image_id(pod: &Pod) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    let image_id = statuses.first().map(|s| s.image_id.as_str())?;
    if image_id.is_empty() {
        return None;
    }
    // Historic runtimes prefix with docker-pullable://
    let image_id = image_id.rsplit("//").next().unwrap_or(image_id);
    Some(image_id.to_string())
}

/// Surface image pull failures while the pod is still Pending.
fn pull_backoff_message(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    let statuses = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    for container in statuses {
        if let Some(waiting) = container.state.as_ref().and_then(|s| s.waiting.as_ref()) {
            if matches!(
                waiting.reason.as_deref(),
                Some("ImagePullBackOff") | Some("ErrImagePull")
            ) {
                return waiting.message.clone().or_else(|| waiting.reason.clone());
            }
        }
    }
    None
}

#[async_trait]
impl Unpacker for PodUnpacker {
    async fn unpack(
        &self,
        bundle: &Bundle,
        source: &BundleSource,
        store: &ContentStore,
    ) -> AppResult<UnpackResult> {
        let BundleSource::Image { image } = source else {
            panic!("pod unpacker invoked on source kind {:?}", source.kind());
        };

        let pods = self.pods();
        let name = unpack_pod_name(&self.provisioner, &bundle.name_any());

        let pod = match pods.get(&name).await {
            Ok(pod) => pod,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                let desired = self.build_pod(bundle, image);
                match pods.create(&PostParams::default(), &desired).await {
                    Ok(pod) => pod,
                    // Lost a create race; adopt whatever won.
                    Err(kube::Error::Api(e)) if e.code == 409 => pods.get(&name).await?,
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Pending");
        match phase {
            "Pending" => Ok(UnpackResult::pending(
                pull_backoff_message(&pod)
                    .unwrap_or_else(|| "waiting for unpack pod to start".to_string()),
            )),
            "Running" => Ok(UnpackResult::unpacking("unpack pod running")),
            "Succeeded" => self.handle_succeeded(&pod, store).await,
            "Failed" => {
                let logs = pods
                    .logs(&name, &LogParams::default())
                    .await
                    .unwrap_or_else(|e| format!("(logs unavailable: {})", e));
                pods.delete(&name, &DeleteParams::default()).await.ok();
                Err(AppError::unrecoverable(AppError::Internal(format!(
                    "unpack pod {} failed: {}",
                    name,
                    logs.trim()
                ))))
            }
            other => {
                // Unknown phase: throw the pod away and start over next pass.
                pods.delete(&name, &DeleteParams::default()).await.ok();
                Err(AppError::Internal(format!(
                    "unpack pod {} in unexpected phase {}",
                    name, other
                )))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use std::io::Write;

    #[test]
    fn pod_names_are_deterministic() {
        assert_eq!(
            unpack_pod_name("plain", "bd-abc123"),
            "plain-unpack-bundle-bd-abc123"
        );
    }

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod {
            status: Some(status),
            ..Default::default()
        }
    }

    fn container_status(image_id: &str, waiting_reason: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            image_id: image_id.to_string(),
            state: waiting_reason.map(|reason| ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    message: Some(format!("{}: pull failed", reason)),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn image_id_strips_runtime_prefix() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![container_status(
                "docker-pullable://example.io/bundle@sha256:abcd",
                None,
            )]),
            ..Default::default()
        });
        assert_eq!(
            resolved_from_image_id(&pod).unwrap(),
            "example.io/bundle@sha256:abcd"
        );
    }

    #[test]
    fn missing_image_id_is_none() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![container_status("", None)]),
            ..Default::default()
        });
        assert!(resolved_from_image_id(&pod).is_none());
    }

    #[test]
    fn pull_backoff_is_surfaced() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![container_status("", Some("ImagePullBackOff"))]),
            ..Default::default()
        });
        let message = pull_backoff_message(&pod).unwrap();
        assert!(message.contains("ImagePullBackOff"));
    }

    #[test]
    fn pod_output_round_trips_archive() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let data = b"kind: ConfigMap";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "manifests/app.yaml", &data[..])
            .unwrap();
        let gz = builder.into_inner().unwrap().finish().unwrap();

        let logs = serde_json::json!({ "content": BASE64.encode(&gz) }).to_string();
        let output: PodOutput = serde_json::from_str(&logs).unwrap();
        let archive = BASE64.decode(output.content).unwrap();

        let base =
            std::env::temp_dir().join(format!("bale-podunpack-{}", std::process::id()));
        let store = ContentStore::create(&base, "bd").unwrap();
        store
            .copy_tar_archive(GzDecoder::new(&archive[..]), "")
            .unwrap();
        let written = std::fs::read(store.root().join("manifests/app.yaml")).unwrap();
        let mut expected = Vec::new();
        expected.write_all(data).unwrap();
        assert_eq!(written, expected);
    }
}
