use kube::api::{DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::client::Client;
use kube::core::discovery;
use kube::discovery::pinned_kind;
use kube::{api::Api, api::DeleteParams, api::ResourceExt};
use std::collections::BTreeSet;

use crate::api::{FIELD_MANAGER, LABEL_OWNER_NAME};
use crate::error::{AppError, AppResult};

pub mod postrender;
pub mod release;

use postrender::PostRenderer;
use release::{Release, ReleaseStatus, ReleaseStore};

/// What the deployer decided to do with the rendered release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseState {
    NeedsInstall,
    NeedsUpgrade,
    Unchanged,
}

/// Converges the cluster toward the desired object set of one release,
/// keyed by `{releaseName, releaseNamespace}`.
#[derive(Clone)]
pub struct Deployer {
    client: Client,
    store: ReleaseStore,
}

/// Identity of an applied object, used for diffing release revisions.
fn object_key(object: &DynamicObject) -> (String, String, String, String) {
    let types = object.types.clone().unwrap_or_default();
    (
        types.api_version,
        types.kind,
        object.metadata.namespace.clone().unwrap_or_default(),
        object.name_any(),
    )
}

fn manifest_fingerprint(objects: &[DynamicObject]) -> AppResult<String> {
    Ok(serde_json::to_string(&serde_json::to_value(objects)?)?)
}

/// Pure release-state classification: no release means install; a manifest
/// drift or a Failed/Superseded current release means upgrade.
pub fn classify(current: Option<&Release>, rendered: &[DynamicObject]) -> AppResult<ReleaseState> {
    let Some(current) = current else {
        return Ok(ReleaseState::NeedsInstall);
    };
    if current.status != ReleaseStatus::Deployed {
        return Ok(ReleaseState::NeedsUpgrade);
    }
    if manifest_fingerprint(&current.manifest)? != manifest_fingerprint(rendered)? {
        return Ok(ReleaseState::NeedsUpgrade);
    }
    Ok(ReleaseState::Unchanged)
}

/// Objects in the current release that the desired set no longer contains.
pub fn stale_objects<'a>(
    current: &'a Release,
    rendered: &[DynamicObject],
) -> Vec<&'a DynamicObject> {
    let desired: BTreeSet<_> = rendered.iter().map(object_key).collect();
    current
        .manifest
        .iter()
        .filter(|object| !desired.contains(&object_key(object)))
        .collect()
}

impl Deployer {
    pub fn new(client: Client) -> Self {
        let store = ReleaseStore::new(client.clone());
        Self { client, store }
    }

    pub fn release_store(&self) -> &ReleaseStore {
        &self.store
    }

    /// Render the desired release and drive the indicated action. Returns
    /// the objects actually applied, as the cluster returned them.
    pub async fn deploy(
        &self,
        name: &str,
        namespace: &str,
        objects: Vec<DynamicObject>,
        renderer: &dyn PostRenderer,
    ) -> AppResult<Vec<DynamicObject>> {
        let rendered = renderer.render(objects)?;

        let current = self
            .store
            .latest(namespace, name)
            .await
            .map_err(|e| AppError::ReleaseState(e.to_string()))?;
        let state = classify(current.as_ref(), &rendered)?;

        match state {
            ReleaseState::NeedsInstall => {
                self.guard_against_foreign_objects(name, namespace, &rendered, None)
                    .await?;
                let applied = self
                    .apply_all(name, namespace, &rendered, |message| {
                        AppError::Install(message)
                    })
                    .await?;
                self.record(name, namespace, &rendered, ReleaseStatus::Deployed)
                    .await?;
                Ok(applied)
            }
            ReleaseState::NeedsUpgrade => {
                self.guard_against_foreign_objects(name, namespace, &rendered, current.as_ref())
                    .await?;
                let applied = match self
                    .apply_all(name, namespace, &rendered, |message| {
                        AppError::Upgrade(message)
                    })
                    .await
                {
                    Ok(applied) => applied,
                    Err(err) => {
                        // Record the failed revision so the next pass
                        // classifies straight to NeedsUpgrade.
                        if !matches!(err, AppError::RequiredResourceNotFound(_)) {
                            self.record(name, namespace, &rendered, ReleaseStatus::Failed)
                                .await
                                .ok();
                        }
                        return Err(err);
                    }
                };
                if let Some(current) = &current {
                    for stale in stale_objects(current, &rendered) {
                        self.delete_object(namespace, stale).await?;
                    }
                }
                self.record(name, namespace, &rendered, ReleaseStatus::Deployed)
                    .await?;
                Ok(applied)
            }
            // Reconcile: re-apply to heal drift in objects already owned.
            ReleaseState::Unchanged => {
                self.apply_all(name, namespace, &rendered, |message| {
                    AppError::Upgrade(message)
                })
                .await
            }
        }
    }

    /// Remove everything a release put on the cluster, then its storage.
    pub async fn uninstall(&self, name: &str, namespace: &str) -> AppResult<()> {
        if let Some(release) = self.store.latest(namespace, name).await? {
            for object in &release.manifest {
                self.delete_object(namespace, object).await?;
            }
        }
        self.store.delete_all(namespace, name).await
    }

    async fn record(
        &self,
        name: &str,
        namespace: &str,
        rendered: &[DynamicObject],
        status: ReleaseStatus,
    ) -> AppResult<()> {
        let version = self.store.next_version(namespace, name).await?;
        self.store
            .save(&Release {
                name: name.to_string(),
                namespace: namespace.to_string(),
                version,
                status,
                manifest: rendered.to_vec(),
            })
            .await
    }

    /// Installing over an object some other owner created is never healed;
    /// it means two BundleDeployments are fighting over the same name.
    async fn guard_against_foreign_objects(
        &self,
        name: &str,
        namespace: &str,
        rendered: &[DynamicObject],
        current: Option<&Release>,
    ) -> AppResult<()> {
        let known: BTreeSet<_> = current
            .map(|c| c.manifest.iter().map(object_key).collect())
            .unwrap_or_default();
        for object in rendered {
            if known.contains(&object_key(object)) {
                continue;
            }
            let api = self.dynamic_api(namespace, object).await?;
            if let Some(existing) = api.get_opt(&object.name_any()).await? {
                let owned_by_us = existing
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_OWNER_NAME))
                    .is_some_and(|owner| owner == name);
                if !owned_by_us {
                    let types = object.types.clone().unwrap_or_default();
                    return Err(AppError::unrecoverable(AppError::Install(format!(
                        "rendered manifests contain a resource that already exists: {} {:?}",
                        types.kind,
                        object.name_any()
                    ))));
                }
            }
        }
        Ok(())
    }

    async fn apply_all(
        &self,
        _name: &str,
        namespace: &str,
        rendered: &[DynamicObject],
        wrap: impl Fn(String) -> AppError,
    ) -> AppResult<Vec<DynamicObject>> {
        let mut applied = Vec::with_capacity(rendered.len());
        for object in rendered {
            match self.apply(namespace, object.clone()).await {
                Ok(object) => applied.push(object),
                Err(err @ AppError::RequiredResourceNotFound(_)) => return Err(err),
                Err(err) => return Err(wrap(err.to_string())),
            }
        }
        Ok(applied)
    }

    async fn dynamic_api(
        &self,
        default_namespace: &str,
        object: &DynamicObject,
    ) -> AppResult<Api<DynamicObject>> {
        let gvk = GroupVersionKind::try_from(object.types.as_ref().ok_or_else(|| {
            AppError::Internal("missing types on DynamicObject".to_string())
        })?)
        .map_err(|e| AppError::Internal(format!("failed parsing GVK: {}", e)))?;

        // Missing CRDs surface here; the user may install them separately.
        let (ar, caps) = pinned_kind(&self.client, &gvk).await.map_err(|_| {
            AppError::RequiredResourceNotFound(format!(
                "no matches for kind {:?} in version {:?}",
                gvk.kind,
                gvk.api_version()
            ))
        })?;

        Ok(match caps.scope {
            discovery::Scope::Namespaced => {
                let namespace = object
                    .metadata
                    .namespace
                    .as_deref()
                    .unwrap_or(default_namespace);
                Api::namespaced_with(self.client.clone(), namespace, &ar)
            }
            discovery::Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        })
    }

    async fn apply(&self, default_namespace: &str, obj: DynamicObject) -> AppResult<DynamicObject> {
        // require name + type info
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| AppError::Internal("metadata.name required".to_string()))?;

        log::debug!("Applying {}/{}", default_namespace, name);
        let api = self.dynamic_api(default_namespace, &obj).await?;

        // SSA upsert
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let obj = api.patch(&name, &pp, &Patch::Apply(obj)).await?;

        Ok(obj)
    }

    async fn delete_object(&self, default_namespace: &str, obj: &DynamicObject) -> AppResult<()> {
        log::debug!(
            "Deleting {}/{}",
            obj.namespace().unwrap_or_else(|| default_namespace.to_string()),
            obj.name_any()
        );

        let api = match self.dynamic_api(default_namespace, obj).await {
            Ok(api) => api,
            // The kind is gone entirely; nothing left to delete.
            Err(AppError::RequiredResourceNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match api.delete(&obj.name_any(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(AppError::Internal(format!("failed to delete object: {}", e))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kube::api::{ObjectMeta, TypeMeta};

    fn object(kind: &str, name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".to_string(),
                kind: kind.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    fn release(status: ReleaseStatus, manifest: Vec<DynamicObject>) -> Release {
        Release {
            name: "my-bd".to_string(),
            namespace: "default".to_string(),
            version: 1,
            status,
            manifest,
        }
    }

    #[test]
    fn no_release_needs_install() {
        let state = classify(None, &[object("ConfigMap", "cm")]).unwrap();
        assert_eq!(state, ReleaseState::NeedsInstall);
    }

    #[test]
    fn identical_manifest_is_unchanged() {
        let rendered = vec![object("ConfigMap", "cm")];
        let current = release(ReleaseStatus::Deployed, rendered.clone());
        assert_eq!(
            classify(Some(&current), &rendered).unwrap(),
            ReleaseState::Unchanged
        );
    }

    #[test]
    fn drifted_manifest_needs_upgrade() {
        let current = release(ReleaseStatus::Deployed, vec![object("ConfigMap", "cm")]);
        let rendered = vec![object("ConfigMap", "cm2")];
        assert_eq!(
            classify(Some(&current), &rendered).unwrap(),
            ReleaseState::NeedsUpgrade
        );
    }

    #[test]
    fn failed_release_needs_upgrade_even_when_identical() {
        let rendered = vec![object("ConfigMap", "cm")];
        let current = release(ReleaseStatus::Failed, rendered.clone());
        assert_eq!(
            classify(Some(&current), &rendered).unwrap(),
            ReleaseState::NeedsUpgrade
        );
    }

    #[test]
    fn shared_objects_survive_a_pivot() {
        // Both revisions carry the same CRD; pivoting between them must not
        // delete it.
        let crd = object("CustomResourceDefinition", "foos.example.io");
        let current = release(
            ReleaseStatus::Deployed,
            vec![crd.clone(), object("ConfigMap", "a")],
        );
        let rendered = vec![crd.clone(), object("ConfigMap", "b")];
        let stale = stale_objects(&current, &rendered);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name_any(), "a");
    }

    #[test]
    fn namespace_participates_in_object_identity() {
        let mut a = object("ConfigMap", "cm");
        a.metadata.namespace = Some("one".to_string());
        let mut b = object("ConfigMap", "cm");
        b.metadata.namespace = Some("two".to_string());
        let current = release(ReleaseStatus::Deployed, vec![a]);
        assert_eq!(stale_objects(&current, &[b]).len(), 1);
    }
}
