use futures_util::StreamExt;
use kube::api::{Api, DynamicObject, GroupVersionKind, ResourceExt};
use kube::client::Client;
use kube::discovery::pinned_kind;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, watcher, Event};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::api::{BundleDeployment, LABEL_OWNER_KIND, LABEL_OWNER_NAME};
use crate::error::{AppError, AppResult};
use crate::hash::deep_hash;

/// Process-wide registry of dynamically watched kinds. Every GroupVersionKind
/// produced by a successful reconcile gets exactly one watcher task; drift on
/// installed objects re-enqueues the owning BundleDeployment through `tx`.
pub struct WatchRegistry {
    client: Client,
    watched: RwLock<HashSet<GroupVersionKind>>,
    tx: mpsc::UnboundedSender<ObjectRef<BundleDeployment>>,
}

impl WatchRegistry {
    pub fn new(
        client: Client,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ObjectRef<BundleDeployment>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                client,
                watched: RwLock::new(HashSet::new()),
                tx,
            }),
            rx,
        )
    }

    /// Register a watch for `gvk` unless one exists. The write lock is held
    /// through registration so two reconciles cannot double-register.
    pub async fn ensure_watch(&self, gvk: GroupVersionKind) -> AppResult<()> {
        let mut watched = self.watched.write().await;
        if watched.contains(&gvk) {
            return Ok(());
        }

        let (ar, _caps) = pinned_kind(&self.client, &gvk).await.map_err(|e| {
            AppError::Internal(format!(
                "resolving {}/{} for watch registration: {}",
                gvk.api_version(),
                gvk.kind,
                e
            ))
        })?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);

        log::info!("Registering dynamic watch for {}", gvk.kind);
        tokio::spawn(run_watch(gvk.kind.clone(), api, self.tx.clone()));
        watched.insert(gvk);
        Ok(())
    }
}

async fn run_watch(
    kind: String,
    api: Api<DynamicObject>,
    tx: mpsc::UnboundedSender<ObjectRef<BundleDeployment>>,
) {
    let mut seen: HashMap<String, u64> = HashMap::new();
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if let Some(owner) = handle_event(&mut seen, &event) {
                    if tx.send(owner).is_err() {
                        // Controller is gone; nothing to notify anymore.
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("Dynamic watch for {} hiccuped: {}", kind, e);
            }
        }
    }
}

/// Watch predicate: Create events (and the initial listing) only seed the
/// cache; spec-changing updates and deletes resolve to the owning
/// BundleDeployment.
fn handle_event(
    seen: &mut HashMap<String, u64>,
    event: &Event<DynamicObject>,
) -> Option<ObjectRef<BundleDeployment>> {
    match event {
        Event::Init | Event::InitDone => None,
        Event::InitApply(object) => {
            if let (Some(uid), Ok(hash)) = (object.uid(), sanitized_hash(object)) {
                seen.insert(uid, hash);
            }
            None
        }
        Event::Apply(object) => {
            let uid = object.uid()?;
            let hash = sanitized_hash(object).ok()?;
            match seen.insert(uid, hash) {
                // First sighting is a Create; ignore it.
                None => None,
                Some(previous) if previous == hash => None,
                Some(_) => owning_bundle_deployment(object),
            }
        }
        Event::Delete(object) => {
            if let Some(uid) = object.uid() {
                seen.remove(&uid);
            }
            owning_bundle_deployment(object)
        }
    }
}

/// Hash of the object with status and server-managed bookkeeping stripped,
/// so status-only updates compare equal.
fn sanitized_hash(object: &DynamicObject) -> AppResult<u64> {
    let mut value = serde_json::to_value(object)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        if let Some(metadata) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            metadata.remove("resourceVersion");
            metadata.remove("managedFields");
            metadata.remove("generation");
        }
    }
    deep_hash(&value)
}

/// Resolve the owning BundleDeployment: the ownership label wins, with the
/// controller owner reference as fallback.
fn owning_bundle_deployment(object: &DynamicObject) -> Option<ObjectRef<BundleDeployment>> {
    if let Some(labels) = &object.metadata.labels {
        if labels.get(LABEL_OWNER_KIND).map(String::as_str) == Some("BundleDeployment") {
            if let Some(name) = labels.get(LABEL_OWNER_NAME) {
                return Some(ObjectRef::new(name));
            }
        }
    }
    object
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|or| or.controller == Some(true) && or.kind == "BundleDeployment")
        .map(|or| ObjectRef::new(&or.name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kube::api::{ObjectMeta, TypeMeta};

    fn object(uid: &str, data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                uid: Some(uid.to_string()),
                labels: Some(
                    [
                        (LABEL_OWNER_KIND.to_string(), "BundleDeployment".to_string()),
                        (LABEL_OWNER_NAME.to_string(), "my-bd".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            data,
        }
    }

    #[test]
    fn create_events_are_ignored() {
        let mut seen = HashMap::new();
        let event = Event::Apply(object("u1", serde_json::json!({"data": {"k": "v"}})));
        assert!(handle_event(&mut seen, &event).is_none());
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn status_only_updates_are_ignored() {
        let mut seen = HashMap::new();
        let base = object("u1", serde_json::json!({"data": {"k": "v"}}));
        handle_event(&mut seen, &Event::Apply(base.clone()));

        // status lives at the top level of the serialized object
        let mut value = serde_json::to_value(&base).unwrap();
        value["status"] = serde_json::json!({"ready": true});
        let updated: DynamicObject = serde_json::from_value(value).unwrap();

        assert!(handle_event(&mut seen, &Event::Apply(updated)).is_none());
    }

    #[test]
    fn spec_changes_resolve_the_owner() {
        let mut seen = HashMap::new();
        handle_event(
            &mut seen,
            &Event::Apply(object("u1", serde_json::json!({"data": {"k": "v"}}))),
        );
        let owner = handle_event(
            &mut seen,
            &Event::Apply(object("u1", serde_json::json!({"data": {"k": "changed"}}))),
        )
        .unwrap();
        assert_eq!(owner.name, "my-bd");
    }

    #[test]
    fn deletes_always_resolve_the_owner() {
        let mut seen = HashMap::new();
        let owner = handle_event(
            &mut seen,
            &Event::Delete(object("u1", serde_json::json!({}))),
        )
        .unwrap();
        assert_eq!(owner.name, "my-bd");
    }

    #[test]
    fn owner_reference_is_the_fallback() {
        let mut obj = object("u1", serde_json::json!({}));
        obj.metadata.labels = None;
        obj.metadata.owner_references =
            Some(vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "core.bale.dev/v1alpha2".to_string(),
                kind: "BundleDeployment".to_string(),
                name: "ref-bd".to_string(),
                uid: "u2".to_string(),
                controller: Some(true),
                ..Default::default()
            }]);
        let owner = owning_bundle_deployment(&obj).unwrap();
        assert_eq!(owner.name, "ref-bd");
    }
}
