use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::{Bundle, BundleSource, ResolvedSource};
use crate::error::{AppError, AppResult};
use crate::store::ContentStore;

pub mod configmaps;
pub mod git;
pub mod http;
pub mod image;
pub mod pod;
pub mod upload;

/// Where a source currently is on its way into the content store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnpackState {
    /// Content is not available yet (image pull pending, upload not yet
    /// received, ...). Requeue and ask again.
    Pending,
    /// Content is actively being fetched.
    Unpacking,
    /// Content is fully materialized and pinned.
    Unpacked,
}

/// Outcome of unpacking a single source.
#[derive(Debug)]
pub struct UnpackResult {
    pub state: UnpackState,
    /// Present iff `state == Unpacked`.
    pub resolved: Option<ResolvedSource>,
    pub message: String,
    /// Filesystem produced for this source, when it lives somewhere other
    /// than the store root (the image unpacker keeps a digest-keyed cache).
    pub root: Option<PathBuf>,
}

impl UnpackResult {
    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            state: UnpackState::Pending,
            resolved: None,
            message: message.into(),
            root: None,
        }
    }

    pub fn unpacking(message: impl Into<String>) -> Self {
        Self {
            state: UnpackState::Unpacking,
            resolved: None,
            message: message.into(),
            root: None,
        }
    }

    pub fn unpacked(resolved: ResolvedSource, message: impl Into<String>) -> Self {
        Self {
            state: UnpackState::Unpacked,
            resolved: Some(resolved),
            message: message.into(),
            root: None,
        }
    }

    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = Some(root);
        self
    }
}

/// Look up a key in a Secret's data, decoding it as UTF-8.
pub(crate) fn secret_value(
    secret: &k8s_openapi::api::core::v1::Secret,
    key: &str,
) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .cloned()
        })
}

/// One source kind's fetch strategy.
#[async_trait]
pub trait Unpacker: Send + Sync {
    async fn unpack(
        &self,
        bundle: &Bundle,
        source: &BundleSource,
        store: &ContentStore,
    ) -> AppResult<UnpackResult>;
}

/// Aggregate outcome over every source of a Bundle.
#[derive(Debug)]
pub struct CompositeResult {
    pub state: UnpackState,
    pub resolved: Vec<ResolvedSource>,
    pub message: String,
    /// Root of the materialized bundle filesystem once fully unpacked.
    pub root: Option<PathBuf>,
}

/// Dispatches each source to the unpacker registered for its kind.
pub struct CompositeUnpacker {
    unpackers: HashMap<&'static str, Arc<dyn Unpacker>>,
}

impl CompositeUnpacker {
    pub fn new() -> Self {
        Self {
            unpackers: HashMap::new(),
        }
    }

    pub fn register(mut self, kind: &'static str, unpacker: Arc<dyn Unpacker>) -> Self {
        self.unpackers.insert(kind, unpacker);
        self
    }

    /// Unpack every source in spec order. The first source that is not yet
    /// Unpacked decides the aggregate state; sources after it are not
    /// touched, so a slow image pull cannot mask a later failure forever.
    pub async fn unpack(&self, bundle: &Bundle, store: &ContentStore) -> AppResult<CompositeResult> {
        let mut resolved = Vec::with_capacity(bundle.spec.sources.len());
        let mut roots: Vec<Option<PathBuf>> = Vec::with_capacity(bundle.spec.sources.len());
        let mut message = String::new();

        for source in &bundle.spec.sources {
            let unpacker = self
                .unpackers
                .get(source.kind())
                .ok_or_else(|| AppError::SourceTypeUnsupported(source.kind().to_string()))?;
            let result = unpacker.unpack(bundle, source, store).await?;
            match result.state {
                UnpackState::Unpacked => {
                    let pinned = result.resolved.ok_or_else(|| {
                        AppError::Internal(format!(
                            "unpacker for {:?} reported Unpacked without a resolved source",
                            source.kind()
                        ))
                    })?;
                    resolved.push(pinned);
                    roots.push(result.root);
                    message = result.message;
                }
                state => {
                    return Ok(CompositeResult {
                        state,
                        resolved: Vec::new(),
                        message: result.message,
                        root: None,
                    })
                }
            }
        }

        // Single-source bundles materialize wherever their unpacker put them.
        // Multi-source bundles layer every displaced root onto the store root
        // in spec order.
        let root = if roots.len() == 1 {
            match roots.pop().flatten() {
                Some(root) => root,
                None => store.root().to_path_buf(),
            }
        } else {
            for displaced in roots.into_iter().flatten() {
                store.copy_dir(&displaced, "")?;
            }
            store.root().to_path_buf()
        };

        Ok(CompositeResult {
            state: UnpackState::Unpacked,
            resolved,
            message,
            root: Some(root),
        })
    }
}

impl Default for CompositeUnpacker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::api::{BundleFormat, BundleSpec, BundleStatus};
    use kube::core::ObjectMeta;

    struct StaticUnpacker(UnpackState);

    #[async_trait]
    impl Unpacker for StaticUnpacker {
        async fn unpack(
            &self,
            _bundle: &Bundle,
            _source: &BundleSource,
            _store: &ContentStore,
        ) -> AppResult<UnpackResult> {
            Ok(match self.0 {
                UnpackState::Pending => UnpackResult::pending("waiting"),
                UnpackState::Unpacking => UnpackResult::unpacking("fetching"),
                UnpackState::Unpacked => UnpackResult::unpacked(
                    ResolvedSource::Upload {
                        digest: "sha256:abc".to_string(),
                    },
                    "done",
                ),
            })
        }
    }

    fn bundle(sources: Vec<BundleSource>) -> Bundle {
        Bundle {
            metadata: ObjectMeta {
                name: Some("bd-abc123".to_string()),
                ..Default::default()
            },
            spec: BundleSpec {
                provisioner_class_name: "core.bale.dev/plain".to_string(),
                format: BundleFormat::Plain,
                sources,
            },
            status: Some(BundleStatus::default()),
        }
    }

    fn store(name: &str) -> ContentStore {
        let base = std::env::temp_dir().join(format!("bale-unpack-{}", std::process::id()));
        ContentStore::create(&base, name).unwrap()
    }

    #[tokio::test]
    async fn unknown_kind_is_unsupported() {
        let composite = CompositeUnpacker::new();
        let err = composite
            .unpack(&bundle(vec![BundleSource::Upload {}]), &store("unknown"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SourceTypeUnsupported(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn pending_source_short_circuits() {
        let composite = CompositeUnpacker::new()
            .register("upload", Arc::new(StaticUnpacker(UnpackState::Pending)));
        let result = composite
            .unpack(&bundle(vec![BundleSource::Upload {}]), &store("pending"))
            .await
            .unwrap();
        assert_eq!(result.state, UnpackState::Pending);
        assert!(result.resolved.is_empty());
        assert!(result.root.is_none());
    }

    #[tokio::test]
    async fn unpacked_sources_collect_pins_in_order() {
        let composite = CompositeUnpacker::new()
            .register("upload", Arc::new(StaticUnpacker(UnpackState::Unpacked)));
        let store = store("order");
        let result = composite
            .unpack(
                &bundle(vec![BundleSource::Upload {}, BundleSource::Upload {}]),
                &store,
            )
            .await
            .unwrap();
        assert_eq!(result.state, UnpackState::Unpacked);
        assert_eq!(result.resolved.len(), 2);
        assert_eq!(result.root.as_deref(), Some(store.root()));
    }
}
