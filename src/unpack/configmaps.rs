use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::Api, client::Client};
use std::fs;
use std::path::Path;

use crate::api::{Bundle, BundleSource, ConfigMapSourceItem, ResolvedSource};
use crate::error::{AppError, AppResult};
use crate::store::{clean_destination, ContentStore};
use crate::unpack::{UnpackResult, Unpacker};

/// Materializes the keys of immutable configMaps into the bundle filesystem.
/// Mutable configMaps are rejected: the pin is the configMap UID, which only
/// identifies fixed content when the API server refuses further edits.
pub struct ConfigMapsUnpacker {
    client: Client,
    namespace: String,
}

impl ConfigMapsUnpacker {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn write_keys(&self, cm: &ConfigMap, dir: &Path) -> AppResult<()> {
        fs::create_dir_all(dir)?;
        if let Some(data) = &cm.data {
            for (key, value) in data {
                let rel = clean_destination(key)?;
                fs::write(dir.join(rel), value)?;
            }
        }
        if let Some(binary) = &cm.binary_data {
            for (key, value) in binary {
                let rel = clean_destination(key)?;
                fs::write(dir.join(rel), &value.0)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Unpacker for ConfigMapsUnpacker {
    async fn unpack(
        &self,
        _bundle: &Bundle,
        source: &BundleSource,
        store: &ContentStore,
    ) -> AppResult<UnpackResult> {
        let BundleSource::ConfigMaps { config_maps } = source else {
            panic!("configMaps unpacker invoked on source kind {:?}", source.kind());
        };

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut uids = Vec::with_capacity(config_maps.len());

        for item in config_maps {
            let ConfigMapSourceItem { name, path } = item;
            let cm = api.get(name).await?;

            if cm.immutable != Some(true) {
                return Err(AppError::unrecoverable(AppError::InvalidInput(format!(
                    "configMap {}/{} must be immutable",
                    self.namespace, name
                ))));
            }
            let uid = cm.metadata.uid.clone().ok_or_else(|| {
                AppError::Internal(format!("configMap {} has no uid", name))
            })?;

            let dest = store.resolve(path.as_deref().unwrap_or(""))?;
            self.write_keys(&cm, &dest)?;
            uids.push(uid);
        }

        uids.sort();
        Ok(UnpackResult::unpacked(
            ResolvedSource::ConfigMaps {
                config_map_uids: uids,
            },
            "configMap keys materialized",
        ))
    }
}
