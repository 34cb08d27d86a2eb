use futures_util::StreamExt;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::{controller::Action, watcher, Controller};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{Bundle, BundleDeployment};
use crate::config::Config;
use crate::deploy::Deployer;
use crate::error::{AppError, AppResult};
use crate::store::ContentStore;
use crate::unpack::CompositeUnpacker;

pub mod conditions;
pub mod reconciler;
pub mod watch;

use watch::WatchRegistry;

/// Context shared by every reconcile.
pub struct Context {
    pub client: Client,
    pub config: Config,
    pub unpacker: CompositeUnpacker,
    pub deployer: Deployer,
    pub watches: Arc<WatchRegistry>,
    /// Content stores are created once per BundleDeployment per process
    /// lifetime; recreating one wipes the image digest cache.
    stores: tokio::sync::Mutex<HashMap<String, ContentStore>>,
    /// Consecutive error counts per key, feeding the requeue backoff.
    error_counts: Mutex<HashMap<String, u32>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: Config,
        unpacker: CompositeUnpacker,
        watches: Arc<WatchRegistry>,
    ) -> Self {
        let deployer = Deployer::new(client.clone());
        Self {
            client,
            config,
            unpacker,
            deployer,
            watches,
            stores: tokio::sync::Mutex::new(HashMap::new()),
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn store_for(&self, name: &str) -> AppResult<ContentStore> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(name) {
            return Ok(store.clone());
        }
        let store = ContentStore::create(&self.config.unpack_dir, name)?;
        stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    pub async fn drop_store(&self, name: &str) {
        self.stores.lock().await.remove(name);
        let scope = self.config.unpack_dir.join(name);
        if scope.exists() {
            if let Err(e) = std::fs::remove_dir_all(&scope) {
                log::warn!("Failed to remove content store for {}: {}", name, e);
            }
        }
    }

    /// Exponential backoff on consecutive errors for one key, capped at
    /// five minutes.
    pub fn backoff_for(&self, key: &str) -> Duration {
        let mut counts = self.error_counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        backoff_delay(*count)
    }

    pub fn clear_backoff(&self, key: &str) {
        self.error_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Delay for the n-th consecutive failure: 250ms doubling up to five minutes.
fn backoff_delay(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(11);
    let millis = 250u64.saturating_mul(1u64 << exponent);
    Duration::from_millis(millis.min(300_000))
}

/// Build the source-kind dispatch table for this process.
pub fn default_unpacker(client: Client, config: &Config) -> CompositeUnpacker {
    let ns = config.system_namespace.clone();
    let image: Arc<dyn crate::unpack::Unpacker> = match &config.unpack_image {
        Some(unpack_image) => Arc::new(crate::unpack::pod::PodUnpacker::new(
            client.clone(),
            ns.clone(),
            config.provisioner_short_name(),
            unpack_image.clone(),
        )),
        None => Arc::new(crate::unpack::image::ImageUnpacker::new(
            client.clone(),
            ns.clone(),
        )),
    };

    let mut composite = CompositeUnpacker::new()
        .register("image", image)
        .register(
            "git",
            Arc::new(crate::unpack::git::GitUnpacker::new(client.clone(), ns.clone())),
        )
        .register(
            "http",
            Arc::new(crate::unpack::http::HttpUnpacker::new(
                client.clone(),
                ns.clone(),
            )),
        )
        .register(
            "configMaps",
            Arc::new(crate::unpack::configmaps::ConfigMapsUnpacker::new(
                client.clone(),
                ns,
            )),
        );
    match crate::unpack::upload::UploadUnpacker::new(&config.upload_url) {
        Ok(upload) => composite = composite.register("upload", Arc::new(upload)),
        Err(e) => log::warn!("Upload unpacker unavailable: {}", e),
    }
    composite
}

/// Error handler for the controller
fn error_policy(bd: Arc<BundleDeployment>, error: &AppError, ctx: Arc<Context>) -> Action {
    let name = bd.metadata.name.clone().unwrap_or_default();
    if error.is_terminal() {
        log::error!(
            "Reconciliation of {} hit a terminal error, waiting for a spec change: {}",
            name,
            error
        );
        return Action::await_change();
    }
    let delay = ctx.backoff_for(&name);
    log::warn!(
        "Error during reconciliation of {} (retry in {:?}): {}",
        name,
        delay,
        crate::error::format_error_chain(error)
    );
    Action::requeue(delay)
}

/// Start the BundleDeployment controller
pub async fn run(client: Client, config: Config) -> AppResult<()> {
    let (watches, requeue_rx) = WatchRegistry::new(client.clone());
    let unpacker = default_unpacker(client.clone(), &config);
    let context = Arc::new(Context::new(client.clone(), config, unpacker, watches));

    let bundle_deployments: Api<BundleDeployment> = Api::all(client.clone());
    let bundles: Api<Bundle> = Api::all(client.clone());

    // Drift notifications from dynamically watched kinds re-enqueue the
    // owning BundleDeployment.
    let trigger = futures_util::stream::unfold(requeue_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    log::info!("Starting BundleDeployment controller");

    Controller::new(bundle_deployments, watcher::Config::default())
        .owns(bundles, watcher::Config::default())
        .reconcile_on(trigger)
        .run(reconciler::reconcile, error_policy, context)
        .for_each(|res| async move {
            match res {
                Ok(o) => log::debug!("Reconciliation completed: {:?}", o),
                Err(e) => log::error!("Reconciliation error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_a_quarter_second() {
        assert_eq!(backoff_delay(1), Duration::from_millis(250));
        assert_eq!(backoff_delay(2), Duration::from_millis(500));
        assert_eq!(backoff_delay(3), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_caps_at_five_minutes() {
        assert_eq!(backoff_delay(11), Duration::from_secs(256));
        assert_eq!(backoff_delay(12), Duration::from_secs(300));
        assert_eq!(backoff_delay(60), Duration::from_secs(300));
    }

    #[test]
    fn terminal_errors_do_not_requeue() {
        assert!(AppError::MaxGeneratedLimit(4).is_terminal());
        assert!(!AppError::Install("boom".to_string()).is_terminal());
    }
}
