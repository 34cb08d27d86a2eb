mod api;
mod config;
mod controller;
mod convert;
mod deploy;
mod error;
mod hash;
mod store;
mod unpack;
mod upload;
mod validate;

use crate::config::Config;

#[actix_web::main]
#[allow(clippy::expect_used)]
async fn main() -> std::io::Result<()> {
    // Configure logger with custom filter levels for the noisy modules
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .filter_module("kube_runtime::controller", log::LevelFilter::Warn) // logs every reconciliation at info level
        .filter_module("actix_web::middleware::logger", log::LevelFilter::Warn)
        .filter_module("bale::controller", log::LevelFilter::Info)
        .filter_module("bale::unpack", log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = Config::from_env().expect("Failed to read configuration");
    log::info!(
        "Provisioner starting (system namespace {}, unpack dir {:?})",
        config.system_namespace,
        config.unpack_dir
    );

    let client = kube::Client::try_default()
        .await
        .expect("Failed to initialize Kubernetes client");

    tokio::select! {
        result = Box::pin(controller::run(client.clone(), config.clone())) => {
            if let Err(e) = result {
                log::error!("Controller exited: {}", e);
            }
        }
        result = Box::pin(upload::run(
            client.clone(),
            config.upload_dir.clone(),
            &config.upload_addr,
        )) => {
            if let Err(e) = result {
                log::error!("Upload service exited: {}", e);
            }
        }
    }

    Ok(())
}
