use std::path::PathBuf;

use crate::error::AppResult;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Process configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base directory for per-BundleDeployment content stores.
    pub unpack_dir: PathBuf,
    /// On-disk cache for the upload service.
    pub upload_dir: PathBuf,
    /// Listen address of the upload service.
    pub upload_addr: String,
    /// Base URL the unpackers (and contentURL consumers) reach uploads at.
    pub upload_url: String,
    /// Namespace holding unpack pods and source auth secrets.
    pub system_namespace: String,
    /// When set, image sources unpack via pods running this helper image
    /// instead of in-process registry pulls.
    pub unpack_image: Option<String>,
    /// When set, only BundleDeployments with exactly this
    /// provisionerClassName are served. Unset serves every class under the
    /// API group.
    pub provisioner_class: Option<String>,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Ok(Self {
            unpack_dir: PathBuf::from(env_or("BALE_UNPACK_DIR", "/var/cache/bale/unpack")),
            upload_dir: PathBuf::from(env_or("BALE_UPLOAD_DIR", "/var/cache/bale/uploads")),
            upload_addr: env_or("BALE_UPLOAD_ADDR", "0.0.0.0:8085"),
            upload_url: env_or("BALE_UPLOAD_URL", "http://localhost:8085"),
            system_namespace: env_or("BALE_SYSTEM_NAMESPACE", "bale-system"),
            unpack_image: std::env::var("BALE_UNPACK_IMAGE").ok().filter(|v| !v.is_empty()),
            provisioner_class: std::env::var("BALE_PROVISIONER_CLASS")
                .ok()
                .filter(|v| !v.is_empty()),
        })
    }

    /// Short provisioner name used in unpack pod prefixes.
    pub fn provisioner_short_name(&self) -> String {
        self.provisioner_class
            .as_deref()
            .and_then(|class| class.rsplit('/').next())
            .unwrap_or("bale")
            .to_string()
    }

    pub fn serves_class(&self, class: &str) -> bool {
        match &self.provisioner_class {
            Some(ours) => class == ours,
            None => class.starts_with(&format!("{}/", crate::api::GROUP)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            unpack_dir: PathBuf::from("/tmp/unpack"),
            upload_dir: PathBuf::from("/tmp/uploads"),
            upload_addr: "0.0.0.0:8085".to_string(),
            upload_url: "http://localhost:8085".to_string(),
            system_namespace: "bale-system".to_string(),
            unpack_image: None,
            provisioner_class: None,
        }
    }

    #[test]
    fn unpinned_class_serves_the_whole_group() {
        let config = base_config();
        assert!(config.serves_class("core.bale.dev/plain"));
        assert!(config.serves_class("core.bale.dev/registry"));
        assert!(!config.serves_class("other.dev/plain"));
    }

    #[test]
    fn pinned_class_is_exact() {
        let config = Config {
            provisioner_class: Some("core.bale.dev/plain".to_string()),
            ..base_config()
        };
        assert!(config.serves_class("core.bale.dev/plain"));
        assert!(!config.serves_class("core.bale.dev/registry"));
        assert_eq!(config.provisioner_short_name(), "plain");
    }
}
