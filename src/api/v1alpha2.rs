use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Bundle formats this provisioner understands.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BundleFormat {
    Plain,
    Registry,
    Helm,
}

impl std::fmt::Display for BundleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleFormat::Plain => write!(f, "plain"),
            BundleFormat::Registry => write!(f, "registry"),
            BundleFormat::Helm => write!(f, "helm"),
        }
    }
}

/// Image source: an OCI artifact holding the bundle filesystem.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Image reference, e.g. `example.io/bundle:v1` or a pinned
    /// `example.io/bundle@sha256:<hex>` digest form.
    #[serde(rename = "ref")]
    pub image_ref: String,
    /// Name of a dockerconfigjson secret in the system namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// Exactly one of the fields must be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitAuth {
    /// Secret holding `username`/`password` for http(s) remotes or
    /// `ssh-privatekey`/`ssh-knownhosts` for ssh remotes.
    pub secret: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub repository: String,
    #[serde(rename = "ref")]
    pub git_ref: GitRef,
    /// Subdirectory of the repository to materialize. Must not escape the
    /// repository root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<GitAuth>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpAuth {
    /// Secret holding either `token` (bearer) or `username`/`password`.
    pub secret: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpSource {
    /// URL of a `.tar.gz` holding the bundle filesystem.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HttpAuth>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSourceItem {
    /// Name of an immutable configMap in the system namespace.
    pub name: String,
    /// Relative destination directory inside the bundle filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Where to fetch bundle content from. A closed set: adding a kind means a
/// new variant, a new unpacker, and a new pinning case.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BundleSource {
    Image { image: ImageSource },
    Git { git: GitSource },
    Http { http: HttpSource },
    #[serde(rename_all = "camelCase")]
    ConfigMaps { config_maps: Vec<ConfigMapSourceItem> },
    Upload {},
}

impl BundleSource {
    /// The wire-level `kind` tag, used as the dispatcher key.
    pub fn kind(&self) -> &'static str {
        match self {
            BundleSource::Image { .. } => "image",
            BundleSource::Git { .. } => "git",
            BundleSource::Http { .. } => "http",
            BundleSource::ConfigMaps { .. } => "configMaps",
            BundleSource::Upload {} => "upload",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedGitRef {
    pub commit: String,
}

/// A source pinned to immutable content.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResolvedSource {
    #[serde(rename_all = "camelCase")]
    Image {
        /// Always the digest form `repo@sha256:<hex>`.
        #[serde(rename = "ref")]
        image_ref: String,
    },
    #[serde(rename_all = "camelCase")]
    Git {
        repository: String,
        #[serde(rename = "ref")]
        git_ref: ResolvedGitRef,
    },
    #[serde(rename_all = "camelCase")]
    Http { url: String, digest: String },
    #[serde(rename_all = "camelCase")]
    ConfigMaps { config_map_uids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Upload { digest: String },
}

/// The part of a BundleDeployment spec that determines the generated Bundle.
/// Hashing this must be deterministic: identical templates, identical names.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleTemplate {
    pub format: BundleFormat,
    pub sources: Vec<BundleSource>,
}

/// The BundleDeployment CustomResource: declarative intent to install a
/// packaged application.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize)]
#[kube(
    group = "core.bale.dev",
    version = "v1alpha2",
    kind = "BundleDeployment",
    shortname = "bd",
    schema = "disabled",
    status = "BundleDeploymentStatus",
    printcolumn = r#"{"name":"Active Bundle", "jsonPath":".status.activeBundle", "type":"string"}"#,
    printcolumn = r#"{"name":"Install State", "jsonPath":".status.conditions[?(@.type==\"Installed\")].reason", "type":"string"}"#,
    printcolumn = r#"{"name":"Age", "jsonPath":".metadata.creationTimestamp", "type":"date"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    /// Selector deciding which provisioner process serves this object.
    pub provisioner_class_name: String,
    pub format: BundleFormat,
    /// Ordered, non-empty. Later sources materialize over earlier ones.
    pub sources: Vec<BundleSource>,
    #[serde(default)]
    pub paused: bool,
    /// Namespace the release is tracked and installed in.
    pub install_namespace: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Name of the most recently materialized Bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_bundle: Option<String>,
    /// Name of the Bundle the on-cluster release was produced from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_bundle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl BundleDeployment {
    /// The source template the generated Bundle is named after.
    pub fn template(&self) -> BundleTemplate {
        BundleTemplate {
            format: self.spec.format,
            sources: self.spec.sources.clone(),
        }
    }
}

/// The generated, content-addressed snapshot of a BundleDeployment's sources.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize)]
#[kube(
    group = "core.bale.dev",
    version = "v1alpha2",
    kind = "Bundle",
    schema = "disabled",
    status = "BundleStatus",
    printcolumn = r#"{"name":"Phase", "jsonPath":".status.phase", "type":"string"}"#,
    printcolumn = r#"{"name":"Digest", "jsonPath":".status.digest", "type":"string"}"#,
    printcolumn = r#"{"name":"Age", "jsonPath":".metadata.creationTimestamp", "type":"date"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    pub provisioner_class_name: String,
    pub format: BundleFormat,
    pub sources: Vec<BundleSource>,
}

/// One object referenced by an unpacked bundle's manifests.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<BundleObject>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Pinned view of every source, in spec order. Non-empty once Unpacked.
    #[serde(
        rename = "resolvedSource",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub resolved_source: Vec<ResolvedSource>,
    /// sha256 over the materialized tree (sorted-path traversal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Where the unpacked archive can be fetched back from, when the upload
    /// service is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<BundleInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Bundle {
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }
}

/// Admission-grade checks the reconciler re-runs since the webhook surface
/// lives outside this repository. Violations are terminal.
pub fn validate_bundle_deployment(
    name: &str,
    spec: &BundleDeploymentSpec,
) -> AppResult<()> {
    if name.len() > super::MAX_BUNDLE_DEPLOYMENT_NAME_LEN {
        return Err(AppError::InvalidInput(format!(
            "metadata.name {:?} exceeds the maximum length of {} characters",
            name,
            super::MAX_BUNDLE_DEPLOYMENT_NAME_LEN
        )));
    }
    if spec.sources.is_empty() {
        return Err(AppError::InvalidInput(
            "spec.sources must contain at least one source".to_string(),
        ));
    }
    if spec.install_namespace.is_empty() {
        return Err(AppError::InvalidInput(
            "spec.installNamespace must not be empty".to_string(),
        ));
    }
    for (i, source) in spec.sources.iter().enumerate() {
        if let BundleSource::Git { git } = source {
            let set = [
                git.git_ref.branch.is_some(),
                git.git_ref.tag.is_some(),
                git.git_ref.commit.is_some(),
            ]
            .iter()
            .filter(|b| **b)
            .count();
            if set != 1 {
                return Err(AppError::InvalidInput(format!(
                    "spec.sources[{}].git.ref must set exactly one of branch, tag or commit",
                    i
                )));
            }
        }
    }
    Ok(())
}

pub fn validate_bundle_name(name: &str) -> AppResult<()> {
    if name.len() > super::MAX_BUNDLE_NAME_LEN {
        return Err(AppError::InvalidInput(format!(
            "bundle name {:?} exceeds the maximum length of {} characters",
            name,
            super::MAX_BUNDLE_NAME_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spec_with_sources(sources: Vec<BundleSource>) -> BundleDeploymentSpec {
        BundleDeploymentSpec {
            provisioner_class_name: "core.bale.dev/plain".to_string(),
            format: BundleFormat::Plain,
            sources,
            paused: false,
            install_namespace: "default".to_string(),
        }
    }

    fn git_source(git_ref: GitRef) -> BundleSource {
        BundleSource::Git {
            git: GitSource {
                repository: "https://example.com/repo.git".to_string(),
                git_ref,
                directory: None,
                auth: None,
            },
        }
    }

    #[test]
    fn source_round_trips_with_kind_tag() {
        let source = BundleSource::Image {
            image: ImageSource {
                image_ref: "example.io/bundle:v1".to_string(),
                pull_secret: None,
                insecure_skip_tls_verify: false,
            },
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["kind"], "image");
        assert_eq!(json["image"]["ref"], "example.io/bundle:v1");
        let back: BundleSource = serde_json::from_value(json).unwrap();
        assert_eq!(back, source);
    }

    #[test]
    fn resolved_git_source_pins_a_commit_only() {
        let resolved = ResolvedSource::Git {
            repository: "https://example.com/repo.git".to_string(),
            git_ref: ResolvedGitRef {
                commit: "c0ffee0000000000000000000000000000000000".to_string(),
            },
        };
        let json = serde_json::to_value(&resolved).unwrap();
        assert_eq!(
            json["ref"]["commit"],
            "c0ffee0000000000000000000000000000000000"
        );
        assert!(json["ref"].get("branch").is_none());
    }

    #[test]
    fn git_ref_requires_exactly_one_subfield() {
        let none = spec_with_sources(vec![git_source(GitRef::default())]);
        assert!(validate_bundle_deployment("a", &none).is_err());

        let two = spec_with_sources(vec![git_source(GitRef {
            branch: Some("main".to_string()),
            tag: Some("v1".to_string()),
            commit: None,
        })]);
        assert!(validate_bundle_deployment("a", &two).is_err());

        let one = spec_with_sources(vec![git_source(GitRef {
            branch: Some("main".to_string()),
            ..Default::default()
        })]);
        assert!(validate_bundle_deployment("a", &one).is_ok());
    }

    #[test]
    fn name_length_limits() {
        let spec = spec_with_sources(vec![BundleSource::Upload {}]);
        let long = "x".repeat(46);
        assert!(validate_bundle_deployment(&long, &spec).is_err());
        let ok = "x".repeat(45);
        assert!(validate_bundle_deployment(&ok, &spec).is_ok());

        assert!(validate_bundle_name(&"b".repeat(53)).is_err());
        assert!(validate_bundle_name(&"b".repeat(52)).is_ok());
    }
}
