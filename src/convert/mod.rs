use itertools::Itertools;
use kube::api::DynamicObject;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::error::{AppError, AppResult};
use crate::hash::generate_name;
use crate::validate::parse_manifest_file;

const SUGGESTED_NAMESPACE_ANNOTATION: &str = "operatorframework.io/suggested-namespace";
const TARGET_NAMESPACES_ANNOTATION: &str = "olm.targetNamespaces";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum InstallModeType {
    AllNamespaces,
    SingleNamespace,
    OwnNamespace,
    MultiNamespace,
}

impl InstallModeType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "AllNamespaces" => Some(Self::AllNamespaces),
            "SingleNamespace" => Some(Self::SingleNamespace),
            "OwnNamespace" => Some(Self::OwnNamespace),
            "MultiNamespace" => Some(Self::MultiNamespace),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CsvMetadata {
    name: String,
    #[serde(default)]
    annotations: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InstallMode {
    #[serde(rename = "type")]
    mode: String,
    supported: bool,
}

#[derive(Debug, Default, Deserialize)]
struct StrategyDeploymentSpec {
    name: String,
    #[serde(default)]
    label: Option<std::collections::BTreeMap<String, String>>,
    spec: Value,
}

#[derive(Clone, Debug, Default, Deserialize, serde::Serialize)]
struct StrategyDeploymentPermissions {
    #[serde(rename = "serviceAccountName")]
    service_account_name: String,
    #[serde(default)]
    rules: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct StrategyDetails {
    #[serde(default)]
    deployments: Vec<StrategyDeploymentSpec>,
    #[serde(default)]
    permissions: Vec<StrategyDeploymentPermissions>,
    #[serde(default, rename = "clusterPermissions")]
    cluster_permissions: Vec<StrategyDeploymentPermissions>,
}

#[derive(Debug, Deserialize)]
struct InstallStrategy {
    #[serde(default)]
    spec: Option<StrategyDetails>,
}

#[derive(Debug, Deserialize)]
struct CsvSpec {
    install: InstallStrategy,
    #[serde(default, rename = "installModes")]
    install_modes: Vec<InstallMode>,
}

#[derive(Debug, Deserialize)]
struct ClusterServiceVersion {
    metadata: CsvMetadata,
    spec: CsvSpec,
}

/// Expand a registry-format bundle (ClusterServiceVersion + CRDs + side
/// objects) into plain manifests honoring install-mode semantics.
///
/// `install_namespace` may be empty, in which case the CSV's
/// suggested-namespace annotation decides. `target_namespaces` of `None`
/// derives targets from the supported install modes.
pub fn registry_to_plain(
    root: &Path,
    install_namespace: &str,
    target_namespaces: Option<Vec<String>>,
) -> AppResult<Vec<DynamicObject>> {
    let mut csv: Option<(Value, ClusterServiceVersion)> = None;
    let mut crds = Vec::new();
    let mut passthrough = Vec::new();

    let manifest_dir = if root.join("manifests").is_dir() {
        root.join("manifests")
    } else {
        root.to_path_buf()
    };

    let mut entries: Vec<_> = fs::read_dir(&manifest_dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        for object in parse_manifest_file(&entry.path())? {
            let kind = object
                .types
                .as_ref()
                .map(|t| t.kind.clone())
                .unwrap_or_default();
            match kind.as_str() {
                "ClusterServiceVersion" => {
                    if csv.is_some() {
                        return Err(AppError::Conversion(
                            "registry bundle contains more than one ClusterServiceVersion"
                                .to_string(),
                        ));
                    }
                    let raw = serde_json::to_value(&object)?;
                    let parsed: ClusterServiceVersion = serde_json::from_value(raw.clone())
                        .map_err(|e| {
                            AppError::Conversion(format!("malformed ClusterServiceVersion: {}", e))
                        })?;
                    csv = Some((raw, parsed));
                }
                "CustomResourceDefinition" => crds.push(object),
                _ => passthrough.push(object),
            }
        }
    }

    let Some((_, csv)) = csv else {
        return Err(AppError::Conversion(
            "registry bundle contains no ClusterServiceVersion".to_string(),
        ));
    };

    let install_namespace = if !install_namespace.is_empty() {
        install_namespace.to_string()
    } else {
        csv.metadata
            .annotations
            .get(SUGGESTED_NAMESPACE_ANNOTATION)
            .cloned()
            .ok_or_else(|| {
                AppError::Conversion("unable to detect install namespace".to_string())
            })?
    };

    let supported: BTreeSet<InstallModeType> = csv
        .spec
        .install_modes
        .iter()
        .filter(|m| m.supported)
        .filter_map(|m| InstallModeType::parse(&m.mode))
        .collect();

    let target_namespaces = match target_namespaces {
        Some(targets) => targets,
        None if supported.contains(&InstallModeType::AllNamespaces) => Vec::new(),
        None if supported.contains(&InstallModeType::OwnNamespace) => {
            vec![install_namespace.clone()]
        }
        None => {
            return Err(AppError::Conversion(
                "unable to derive target namespaces from the supported install modes".to_string(),
            ))
        }
    };
    validate_target_namespaces(&supported, &install_namespace, &target_namespaces)?;

    let strategy = csv.spec.install.spec.unwrap_or_default();
    let csv_name = csv.metadata.name.clone();

    // In AllNamespaces mode there is no namespace to scope a Role to, so
    // namespaced permissions are promoted to cluster scope.
    let all_namespaces = target_namespaces.is_empty()
        || (target_namespaces.len() == 1 && target_namespaces[0].is_empty());
    let (permissions, cluster_permissions) = if all_namespaces {
        (Vec::new(), {
            let mut promoted = strategy.cluster_permissions.clone();
            promoted.extend(strategy.permissions.clone());
            promoted
        })
    } else {
        (
            strategy.permissions.clone(),
            strategy.cluster_permissions.clone(),
        )
    };

    let mut service_accounts: BTreeSet<String> = BTreeSet::new();
    let mut roles = Vec::new();
    let mut role_bindings = Vec::new();
    let mut cluster_roles = Vec::new();
    let mut cluster_role_bindings = Vec::new();
    let mut deployments = Vec::new();

    for permission in &permissions {
        service_accounts.insert(permission.service_account_name.clone());
        let name = rbac_name(&csv_name, permission)?;
        for namespace in target_namespaces.iter().filter(|ns| !ns.is_empty()) {
            roles.push(dynamic(json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "Role",
                "metadata": { "name": name, "namespace": namespace },
                "rules": permission.rules,
            }))?);
            role_bindings.push(dynamic(json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "RoleBinding",
                "metadata": { "name": name, "namespace": namespace },
                "roleRef": {
                    "apiGroup": "rbac.authorization.k8s.io",
                    "kind": "Role",
                    "name": name,
                },
                "subjects": [{
                    "kind": "ServiceAccount",
                    "name": permission.service_account_name,
                    "namespace": install_namespace,
                }],
            }))?);
        }
    }

    for permission in &cluster_permissions {
        service_accounts.insert(permission.service_account_name.clone());
        let name = rbac_name(&csv_name, permission)?;
        cluster_roles.push(dynamic(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": { "name": name },
            "rules": permission.rules,
        }))?);
        cluster_role_bindings.push(dynamic(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": { "name": name },
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": name,
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": permission.service_account_name,
                "namespace": install_namespace,
            }],
        }))?);
    }

    for deployment in &strategy.deployments {
        if let Some(sa) = deployment
            .spec
            .pointer("/template/spec/serviceAccountName")
            .and_then(Value::as_str)
        {
            service_accounts.insert(sa.to_string());
        }
        deployments.push(dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": deployment.name,
                "namespace": install_namespace,
                "labels": deployment.label.clone().unwrap_or_default(),
                "annotations": {
                    TARGET_NAMESPACES_ANNOTATION: target_namespaces.iter().join(","),
                },
            },
            "spec": deployment.spec,
        }))?);
    }

    // The builtin service account already exists in every namespace.
    service_accounts.remove("default");
    let service_accounts: Vec<DynamicObject> = service_accounts
        .into_iter()
        .map(|name| {
            dynamic(json!({
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": { "name": name, "namespace": install_namespace },
            }))
        })
        .collect::<AppResult<_>>()?;

    // Apply order: CRDs and rbac wiring before the workloads that need them.
    let mut objects = Vec::new();
    objects.extend(crds);
    objects.extend(service_accounts);
    objects.extend(cluster_roles);
    objects.extend(cluster_role_bindings);
    objects.extend(roles);
    objects.extend(role_bindings);
    objects.extend(deployments);
    objects.extend(passthrough);
    Ok(objects)
}

fn validate_target_namespaces(
    supported: &BTreeSet<InstallModeType>,
    install_namespace: &str,
    targets: &[String],
) -> AppResult<()> {
    let all = supported.contains(&InstallModeType::AllNamespaces);
    let single = supported.contains(&InstallModeType::SingleNamespace);
    let own = supported.contains(&InstallModeType::OwnNamespace);
    let multi = supported.contains(&InstallModeType::MultiNamespace);

    let ok = match targets {
        [] => all,
        [ns] if ns.is_empty() => all,
        [ns] => single || (own && ns == install_namespace),
        _ => multi,
    };
    if ok {
        Ok(())
    } else {
        Err(AppError::Conversion(format!(
            "supported install modes do not permit target namespaces {:?} with install namespace {:?}",
            targets, install_namespace
        )))
    }
}

/// Stable name for generated rbac objects: identical CSV + permission input
/// always produces the identical name.
fn rbac_name(csv_name: &str, permission: &StrategyDeploymentPermissions) -> AppResult<String> {
    generate_name(
        &format!("{}-{}", csv_name, permission.service_account_name),
        &json!({ "csvName": csv_name, "permission": permission }),
    )
}

fn dynamic(value: Value) -> AppResult<DynamicObject> {
    Ok(serde_json::from_value(value)?)
}
