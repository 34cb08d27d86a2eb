use kube::api::DynamicObject;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::api::BundleFormat;
use crate::convert;
use crate::error::{AppError, AppResult};

/// Validate a materialized bundle filesystem against its declared format.
/// Errors become the `Validated` condition message.
pub fn validate(format: BundleFormat, root: &Path, install_namespace: &str) -> AppResult<()> {
    match format {
        BundleFormat::Plain => validate_plain(root),
        // Registry bundles are valid iff they convert to a valid plain set.
        BundleFormat::Registry => {
            let objects = convert::registry_to_plain(root, install_namespace, None)?;
            if objects.is_empty() {
                return Err(AppError::Validation(
                    "registry bundle converted to an empty object set".to_string(),
                ));
            }
            Ok(())
        }
        BundleFormat::Helm => {
            chart_root(root)?;
            Ok(())
        }
    }
}

/// Produce the desired object set for the deployer.
pub fn materialize(
    format: BundleFormat,
    root: &Path,
    install_namespace: &str,
) -> AppResult<Vec<DynamicObject>> {
    match format {
        BundleFormat::Plain => load_manifest_dir(&root.join("manifests")),
        BundleFormat::Registry => convert::registry_to_plain(root, install_namespace, None),
        BundleFormat::Helm => load_chart_manifests(root),
    }
}

fn validate_plain(root: &Path) -> AppResult<()> {
    let manifests = root.join("manifests");
    if !manifests.is_dir() {
        return Err(AppError::Validation(
            "plain bundle must contain a manifests/ directory at the root".to_string(),
        ));
    }

    let mut files = 0usize;
    for entry in fs::read_dir(&manifests)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            return Err(AppError::Validation(format!(
                "subdirectories are not allowed in manifests/: found {:?}",
                entry.file_name()
            )));
        }
        let objects = parse_manifest_file(&entry.path())?;
        if objects.is_empty() {
            return Err(AppError::Validation(format!(
                "manifest {:?} contains no objects",
                entry.file_name()
            )));
        }
        files += 1;
    }

    if files == 0 {
        return Err(AppError::Validation(
            "manifests/ contains no manifest files".to_string(),
        ));
    }
    Ok(())
}

/// Helm bundles are either the chart directory itself (Chart.yaml at the
/// root, as produced by uploads from inside a chart) or a single directory
/// holding the chart.
fn chart_root(root: &Path) -> AppResult<PathBuf> {
    if root.join("Chart.yaml").is_file() {
        return Ok(root.to_path_buf());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        } else {
            return Err(AppError::Validation(format!(
                "helm bundle root may only contain the chart directory, found file {:?}",
                entry.file_name()
            )));
        }
    }
    match dirs.as_slice() {
        [chart] if chart.join("Chart.yaml").is_file() => Ok(chart.clone()),
        [chart] => Err(AppError::Validation(format!(
            "directory {:?} has no Chart.yaml",
            chart.file_name().unwrap_or_default()
        ))),
        _ => Err(AppError::Validation(format!(
            "helm bundle must contain exactly one chart directory, found {}",
            dirs.len()
        ))),
    }
}

/// Static chart contents: crds/ then templates/, skipping helper files.
/// Values are not interpolated; charts are applied as committed.
fn load_chart_manifests(root: &Path) -> AppResult<Vec<DynamicObject>> {
    let chart = chart_root(root)?;
    let mut objects = Vec::new();
    for dir in ["crds", "templates"] {
        let dir = chart.join(dir);
        if dir.is_dir() {
            load_manifests_recursive(&dir, &mut objects)?;
        }
    }
    if objects.is_empty() {
        return Err(AppError::Validation(
            "chart contains no manifests under crds/ or templates/".to_string(),
        ));
    }
    Ok(objects)
}

fn load_manifests_recursive(dir: &Path, out: &mut Vec<DynamicObject>) -> AppResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            load_manifests_recursive(&path, out)?;
        } else if is_manifest_file(&name) {
            out.extend(parse_manifest_file(&path)?);
        }
    }
    Ok(())
}

fn is_manifest_file(name: &str) -> bool {
    !name.starts_with('_') && (name.ends_with(".yaml") || name.ends_with(".yml") || name.ends_with(".json"))
}

fn load_manifest_dir(dir: &Path) -> AppResult<Vec<DynamicObject>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    let mut objects = Vec::new();
    for entry in entries {
        if entry.file_type()?.is_file() {
            objects.extend(parse_manifest_file(&entry.path())?);
        }
    }
    Ok(objects)
}

/// Parse one file as a stream of YAML documents, each a Kubernetes object
/// with complete type and name metadata.
pub fn parse_manifest_file(path: &Path) -> AppResult<Vec<DynamicObject>> {
    let contents = fs::read_to_string(path)?;
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&contents) {
        let value = serde_json::Value::deserialize(document).map_err(|e| {
            AppError::Validation(format!("{:?}: {}", path.file_name().unwrap_or_default(), e))
        })?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject = serde_json::from_value(value).map_err(|e| {
            AppError::Validation(format!(
                "{:?} didn't look like a Kubernetes object (apiVersion/kind/metadata): {}",
                path.file_name().unwrap_or_default(),
                e
            ))
        })?;
        if object.types.is_none() {
            return Err(AppError::Validation(format!(
                "{:?}: object is missing apiVersion/kind",
                path.file_name().unwrap_or_default()
            )));
        }
        if object.metadata.name.is_none() {
            return Err(AppError::Validation(format!(
                "{:?}: object is missing metadata.name",
                path.file_name().unwrap_or_default()
            )));
        }
        objects.push(object);
    }
    Ok(objects)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn scratch(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("bale-validate-{}-{}", name, std::process::id()));
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    const CONFIGMAP: &str = indoc! {r#"
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: app-settings
        data:
          key: value
    "#};

    #[test]
    fn plain_requires_manifests_dir() {
        let root = scratch("nodir");
        let err = validate(BundleFormat::Plain, &root, "default").unwrap_err();
        assert!(err.to_string().contains("manifests/"));
    }

    #[test]
    fn plain_rejects_empty_manifests_dir() {
        let root = scratch("empty");
        fs::create_dir_all(root.join("manifests")).unwrap();
        assert!(validate(BundleFormat::Plain, &root, "default").is_err());
    }

    #[test]
    fn plain_rejects_subdirectories() {
        let root = scratch("subdir");
        fs::create_dir_all(root.join("manifests/nested")).unwrap();
        fs::write(root.join("manifests/app.yaml"), CONFIGMAP).unwrap();
        let err = validate(BundleFormat::Plain, &root, "default").unwrap_err();
        assert!(err.to_string().contains("subdirectories"));
    }

    #[test]
    fn plain_accepts_multi_document_manifests() {
        let root = scratch("multidoc");
        fs::create_dir_all(root.join("manifests")).unwrap();
        let doc = format!("{}---\n{}", CONFIGMAP, CONFIGMAP.replace("app-settings", "extra"));
        fs::write(root.join("manifests/app.yaml"), doc).unwrap();
        validate(BundleFormat::Plain, &root, "default").unwrap();

        let objects = materialize(BundleFormat::Plain, &root, "default").unwrap();
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn plain_rejects_objects_without_type_metadata() {
        let root = scratch("untyped");
        fs::create_dir_all(root.join("manifests")).unwrap();
        fs::write(root.join("manifests/app.yaml"), "metadata:\n  name: x\n").unwrap();
        assert!(validate(BundleFormat::Plain, &root, "default").is_err());
    }

    #[test]
    fn helm_accepts_chart_yaml_at_root() {
        let root = scratch("chartroot");
        fs::write(root.join("Chart.yaml"), "name: demo\nversion: 1.0.0\n").unwrap();
        validate(BundleFormat::Helm, &root, "default").unwrap();
    }

    #[test]
    fn helm_accepts_single_chart_directory() {
        let root = scratch("chartdir");
        fs::create_dir_all(root.join("demo/templates")).unwrap();
        fs::write(root.join("demo/Chart.yaml"), "name: demo\nversion: 1.0.0\n").unwrap();
        fs::write(root.join("demo/templates/cm.yaml"), CONFIGMAP).unwrap();
        validate(BundleFormat::Helm, &root, "default").unwrap();

        let objects = materialize(BundleFormat::Helm, &root, "default").unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("app-settings"));
    }

    #[test]
    fn helm_rejects_multiple_top_level_directories() {
        let root = scratch("twodirs");
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        assert!(validate(BundleFormat::Helm, &root, "default").is_err());
    }

    #[test]
    fn helper_templates_are_skipped() {
        assert!(!is_manifest_file("_helpers.tpl"));
        assert!(!is_manifest_file("NOTES.txt"));
        assert!(is_manifest_file("deployment.yaml"));
    }
}
