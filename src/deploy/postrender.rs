use kube::api::DynamicObject;

use crate::api::{LABEL_OWNER_KIND, LABEL_OWNER_NAME};
use crate::error::AppResult;

/// Mutates rendered manifests before they reach the cluster.
pub trait PostRenderer: Send + Sync {
    fn render(&self, objects: Vec<DynamicObject>) -> AppResult<Vec<DynamicObject>>;
}

/// Stamps the ownership labels onto every rendered object, preserving any
/// other labels, then hands the set to whatever renderer was already
/// installed upstream.
pub struct OwnerLabelRenderer {
    owner_name: String,
    next: Option<Box<dyn PostRenderer>>,
}

impl OwnerLabelRenderer {
    pub fn new(owner_name: impl Into<String>) -> Self {
        Self {
            owner_name: owner_name.into(),
            next: None,
        }
    }

    pub fn chain(mut self, next: Box<dyn PostRenderer>) -> Self {
        self.next = Some(next);
        self
    }
}

impl PostRenderer for OwnerLabelRenderer {
    fn render(&self, mut objects: Vec<DynamicObject>) -> AppResult<Vec<DynamicObject>> {
        for object in &mut objects {
            let labels = object.metadata.labels.get_or_insert_with(Default::default);
            labels.insert(
                LABEL_OWNER_KIND.to_string(),
                "BundleDeployment".to_string(),
            );
            labels.insert(LABEL_OWNER_NAME.to_string(), self.owner_name.clone());
        }
        match &self.next {
            Some(next) => next.render(objects),
            None => Ok(objects),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn object(name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(kube::api::TypeMeta {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn injects_owner_labels() {
        let renderer = OwnerLabelRenderer::new("my-bd");
        let rendered = renderer.render(vec![object("cm")]).unwrap();
        let labels = rendered[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_OWNER_KIND).unwrap(), "BundleDeployment");
        assert_eq!(labels.get(LABEL_OWNER_NAME).unwrap(), "my-bd");
    }

    #[test]
    fn preserves_existing_labels() {
        let mut obj = object("cm");
        obj.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("app".to_string(), "demo".to_string());

        let rendered = OwnerLabelRenderer::new("my-bd").render(vec![obj]).unwrap();
        let labels = rendered[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").unwrap(), "demo");
        assert_eq!(labels.get(LABEL_OWNER_NAME).unwrap(), "my-bd");
    }

    struct Suffixer;
    impl PostRenderer for Suffixer {
        fn render(&self, mut objects: Vec<DynamicObject>) -> AppResult<Vec<DynamicObject>> {
            for object in &mut objects {
                let name = object.metadata.name.get_or_insert_with(String::new);
                name.push_str("-rendered");
            }
            Ok(objects)
        }
    }

    #[test]
    fn chains_to_upstream_renderer_after_labeling() {
        let renderer = OwnerLabelRenderer::new("my-bd").chain(Box::new(Suffixer));
        let rendered = renderer.render(vec![object("cm")]).unwrap();
        assert_eq!(rendered[0].metadata.name.as_deref(), Some("cm-rendered"));
        assert!(rendered[0]
            .metadata
            .labels
            .as_ref()
            .unwrap()
            .contains_key(LABEL_OWNER_NAME));
    }
}
