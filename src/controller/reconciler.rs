use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{
    Api, DeleteParams, GroupVersionKind, ListParams, ObjectMeta, Patch, PatchParams, PostParams,
    ResourceExt,
};
use kube::runtime::controller::Action;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{
    condition, phase, reason, validate_bundle_deployment, validate_bundle_name, Bundle,
    BundleDeployment, BundleDeploymentStatus, BundleInfo, BundleObject, BundleSpec, BundleStatus,
    FINALIZER_RELEASE_CLEANUP, GROUP, LABEL_OWNER_KIND, LABEL_OWNER_NAME,
    MAX_GENERATED_BUNDLE_LIMIT,
};
use crate::controller::conditions::set_condition;
use crate::controller::Context;
use crate::deploy::postrender::OwnerLabelRenderer;
use crate::error::{AppError, AppResult};
use crate::hash;
use crate::store::tree_digest;
use crate::unpack::UnpackState;
use crate::validate;

/// Requeue interval while waiting on an unpack to make progress.
const UNPACK_REQUEUE: Duration = Duration::from_secs(5);

enum PipelineOutcome {
    /// Desired state reached; wait for the next change.
    Converged,
    /// Work in flight; ask again shortly.
    Waiting(Duration),
}

/// The reconciliation function for BundleDeployment resources
pub async fn reconcile(
    bd: Arc<BundleDeployment>,
    ctx: Arc<Context>,
) -> Result<Action, AppError> {
    let name = bd.name_any();

    if !ctx.config.serves_class(&bd.spec.provisioner_class_name) {
        return Ok(Action::await_change());
    }

    if bd.metadata.deletion_timestamp.is_some() {
        return finalize(&bd, &ctx).await;
    }

    let generation = bd.metadata.generation.unwrap_or(0);
    log::debug!("Reconciling BundleDeployment {} (generation {})", name, generation);

    // Paused: acknowledge the spec, do nothing else.
    if bd.spec.paused {
        let api: Api<BundleDeployment> = Api::all(ctx.client.clone());
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": { "observedGeneration": generation } })),
        )
        .await?;
        return Ok(Action::await_change());
    }

    // Work on a copy; the live object stays untouched until the final write.
    let mut status = bd.status.clone().unwrap_or_default();
    let outcome = run_pipeline(&bd, &mut status, &ctx).await;

    if outcome.is_ok() {
        status.observed_generation = Some(generation);
    }

    // Two-phase write: the status subresource first, metadata (finalizer)
    // second, so a racing deletion still sees the last observed conditions.
    let status_write = write_status(&ctx.client, &name, &status).await;
    let meta_write = match &status_write {
        Ok(()) => ensure_finalizer(&ctx.client, &bd).await,
        Err(_) => Ok(()),
    };

    let write_result = status_write.and(meta_write);
    match (outcome, write_result) {
        (Ok(PipelineOutcome::Converged), Ok(())) => {
            ctx.clear_backoff(&name);
            Ok(Action::await_change())
        }
        (Ok(PipelineOutcome::Waiting(delay)), Ok(())) => Ok(Action::requeue(delay)),
        (Ok(_), Err(write_err)) => Err(write_err),
        (Err(err), Ok(())) => Err(err),
        // Aggregate so neither failure is lost to the queue.
        (Err(err), Err(write_err)) => Err(AppError::Internal(format!(
            "{}; additionally the status write failed: {}",
            err, write_err
        ))),
    }
}

async fn run_pipeline(
    bd: &BundleDeployment,
    status: &mut BundleDeploymentStatus,
    ctx: &Context,
) -> AppResult<PipelineOutcome> {
    let name = bd.name_any();
    let generation = bd.metadata.generation.unwrap_or(0);

    // The admission webhook lives outside this repository, so the same
    // checks run here and surface as terminal conditions.
    if let Err(err) = validate_bundle_deployment(&name, &bd.spec) {
        set_condition(
            &mut status.conditions,
            condition::INSTALLED,
            "False",
            reason::RECONCILE_FAILED,
            &err.to_string(),
            generation,
        );
        return Err(AppError::unrecoverable(err));
    }

    // Reconcile the child Bundle for the current template.
    let template_hash = hash::template_hash6(&bd.template())?;
    let bundle_name = hash::bundle_name(&name, &template_hash);
    let bundle = match ensure_bundle(ctx, bd, &bundle_name).await {
        Ok(bundle) => bundle,
        Err(err) => {
            set_condition(
                &mut status.conditions,
                condition::HAS_VALID_BUNDLE,
                "False",
                reason::BUNDLE_LOOKUP_FAILED,
                &err.to_string(),
                generation,
            );
            return Err(err);
        }
    };
    status.active_bundle = Some(bundle_name.clone());

    // Drive the Bundle through unpack and mirror its condition.
    let store = ctx.store_for(&name).await?;
    let unpack = match ctx.unpacker.unpack(&bundle, &store).await {
        Ok(result) => result,
        Err(err) => {
            mark_bundle_failed(ctx, &bundle, &err).await.ok();
            set_condition(
                &mut status.conditions,
                condition::HAS_VALID_BUNDLE,
                "False",
                reason::UNPACK_FAILED,
                &err.to_string(),
                generation,
            );
            set_condition(
                &mut status.conditions,
                condition::UNPACKED,
                "False",
                reason::UNPACK_FAILED,
                &err.to_string(),
                generation,
            );
            return Err(err);
        }
    };

    match unpack.state {
        UnpackState::Pending => {
            update_bundle_progress(ctx, &bundle, phase::PENDING, reason::UNPACK_PENDING, &unpack.message)
                .await?;
            for type_ in [condition::HAS_VALID_BUNDLE, condition::UNPACKED] {
                set_condition(
                    &mut status.conditions,
                    type_,
                    "False",
                    reason::UNPACK_PENDING,
                    &unpack.message,
                    generation,
                );
            }
            return Ok(PipelineOutcome::Waiting(UNPACK_REQUEUE));
        }
        UnpackState::Unpacking => {
            update_bundle_progress(ctx, &bundle, phase::UNPACKING, reason::UNPACKING, &unpack.message)
                .await?;
            for type_ in [condition::HAS_VALID_BUNDLE, condition::UNPACKED] {
                set_condition(
                    &mut status.conditions,
                    type_,
                    "False",
                    reason::UNPACKING,
                    &unpack.message,
                    generation,
                );
            }
            return Ok(PipelineOutcome::Waiting(UNPACK_REQUEUE));
        }
        UnpackState::Unpacked => {}
    }

    let root = unpack.root.clone().ok_or_else(|| {
        AppError::Internal("unpacker reported Unpacked without a filesystem root".to_string())
    })?;
    let digest = tree_digest(&root)?;
    mark_bundle_unpacked(ctx, &bundle, &unpack.resolved, &digest).await?;
    for type_ in [condition::HAS_VALID_BUNDLE, condition::UNPACKED] {
        set_condition(
            &mut status.conditions,
            type_,
            "True",
            reason::UNPACK_SUCCESSFUL,
            "unpack successful",
            generation,
        );
    }

    // Validate the materialized filesystem against the declared format.
    if let Err(err) = validate::validate(bd.spec.format, &root, &bd.spec.install_namespace) {
        set_condition(
            &mut status.conditions,
            condition::VALIDATED,
            "False",
            reason::VALIDATE_FAILED,
            &err.to_string(),
            generation,
        );
        return Err(err);
    }

    // Materialize the plain object set (registry bundles convert here).
    let objects = match validate::materialize(bd.spec.format, &root, &bd.spec.install_namespace) {
        Ok(objects) => objects,
        Err(err) => {
            set_condition(
                &mut status.conditions,
                condition::VALIDATED,
                "False",
                reason::VALIDATE_FAILED,
                &err.to_string(),
                generation,
            );
            // A malformed registry bundle cannot convert differently later.
            return Err(match err {
                err @ AppError::Conversion(_) => AppError::unrecoverable(err),
                err => err,
            });
        }
    };
    set_condition(
        &mut status.conditions,
        condition::VALIDATED,
        "True",
        reason::VALIDATE_SUCCESSFUL,
        "validate successful",
        generation,
    );
    record_bundle_objects(ctx, &bundle, &objects).await?;

    // Converge the release.
    let renderer = OwnerLabelRenderer::new(&name);
    let applied = match ctx
        .deployer
        .deploy(&name, &bd.spec.install_namespace, objects, &renderer)
        .await
    {
        Ok(applied) => applied,
        Err(err) => {
            let reason = match &err {
                AppError::ReleaseState(_) => reason::ERROR_GETTING_RELEASE_STATE,
                AppError::Upgrade(_) => reason::UPGRADE_FAILED,
                AppError::Unrecoverable(inner) if matches!(**inner, AppError::Upgrade(_)) => {
                    reason::UPGRADE_FAILED
                }
                _ => reason::INSTALL_FAILED,
            };
            set_condition(
                &mut status.conditions,
                condition::INSTALLED,
                "False",
                reason,
                &err.to_string(),
                generation,
            );
            return Err(err);
        }
    };

    // Every applied kind gets a dynamic watch so drift re-enqueues us.
    for object in &applied {
        let Some(types) = &object.types else { continue };
        let gvk = GroupVersionKind::try_from(types)
            .map_err(|e| AppError::Internal(format!("failed parsing GVK: {}", e)))?;
        if let Err(err) = ctx.watches.ensure_watch(gvk).await {
            set_condition(
                &mut status.conditions,
                condition::INSTALLED,
                "False",
                reason::CREATE_DYNAMIC_WATCH_FAILED,
                &err.to_string(),
                generation,
            );
            return Err(err);
        }
    }

    set_condition(
        &mut status.conditions,
        condition::INSTALLED,
        "True",
        reason::INSTALLATION_SUCCEEDED,
        &format!("instantiated bundle {}", bundle_name),
        generation,
    );
    status.installed_bundle_name = Some(bundle_name.clone());

    // Previous-template Bundles are garbage once the release comes from the
    // new one.
    gc_stale_bundles(ctx, &name, &bundle_name).await?;

    Ok(PipelineOutcome::Converged)
}

/// Adopt the Bundle matching the current template hash, or create it while
/// honoring the hotloop limit.
async fn ensure_bundle(ctx: &Context, bd: &BundleDeployment, bundle_name: &str) -> AppResult<Bundle> {
    validate_bundle_name(bundle_name).map_err(AppError::unrecoverable)?;

    let api: Api<Bundle> = Api::all(ctx.client.clone());
    let params = ListParams::default().labels(&format!("{}={}", LABEL_OWNER_NAME, bd.name_any()));
    let existing = api.list(&params).await?.items;

    if let Some(found) = existing.iter().find(|b| b.name_any() == bundle_name) {
        return Ok(found.clone());
    }
    if existing.len() >= MAX_GENERATED_BUNDLE_LIMIT {
        return Err(AppError::MaxGeneratedLimit(MAX_GENERATED_BUNDLE_LIMIT));
    }

    let bundle = Bundle {
        metadata: ObjectMeta {
            name: Some(bundle_name.to_string()),
            labels: Some(
                [
                    (
                        LABEL_OWNER_KIND.to_string(),
                        "BundleDeployment".to_string(),
                    ),
                    (LABEL_OWNER_NAME.to_string(), bd.name_any()),
                ]
                .into_iter()
                .collect(),
            ),
            owner_references: Some(vec![OwnerReference {
                api_version: format!("{}/v1alpha2", GROUP),
                kind: "BundleDeployment".to_string(),
                name: bd.name_any(),
                uid: bd.uid().unwrap_or_default(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: BundleSpec {
            provisioner_class_name: bd.spec.provisioner_class_name.clone(),
            format: bd.spec.format,
            sources: bd.spec.sources.clone(),
        },
        status: None,
    };

    log::info!("Creating Bundle {} for BundleDeployment {}", bundle_name, bd.name_any());
    match api.create(&PostParams::default(), &bundle).await {
        Ok(created) => Ok(created),
        // Lost a create race; adopt the winner.
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(api.get(bundle_name).await?),
        Err(e) => Err(e.into()),
    }
}

async fn gc_stale_bundles(ctx: &Context, owner: &str, active: &str) -> AppResult<()> {
    let api: Api<Bundle> = Api::all(ctx.client.clone());
    let params = ListParams::default().labels(&format!("{}={}", LABEL_OWNER_NAME, owner));
    for bundle in api.list(&params).await?.items {
        let name = bundle.name_any();
        if name != active {
            log::info!("Garbage-collecting stale Bundle {}", name);
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

async fn patch_bundle_status(ctx: &Context, name: &str, status: &BundleStatus) -> AppResult<()> {
    let api: Api<Bundle> = Api::all(ctx.client.clone());
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;
    Ok(())
}

async fn update_bundle_progress(
    ctx: &Context,
    bundle: &Bundle,
    phase: &str,
    reason: &str,
    message: &str,
) -> AppResult<()> {
    let mut status = bundle.status.clone().unwrap_or_default();
    status.phase = Some(phase.to_string());
    status.observed_generation = bundle.metadata.generation;
    set_condition(
        &mut status.conditions,
        condition::UNPACKED,
        "False",
        reason,
        message,
        bundle.metadata.generation.unwrap_or(0),
    );
    patch_bundle_status(ctx, &bundle.name_any(), &status).await
}

async fn mark_bundle_unpacked(
    ctx: &Context,
    bundle: &Bundle,
    resolved: &[crate::api::ResolvedSource],
    digest: &str,
) -> AppResult<()> {
    let mut status = bundle.status.clone().unwrap_or_default();
    status.phase = Some(phase::UNPACKED.to_string());
    status.resolved_source = resolved.to_vec();
    status.digest = Some(digest.to_string());
    status.content_url = Some(format!(
        "{}/uploads/{}.tgz",
        ctx.config.upload_url.trim_end_matches('/'),
        bundle.name_any()
    ));
    status.observed_generation = bundle.metadata.generation;
    set_condition(
        &mut status.conditions,
        condition::UNPACKED,
        "True",
        reason::UNPACK_SUCCESSFUL,
        "unpack successful",
        bundle.metadata.generation.unwrap_or(0),
    );
    patch_bundle_status(ctx, &bundle.name_any(), &status).await
}

async fn mark_bundle_failed(ctx: &Context, bundle: &Bundle, err: &AppError) -> AppResult<()> {
    let mut status = bundle.status.clone().unwrap_or_default();
    status.phase = Some(phase::FAILING.to_string());
    status.observed_generation = bundle.metadata.generation;
    set_condition(
        &mut status.conditions,
        condition::UNPACKED,
        "False",
        reason::UNPACK_FAILED,
        &err.to_string(),
        bundle.metadata.generation.unwrap_or(0),
    );
    patch_bundle_status(ctx, &bundle.name_any(), &status).await
}

/// Record which manifests the bundle produced on its status.
async fn record_bundle_objects(
    ctx: &Context,
    bundle: &Bundle,
    objects: &[kube::api::DynamicObject],
) -> AppResult<()> {
    let mut status = bundle.status.clone().unwrap_or_default();
    status.phase = Some(phase::UNPACKED.to_string());
    status.info = Some(BundleInfo {
        objects: objects
            .iter()
            .map(|object| {
                let types = object.types.clone().unwrap_or_default();
                let group = types
                    .api_version
                    .split_once('/')
                    .map(|(group, _)| group.to_string());
                BundleObject {
                    group,
                    kind: types.kind,
                    name: object.name_any(),
                    namespace: object.metadata.namespace.clone(),
                }
            })
            .collect(),
    });
    patch_bundle_status(ctx, &bundle.name_any(), &status).await
}

async fn write_status(
    client: &kube::Client,
    name: &str,
    status: &BundleDeploymentStatus,
) -> AppResult<()> {
    let api: Api<BundleDeployment> = Api::all(client.clone());
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;
    Ok(())
}

async fn ensure_finalizer(client: &kube::Client, bd: &BundleDeployment) -> AppResult<()> {
    if bd.finalizers().iter().any(|f| f == FINALIZER_RELEASE_CLEANUP) {
        return Ok(());
    }
    let mut finalizers = bd.finalizers().to_vec();
    finalizers.push(FINALIZER_RELEASE_CLEANUP.to_string());
    let api: Api<BundleDeployment> = Api::all(client.clone());
    api.patch(
        &bd.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

/// Deletion path: the finalizer holds the object until every release object
/// carrying our owner labels is gone.
async fn finalize(bd: &BundleDeployment, ctx: &Context) -> Result<Action, AppError> {
    let name = bd.name_any();
    if !bd.finalizers().iter().any(|f| f == FINALIZER_RELEASE_CLEANUP) {
        return Ok(Action::await_change());
    }

    log::info!("Cleaning up release for deleted BundleDeployment {}", name);
    ctx.deployer
        .uninstall(&name, &bd.spec.install_namespace)
        .await?;
    ctx.drop_store(&name).await;

    let remaining: Vec<String> = bd
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER_RELEASE_CLEANUP)
        .cloned()
        .collect();
    let api: Api<BundleDeployment> = Api::all(ctx.client.clone());
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(&json!({ "metadata": { "finalizers": remaining } })),
    )
    .await?;

    Ok(Action::await_change())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::api::{BundleDeploymentSpec, BundleFormat, BundleSource, BundleTemplate};

    fn deployment(name: &str, sources: Vec<BundleSource>) -> BundleDeployment {
        BundleDeployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: BundleDeploymentSpec {
                provisioner_class_name: "core.bale.dev/plain".to_string(),
                format: BundleFormat::Plain,
                sources,
                paused: false,
                install_namespace: "default".to_string(),
            },
            status: None,
        }
    }

    #[test]
    fn bundle_names_are_deterministic_per_template() {
        let bd = deployment("my-bd", vec![BundleSource::Upload {}]);
        let a = hash::bundle_name(&bd.name_any(), &hash::template_hash6(&bd.template()).unwrap());
        let b = hash::bundle_name(&bd.name_any(), &hash::template_hash6(&bd.template()).unwrap());
        assert_eq!(a, b);
        assert!(a.starts_with("my-bd-"));
        assert_eq!(a.len(), "my-bd-".len() + 6);
    }

    #[test]
    fn template_hash_tracks_source_changes() {
        let upload = deployment("my-bd", vec![BundleSource::Upload {}]);
        let image = deployment(
            "my-bd",
            vec![BundleSource::Image {
                image: crate::api::ImageSource {
                    image_ref: "example.io/bundle:v1".to_string(),
                    pull_secret: None,
                    insecure_skip_tls_verify: false,
                },
            }],
        );
        assert_ne!(
            hash::template_hash6(&upload.template()).unwrap(),
            hash::template_hash6(&image.template()).unwrap()
        );
    }

    #[test]
    fn template_is_format_and_sources_only() {
        let mut a = deployment("my-bd", vec![BundleSource::Upload {}]);
        a.spec.install_namespace = "one".to_string();
        let mut b = deployment("my-bd", vec![BundleSource::Upload {}]);
        b.spec.install_namespace = "two".to_string();
        // Changing the install namespace must not spawn a new Bundle.
        assert_eq!(
            hash::template_hash6(&a.template()).unwrap(),
            hash::template_hash6(&b.template()).unwrap()
        );
        assert_eq!(
            a.template(),
            BundleTemplate {
                format: BundleFormat::Plain,
                sources: vec![BundleSource::Upload {}],
            }
        );
    }
}
