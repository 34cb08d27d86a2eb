use actix_web::http::header;
use actix_web::{get, put, web, App, HttpRequest, HttpResponse, HttpServer};
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::client::Client;
use std::fs;
use std::path::PathBuf;

use crate::api::{phase, Bundle, GROUP};
use crate::error::{AppError, AppResult};

/// Attempts at the status conflict-retry loop before giving up.
const STATUS_RETRIES: usize = 4;

/// Shared state of the upload service.
pub struct UploadState {
    pub client: Client,
    pub dir: PathBuf,
}

/// What a PUT should do, given the stored bytes and the bundle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UploadOutcome {
    /// Byte-identical to what is stored already: nothing changes.
    NoChange,
    /// Content differs but the bundle is already Unpacked: immutable.
    Conflict,
    /// Store the new content and kick the bundle back to Pending.
    Store,
}

fn upload_outcome(existing: Option<&[u8]>, body: &[u8], unpacked: bool) -> UploadOutcome {
    if existing.is_some_and(|bytes| bytes == body) {
        return UploadOutcome::NoChange;
    }
    if unpacked {
        return UploadOutcome::Conflict;
    }
    UploadOutcome::Store
}

fn archive_path(dir: &std::path::Path, bundle_name: &str) -> PathBuf {
    dir.join(format!("{}.tgz", bundle_name))
}

/// TokenReview then SubjectAccessReview against the orchestrator: the caller
/// must be allowed to update bundles.
async fn authorize(state: &UploadState, req: &HttpRequest, bundle_name: &str) -> AppResult<bool> {
    let Some(token) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return Ok(false);
    };

    let token_reviews: Api<TokenReview> = Api::all(state.client.clone());
    let review = token_reviews
        .create(
            &PostParams::default(),
            &TokenReview {
                spec: TokenReviewSpec {
                    token: Some(token.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await?;
    let Some(status) = review.status else {
        return Ok(false);
    };
    if status.authenticated != Some(true) {
        return Ok(false);
    }
    let user = status.user.unwrap_or_default();

    let access_reviews: Api<SubjectAccessReview> = Api::all(state.client.clone());
    let review = access_reviews
        .create(
            &PostParams::default(),
            &SubjectAccessReview {
                spec: SubjectAccessReviewSpec {
                    user: user.username,
                    groups: user.groups,
                    uid: user.uid,
                    resource_attributes: Some(ResourceAttributes {
                        group: Some(GROUP.to_string()),
                        resource: Some("bundles".to_string()),
                        verb: Some("update".to_string()),
                        name: Some(bundle_name.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await?;
    Ok(review.status.map(|s| s.allowed).unwrap_or(false))
}

/// Flip the bundle back to Pending so the reconciler re-unpacks the new
/// content. replace_status carries the resourceVersion, so concurrent PUTs
/// conflict and retry.
async fn reset_bundle_phase(state: &UploadState, bundle_name: &str) -> AppResult<()> {
    let api: Api<Bundle> = Api::all(state.client.clone());
    for attempt in 0..STATUS_RETRIES {
        let mut bundle = api.get(bundle_name).await?;
        let status = bundle.status.get_or_insert_with(Default::default);
        status.phase = Some(phase::PENDING.to_string());
        status.resolved_source = Vec::new();
        status.digest = None;

        let payload = serde_json::to_vec(&bundle)?;
        match api
            .replace_status(bundle_name, &PostParams::default(), payload)
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt + 1 < STATUS_RETRIES => {
                log::debug!(
                    "Conflict resetting phase of bundle {}, retrying",
                    bundle_name
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(AppError::Internal(format!(
        "persistent conflict resetting phase of bundle {}",
        bundle_name
    )))
}

#[put("/uploads/{bundle}.tgz")]
async fn put_upload(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    state: web::Data<UploadState>,
) -> AppResult<HttpResponse> {
    let bundle_name = path.into_inner();

    let gzip = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "application/gzip");
    if !gzip {
        return Ok(
            HttpResponse::UnsupportedMediaType().body("content must be application/gzip")
        );
    }

    if !authorize(&state, &req, &bundle_name).await? {
        return Ok(HttpResponse::Unauthorized().finish());
    }

    let api: Api<Bundle> = Api::all(state.client.clone());
    let Some(bundle) = api.get_opt(&bundle_name).await? else {
        return Ok(HttpResponse::NotFound().body(format!("no bundle named {:?}", bundle_name)));
    };

    let file = archive_path(&state.dir, &bundle_name);
    let existing = if file.exists() {
        Some(fs::read(&file)?)
    } else {
        None
    };
    let unpacked = bundle.phase() == Some(phase::UNPACKED);

    match upload_outcome(existing.as_deref(), &body, unpacked) {
        UploadOutcome::NoChange => Ok(HttpResponse::NoContent().finish()),
        UploadOutcome::Conflict => Ok(HttpResponse::Conflict()
            .body("bundle has already been unpacked, cannot change content")),
        UploadOutcome::Store => {
            fs::create_dir_all(&state.dir)?;
            fs::write(&file, &body)?;
            log::info!("Stored upload for bundle {} ({} bytes)", bundle_name, body.len());
            reset_bundle_phase(&state, &bundle_name).await?;
            Ok(HttpResponse::Created().finish())
        }
    }
}

#[get("/uploads/{bundle}.tgz")]
async fn get_upload(
    path: web::Path<String>,
    state: web::Data<UploadState>,
) -> AppResult<HttpResponse> {
    let bundle_name = path.into_inner();
    let file = archive_path(&state.dir, &bundle_name);
    if !file.exists() {
        return Ok(HttpResponse::NotFound().finish());
    }
    Ok(HttpResponse::Ok()
        .content_type("application/gzip")
        .body(fs::read(&file)?))
}

/// Serve the upload endpoints until the process exits.
pub async fn run(client: Client, dir: PathBuf, addr: &str) -> std::io::Result<()> {
    fs::create_dir_all(&dir)?;
    log::info!("Starting upload service at http://{}/uploads", addr);
    let state = web::Data::new(UploadState { client, dir });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            // bundle archives routinely exceed the default payload cap
            .app_data(web::PayloadConfig::new(512 * 1024 * 1024))
            .service(put_upload)
            .service(get_upload)
    })
    .bind(addr)?
    .run()
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_are_no_change_even_after_unpack() {
        assert_eq!(
            upload_outcome(Some(b"abc"), b"abc", true),
            UploadOutcome::NoChange
        );
        assert_eq!(
            upload_outcome(Some(b"abc"), b"abc", false),
            UploadOutcome::NoChange
        );
    }

    #[test]
    fn changed_bytes_conflict_once_unpacked() {
        assert_eq!(
            upload_outcome(Some(b"abc"), b"xyz", true),
            UploadOutcome::Conflict
        );
    }

    #[test]
    fn new_or_changed_bytes_store_before_unpack() {
        assert_eq!(upload_outcome(None, b"abc", false), UploadOutcome::Store);
        assert_eq!(
            upload_outcome(Some(b"abc"), b"xyz", false),
            UploadOutcome::Store
        );
    }

    #[test]
    fn missing_content_while_unpacked_still_conflicts() {
        // The cache was lost but the bundle pinned its content already;
        // accepting different bytes would break the pin.
        assert_eq!(upload_outcome(None, b"abc", true), UploadOutcome::Conflict);
    }

    #[test]
    fn archive_paths_are_keyed_by_bundle_name() {
        let path = archive_path(std::path::Path::new("/cache"), "bd-abc123");
        assert_eq!(path, PathBuf::from("/cache/bd-abc123.tgz"));
    }
}
