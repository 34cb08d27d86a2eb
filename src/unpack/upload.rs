use async_trait::async_trait;
use flate2::read::GzDecoder;
use kube::api::ResourceExt;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::api::{Bundle, BundleSource, ResolvedSource};
use crate::error::{AppError, AppResult};
use crate::store::ContentStore;
use crate::unpack::{UnpackResult, Unpacker};

/// What the upload service's answer means for this bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveStatus {
    /// The archive is in the body.
    Ready,
    /// Nothing uploaded under this bundle name yet.
    Missing,
    /// The service misbehaved; retry with backoff.
    Unexpected,
}

fn archive_status(status: StatusCode) -> ArchiveStatus {
    match status {
        StatusCode::OK => ArchiveStatus::Ready,
        StatusCode::NOT_FOUND => ArchiveStatus::Missing,
        _ => ArchiveStatus::Unexpected,
    }
}

/// Materialize a fetched archive into the store root, pinned by the content
/// hash of the archive bytes.
fn unpack_archive(store: &ContentStore, body: &[u8]) -> AppResult<UnpackResult> {
    let digest = format!("sha256:{:x}", Sha256::digest(body));
    store.copy_tar_archive(GzDecoder::new(body), "")?;
    Ok(UnpackResult::unpacked(
        ResolvedSource::Upload { digest },
        "uploaded content unpacked",
    ))
}

/// Fetches archives previously pushed to the upload service. The archive is
/// addressed by bundle name; a 404 means the caller has not uploaded yet.
pub struct UploadUnpacker {
    base_url: String,
    client: reqwest::Client,
}

impl UploadUnpacker {
    pub fn new(base_url: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Unpacker for UploadUnpacker {
    async fn unpack(
        &self,
        bundle: &Bundle,
        source: &BundleSource,
        store: &ContentStore,
    ) -> AppResult<UnpackResult> {
        let BundleSource::Upload {} = source else {
            panic!("upload unpacker invoked on source kind {:?}", source.kind());
        };

        let url = format!("{}/uploads/{}.tgz", self.base_url, bundle.name_any());
        let response = self.client.get(&url).send().await?;
        let status = response.status();

        match archive_status(status) {
            ArchiveStatus::Missing => Ok(UnpackResult::pending("waiting for bundle upload")),
            ArchiveStatus::Unexpected => Err(AppError::Internal(format!(
                "unexpected status {} fetching {}",
                status, url
            ))),
            ArchiveStatus::Ready => {
                let body = response.bytes().await?;
                unpack_archive(store, &body)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::unpack::UnpackState;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tgz(path: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn missing_upload_reports_pending() {
        assert_eq!(archive_status(StatusCode::NOT_FOUND), ArchiveStatus::Missing);
        // and the pending result carries no pin
        let result = UnpackResult::pending("waiting for bundle upload");
        assert_eq!(result.state, UnpackState::Pending);
        assert!(result.resolved.is_none());
    }

    #[test]
    fn ok_is_ready_and_anything_else_retries() {
        assert_eq!(archive_status(StatusCode::OK), ArchiveStatus::Ready);
        assert_eq!(
            archive_status(StatusCode::INTERNAL_SERVER_ERROR),
            ArchiveStatus::Unexpected
        );
        assert_eq!(
            archive_status(StatusCode::FORBIDDEN),
            ArchiveStatus::Unexpected
        );
    }

    #[test]
    fn fetched_archive_is_pinned_by_its_content_hash() {
        let base = std::env::temp_dir().join(format!("bale-upload-{}", std::process::id()));
        let store = ContentStore::create(&base, "bd").unwrap();
        let body = tgz("manifests/app.yaml", b"kind: ConfigMap");

        let result = unpack_archive(&store, &body).unwrap();
        assert_eq!(result.state, UnpackState::Unpacked);
        let expected = format!("sha256:{:x}", Sha256::digest(&body));
        match result.resolved.unwrap() {
            ResolvedSource::Upload { digest } => assert_eq!(digest, expected),
            other => panic!("expected an upload pin, got {other:?}"),
        }
        assert!(store.root().join("manifests/app.yaml").exists());
    }

    #[test]
    fn corrupt_archives_error_instead_of_pinning() {
        let base = std::env::temp_dir().join(format!("bale-upload-bad-{}", std::process::id()));
        let store = ContentStore::create(&base, "bd").unwrap();
        assert!(unpack_archive(&store, b"not a gzip stream").is_err());
    }
}
