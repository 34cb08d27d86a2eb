use async_trait::async_trait;
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::Secret;
use kube::{api::Api, client::Client};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};

use crate::api::{Bundle, BundleSource, HttpSource, ResolvedSource};
use crate::error::{AppError, AppResult};
use crate::store::ContentStore;
use crate::unpack::{secret_value, UnpackResult, Unpacker};

/// How to proceed with a source URL's response, by status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FetchOutcome {
    /// The body is the archive; unpack it.
    Unpack,
    /// Content not published yet; ask again later.
    Pending,
    /// A fixed URL answering anything else will keep answering it.
    Terminal,
}

fn fetch_outcome(status: StatusCode) -> FetchOutcome {
    match status {
        StatusCode::OK => FetchOutcome::Unpack,
        StatusCode::NOT_FOUND => FetchOutcome::Pending,
        _ => FetchOutcome::Terminal,
    }
}

/// Fetches a `.tar.gz` over HTTP(S) with optional bearer or basic auth.
pub struct HttpUnpacker {
    client: Client,
    namespace: String,
}

impl HttpUnpacker {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn auth_secret(&self, name: &str) -> AppResult<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(api.get(name).await?)
    }

    async fn fetch(&self, http: &HttpSource) -> AppResult<reqwest::Response> {
        let mut builder = reqwest::Client::builder();
        if http.auth.as_ref().is_some_and(|a| a.insecure_skip_verify) {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        let mut request = client.get(&http.url);
        if let Some(auth) = &http.auth {
            let secret = self.auth_secret(&auth.secret).await?;
            if let Some(token) = secret_value(&secret, "token") {
                request = request.bearer_auth(token.trim());
            } else if let Some(username) = secret_value(&secret, "username") {
                request = request.basic_auth(username, secret_value(&secret, "password"));
            }
        }
        Ok(request.send().await?)
    }
}

#[async_trait]
impl Unpacker for HttpUnpacker {
    async fn unpack(
        &self,
        _bundle: &Bundle,
        source: &BundleSource,
        store: &ContentStore,
    ) -> AppResult<UnpackResult> {
        let BundleSource::Http { http } = source else {
            panic!("http unpacker invoked on source kind {:?}", source.kind());
        };

        // A URL that does not parse will never start resolving.
        if let Err(e) = url::Url::parse(&http.url) {
            return Err(AppError::unrecoverable(AppError::InvalidInput(format!(
                "invalid source url {:?}: {}",
                http.url, e
            ))));
        }

        let response = self.fetch(http).await?;
        let status = response.status();
        match fetch_outcome(status) {
            FetchOutcome::Unpack => {}
            FetchOutcome::Pending => {
                return Ok(UnpackResult::pending(format!(
                    "{} not available yet",
                    http.url
                )))
            }
            FetchOutcome::Terminal => {
                return Err(AppError::unrecoverable(AppError::Internal(format!(
                    "unexpected status {} fetching {}",
                    status, http.url
                ))))
            }
        }

        let body = response.bytes().await?;
        let digest = format!("sha256:{:x}", Sha256::digest(&body));
        store.copy_tar_archive(GzDecoder::new(&body[..]), "")?;

        Ok(UnpackResult::unpacked(
            ResolvedSource::Http {
                url: http.url.clone(),
                digest,
            },
            "archive unpacked",
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ok_responses_unpack() {
        assert_eq!(fetch_outcome(StatusCode::OK), FetchOutcome::Unpack);
    }

    #[test]
    fn missing_content_is_pending() {
        assert_eq!(fetch_outcome(StatusCode::NOT_FOUND), FetchOutcome::Pending);
    }

    #[test]
    fn every_other_status_is_terminal() {
        for status in [
            StatusCode::FORBIDDEN,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::MOVED_PERMANENTLY,
        ] {
            assert_eq!(fetch_outcome(status), FetchOutcome::Terminal);
        }
    }
}
