//! HTTP/JSON client for the authority.
//!
//! Uses reqwest to call the authority's `/v1` endpoints and to stream media
//! blobs with range resume.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use tracing::debug;

use karaoke_core::catalog::{CatalogCode, CatalogEntry};
use karaoke_core::license::{LeaseGrant, LicenseKey};
use karaoke_core::wire::{
    CatalogPage, ErrorBody, HistoryRecord, PushHistoryRequest, PushHistoryResponse,
    ValidateRequest,
};

use super::{BlobBody, RemoteError, RemoteStore};

/// Timeout for JSON calls. Blob transfers only get the connect timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Authority client.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    /// Create a client for the authority at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(RemoteError::Network(format!(
                "authority URL must be http(s): {base_url:?}"
            )));
        }

        // reqwest is built with rustls-no-provider; the `Err` case just means
        // a provider was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("karaoke-node/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base_url, path)
    }

    /// Resolve a media reference: absolute URLs pass through, anything else
    /// is relative to the authority base URL.
    pub fn resolve_media_ref(&self, media_ref: &str) -> String {
        if media_ref.starts_with("http://") || media_ref.starts_with("https://") {
            media_ref.to_string()
        } else {
            format!("{}/{}", self.base_url, media_ref.trim_start_matches('/'))
        }
    }

    /// Turn a non-success response into an error, reading the error body.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => match body.as_validation() {
                Some(rejection) => Err(RemoteError::Rejected(rejection)),
                None => Err(RemoteError::Api {
                    status: status.as_u16(),
                    message: body.message,
                }),
            },
            Err(_) => Err(RemoteError::Api {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").into(),
            }),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn validate_activation_key(
        &self,
        key: &LicenseKey,
        device_id: &str,
    ) -> Result<LeaseGrant, RemoteError> {
        let resp = self
            .http
            .post(self.api_url("/activation/validate"))
            .timeout(REQUEST_TIMEOUT)
            .json(&ValidateRequest {
                key: key.to_string(),
                device_id: device_id.to_string(),
            })
            .send()
            .await?;
        Ok(Self::check_status(resp).await?.json().await?)
    }

    async fn fetch_catalog_page(&self, since: i64, limit: u32) -> Result<CatalogPage, RemoteError> {
        let resp = self
            .http
            .get(format!("{}?since={since}&limit={limit}", self.api_url("/catalog")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(Self::check_status(resp).await?.json().await?)
    }

    async fn fetch_catalog_by_code(
        &self,
        code: &CatalogCode,
    ) -> Result<Option<CatalogEntry>, RemoteError> {
        let resp = self
            .http
            .get(self.api_url(&format!("/catalog/{code}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check_status(resp).await?.json().await?))
    }

    async fn fetch_blob(
        &self,
        media_ref: &str,
        offset: u64,
    ) -> Result<Box<dyn BlobBody>, RemoteError> {
        let url = self.resolve_media_ref(media_ref);
        let mut req = self.http.get(&url);
        if offset > 0 {
            req = req.header(RANGE, format!("bytes={offset}-"));
        }
        let resp = Self::check_status(req.send().await?).await?;

        let resumed = offset > 0 && resp.status() == StatusCode::PARTIAL_CONTENT;
        let total_len = if resp.status() == StatusCode::PARTIAL_CONTENT {
            resp.headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
        } else {
            resp.headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        };
        debug!(url = %url, offset, resumed, total_len = ?total_len, "Blob transfer started");

        Ok(Box::new(HttpBlob {
            resp,
            total_len,
            resumed,
        }))
    }

    async fn push_history(
        &self,
        key: &LicenseKey,
        device_id: &str,
        entries: &[HistoryRecord],
    ) -> Result<PushHistoryResponse, RemoteError> {
        let resp = self
            .http
            .post(self.api_url("/history"))
            .timeout(REQUEST_TIMEOUT)
            .json(&PushHistoryRequest {
                key: key.clone(),
                device_id: device_id.to_string(),
                entries: entries.to_vec(),
            })
            .send()
            .await?;
        Ok(Self::check_status(resp).await?.json().await?)
    }

    async fn upsert_placeholder_catalog_entry(&self, code: &CatalogCode) -> Result<(), RemoteError> {
        let resp = self
            .http
            .put(self.api_url(&format!("/catalog/{code}/placeholder")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }
}

/// Total length from `Content-Range: bytes a-b/total`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

struct HttpBlob {
    resp: reqwest::Response,
    total_len: Option<u64>,
    resumed: bool,
}

#[async_trait]
impl BlobBody for HttpBlob {
    fn total_len(&self) -> Option<u64> {
        self.total_len
    }

    fn resumed(&self) -> bool {
        self.resumed
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, RemoteError> {
        Ok(self.resp.chunk().await?)
    }
}
