//! REST client for the snapshot endpoints of the sync service.
//!
//! ```text
//! POST /api/documents/{doc}/versions            NewVersion -> VersionSnapshot
//! GET  /api/documents/{doc}/versions            -> [VersionInfo]
//! GET  /api/documents/{doc}/versions/{version}  -> VersionSnapshot
//! ```
//!
//! Error responses carry a [`SerializableError`] body.

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use super::service::{BoxFuture, SnapshotService};
use super::snapshot::{NewVersion, VersionInfo, VersionSnapshot};
use crate::error::{CollabError, Result, SerializableError};

#[derive(Debug, Clone)]
pub struct HttpSnapshotService {
    client: Client,
    base_url: Url,
    token: String,
}

impl HttpSnapshotService {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| CollabError::Http(format!("invalid base url '{}': {}", base_url, e)))?;
        Ok(Self {
            client: Client::new(),
            base_url,
            token: token.into(),
        })
    }

    fn versions_url(&self, document: &str, version: Option<u64>) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CollabError::Http("base url cannot be a base".to_string()))?;
            segments
                .pop_if_empty()
                .extend(["api", "documents", document, "versions"]);
            if let Some(v) = version {
                segments.push(&v.to_string());
            }
        }
        Ok(url)
    }
}

/// Decode a JSON body or map the error response onto a `CollabError`.
async fn read_json<T: DeserializeOwned>(response: Response, version: Option<u64>) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| CollabError::Http(format!("invalid response body: {}", e)));
    }
    let body = response.text().await.unwrap_or_default();
    if let Ok(error) = serde_json::from_str::<SerializableError>(&body) {
        return Err(error.into_error());
    }
    Err(match (status, version) {
        (StatusCode::NOT_FOUND, Some(v)) => CollabError::VersionNotFound(v),
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => CollabError::Authorization(body),
        _ => CollabError::Http(format!("{} - {}", status, body)),
    })
}

fn transport_error(e: reqwest::Error) -> CollabError {
    CollabError::Http(format!("snapshot service unreachable: {}", e))
}

impl SnapshotService for HttpSnapshotService {
    fn create_version<'a>(
        &'a self,
        document: &'a str,
        version: NewVersion,
    ) -> BoxFuture<'a, Result<VersionSnapshot>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.versions_url(document, None)?)
                .bearer_auth(&self.token)
                .json(&version)
                .send()
                .await
                .map_err(transport_error)?;
            read_json(response, None).await
        })
    }

    fn list_versions<'a>(&'a self, document: &'a str) -> BoxFuture<'a, Result<Vec<VersionInfo>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.versions_url(document, None)?)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(transport_error)?;
            read_json(response, None).await
        })
    }

    fn fetch_version<'a>(
        &'a self,
        document: &'a str,
        version: u64,
    ) -> BoxFuture<'a, Result<VersionSnapshot>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.versions_url(document, Some(version))?)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(transport_error)?;
            read_json(response, Some(version)).await
        })
    }
}
