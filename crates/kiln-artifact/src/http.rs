use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Response, StatusCode};
use tracing::debug;
use uuid::Uuid;

use crate::{ArtifactKind, ArtifactMetadata, ArtifactStore, ByteStream, Error, ModelRecord};

/// Client for the HTTP storage service.
///
/// Routes:
/// - `GET  {base}/{kind}/{id}/blob` blob content
/// - `GET  {base}/{kind}/{id}` metadata
/// - `POST {base}/model?id={id}&algo={algo}` model upload
pub struct HttpArtifactStore {
  base_url: String,
  client: Client,
}

impl HttpArtifactStore {
  /// Create a client for the storage service at `base_url`.
  ///
  /// `timeout` bounds every request, including streaming the body.
  pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, Error> {
    let mut builder = Client::builder();
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    Ok(Self {
      base_url: base_url.into().trim_end_matches('/').to_string(),
      client: builder.build()?,
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}/{}", self.base_url, path)
  }

  fn check(response: Response, kind: ArtifactKind, id: Uuid) -> Result<Response, Error> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
      return Err(Error::NotFound { kind, id });
    }
    if !status.is_success() {
      return Err(Error::Status {
        status: status.as_u16(),
        url: response.url().to_string(),
      });
    }
    Ok(response)
  }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
  async fn fetch(&self, kind: ArtifactKind, id: Uuid) -> Result<ByteStream, Error> {
    let url = self.url(&format!("{}/{}/blob", kind, id));
    debug!(url = %url, "fetching artifact");

    let response = self.client.get(&url).send().await?;
    let response = Self::check(response, kind, id)?;
    let stream = response.bytes_stream().map(|r| r.map_err(Error::Http));
    Ok(Box::pin(stream))
  }

  async fn fetch_metadata(&self, kind: ArtifactKind, id: Uuid) -> Result<ArtifactMetadata, Error> {
    let url = self.url(&format!("{}/{}", kind, id));
    let response = self.client.get(&url).send().await?;
    let response = Self::check(response, kind, id)?;
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Metadata(e.to_string()))
  }

  async fn store_model(
    &self,
    model: &ModelRecord,
    data: ByteStream,
    size: u64,
  ) -> Result<(), Error> {
    let url = self.url("model");
    debug!(url = %url, model_id = %model.id, size, "uploading model");

    let response = self
      .client
      .post(&url)
      .query(&[("id", model.id.to_string()), ("algo", model.algo.to_string())])
      .header(CONTENT_LENGTH, size)
      .body(Body::wrap_stream(data))
      .send()
      .await?;

    Self::check(response, ArtifactKind::Model, model.id)?;
    Ok(())
  }
}
