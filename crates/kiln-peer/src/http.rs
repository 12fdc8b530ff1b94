use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use kiln_task::{PerformanceRecord, TaskStatus, WorkerId};
use reqwest::{Client, Response, Url};
use serde::Serialize;
use tracing::debug;

use crate::{PeerError, StatusReporter};

#[derive(Serialize)]
struct ClaimBody<'a> {
  worker: &'a WorkerId,
}

#[derive(Serialize)]
struct ReportBody<'a> {
  status: TaskStatus,
  perf: f64,
  train_perf: &'a HashMap<String, f64>,
  test_perf: &'a HashMap<String, f64>,
}

/// HTTP client for the peer.
///
/// Routes:
/// - `POST {base}/learnuplet/{key}/worker` claim
/// - `POST {base}/learnuplet/{key}/report` outcome
///
/// The task key is a single path segment; `/`, `?` and `#` in it are
/// percent-encoded.
pub struct HttpPeer {
  base_url: Url,
  client: Client,
}

impl HttpPeer {
  /// Create a client for the peer at `base_url`.
  pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, PeerError> {
    let mut builder = Client::builder();
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let base_url = base_url.into();
    let base_url = Url::parse(&base_url)
      .map_err(|e| PeerError::InvalidUrl(format!("{}: {}", base_url, e)))?;
    if base_url.cannot_be_a_base() {
      return Err(PeerError::InvalidUrl(base_url.to_string()));
    }

    Ok(Self {
      base_url,
      client: builder.build()?,
    })
  }

  fn url(&self, task_key: &str, action: &str) -> Result<Url, PeerError> {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|()| PeerError::InvalidUrl(self.base_url.to_string()))?
      .pop_if_empty()
      .extend(["learnuplet", task_key, action]);
    Ok(url)
  }

  async fn check(response: Response) -> Result<(), PeerError> {
    let status = response.status();
    if status.is_success() {
      return Ok(());
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(PeerError::Status {
      status: status.as_u16(),
      url,
      body,
    })
  }
}

#[async_trait]
impl StatusReporter for HttpPeer {
  async fn claim(&self, task_key: &str, worker: &WorkerId) -> Result<(), PeerError> {
    let url = self.url(task_key, "worker")?;
    debug!(url = %url, worker = %worker, "claiming task");

    let response = self
      .client
      .post(url)
      .json(&ClaimBody { worker })
      .send()
      .await?;
    Self::check(response).await
  }

  async fn report_learn(
    &self,
    task_key: &str,
    status: TaskStatus,
    performance: &PerformanceRecord,
  ) -> Result<(), PeerError> {
    let url = self.url(task_key, "report")?;
    debug!(url = %url, status = %status, perf = performance.perf, "reporting task");

    let body = ReportBody {
      status,
      perf: performance.perf,
      train_perf: &performance.train_perf,
      test_perf: &performance.test_perf,
    };
    let response = self.client.post(url).json(&body).send().await?;
    Self::check(response).await
  }
}
