// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#![deny(
  clippy::expect_used,
  clippy::panic,
  clippy::todo,
  clippy::unimplemented,
  clippy::unreachable,
  clippy::unwrap_used
)]


use mockall::automock;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use tl_time::TimeDurationExt;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}

/// Queries longer than this are sent as a form body rather than in the URL.
pub const MAX_GET_QUERY_LENGTH: usize = 2048;

//
// Endpoint
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
  /// Queued ingestion requests.
  Ingest,
  /// Immediate fetches (remote config, rating widgets, feedback lists).
  Sdk,
}

impl Endpoint {
  #[must_use]
  pub const fn path(self) -> &'static str {
    match self {
      Self::Ingest => "/i",
      Self::Sdk => "/o/sdk",
    }
  }
}

//
// Response
//

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub body: String,
}

impl Response {
  #[must_use]
  pub const fn is_success(&self) -> bool {
    self.status >= 200 && self.status < 300
  }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("connection failed: {0}")]
  Connection(String),
  #[error("request timed out")]
  Timeout,
}

//
// Transport
//

/// Sends a fully formed, URL-encoded query to the collector.
#[automock]
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, endpoint: Endpoint, query: &str) -> Result<Response, TransportError>;
}

/// Hex encoded SHA-256 of the query concatenated with the salt.
#[must_use]
pub fn checksum(query: &str, salt: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(query.as_bytes());
  hasher.update(salt.as_bytes());
  format!("{:x}", hasher.finalize())
}

//
// HttpTransportConfig
//

#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
  pub server_url: String,
  pub force_post: bool,
  pub salt: Option<String>,
  pub headers: Vec<(String, String)>,
  pub timeout: time::Duration,
}

//
// HttpTransport
//

pub struct HttpTransport {
  client: reqwest::Client,
  server_url: String,
  force_post: bool,
  salt: Option<String>,
  timeout: time::Duration,
}

impl HttpTransport {
  pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
      headers.insert(
        HeaderName::from_bytes(name.as_bytes())?,
        HeaderValue::from_str(value)?,
      );
    }

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .build()?;

    Ok(Self {
      client,
      server_url: config.server_url.trim_end_matches('/').to_string(),
      force_post: config.force_post,
      salt: config.salt,
      timeout: config.timeout,
    })
  }

  fn finalize_query(&self, query: &str) -> String {
    match &self.salt {
      Some(salt) => format!("{query}&checksum256={}", checksum(query, salt)),
      None => query.to_string(),
    }
  }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
  async fn send(&self, endpoint: Endpoint, query: &str) -> Result<Response, TransportError> {
    let query = self.finalize_query(query);
    let url = format!("{}{}", self.server_url, endpoint.path());

    let request = if self.force_post || query.len() > MAX_GET_QUERY_LENGTH {
      self
        .client
        .post(&url)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(query)
    } else {
      self.client.get(format!("{url}?{query}"))
    };

    let send = async {
      let response = request.send().await?;
      let status = response.status().as_u16();
      let body = response.text().await?;
      Ok::<_, reqwest::Error>(Response { status, body })
    };

    match self.timeout.timeout(send).await {
      Ok(Ok(response)) => {
        log::trace!("{} returned {}", endpoint.path(), response.status);
        Ok(response)
      },
      Ok(Err(e)) => Err(TransportError::Connection(e.to_string())),
      Err(_) => Err(TransportError::Timeout),
    }
  }
}
