// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use serde_json::Value;
use std::time::Duration;
use tl_network::Endpoint;
use tl_queue::{ImmediateClient, NETWORK_FAILURE_MESSAGE, RecvTimeoutError, recv_blocking};
use tl_request::RequestError;
use tokio::sync::oneshot;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The request was refused or failed. Carries the message surfaced to the host.
  #[error("{0}")]
  Failed(String),
  #[error("timed out waiting for response")]
  Timeout,
}

//
// FetchHandle
//

/// Resolves with the collector's JSON response to a rating widget or feedback list fetch.
#[derive(Debug)]
pub struct FetchHandle {
  rx: oneshot::Receiver<Result<Value, String>>,
}

impl FetchHandle {
  pub(crate) fn start(
    runtime: &tokio::runtime::Handle,
    immediate: &ImmediateClient,
    prepared: Result<String, RequestError>,
  ) -> Self {
    let (tx, rx) = oneshot::channel();

    match prepared {
      Ok(query) => {
        let immediate = immediate.clone();
        runtime.spawn(async move {
          let _ignored = tx.send(immediate.fetch_json(Endpoint::Sdk, query).await);
        });
      },
      Err(e) => {
        log::debug!("refusing fetch: {e}");
        let _ignored = tx.send(Err(e.to_string()));
      },
    }

    Self { rx }
  }

  pub(crate) fn failed(message: &str) -> Self {
    let (tx, rx) = oneshot::channel();
    let _ignored = tx.send(Err(message.to_string()));
    Self { rx }
  }

  pub async fn wait(self) -> Result<Value, FetchError> {
    self
      .rx
      .await
      .unwrap_or_else(|_| Err(NETWORK_FAILURE_MESSAGE.to_string()))
      .map_err(FetchError::Failed)
  }

  /// For callers outside the runtime.
  pub fn blocking_wait(self, timeout: Duration) -> Result<Value, FetchError> {
    match recv_blocking(self.rx, timeout) {
      Ok(result) => result.map_err(FetchError::Failed),
      Err(RecvTimeoutError::Timeout) => Err(FetchError::Timeout),
      Err(RecvTimeoutError::Closed) => Err(FetchError::Failed(NETWORK_FAILURE_MESSAGE.to_string())),
    }
  }
}
