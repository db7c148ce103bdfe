// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use std::sync::Arc;
use std::time::Duration;
use tl_queue::{RecvTimeoutError, recv_blocking};
use tokio::sync::oneshot;

//
// RemoteConfigListener
//

/// Told about the outcome of every remote config update, including automatic ones. `error` is
/// None on success.
pub trait RemoteConfigListener: Send + Sync {
  fn on_update(&self, error: Option<&str>);
}

//
// UpdateCompletion
//

/// The producing side of an update. Completing it resolves the matching `UpdateHandle` and
/// notifies the listener, exactly once.
pub struct UpdateCompletion {
  tx: oneshot::Sender<Option<String>>,
  listener: Option<Arc<dyn RemoteConfigListener>>,
}

impl UpdateCompletion {
  #[must_use]
  pub fn new(listener: Option<Arc<dyn RemoteConfigListener>>) -> (Self, UpdateHandle) {
    let (tx, rx) = oneshot::channel();
    (Self { tx, listener }, UpdateHandle { rx })
  }

  pub fn complete(self, error: Option<String>) {
    match &error {
      Some(error) => log::debug!("remote config update failed: {error}"),
      None => log::debug!("remote config update finished"),
    }

    if let Some(listener) = &self.listener {
      listener.on_update(error.as_deref());
    }

    if self.tx.send(error).is_err() {
      log::trace!("remote config update handle was dropped");
    }
  }
}

//
// UpdateHandle
//

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WaitError {
  #[error("timed out waiting for remote config update")]
  Timeout,
  #[error("remote config update was abandoned")]
  Abandoned,
}

/// Resolves with None once the update succeeded, or with a failure message.
#[derive(Debug)]
pub struct UpdateHandle {
  rx: oneshot::Receiver<Option<String>>,
}

impl UpdateHandle {
  pub async fn wait(self) -> Result<Option<String>, WaitError> {
    self.rx.await.map_err(|_| WaitError::Abandoned)
  }

  /// For callers outside the runtime.
  pub fn blocking_wait(self, timeout: Duration) -> Result<Option<String>, WaitError> {
    recv_blocking(self.rx, timeout).map_err(|e| match e {
      RecvTimeoutError::Timeout => WaitError::Timeout,
      RecvTimeoutError::Closed => WaitError::Abandoned,
    })
  }
}
