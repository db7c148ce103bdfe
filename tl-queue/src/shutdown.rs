// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use std::sync::Arc;
use tokio::sync::watch;

//
// ComponentStatus
//

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentStatus {
  Running,
  PendingShutdown,
}

//
// ComponentShutdownTrigger
//

/// Initiates shutdown of the components holding a `ComponentShutdown` made from it.
#[derive(Debug)]
pub struct ComponentShutdownTrigger {
  status_tx: Arc<watch::Sender<ComponentStatus>>,
}

impl Default for ComponentShutdownTrigger {
  fn default() -> Self {
    let (status_tx, _) = watch::channel(ComponentStatus::Running);
    Self {
      status_tx: Arc::new(status_tx),
    }
  }
}

impl ComponentShutdownTrigger {
  #[must_use]
  pub fn make_shutdown(&self) -> ComponentShutdown {
    ComponentShutdown {
      status_rx: self.status_tx.subscribe(),
    }
  }

  /// Signals shutdown and waits for every component to drop its `ComponentShutdown`. Used in async
  /// context.
  pub async fn shutdown(self) {
    self
      .status_tx
      .send_replace(ComponentStatus::PendingShutdown);
    self.status_tx.closed().await;
  }

  /// Signals shutdown and waits for every component to drop its `ComponentShutdown`. Used in sync
  /// context.
  pub fn shutdown_blocking(self) {
    self
      .status_tx
      .send_replace(ComponentStatus::PendingShutdown);
    while !self.status_tx.is_closed() {
      std::thread::sleep(std::time::Duration::from_millis(50));
    }
  }
}

//
// ComponentShutdown
//

/// Held by a component to learn about shutdown. The trigger knows every component has stopped
/// once all of these have been dropped.
#[derive(Clone, Debug)]
pub struct ComponentShutdown {
  status_rx: watch::Receiver<ComponentStatus>,
}

impl ComponentShutdown {
  /// Returns when the component has been cancelled.
  pub async fn cancelled(&mut self) {
    if *self.status_rx.borrow_and_update() == ComponentStatus::PendingShutdown {
      return;
    }
    let _ignored = self.status_rx.changed().await;
  }

  #[must_use]
  pub fn component_status(&self) -> ComponentStatus {
    *self.status_rx.borrow()
  }
}
