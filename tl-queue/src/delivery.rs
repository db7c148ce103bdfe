// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./delivery_test.rs"]
mod delivery_test;

use crate::queue::DurableQueue;
use crate::shutdown::{ComponentShutdown, ComponentStatus};
use backoff::backoff::Backoff;
use serde_json::Value;
use std::sync::Arc;
use time::ext::NumericalDuration;
use tl_log::warn_every;
use tl_network::{Endpoint, Response, Transport, TransportError};
use tl_time::TimeDurationExt;
use tokio::sync::{mpsc, oneshot};

/// Reported to the caller of an immediate request when the collector could not be reached.
pub const NETWORK_FAILURE_MESSAGE: &str =
  "Encountered problem while trying to reach the server, possibly no internet connection";

//
// DeliveryConfig
//

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
  pub request_timeout: time::Duration,
  pub initial_backoff: time::Duration,
  pub max_backoff: time::Duration,
}

impl Default for DeliveryConfig {
  fn default() -> Self {
    Self {
      request_timeout: 30.seconds(),
      initial_backoff: 1.seconds(),
      max_backoff: 60.seconds(),
    }
  }
}

//
// Outcome
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
  Delivered,
  /// Worth retrying: connectivity problems, timeouts, server errors and throttling.
  Transient,
  /// The collector rejected the request itself. Retrying can never succeed.
  Permanent,
}

#[must_use]
pub fn classify(result: &Result<Response, TransportError>) -> Outcome {
  match result {
    Ok(response) if response.is_success() => Outcome::Delivered,
    Ok(response) if (400 .. 500).contains(&response.status) => match response.status {
      408 | 429 => Outcome::Transient,
      _ => Outcome::Permanent,
    },
    Ok(_) | Err(_) => Outcome::Transient,
  }
}

//
// ImmediateRequest
//

/// A request that bypasses the durable queue and reports its result to the caller exactly once.
#[derive(Debug)]
pub struct ImmediateRequest {
  pub endpoint: Endpoint,
  pub query: String,
  pub response_tx: oneshot::Sender<Result<Response, String>>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueueError {
  #[error("delivery loop is shutting down")]
  Shutdown,
  #[error("too many immediate requests in flight")]
  Full,
}

//
// ImmediateClient
//

#[derive(Clone)]
pub struct ImmediateClient {
  tx: mpsc::Sender<ImmediateRequest>,
}

impl ImmediateClient {
  /// Hands a request to the delivery loop without waiting for it. The returned receiver resolves
  /// with the collector response or a failure message.
  pub fn send(
    &self,
    endpoint: Endpoint,
    query: String,
  ) -> Result<oneshot::Receiver<Result<Response, String>>, QueueError> {
    let (response_tx, response_rx) = oneshot::channel();

    self
      .tx
      .try_send(ImmediateRequest {
        endpoint,
        query,
        response_tx,
      })
      .map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => QueueError::Full,
        mpsc::error::TrySendError::Closed(_) => QueueError::Shutdown,
      })?;

    Ok(response_rx)
  }

  /// Sends a request and decodes the collector's JSON answer. Failures are reported as a message
  /// for the host.
  pub async fn fetch_json(&self, endpoint: Endpoint, query: String) -> Result<Value, String> {
    let response = self
      .send(endpoint, query)
      .map_err(|e| e.to_string())?
      .await
      .map_err(|_| NETWORK_FAILURE_MESSAGE.to_string())??;

    if !response.is_success() {
      log::debug!("fetch failed with status {}", response.status);
      return Err(NETWORK_FAILURE_MESSAGE.to_string());
    }

    serde_json::from_str(&response.body).map_err(|e| {
      log::debug!("fetch response is not JSON: {e}");
      NETWORK_FAILURE_MESSAGE.to_string()
    })
  }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
  #[error("timed out waiting for a result")]
  Timeout,
  #[error("result was abandoned")]
  Closed,
}

/// Waits for a one-shot result from a thread outside the runtime.
pub fn recv_blocking<T>(
  mut rx: oneshot::Receiver<T>,
  timeout: std::time::Duration,
) -> Result<T, RecvTimeoutError> {
  let deadline = std::time::Instant::now() + timeout;

  loop {
    match rx.try_recv() {
      Ok(result) => return Ok(result),
      Err(oneshot::error::TryRecvError::Closed) => return Err(RecvTimeoutError::Closed),
      Err(oneshot::error::TryRecvError::Empty) => {
        if std::time::Instant::now() > deadline {
          return Err(RecvTimeoutError::Timeout);
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
      },
    }
  }
}

//
// DeliveryLoop
//

/// Drains the durable queue to the collector, one record at a time and in order. Runs on its own
/// task so callers never wait on the network. Shutdown only stops the loop from starting another
/// send: a send already in flight runs to completion.
pub struct DeliveryLoop {
  queue: Arc<DurableQueue>,
  transport: Arc<dyn Transport>,
  immediate_rx: mpsc::Receiver<ImmediateRequest>,
  shutdown: ComponentShutdown,
  config: DeliveryConfig,
  backoff: Option<backoff::ExponentialBackoff>,
}

impl DeliveryLoop {
  #[must_use]
  pub fn new(
    queue: Arc<DurableQueue>,
    transport: Arc<dyn Transport>,
    config: DeliveryConfig,
    shutdown: ComponentShutdown,
  ) -> (Self, ImmediateClient) {
    let (tx, immediate_rx) = mpsc::channel(16);

    (
      Self {
        queue,
        transport,
        immediate_rx,
        shutdown,
        config,
        backoff: None,
      },
      ImmediateClient { tx },
    )
  }

  pub async fn run(mut self) {
    log::debug!("starting delivery loop");

    'delivery: loop {
      if self.shutdown.component_status() == ComponentStatus::PendingShutdown {
        break;
      }

      while let Ok(request) = self.immediate_rx.try_recv() {
        self.send_immediate(request).await;
      }

      let Some(record) = self.queue.next_deliverable() else {
        tokio::select! {
          () = self.shutdown.cancelled() => break,
          () = self.queue.changed() => {},
          Some(request) = self.immediate_rx.recv() => self.send_immediate(request).await,
        }
        continue;
      };

      log::trace!("delivering request {}", record.id);
      let result = self.send(Endpoint::Ingest, &record.query).await;

      match classify(&result) {
        Outcome::Delivered => {
          self.queue.remove(record.id);
          self.backoff = None;
        },
        Outcome::Permanent => {
          log::warn!(
            "dropping request {} rejected by the collector: {:?}",
            record.id,
            result
          );
          self.queue.remove(record.id);
          self.backoff = None;
        },
        Outcome::Transient => {
          let delay = self.next_backoff();
          warn_every!(
            30.seconds(),
            "request {} failed ({:?}), retrying in {:?}",
            record.id,
            result,
            delay
          );

          // Immediate requests don't go through the queue, so they are not held up by the retry.
          let retry = tokio::time::sleep(delay);
          tokio::pin!(retry);
          loop {
            tokio::select! {
              () = self.shutdown.cancelled() => break 'delivery,
              () = &mut retry => break,
              Some(request) = self.immediate_rx.recv() => self.send_immediate(request).await,
            }
          }
        },
      }
    }

    log::debug!("delivery loop stopped");
  }

  async fn send(&self, endpoint: Endpoint, query: &str) -> Result<Response, TransportError> {
    self
      .config
      .request_timeout
      .timeout(self.transport.send(endpoint, query))
      .await
      .unwrap_or(Err(TransportError::Timeout))
  }

  async fn send_immediate(&self, request: ImmediateRequest) {
    let result = match self.send(request.endpoint, &request.query).await {
      Ok(response) => Ok(response),
      Err(e) => {
        log::debug!("immediate request failed: {e}");
        Err(NETWORK_FAILURE_MESSAGE.to_string())
      },
    };

    // The caller may have stopped waiting.
    let _ignored = request.response_tx.send(result);
  }

  fn next_backoff(&mut self) -> std::time::Duration {
    let max = self.config.max_backoff.unsigned_abs();
    let initial = self.config.initial_backoff.unsigned_abs();

    self
      .backoff
      .get_or_insert_with(|| {
        backoff::ExponentialBackoffBuilder::new()
          .with_initial_interval(initial)
          .with_max_interval(max)
          .with_max_elapsed_time(None)
          .build()
      })
      .next_backoff()
      .unwrap_or(max)
  }
}
