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

pub mod delivery;
pub mod queue;
pub mod shutdown;

pub use delivery::{
  DeliveryConfig,
  DeliveryLoop,
  ImmediateClient,
  NETWORK_FAILURE_MESSAGE,
  Outcome,
  QueueError,
  RecvTimeoutError,
  recv_blocking,
};
pub use queue::{DEFAULT_MAX_QUEUE_SIZE, DurableQueue, RequestRecord};
pub use shutdown::{ComponentShutdown, ComponentShutdownTrigger};

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}
