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

mod builder;
pub mod config;
mod events;
mod fetch;
mod sdk;

pub use builder::{InitParams, SdkBuilder, SdkFuture};
pub use config::{Config, ConfigError, DirectAttribution};
pub use fetch::{FetchError, FetchHandle};
pub use sdk::Sdk;
pub use tl_client_common::Feature;
pub use tl_device::DeviceIdType;
pub use tl_events::Segmentation;
pub use tl_remote_config::{RemoteConfigListener, UpdateHandle, WaitError};
pub use tl_request::{Location, MessagingMode, MessagingProvider, NetworkTrace};

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}

/// Reported with every request as `sdk_name`.
pub const SDK_NAME: &str = "rust-native-tl";

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
