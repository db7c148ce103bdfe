// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use serde_json::{Map, Value};

//
// MetricsProvider
//

/// Host device and app metrics (`_os`, `_os_version`, `_app_version`, ...) reported with session
/// starts, remote config fetches and crashes.
pub trait MetricsProvider: Send + Sync {
  fn metrics(&self) -> Map<String, Value>;

  /// Metrics attached to crash reports. Hosts can add state only meaningful for crashes such as
  /// free memory or orientation.
  fn crash_metrics(&self) -> Map<String, Value> {
    self.metrics()
  }
}

//
// StaticMetrics
//

/// A fixed set of metrics captured once at startup.
#[derive(Clone, Debug, Default)]
pub struct StaticMetrics {
  metrics: Map<String, Value>,
}

impl StaticMetrics {
  #[must_use]
  pub const fn new(metrics: Map<String, Value>) -> Self {
    Self { metrics }
  }

  /// The metrics knowable without help from the host platform.
  #[must_use]
  pub fn host(app_version: &str) -> Self {
    let mut metrics = Map::new();
    metrics.insert("_os".to_string(), std::env::consts::OS.into());
    metrics.insert("_arch".to_string(), std::env::consts::ARCH.into());
    metrics.insert("_app_version".to_string(), app_version.into());
    Self { metrics }
  }
}

impl MetricsProvider for StaticMetrics {
  fn metrics(&self) -> Map<String, Value> {
    self.metrics.clone()
  }
}
