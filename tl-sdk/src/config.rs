// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use time::ext::NumericalDuration;
use tl_client_common::Feature;
use tl_events::Segmentation;
use tl_request::Location;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
  #[error("server URL is not set")]
  MissingServerUrl,
  #[error("app key is not set")]
  MissingAppKey,
  #[error("unable to parse config: {0}")]
  Parse(String),
}

//
// DirectAttribution
//

/// Campaign attribution known at install time.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DirectAttribution {
  /// `countly` for the legacy campaign format, `_special_test` for raw attribution data.
  pub campaign_type: String,
  pub campaign_data: String,
}

//
// Config
//

/// SDK settings. Every field has a default so a YAML document only needs to name what it changes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub server_url: String,
  pub app_key: String,
  pub app_version: String,

  pub device_id: Option<String>,
  pub temporary_device_id: bool,

  pub requires_consent: bool,
  pub consent_granted: Vec<Feature>,

  pub force_http_post: bool,
  pub tamper_protection_salt: Option<String>,
  pub custom_headers: BTreeMap<String, String>,

  pub event_queue_threshold: usize,
  pub max_request_queue_size: usize,
  pub request_timeout_secs: i64,
  pub retry_initial_backoff_ms: i64,
  pub retry_max_backoff_secs: i64,
  pub session_update_interval_secs: i64,

  pub enable_unhandled_crash_reporting: bool,
  pub record_all_threads_with_crash: bool,
  pub custom_crash_segments: Map<String, Value>,
  pub native_crash_dump_directory: Option<PathBuf>,
  pub max_breadcrumb_count: usize,
  pub max_segmentation_values: usize,
  pub max_value_size: usize,

  pub remote_config_automatic_download: bool,

  pub location: Option<Location>,
  pub disable_location: bool,

  pub metric_override: Map<String, Value>,

  pub direct_attribution: Option<DirectAttribution>,
  pub indirect_attribution: BTreeMap<String, String>,

  /// `RUST_LOG` style filter applied to the SDK's logging when it starts.
  pub log_filter: Option<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      server_url: String::new(),
      app_key: String::new(),
      app_version: String::new(),
      device_id: None,
      temporary_device_id: false,
      requires_consent: false,
      consent_granted: Vec::new(),
      force_http_post: false,
      tamper_protection_salt: None,
      custom_headers: BTreeMap::new(),
      event_queue_threshold: 10,
      max_request_queue_size: tl_queue::DEFAULT_MAX_QUEUE_SIZE,
      request_timeout_secs: 30,
      retry_initial_backoff_ms: 1000,
      retry_max_backoff_secs: 60,
      session_update_interval_secs: 60,
      enable_unhandled_crash_reporting: false,
      record_all_threads_with_crash: false,
      custom_crash_segments: Map::new(),
      native_crash_dump_directory: None,
      max_breadcrumb_count: 100,
      max_segmentation_values: 30,
      max_value_size: 256,
      remote_config_automatic_download: false,
      location: None,
      disable_location: false,
      metric_override: Map::new(),
      direct_attribution: None,
      indirect_attribution: BTreeMap::new(),
      log_filter: None,
    }
  }
}

impl Config {
  #[must_use]
  pub fn new(server_url: impl Into<String>, app_key: impl Into<String>) -> Self {
    Self {
      server_url: server_url.into(),
      app_key: app_key.into(),
      ..Default::default()
    }
  }

  /// Parses and validates a YAML document.
  pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()
  }

  /// Rejects configs that can't reach a collector and clamps limits into their usable range.
  pub fn validate(mut self) -> Result<Self, ConfigError> {
    if self.server_url.trim().is_empty() {
      return Err(ConfigError::MissingServerUrl);
    }
    if self.app_key.trim().is_empty() {
      return Err(ConfigError::MissingAppKey);
    }

    if self.max_request_queue_size < 1 {
      log::warn!("request queue size must be at least 1, using 1");
      self.max_request_queue_size = 1;
    }
    if self.event_queue_threshold < 1 {
      log::warn!("event queue threshold must be at least 1, using 1");
      self.event_queue_threshold = 1;
    }
    if self.session_update_interval_secs < 1 {
      log::warn!("session update interval must be at least 1s, using 1s");
      self.session_update_interval_secs = 1;
    }

    Ok(self)
  }

  #[must_use]
  pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
    self.app_version = app_version.into();
    self
  }

  #[must_use]
  pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
    self.log_filter = Some(filter.into());
    self
  }

  #[must_use]
  pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
    self.device_id = Some(device_id.into());
    self
  }

  #[must_use]
  pub const fn with_temporary_device_id(mut self) -> Self {
    self.temporary_device_id = true;
    self
  }

  /// Requires consent, starting with `granted` enabled.
  #[must_use]
  pub fn with_consent_required(mut self, granted: &[Feature]) -> Self {
    self.requires_consent = true;
    self.consent_granted = granted.to_vec();
    self
  }

  #[must_use]
  pub const fn with_force_http_post(mut self) -> Self {
    self.force_http_post = true;
    self
  }

  #[must_use]
  pub fn with_tamper_protection_salt(mut self, salt: impl Into<String>) -> Self {
    self.tamper_protection_salt = Some(salt.into());
    self
  }

  #[must_use]
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.custom_headers.insert(name.into(), value.into());
    self
  }

  #[must_use]
  pub const fn with_event_queue_threshold(mut self, threshold: usize) -> Self {
    self.event_queue_threshold = threshold;
    self
  }

  #[must_use]
  pub const fn with_max_request_queue_size(mut self, size: usize) -> Self {
    self.max_request_queue_size = size;
    self
  }

  #[must_use]
  pub const fn with_unhandled_crash_reporting(mut self) -> Self {
    self.enable_unhandled_crash_reporting = true;
    self
  }

  #[must_use]
  pub const fn with_all_threads_recorded_with_crash(mut self) -> Self {
    self.record_all_threads_with_crash = true;
    self
  }

  #[must_use]
  pub fn with_custom_crash_segments(mut self, segments: &Segmentation) -> Self {
    self.custom_crash_segments = segments.to_json();
    self
  }

  #[must_use]
  pub fn with_native_crash_dump_directory(mut self, directory: impl Into<PathBuf>) -> Self {
    self.native_crash_dump_directory = Some(directory.into());
    self
  }

  #[must_use]
  pub const fn with_max_breadcrumb_count(mut self, count: usize) -> Self {
    self.max_breadcrumb_count = count;
    self
  }

  #[must_use]
  pub const fn with_max_segmentation_values(mut self, count: usize) -> Self {
    self.max_segmentation_values = count;
    self
  }

  #[must_use]
  pub const fn with_remote_config_automatic_download(mut self) -> Self {
    self.remote_config_automatic_download = true;
    self
  }

  #[must_use]
  pub fn with_location(mut self, location: Location) -> Self {
    self.location = Some(location);
    self.disable_location = false;
    self
  }

  #[must_use]
  pub fn with_location_disabled(mut self) -> Self {
    self.location = None;
    self.disable_location = true;
    self
  }

  #[must_use]
  pub fn with_metric_override(mut self, metrics: Map<String, Value>) -> Self {
    self.metric_override = metrics;
    self
  }

  #[must_use]
  pub fn with_direct_attribution(
    mut self,
    campaign_type: impl Into<String>,
    campaign_data: impl Into<String>,
  ) -> Self {
    self.direct_attribution = Some(DirectAttribution {
      campaign_type: campaign_type.into(),
      campaign_data: campaign_data.into(),
    });
    self
  }

  #[must_use]
  pub fn with_indirect_attribution(mut self, attribution: BTreeMap<String, String>) -> Self {
    self.indirect_attribution = attribution;
    self
  }

  #[must_use]
  pub fn request_timeout(&self) -> time::Duration {
    self.request_timeout_secs.seconds()
  }

  #[must_use]
  pub fn retry_initial_backoff(&self) -> time::Duration {
    self.retry_initial_backoff_ms.milliseconds()
  }

  #[must_use]
  pub fn retry_max_backoff(&self) -> time::Duration {
    self.retry_max_backoff_secs.seconds()
  }

  #[must_use]
  pub fn session_update_interval(&self) -> time::Duration {
    self.session_update_interval_secs.seconds()
  }

  pub(crate) fn headers(&self) -> Vec<(String, String)> {
    self
      .custom_headers
      .iter()
      .map(|(name, value)| (name.clone(), value.clone()))
      .collect()
  }
}
