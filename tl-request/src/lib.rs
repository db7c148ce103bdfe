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

#[cfg(test)]
#[path = "./lib_test.rs"]
mod lib_test;

pub mod metrics;
pub mod query;

pub use metrics::{MetricsProvider, StaticMetrics};
pub use query::Query;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tl_client_common::{ConsentProvider, Feature};
use tl_device::DeviceIdProvider;
use tl_queue::DurableQueue;
use tl_time::TimeProvider;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}

//
// RequestError
//

/// Why a device ID dependent fetch could not be prepared. The display strings are surfaced to
/// the host through completion callbacks.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
  #[error("Can't complete call, device ID is null")]
  NoDeviceId,
  #[error("Can't complete call, temporary device ID is set")]
  TemporaryDeviceId,
}

//
// Location
//

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct Location {
  pub country_code: Option<String>,
  pub city: Option<String>,
  /// `"lat,lon"`
  pub gps_coordinates: Option<String>,
  pub ip_address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocationParams {
  /// Tells the collector to stop deriving a location for this device.
  Disabled,
  Known(Location),
}

impl LocationParams {
  fn append_to(&self, query: &mut Query) {
    match self {
      Self::Disabled => {
        query.push("location", "");
      },
      Self::Known(location) => {
        query
          .push_opt("location", location.gps_coordinates.as_deref())
          .push_opt("city", location.city.as_deref())
          .push_opt("country_code", location.country_code.as_deref())
          .push_opt("ip", location.ip_address.as_deref());
      },
    }
  }
}

//
// Push
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessagingMode {
  Test,
  Production,
}

impl MessagingMode {
  const fn wire_value(self) -> u8 {
    match self {
      Self::Test => 2,
      Self::Production => 0,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessagingProvider {
  Fcm,
  Hms,
}

impl MessagingProvider {
  const fn as_str(self) -> &'static str {
    match self {
      Self::Fcm => "FCM",
      Self::Hms => "HMS",
    }
  }
}

//
// NetworkTrace
//

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkTrace {
  pub key: String,
  pub response_time_ms: i64,
  pub response_code: i32,
  pub request_payload_size: i64,
  pub response_payload_size: i64,
  pub start_ms: i64,
  pub end_ms: i64,
}

//
// RequestBuilderConfig
//

#[derive(Clone, Debug, Default)]
pub struct RequestBuilderConfig {
  pub app_key: String,
  pub sdk_name: String,
  pub sdk_version: String,
  /// Merged over the provider's metrics, replacing values for the same keys.
  pub metric_override: Map<String, Value>,
}

//
// RequestBuilder
//

/// Turns domain actions into collector requests. Every `send_*`-style call appends exactly one
/// record to the durable queue, synchronously, built from the consent, device ID and
/// configuration state at the time of the call. The `prepare_*` calls build requests for the
/// immediate path and are refused while no usable device ID exists.
pub struct RequestBuilder {
  config: RequestBuilderConfig,
  queue: Arc<DurableQueue>,
  device: Arc<dyn DeviceIdProvider>,
  consent: Arc<dyn ConsentProvider>,
  metrics: Arc<dyn MetricsProvider>,
  time: Arc<dyn TimeProvider>,
}

impl RequestBuilder {
  #[must_use]
  pub fn new(
    config: RequestBuilderConfig,
    queue: Arc<DurableQueue>,
    device: Arc<dyn DeviceIdProvider>,
    consent: Arc<dyn ConsentProvider>,
    metrics: Arc<dyn MetricsProvider>,
    time: Arc<dyn TimeProvider>,
  ) -> Self {
    Self {
      config,
      queue,
      device,
      consent,
      metrics,
      time,
    }
  }

  //
  // Sessions
  //

  pub fn begin_session(&self, location: Option<&LocationParams>) {
    let mut query = self.common();
    query
      .push("begin_session", 1)
      .push("metrics", self.metrics_json());

    if let Some(location) = location
      && self.consent.has_consent(Feature::Location)
    {
      location.append_to(&mut query);
    }

    self.enqueue(query);
  }

  /// Reports the seconds elapsed since the last begin or update. Nothing is sent for an empty
  /// interval.
  pub fn update_session(&self, duration_s: i64) {
    if duration_s <= 0 {
      log::trace!("skipping session update with no elapsed time");
      return;
    }

    let mut query = self.common();
    query.push("session_duration", duration_s);
    self.enqueue(query);
  }

  /// Ends the session. `device_id_override` attributes the request to an identity other than the
  /// current one, used when the session belonged to the ID being replaced.
  pub fn end_session(&self, duration_s: i64, device_id_override: Option<&str>) {
    let mut query = self.common_with_device_id(device_id_override);
    query.push("end_session", 1);
    if duration_s > 0 {
      query.push("session_duration", duration_s);
    }
    self.enqueue(query);
  }

  //
  // Identity
  //

  /// Asks the collector to merge the data recorded under `old_device_id` into the current ID.
  pub fn change_device_id(&self, old_device_id: &str, duration_s: i64) {
    let mut query = self.common();
    if duration_s > 0 {
      query.push("session_duration", duration_s);
    }
    query.push("old_device_id", old_device_id);
    self.enqueue(query);
  }

  pub fn token_session(&self, token: &str, mode: MessagingMode, provider: MessagingProvider) {
    let mut query = self.common();
    query
      .push("token_session", 1)
      .push("android_token", token)
      .push("token_provider", provider.as_str())
      .push("test_mode", mode.wire_value());
    self.enqueue(query);
  }

  pub fn send_location(&self, location: &LocationParams) {
    let mut query = self.common();
    location.append_to(&mut query);
    self.enqueue(query);
  }

  /// `user_details` is the JSON document of user properties.
  pub fn send_user_data(&self, user_details: &str) {
    if user_details.is_empty() {
      log::debug!("no user data to send");
      return;
    }

    let mut query = self.common();
    query.push("user_details", user_details);
    self.enqueue(query);
  }

  //
  // Attribution
  //

  pub fn send_indirect_attribution(&self, attribution: &str) {
    let mut query = self.common();
    query.push("aid", attribution);
    self.enqueue(query);
  }

  pub fn send_direct_attribution_legacy(&self, campaign_id: &str, campaign_user: Option<&str>) {
    let mut query = self.common();
    query
      .push("campaign_id", campaign_id)
      .push_opt("campaign_user", campaign_user.filter(|u| !u.is_empty()));
    self.enqueue(query);
  }

  pub fn send_direct_attribution_test(&self, attribution_data: &str) {
    let mut query = self.common();
    query.push("attribution_data", attribution_data);
    self.enqueue(query);
  }

  //
  // Payloads
  //

  /// Gives up and returns false if the queue stays locked for longer than `lock_timeout`.
  pub fn send_crash_report(&self, crash: &str, lock_timeout: std::time::Duration) -> bool {
    let mut query = self.common();
    query.push("crash", crash);

    let Some(id) = self.queue.try_push(query.finish(), lock_timeout) else {
      log::warn!("request queue is locked, dropping crash report");
      return false;
    };
    log::trace!("queued request {id}");
    true
  }

  /// `events` is an already serialized JSON array of events.
  pub fn record_events(&self, events: &str) {
    let mut query = self.common();
    query.push("events", events);
    self.enqueue(query);
  }

  /// `changes` is a JSON object mapping feature names to their new consent state.
  pub fn send_consent_changes(&self, changes: &str) {
    let mut query = self.common();
    query.push("consent", changes);
    self.enqueue(query);
  }

  //
  // APM
  //

  pub fn send_apm_custom_trace(
    &self,
    key: &str,
    duration_ms: i64,
    start_ms: i64,
    end_ms: i64,
    custom_metrics: &Map<String, Value>,
  ) {
    let mut apm_metrics = custom_metrics.clone();
    apm_metrics.insert("duration".to_string(), duration_ms.into());

    self.send_apm("device", key, apm_metrics, start_ms, end_ms);
  }

  pub fn send_apm_network_trace(&self, trace: &NetworkTrace) {
    let mut apm_metrics = Map::new();
    apm_metrics.insert("response_time".to_string(), trace.response_time_ms.into());
    apm_metrics.insert("response_code".to_string(), trace.response_code.into());
    apm_metrics.insert(
      "request_payload_size".to_string(),
      trace.request_payload_size.into(),
    );
    apm_metrics.insert(
      "response_payload_size".to_string(),
      trace.response_payload_size.into(),
    );

    self.send_apm(
      "network",
      &trace.key,
      apm_metrics,
      trace.start_ms,
      trace.end_ms,
    );
  }

  pub fn send_apm_app_start(&self, duration_ms: i64, start_ms: i64, end_ms: i64) {
    let mut apm_metrics = Map::new();
    apm_metrics.insert("duration".to_string(), duration_ms.into());
    self.send_apm("device", "app_start", apm_metrics, start_ms, end_ms);
  }

  pub fn send_apm_screen_time(
    &self,
    foreground: bool,
    duration_ms: i64,
    start_ms: i64,
    end_ms: i64,
  ) {
    let name = if foreground {
      "app_in_foreground"
    } else {
      "app_in_background"
    };

    let mut apm_metrics = Map::new();
    apm_metrics.insert("duration".to_string(), duration_ms.into());
    self.send_apm("device", name, apm_metrics, start_ms, end_ms);
  }

  fn send_apm(
    &self,
    trace_type: &str,
    name: &str,
    apm_metrics: Map<String, Value>,
    start_ms: i64,
    end_ms: i64,
  ) {
    let apm = json!({
      "type": trace_type,
      "name": name,
      "apm_metrics": apm_metrics,
      "stz": start_ms,
      "etz": end_ms,
    });

    let mut query = self.common();
    query.push("count", 1).push("apm", apm);
    self.enqueue(query);
  }

  //
  // Queue
  //

  #[must_use]
  pub fn queue_contains_temporary_id_items(&self) -> bool {
    self.queue.contains_temporary_id_items()
  }

  /// Prompts the delivery loop to retry the head of the queue.
  pub fn tick(&self) {
    self.queue.tick();
  }

  //
  // Immediate requests
  //

  /// Builds a remote config fetch. A non-empty `keys_include` wins over `keys_exclude`; with both
  /// empty every key is requested.
  pub fn prepare_remote_config_request(
    &self,
    keys_include: &[String],
    keys_exclude: &[String],
  ) -> Result<String, RequestError> {
    self.check_device_id()?;

    let mut query = self.common();
    query.push("method", "fetch_remote_config");
    if !keys_include.is_empty() {
      query.push("keys", json!(keys_include));
    } else if !keys_exclude.is_empty() {
      query.push("omit_keys", json!(keys_exclude));
    }
    query.push("metrics", self.metrics_json());

    Ok(query.finish())
  }

  pub fn prepare_rating_widget_request(&self, widget_id: &str) -> Result<String, RequestError> {
    self.check_device_id()?;

    let mut query = self.common();
    query.push("widget_id", widget_id);
    Ok(query.finish())
  }

  pub fn prepare_feedback_list_request(&self) -> Result<String, RequestError> {
    self.check_device_id()?;

    let mut query = self.common();
    query.push("method", "feedback");
    Ok(query.finish())
  }

  fn check_device_id(&self) -> Result<(), RequestError> {
    if self.device.device_id().is_none() {
      log::debug!("device ID is not set, refusing to prepare request");
      return Err(RequestError::NoDeviceId);
    }

    if self.device.is_temporary() || self.queue.contains_temporary_id_items() {
      log::debug!("temporary device ID is in use, refusing to prepare request");
      return Err(RequestError::TemporaryDeviceId);
    }

    Ok(())
  }

  //
  // Common
  //

  fn common(&self) -> Query {
    self.common_with_device_id(None)
  }

  fn common_with_device_id(&self, device_id_override: Option<&str>) -> Query {
    let parts = self.time.timestamp_parts();
    let device_id = device_id_override
      .map(ToString::to_string)
      .or_else(|| self.device.device_id())
      .unwrap_or_default();

    let mut query = Query::default();
    query
      .push("app_key", &self.config.app_key)
      .push("timestamp", parts.timestamp_ms)
      .push("hour", parts.hour)
      .push("dow", parts.dow)
      .push("tz", parts.tz_minutes)
      .push("sdk_version", &self.config.sdk_version)
      .push("sdk_name", &self.config.sdk_name)
      .push("device_id", device_id);
    query
  }

  fn metrics_json(&self) -> String {
    let mut metrics = self.metrics.metrics();
    metrics.extend(self.config.metric_override.clone());
    Value::Object(metrics).to_string()
  }

  fn enqueue(&self, query: Query) {
    // Anything recorded while the identity is switching waits for the switch to complete.
    let delayed = self.queue.device_id_change_pending();
    let id = self.queue.push(query.finish(), delayed);
    log::trace!("queued request {id}");
  }
}
