// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./sdk_test.rs"]
mod sdk_test;

use crate::events::EventBatch;
use crate::fetch::FetchHandle;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use tl_client_common::consent::Consent;
use tl_client_common::{ConsentProvider, Feature};
use tl_crash::CrashReporter;
use tl_device::{Device, DeviceIdType, TEMPORARY_DEVICE_ID};
use tl_events::{Event, Segmentation};
use tl_log::SwapLogger;
use tl_queue::{ComponentShutdownTrigger, DurableQueue, ImmediateClient};
use tl_remote_config::{NO_CONSENT_MESSAGE, RemoteConfig, UpdateHandle, UpdateScope};
use tl_request::{
  Location,
  LocationParams,
  MessagingMode,
  MessagingProvider,
  NetworkTrace,
  RequestBuilder,
};
use tl_time::{OffsetDateTimeExt, TimeProvider};

const LEGACY_CAMPAIGN_TYPE: &str = "countly";
const TEST_CAMPAIGN_TYPE: &str = "_special_test";

//
// State
//

struct State {
  events: EventBatch,
  // When the running session last reported its duration. None while no session is running.
  session_tick: Option<OffsetDateTime>,
  location: Option<LocationParams>,
  traces: HashMap<String, OffsetDateTime>,
}

//
// Components
//

pub(crate) struct Components {
  pub device: Arc<Device>,
  pub consent: Arc<Consent>,
  pub queue: Arc<DurableQueue>,
  pub requests: Arc<RequestBuilder>,
  pub crashes: Arc<CrashReporter>,
  pub remote_config: RemoteConfig,
  pub immediate: ImmediateClient,
  pub time: Arc<dyn TimeProvider>,
  pub runtime: tokio::runtime::Handle,
  pub shutdown_trigger: ComponentShutdownTrigger,
}

//
// Sdk
//

/// The host facing API. Every call that changes SDK state serializes on one lock; crash
/// recording bypasses it so that a panic raised while the lock is held can still be reported.
/// None of the calls wait on the network.
pub struct Sdk {
  device: Arc<Device>,
  consent: Arc<Consent>,
  queue: Arc<DurableQueue>,
  requests: Arc<RequestBuilder>,
  crashes: Arc<CrashReporter>,
  remote_config: RemoteConfig,
  immediate: ImmediateClient,
  time: Arc<dyn TimeProvider>,
  runtime: tokio::runtime::Handle,
  max_segmentation_values: usize,

  state: Mutex<State>,
  shutdown_state: Mutex<Option<ComponentShutdownTrigger>>,
}

impl Sdk {
  pub(crate) fn new(
    components: Components,
    event_queue_threshold: usize,
    max_segmentation_values: usize,
    location: Option<LocationParams>,
  ) -> Self {
    Self {
      device: components.device,
      consent: components.consent,
      queue: components.queue,
      requests: components.requests,
      crashes: components.crashes,
      remote_config: components.remote_config,
      immediate: components.immediate,
      time: components.time,
      runtime: components.runtime,
      max_segmentation_values,
      state: Mutex::new(State {
        events: EventBatch::new(event_queue_threshold),
        session_tick: None,
        location,
        traces: HashMap::new(),
      }),
      shutdown_state: Mutex::new(Some(components.shutdown_trigger)),
    }
  }

  //
  // Events
  //

  /// Adds an event to the batch. The batch is sent once it reaches the configured threshold.
  pub fn record_event(
    &self,
    key: &str,
    count: i32,
    sum: f64,
    duration: f64,
    segmentation: Option<&Segmentation>,
  ) {
    let mut state = self.state.lock();
    self.add_event(&mut state, key, count, sum, duration, segmentation);
  }

  /// Starts timing an event. Returns false if it is already running or can't be recorded.
  pub fn start_event(&self, key: &str) -> bool {
    if key.is_empty() || !self.consent.has_consent(Feature::Events) {
      return false;
    }

    self.state.lock().events.start_timed(key, self.time.now())
  }

  /// Records a timed event with its duration measured from `start_event`.
  pub fn end_event(
    &self,
    key: &str,
    count: i32,
    sum: f64,
    segmentation: Option<&Segmentation>,
  ) -> bool {
    let mut state = self.state.lock();
    let Some(started_at) = state.events.end_timed(key) else {
      log::debug!("timed event {key:?} was not started");
      return false;
    };

    let duration = (self.time.now() - started_at).as_seconds_f64();
    self.add_event(&mut state, key, count, sum, duration, segmentation);
    true
  }

  /// Sends every batched event now.
  pub fn flush_events(&self) {
    let mut state = self.state.lock();
    self.flush_locked(&mut state);
  }

  fn add_event(
    &self,
    state: &mut State,
    key: &str,
    count: i32,
    sum: f64,
    duration: f64,
    segmentation: Option<&Segmentation>,
  ) {
    if !self.consent.has_consent(Feature::Events) {
      log::debug!("no consent for events, dropping {key:?}");
      return;
    }
    if key.is_empty() {
      log::warn!("dropping event with an empty key");
      return;
    }
    if count < 1 {
      log::warn!("dropping event {key:?} with count {count}");
      return;
    }

    let mut event = Event::new(key, self.time.timestamp_parts());
    event.count = count;
    event.sum = sum;
    event.duration = duration.max(0.0);
    if let Some(segmentation) = segmentation {
      let mut segmentation = segmentation.clone();
      segmentation.truncate(self.max_segmentation_values);
      event.segmentation = segmentation;
    }

    if state.events.push(event) {
      self.flush_locked(state);
    }
  }

  fn flush_locked(&self, state: &mut State) {
    if let Some(events) = state.events.take() {
      self.requests.record_events(&events);
    }
  }

  //
  // Sessions
  //

  pub fn begin_session(&self) {
    let mut state = self.state.lock();
    self.begin_session_locked(&mut state);
  }

  /// Reports the time elapsed since the last begin or update, sending batched events first.
  pub fn update_session(&self) {
    let mut state = self.state.lock();
    self.update_session_locked(&mut state);
  }

  pub fn end_session(&self) {
    let mut state = self.state.lock();
    self.end_session_locked(&mut state);
  }

  #[must_use]
  pub fn session_running(&self) -> bool {
    self.state.lock().session_tick.is_some()
  }

  fn begin_session_locked(&self, state: &mut State) {
    if !self.consent.has_consent(Feature::Sessions) {
      log::debug!("no consent for sessions, not beginning session");
      return;
    }
    if state.session_tick.is_some() {
      log::debug!("session already running");
      return;
    }

    state.session_tick = Some(self.time.now());
    self.requests.begin_session(state.location.as_ref());
  }

  fn update_session_locked(&self, state: &mut State) {
    self.flush_locked(state);

    if !self.consent.has_consent(Feature::Sessions) {
      return;
    }
    if let Some(duration) = self.take_session_duration(state) {
      self.requests.update_session(duration);
    }
  }

  // Returns whether a session was running.
  fn end_session_locked(&self, state: &mut State) -> bool {
    self.flush_locked(state);

    let Some(duration) = self.take_session_duration(state) else {
      log::debug!("no session running");
      return false;
    };
    state.session_tick = None;

    if self.consent.has_consent(Feature::Sessions) {
      self.requests.end_session(duration, None);
    }
    true
  }

  // Whole seconds since the last report. The remainder carries over to the next one.
  fn take_session_duration(&self, state: &mut State) -> Option<i64> {
    let tick = state.session_tick.as_mut()?;
    let duration = (self.time.now() - *tick).whole_seconds();
    *tick += time::Duration::seconds(duration);
    Some(duration)
  }

  /// Periodic work driven by the background task.
  pub(crate) fn on_timer(&self) {
    let mut state = self.state.lock();
    if state.session_tick.is_some() {
      self.update_session_locked(&mut state);
    } else {
      self.flush_locked(&mut state);
    }
    self.requests.tick();
  }

  //
  // Device ID
  //

  #[must_use]
  pub fn device_id(&self) -> Option<String> {
    self.device.current().map(|device_id| device_id.id)
  }

  #[must_use]
  pub fn device_id_type(&self) -> Option<DeviceIdType> {
    self.device.current().map(|device_id| device_id.id_type)
  }

  /// Switches to a new device ID and asks the collector to merge the data recorded under the old
  /// one into it.
  pub fn change_device_id_with_merge(&self, device_id: &str) {
    let mut state = self.state.lock();
    let Some(current) = self.check_device_id_change(&mut state, device_id) else {
      return;
    };

    self.flush_locked(&mut state);
    let duration = self.take_session_duration(&mut state).unwrap_or(0);
    self.device.set(device_id, DeviceIdType::DeveloperSupplied);
    self.requests.change_device_id(&current, duration);

    self.remote_config.clear_and_download_after_id_change();
    self.remote_config.device_id_changed();
  }

  /// Switches to a new device ID without merging. The running session is ended under the old ID
  /// and restarted under the new one.
  pub fn change_device_id_without_merge(&self, device_id: &str) {
    let mut state = self.state.lock();
    if self
      .check_device_id_change(&mut state, device_id)
      .is_none()
    {
      return;
    }

    let session_was_running = self.end_session_locked(&mut state);

    self.queue.begin_device_id_change();
    self.remote_config.clear_and_download_after_id_change();
    self.device.set(device_id, DeviceIdType::DeveloperSupplied);
    if session_was_running {
      self.begin_session_locked(&mut state);
    }
    self.queue.complete_device_id_change();

    self.remote_config.device_id_changed();
  }

  /// Stops attributing data to any device until a real ID is set. Requests recorded meanwhile
  /// are held in the queue and rewritten once the real ID arrives.
  pub fn enable_temporary_id_mode(&self) {
    let mut state = self.state.lock();
    self.enter_temporary_mode_locked(&mut state);
  }

  #[must_use]
  pub fn is_temporary_id_mode(&self) -> bool {
    self
      .device
      .current()
      .is_some_and(|device_id| device_id.is_temporary())
  }

  // Handles the cases shared by both kinds of change. Returns the current ID if the caller still
  // has to carry out the change.
  fn check_device_id_change(&self, state: &mut State, device_id: &str) -> Option<String> {
    if device_id.is_empty() {
      log::warn!("ignoring change to an empty device ID");
      return None;
    }

    if device_id == TEMPORARY_DEVICE_ID {
      self.enter_temporary_mode_locked(state);
      return None;
    }

    let current = self.device.current()?;
    if current.id == device_id {
      log::debug!("device ID is unchanged");
      return None;
    }

    if current.is_temporary() {
      self.leave_temporary_mode_locked(state, device_id);
      return None;
    }

    Some(current.id)
  }

  fn enter_temporary_mode_locked(&self, state: &mut State) {
    if self.is_temporary_id_mode() {
      log::debug!("already in temporary ID mode");
      return;
    }

    log::debug!("entering temporary ID mode");
    let session_was_running = self.end_session_locked(state);
    self.remote_config.clear_stored_values();
    self.device.enter_temporary_mode();
    if session_was_running {
      self.begin_session_locked(state);
    }
  }

  fn leave_temporary_mode_locked(&self, state: &mut State, device_id: &str) {
    log::debug!("leaving temporary ID mode");
    self.flush_locked(state);
    self.device.set(device_id, DeviceIdType::DeveloperSupplied);
    self.queue.replace_temporary_id(device_id);

    self.remote_config.clear_and_download_after_id_change();
    self.remote_config.device_id_changed();
  }

  //
  // Consent
  //

  #[must_use]
  pub fn has_consent(&self, feature: Feature) -> bool {
    self.consent.has_consent(feature)
  }

  pub fn give_consent(&self, features: &[Feature]) {
    let _state = self.state.lock();
    if let Some(changes) = self.consent.set(features, true) {
      self.requests.send_consent_changes(&changes);
    }
  }

  /// Withdraws consent. Work belonging to the features is wound down first: the running session
  /// is ended, batched events are sent and stored remote config values are dropped.
  pub fn remove_consent(&self, features: &[Feature]) {
    let mut state = self.state.lock();
    let had = |feature| features.contains(&feature) && self.consent.has_consent(feature);

    if had(Feature::Sessions) {
      self.end_session_locked(&mut state);
    }
    if had(Feature::Events) {
      self.flush_locked(&mut state);
    }
    let had_location = had(Feature::Location);
    let had_remote_config = had(Feature::RemoteConfig);

    let Some(changes) = self.consent.set(features, false) else {
      return;
    };
    self.requests.send_consent_changes(&changes);

    if had_location {
      state.location = None;
      self.requests.send_location(&LocationParams::Disabled);
    }
    if had_remote_config {
      self.remote_config.clear_stored_values();
    }
  }

  pub fn give_all_consent(&self) {
    self.give_consent(&Feature::ALL);
  }

  pub fn remove_all_consent(&self) {
    self.remove_consent(&Feature::ALL);
  }

  //
  // Location
  //

  /// Sends the location now and attaches it to every following session start.
  pub fn set_location(&self, location: Location) {
    let mut state = self.state.lock();
    if !self.consent.has_consent(Feature::Location) {
      log::debug!("no consent for location, ignoring");
      return;
    }

    let location = LocationParams::Known(location);
    self.requests.send_location(&location);
    state.location = Some(location);
  }

  /// Tells the collector to stop deriving a location for this device.
  pub fn disable_location(&self) {
    let mut state = self.state.lock();
    if !self.consent.has_consent(Feature::Location) {
      log::debug!("no consent for location, ignoring");
      return;
    }

    self.requests.send_location(&LocationParams::Disabled);
    state.location = Some(LocationParams::Disabled);
  }

  //
  // Users & push
  //

  pub fn set_user_data(&self, user_details: &Map<String, Value>) {
    let _state = self.state.lock();
    if !self.consent.has_consent(Feature::Users) {
      log::debug!("no consent for users, ignoring user data");
      return;
    }
    if user_details.is_empty() {
      log::debug!("no user data to send");
      return;
    }

    self
      .requests
      .send_user_data(&Value::Object(user_details.clone()).to_string());
  }

  pub fn set_push_token(&self, token: &str, mode: MessagingMode, provider: MessagingProvider) {
    let _state = self.state.lock();
    if !self.consent.has_consent(Feature::Push) {
      log::debug!("no consent for push, ignoring token");
      return;
    }
    if token.is_empty() {
      log::warn!("ignoring empty push token");
      return;
    }

    self.requests.token_session(token, mode, provider);
  }

  //
  // Attribution
  //

  /// Records the campaign an install came from. `countly` campaigns carry a JSON object with a
  /// `cid` and an optional `cuid`; `_special_test` data is sent as is.
  pub fn record_direct_attribution(&self, campaign_type: &str, campaign_data: &str) {
    let _state = self.state.lock();
    if !self.consent.has_consent(Feature::Attribution) {
      log::debug!("no consent for attribution, ignoring");
      return;
    }
    if campaign_data.is_empty() {
      log::warn!("ignoring direct attribution without data");
      return;
    }

    match campaign_type {
      LEGACY_CAMPAIGN_TYPE => {
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(campaign_data) else {
          log::warn!("direct attribution data is not a JSON object");
          return;
        };
        let Some(campaign_id) = data
          .get("cid")
          .and_then(Value::as_str)
          .filter(|id| !id.is_empty())
        else {
          log::warn!("direct attribution data has no campaign ID");
          return;
        };

        self.requests.send_direct_attribution_legacy(
          campaign_id,
          data.get("cuid").and_then(Value::as_str),
        );
      },
      TEST_CAMPAIGN_TYPE => self.requests.send_direct_attribution_test(campaign_data),
      other => log::warn!("unknown direct attribution campaign type {other:?}"),
    }
  }

  /// Records advertising identifiers. Entries with an empty key or value are left out.
  pub fn record_indirect_attribution(&self, attribution: &BTreeMap<String, String>) {
    let _state = self.state.lock();
    if !self.consent.has_consent(Feature::Attribution) {
      log::debug!("no consent for attribution, ignoring");
      return;
    }

    let attribution: Map<String, Value> = attribution
      .iter()
      .filter(|(key, value)| !key.is_empty() && !value.is_empty())
      .map(|(key, value)| (key.clone(), value.clone().into()))
      .collect();
    if attribution.is_empty() {
      log::warn!("ignoring empty indirect attribution");
      return;
    }

    self
      .requests
      .send_indirect_attribution(&Value::Object(attribution).to_string());
  }

  //
  // Crashes
  //

  pub fn add_crash_breadcrumb(&self, breadcrumb: &str) {
    self.crashes.add_breadcrumb(breadcrumb);
  }

  pub fn set_custom_crash_segments(&self, segments: Segmentation) {
    self.crashes.set_custom_segments(segments);
  }

  pub fn record_handled_error(
    &self,
    error: &(dyn std::error::Error + 'static),
    segmentation: Option<&Segmentation>,
  ) {
    self.crashes.record_error(Some(error), true, segmentation);
  }

  pub fn record_unhandled_error(
    &self,
    error: &(dyn std::error::Error + 'static),
    segmentation: Option<&Segmentation>,
  ) {
    self.crashes.record_error(Some(error), false, segmentation);
  }

  //
  // Remote config
  //

  pub fn update_remote_config(&self) -> UpdateHandle {
    self.remote_config.update(UpdateScope::All)
  }

  /// Fetches and merges only `keys`. Stored values for other keys are kept.
  pub fn update_remote_config_for_keys(&self, keys: Vec<String>) -> UpdateHandle {
    self
      .remote_config
      .update(UpdateScope::from_lists(Some(keys), None))
  }

  /// Fetches and merges every key but `keys`. Stored values are kept.
  pub fn update_remote_config_except_keys(&self, keys: Vec<String>) -> UpdateHandle {
    self
      .remote_config
      .update(UpdateScope::from_lists(None, Some(keys)))
  }

  #[must_use]
  pub fn remote_config_value(&self, key: &str) -> Option<Value> {
    self.remote_config.value(key)
  }

  #[must_use]
  pub fn remote_config_values(&self) -> Option<Map<String, Value>> {
    self.remote_config.all_values()
  }

  pub(crate) fn download_remote_config_at_init(&self) {
    self.remote_config.download_at_init();
  }

  pub fn clear_remote_config_values(&self) {
    let _state = self.state.lock();
    self.remote_config.clear_stored_values();
  }

  //
  // APM
  //

  /// Returns false if a trace with this key is already running.
  pub fn start_trace(&self, key: &str) -> bool {
    if key.is_empty() || !self.consent.has_consent(Feature::Apm) {
      return false;
    }

    let mut state = self.state.lock();
    if state.traces.contains_key(key) {
      log::debug!("trace {key:?} is already running");
      return false;
    }
    state.traces.insert(key.to_string(), self.time.now());
    true
  }

  /// Ends a running trace. Only numeric custom metrics are reported.
  pub fn end_trace(&self, key: &str, custom_metrics: &Map<String, Value>) -> bool {
    let mut state = self.state.lock();
    let Some(started_at) = state.traces.remove(key) else {
      log::debug!("trace {key:?} was not started");
      return false;
    };
    if !self.consent.has_consent(Feature::Apm) {
      return false;
    }

    let metrics: Map<String, Value> = custom_metrics
      .iter()
      .filter(|(name, value)| {
        let numeric = value.is_number();
        if !numeric {
          log::warn!("dropping non-numeric trace metric {name:?}");
        }
        numeric
      })
      .map(|(name, value)| (name.clone(), value.clone()))
      .collect();

    let ended_at = self.time.now();
    self.requests.send_apm_custom_trace(
      key,
      (ended_at - started_at).whole_milliseconds().try_into().unwrap_or(i64::MAX),
      started_at.unix_timestamp_ms(),
      ended_at.unix_timestamp_ms(),
      &metrics,
    );
    true
  }

  pub fn cancel_trace(&self, key: &str) -> bool {
    self.state.lock().traces.remove(key).is_some()
  }

  pub fn record_network_trace(&self, trace: &NetworkTrace) {
    let _state = self.state.lock();
    if !self.consent.has_consent(Feature::Apm) {
      return;
    }
    if trace.key.is_empty() {
      log::warn!("ignoring network trace without a key");
      return;
    }

    self.requests.send_apm_network_trace(trace);
  }

  /// Reports how long the app took to start, measured from `started_at` until now.
  pub fn record_app_start(&self, started_at: OffsetDateTime) {
    let _state = self.state.lock();
    if !self.consent.has_consent(Feature::Apm) {
      return;
    }

    let (duration_ms, start_ms, end_ms) = self.span_until_now(started_at);
    self.requests.send_apm_app_start(duration_ms, start_ms, end_ms);
  }

  /// Reports a stretch of time the app spent in the foreground or the background, ending now.
  pub fn record_screen_time(&self, foreground: bool, started_at: OffsetDateTime) {
    let _state = self.state.lock();
    if !self.consent.has_consent(Feature::Apm) {
      return;
    }

    let (duration_ms, start_ms, end_ms) = self.span_until_now(started_at);
    self
      .requests
      .send_apm_screen_time(foreground, duration_ms, start_ms, end_ms);
  }

  fn span_until_now(&self, started_at: OffsetDateTime) -> (i64, i64, i64) {
    let now = self.time.now();
    let duration_ms = (now - started_at)
      .whole_milliseconds()
      .try_into()
      .unwrap_or(i64::MAX)
      .max(0);
    (
      duration_ms,
      started_at.unix_timestamp_ms(),
      now.unix_timestamp_ms(),
    )
  }

  //
  // Rating & feedback
  //

  pub fn fetch_rating_widget(&self, widget_id: &str) -> FetchHandle {
    if !self.consent.has_consent(Feature::StarRating) {
      return FetchHandle::failed(NO_CONSENT_MESSAGE);
    }
    if widget_id.is_empty() {
      return FetchHandle::failed("Widget ID is empty");
    }

    FetchHandle::start(
      &self.runtime,
      &self.immediate,
      self.requests.prepare_rating_widget_request(widget_id),
    )
  }

  pub fn fetch_feedback_widgets(&self) -> FetchHandle {
    if !self.consent.has_consent(Feature::Feedback) {
      return FetchHandle::failed(NO_CONSENT_MESSAGE);
    }

    FetchHandle::start(
      &self.runtime,
      &self.immediate,
      self.requests.prepare_feedback_list_request(),
    )
  }

  //
  // Lifecycle
  //

  /// Replaces the logging filter with a `RUST_LOG` style directive string. Returns false if
  /// logging was never initialized.
  pub fn set_log_filter(&self, filter: &str) -> bool {
    match SwapLogger::swap(filter) {
      Ok(()) => true,
      Err(e) => {
        log::warn!("unable to apply log filter {filter:?}: {e}");
        false
      },
    }
  }

  #[must_use]
  pub fn pending_request_count(&self) -> usize {
    self.queue.len()
  }

  /// Sends batched events to the queue and stops the background tasks. A send already in flight
  /// is allowed to finish. With `blocking` the call waits for the tasks to stop, so it must not be
  /// made from the SDK's own runtime.
  pub fn shutdown(&self, blocking: bool) {
    self.flush_events();

    let shutdown_trigger = self.shutdown_state.lock().take();
    if let Some(shutdown_trigger) = shutdown_trigger
      && blocking
    {
      shutdown_trigger.shutdown_blocking();
    }
  }

  #[cfg(test)]
  pub(crate) fn queued_queries(&self) -> Vec<String> {
    self
      .queue
      .snapshot()
      .into_iter()
      .map(|record| record.query)
      .collect()
  }
}
