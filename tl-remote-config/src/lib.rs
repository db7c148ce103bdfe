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


pub mod completion;
pub mod values;

pub use completion::{RemoteConfigListener, UpdateCompletion, UpdateHandle, WaitError};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tl_client_common::{ConsentProvider, Feature};
use tl_key_value::{Key, Store};
use tl_network::Endpoint;
use tl_queue::{ImmediateClient, NETWORK_FAILURE_MESSAGE};
use tl_request::RequestBuilder;
pub use values::RemoteConfigValues;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}

pub static REMOTE_CONFIG_KEY: Key<String> = Key::new("remote_config");

pub const NO_CONSENT_MESSAGE: &str = "No consent given";

pub const DEFAULT_ID_CHANGE_FETCH_DELAY: time::Duration = time::Duration::seconds(1);

//
// UpdateScope
//

/// Which keys an update fetches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateScope {
  /// Replaces the whole store with the collector's values.
  All,
  /// Fetches every key and merges the result into the stored values.
  Merge,
  /// Fetches and merges only these keys.
  Only(Vec<String>),
  /// Fetches and merges every key but these.
  Except(Vec<String>),
}

impl UpdateScope {
  /// Builds a scope from optional include and exclude lists. A non-empty include list wins.
  /// Only an update with neither list replaces the stored values; passing empty lists merges.
  #[must_use]
  pub fn from_lists(only: Option<Vec<String>>, except: Option<Vec<String>>) -> Self {
    match (only, except) {
      (None, None) => Self::All,
      (Some(only), _) if !only.is_empty() => Self::Only(only),
      (_, Some(except)) if !except.is_empty() => Self::Except(except),
      _ => Self::Merge,
    }
  }

  fn key_lists(&self) -> (&[String], &[String]) {
    match self {
      Self::All | Self::Merge => (&[], &[]),
      Self::Only(keys) => (keys, &[]),
      Self::Except(keys) => (&[], keys),
    }
  }
}

//
// PersistedValues
//

// Owns the persisted blob. Every read-modify-write goes through `write_lock` so concurrent
// updates and clears can't overwrite each other.
struct PersistedValues {
  store: Arc<Store>,
  write_lock: Mutex<()>,
}

impl PersistedValues {
  fn load(&self) -> RemoteConfigValues {
    RemoteConfigValues::from_blob(
      &self
        .store
        .get_string(&REMOTE_CONFIG_KEY)
        .unwrap_or_default(),
    )
  }

  fn apply(&self, update: &Map<String, Value>, full_update: bool) {
    let _guard = self.write_lock.lock();

    let mut values = self.load();
    if full_update {
      values.clear();
    }
    values.merge(update);
    self
      .store
      .set_string(&REMOTE_CONFIG_KEY, &values.to_blob());
  }

  fn clear(&self) {
    let _guard = self.write_lock.lock();
    self.store.delete(&REMOTE_CONFIG_KEY);
  }
}

//
// RemoteConfigParams
//

pub struct RemoteConfigParams {
  pub store: Arc<Store>,
  pub requests: Arc<RequestBuilder>,
  pub immediate: ImmediateClient,
  pub consent: Arc<dyn ConsentProvider>,
  pub listener: Option<Arc<dyn RemoteConfigListener>>,
  pub automatic_download: bool,
  /// How long a re-download triggered by a device ID change waits, giving the queued ID change
  /// request a head start.
  pub id_change_fetch_delay: time::Duration,
  pub runtime: tokio::runtime::Handle,
}

//
// RemoteConfig
//

/// Downloads, persists and serves remote config values. Fetches go through the immediate
/// request path and complete asynchronously on the runtime; their outcome is reported through
/// the returned `UpdateHandle` and the listener.
pub struct RemoteConfig {
  values: Arc<PersistedValues>,
  requests: Arc<RequestBuilder>,
  immediate: ImmediateClient,
  consent: Arc<dyn ConsentProvider>,
  listener: Option<Arc<dyn RemoteConfigListener>>,
  automatic_download: bool,
  id_change_fetch_delay: time::Duration,
  runtime: tokio::runtime::Handle,
  update_after_id_change: AtomicBool,
}

impl RemoteConfig {
  #[must_use]
  pub fn new(params: RemoteConfigParams) -> Self {
    Self {
      values: Arc::new(PersistedValues {
        store: params.store,
        write_lock: Mutex::new(()),
      }),
      requests: params.requests,
      immediate: params.immediate,
      consent: params.consent,
      listener: params.listener,
      automatic_download: params.automatic_download,
      id_change_fetch_delay: params.id_change_fetch_delay,
      runtime: params.runtime,
      update_after_id_change: AtomicBool::new(false),
    }
  }

  /// Starts a manual update.
  pub fn update(&self, scope: UpdateScope) -> UpdateHandle {
    log::debug!("manual remote config update for {scope:?}");

    let (completion, handle) = UpdateCompletion::new(self.listener.clone());
    if !self.consent.has_consent(Feature::RemoteConfig) {
      completion.complete(Some(NO_CONSENT_MESSAGE.to_string()));
      return handle;
    }

    self.start_update(&scope, false, completion);
    handle
  }

  /// Downloads everything at startup when automatic download is enabled.
  pub fn download_at_init(&self) -> Option<UpdateHandle> {
    if !self.automatic_download || !self.consent.has_consent(Feature::RemoteConfig) {
      return None;
    }

    log::debug!("automatically downloading remote config");
    let (completion, handle) = UpdateCompletion::new(self.listener.clone());
    self.start_update(&UpdateScope::All, false, completion);
    Some(handle)
  }

  #[must_use]
  pub fn value(&self, key: &str) -> Option<Value> {
    if !self.consent.has_consent(Feature::RemoteConfig) {
      return None;
    }

    self.values.load().get(key).cloned()
  }

  #[must_use]
  pub fn all_values(&self) -> Option<Map<String, Value>> {
    if !self.consent.has_consent(Feature::RemoteConfig) {
      return None;
    }

    Some(self.values.load().get_all())
  }

  pub fn clear_stored_values(&self) {
    log::debug!("clearing stored remote config values");
    self.values.clear();
  }

  /// Values belong to the device ID they were fetched for. Clears them and, when automatic
  /// download is enabled, schedules a fresh download for once the new ID is in place.
  pub fn clear_and_download_after_id_change(&self) {
    self.clear_stored_values();

    if self.automatic_download && self.consent.has_consent(Feature::RemoteConfig) {
      self.update_after_id_change.store(true, Ordering::SeqCst);
    }
  }

  /// Called once a device ID change has completed.
  pub fn device_id_changed(&self) -> Option<UpdateHandle> {
    if !self.update_after_id_change.swap(false, Ordering::SeqCst) {
      return None;
    }

    log::debug!("downloading remote config for the new device ID");
    let (completion, handle) = UpdateCompletion::new(self.listener.clone());
    self.start_update(&UpdateScope::All, true, completion);
    Some(handle)
  }

  fn start_update(&self, scope: &UpdateScope, delayed: bool, completion: UpdateCompletion) {
    let (include, exclude) = scope.key_lists();
    let query = match self.requests.prepare_remote_config_request(include, exclude) {
      Ok(query) => query,
      Err(e) => {
        completion.complete(Some(e.to_string()));
        return;
      },
    };
    log::trace!("remote config request: {query}");

    let values = self.values.clone();
    let immediate = self.immediate.clone();
    let full_update = *scope == UpdateScope::All;
    let delay = delayed.then_some(self.id_change_fetch_delay);

    self.runtime.spawn(async move {
      if let Some(delay) = delay {
        tokio::time::sleep(delay.unsigned_abs()).await;
      }

      match immediate.fetch_json(Endpoint::Sdk, query).await {
        Ok(Value::Object(update)) => {
          values.apply(&update, full_update);
          completion.complete(None);
        },
        Ok(_) => {
          log::debug!("remote config response is not a JSON object");
          completion.complete(Some(NETWORK_FAILURE_MESSAGE.to_string()));
        },
        Err(message) => completion.complete(Some(message)),
      }
    });
  }
}
