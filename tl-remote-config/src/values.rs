// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./values_test.rs"]
mod values_test;

use serde_json::{Map, Value};

//
// RemoteConfigValues
//

/// The key/value document served by the collector, persisted as a single JSON blob.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteConfigValues {
  values: Map<String, Value>,
}

impl RemoteConfigValues {
  /// Decodes a persisted blob. Anything that isn't a JSON object yields an empty store.
  #[must_use]
  pub fn from_blob(blob: &str) -> Self {
    if blob.is_empty() {
      return Self::default();
    }

    match serde_json::from_str::<Value>(blob) {
      Ok(Value::Object(values)) => Self { values },
      Ok(other) => {
        log::warn!("stored remote config is not an object ({other}), starting empty");
        Self::default()
      },
      Err(e) => {
        log::warn!("failed to decode stored remote config, starting empty: {e}");
        Self::default()
      },
    }
  }

  #[must_use]
  pub fn to_blob(&self) -> String {
    Value::Object(self.values.clone()).to_string()
  }

  /// Copies every key of `update` over the current values. Keys are applied independently of one
  /// another.
  pub fn merge(&mut self, update: &Map<String, Value>) {
    for (key, value) in update {
      if key.is_empty() {
        log::debug!("skipping remote config value with an empty key");
        continue;
      }
      self.values.insert(key.clone(), value.clone());
    }
  }

  pub fn clear(&mut self) {
    self.values.clear();
  }

  #[must_use]
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.values.get(key)
  }

  #[must_use]
  pub fn get_all(&self) -> Map<String, Value> {
    self.values.clone()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}
