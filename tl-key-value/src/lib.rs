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
#[path = "./store_test.rs"]
mod store_test;

mod directory;

pub use directory::DirectoryStorage;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::ext::NumericalDuration;
use tl_log::warn_every;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}

//
// Storage
//

/// Host provided persistence for a small set of named string blobs.
pub trait Storage: Send + Sync {
  fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()>;
  fn get_string(&self, key: &str) -> anyhow::Result<Option<String>>;
  fn delete(&self, key: &str) -> anyhow::Result<()>;

  /// Whether anything at all has ever been persisted. Used to tell a fresh install apart from an
  /// upgrade.
  fn has_any_data(&self) -> anyhow::Result<bool>;
}

//
// ReadError
//

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  /// The storage itself failed. The persisted value may still be intact.
  #[error("storage read failed: {0:?}")]
  Storage(anyhow::Error),
  #[error("failed to deserialize value: {0}")]
  Decode(#[from] serde_json::Error),
}

//
// Store
//

pub struct Store {
  storage: Box<dyn Storage>,
}

impl Store {
  #[must_use]
  pub fn new(storage: Box<dyn Storage>) -> Self {
    Self { storage }
  }

  pub fn set_string(&self, key: &Key<String>, value: &str) {
    if let Err(e) = self.storage.set_string(key.key, value) {
      warn_every!(
        15.seconds(),
        "failed to set value for {:?} key: {:?}",
        key.key,
        e
      );
    }
  }

  #[must_use]
  pub fn get_string(&self, key: &Key<String>) -> Option<String> {
    self
      .storage
      .get_string(key.key)
      .map_err(|e| {
        warn_every!(
          15.seconds(),
          "failed to get value for {:?} key: {:?}",
          key.key,
          e
        );
      })
      .ok()
      .flatten()
  }

  pub fn set<T: Serialize>(&self, key: &Key<T>, value: &T) {
    if let Err(e) = self.set_internal(key, value) {
      warn_every!(
        15.seconds(),
        "failed to set value for {:?} key: {:?}",
        key.key,
        e
      );
    }
  }

  /// Reads a JSON encoded value. A value that can't be decoded is treated as corrupt: it is
  /// deleted and None is returned. A failed read leaves the stored value alone.
  #[must_use]
  pub fn get<T: DeserializeOwned>(&self, key: &Key<T>) -> Option<T> {
    self
      .get_internal(key)
      .map_err(|e| {
        warn_every!(
          15.seconds(),
          "failed to get value for {:?} key: {}",
          key.key,
          e
        );

        if matches!(e, ReadError::Decode(_)) {
          self.delete_raw(key.key);
        }
      })
      .ok()
      .flatten()
  }

  pub fn delete<T>(&self, key: &Key<T>) {
    self.delete_raw(key.key);
  }

  /// Returns true if the storage reports any persisted data. A failing storage is reported as
  /// holding data so that callers err on the side of treating the install as an upgrade.
  #[must_use]
  pub fn has_any_data(&self) -> bool {
    self.storage.has_any_data().unwrap_or_else(|e| {
      log::warn!("failed to query storage contents: {e:?}");
      true
    })
  }

  pub fn set_internal<T: Serialize>(&self, key: &Key<T>, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string(value)?;
    self.storage.set_string(key.key, &json)?;
    Ok(())
  }

  pub fn get_internal<T: DeserializeOwned>(
    &self,
    key: &Key<T>,
  ) -> Result<Option<T>, ReadError> {
    let Some(json) = self
      .storage
      .get_string(key.key)
      .map_err(ReadError::Storage)?
    else {
      return Ok(None);
    };

    Ok(Some(serde_json::from_str(&json)?))
  }

  fn delete_raw(&self, key: &str) {
    if let Err(e) = self.storage.delete(key) {
      warn_every!(
        15.seconds(),
        "failed to delete value for {:?} key: {:?}",
        key,
        e
      );
    }
  }
}

//
// Key
//

pub struct Key<T> {
  key: &'static str,
  _phantom: std::marker::PhantomData<T>,
}

impl<T> Key<T> {
  #[must_use]
  pub const fn new(key: &'static str) -> Self {
    Self {
      key,
      _phantom: std::marker::PhantomData,
    }
  }

  #[must_use]
  pub const fn key(&self) -> &str {
    self.key
  }
}
