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


use std::sync::Arc;
use tl_device::{DEVICE_ID_KEY, DEVICE_ID_TYPE_KEY, DeviceIdType};
use tl_key_value::{Key, Store};
use uuid::Uuid;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}

/// Version history of the persisted state:
/// 0 - state written before versioning was introduced.
/// 1 - device ID type is always persisted alongside the device ID.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

pub static SCHEMA_VERSION_KEY: Key<String> = Key::new("schema_version");

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MigrationError {
  #[error("stored schema version {0} is negative")]
  NegativeVersion(i64),
  #[error("stored schema version {0:?} is not a number")]
  UnparsableVersion(String),
  #[error("schema version did not advance past {0}")]
  NoProgress(i64),
}

/// Inputs that migration steps can't recover from persisted state alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct MigrationParams {
  /// Whether the host passed an explicit device ID at this init. Used to guess the type of an
  /// untyped legacy device ID.
  pub custom_id_set: bool,
}

//
// Migrator
//

pub struct Migrator {
  store: Arc<Store>,
}

impl Migrator {
  #[must_use]
  pub const fn new(store: Arc<Store>) -> Self {
    Self { store }
  }

  /// Brings persisted state up to `CURRENT_SCHEMA_VERSION`, one step at a time. Returns the final
  /// version. Errors mean migration halted and nothing further was written.
  pub fn run(&self, params: MigrationParams) -> Result<i64, MigrationError> {
    let mut version = self.current_version()?;
    log::debug!("schema version at startup: {version}");

    while version < CURRENT_SCHEMA_VERSION {
      self.step(version, params);

      let next = self.current_version()?;
      if next == version {
        log::error!("schema migration made no progress at version {version}, halting");
        return Err(MigrationError::NoProgress(version));
      }
      version = next;
    }

    if version > CURRENT_SCHEMA_VERSION {
      log::warn!("stored schema version {version} is newer than {CURRENT_SCHEMA_VERSION}");
    }

    Ok(version)
  }

  /// Reads the stored version, stamping an initial one if none exists: a store with no data at
  /// all is a fresh install and starts at the current version, anything else predates versioning.
  fn current_version(&self) -> Result<i64, MigrationError> {
    let Some(stored) = self.store.get_string(&SCHEMA_VERSION_KEY) else {
      let initial = if self.store.has_any_data() {
        0
      } else {
        CURRENT_SCHEMA_VERSION
      };
      self.write_version(initial);
      return Ok(initial);
    };

    let version = stored
      .trim()
      .parse::<i64>()
      .map_err(|_| MigrationError::UnparsableVersion(stored.clone()))?;
    if version < 0 {
      log::error!("stored schema version is negative, refusing to migrate");
      return Err(MigrationError::NegativeVersion(version));
    }

    Ok(version)
  }

  fn step(&self, version: i64, params: MigrationParams) {
    match version {
      0 => {
        log::info!("migrating persisted state from schema version 0 to 1");
        self.migrate_0_to_1(params);
        self.write_version(1);
      },
      v => log::warn!("no migration step defined for schema version {v}"),
    }
  }

  fn write_version(&self, version: i64) {
    self
      .store
      .set_string(&SCHEMA_VERSION_KEY, &version.to_string());
  }

  /// Normalizes the persisted device identity so that it always carries a type. Safe to re-run:
  /// every write is derived from what is currently stored.
  pub fn migrate_0_to_1(&self, params: MigrationParams) {
    let id_type = self.store.get_string(&DEVICE_ID_TYPE_KEY);
    let id = self.store.get_string(&DEVICE_ID_KEY);

    let id_type = match (id_type, &id) {
      (None, Some(_)) if params.custom_id_set => DeviceIdType::DeveloperSupplied,
      (None, _) => DeviceIdType::OpenUdid,
      (Some(stored), _) => match DeviceIdType::parse(&stored) {
        Some(DeviceIdType::AdvertisingId) => DeviceIdType::OpenUdid,
        Some(id_type) => id_type,
        None => {
          log::warn!("leaving unrecognized device ID type {stored:?} as is");
          return;
        },
      },
    };

    self.store.set_string(&DEVICE_ID_TYPE_KEY, id_type.as_str());

    if id_type == DeviceIdType::OpenUdid && id.as_deref().is_none_or(str::is_empty) {
      let generated = Uuid::new_v4().to_string();
      log::debug!("generated device ID {generated:?} during migration");
      self.store.set_string(&DEVICE_ID_KEY, &generated);
    }
  }
}
