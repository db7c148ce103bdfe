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
#[path = "./device_test.rs"]
mod device_test;

use std::sync::Arc;
use tl_key_value::{Key, Store};
use uuid::Uuid;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}

pub static DEVICE_ID_KEY: Key<String> = Key::new("device_id");
pub static DEVICE_ID_TYPE_KEY: Key<String> = Key::new("device_id_type");

/// Placeholder identity used while the host has not yet provided a real device ID.
pub const TEMPORARY_DEVICE_ID: &str = "CLYTemporaryDeviceID";

//
// DeviceIdType
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceIdType {
  DeveloperSupplied,
  /// Generated by the SDK.
  OpenUdid,
  /// No longer produced, only found in state persisted by old releases.
  AdvertisingId,
  TemporaryId,
}

impl DeviceIdType {
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::DeveloperSupplied => "DEVELOPER_SUPPLIED",
      Self::OpenUdid => "OPEN_UDID",
      Self::AdvertisingId => "ADVERTISING_ID",
      Self::TemporaryId => "TEMPORARY_ID",
    }
  }

  #[must_use]
  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "DEVELOPER_SUPPLIED" => Some(Self::DeveloperSupplied),
      "OPEN_UDID" => Some(Self::OpenUdid),
      "ADVERTISING_ID" => Some(Self::AdvertisingId),
      "TEMPORARY_ID" => Some(Self::TemporaryId),
      _ => None,
    }
  }
}

impl std::fmt::Display for DeviceIdType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

//
// DeviceId
//

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceId {
  pub id: String,
  pub id_type: DeviceIdType,
}

impl DeviceId {
  #[must_use]
  pub fn temporary() -> Self {
    Self {
      id: TEMPORARY_DEVICE_ID.to_string(),
      id_type: DeviceIdType::TemporaryId,
    }
  }

  #[must_use]
  pub fn is_temporary(&self) -> bool {
    self.id_type == DeviceIdType::TemporaryId
  }
}

//
// DeviceIdProvider
//

/// Read access to the current device identity, used by the request builder.
pub trait DeviceIdProvider: Send + Sync {
  fn device_id(&self) -> Option<String>;
  fn is_temporary(&self) -> bool;
}

//
// Device
//

pub struct Device {
  store: Arc<Store>,
  current: parking_lot::Mutex<Option<DeviceId>>,
}

impl Device {
  #[must_use]
  pub const fn new(store: Arc<Store>) -> Self {
    Self {
      store,
      current: parking_lot::Mutex::new(None),
    }
  }

  /// Selects the identity for this run: an explicitly configured ID wins, then temporary mode,
  /// then whatever was persisted by a previous run, and finally a freshly generated UUID. Must
  /// only be called after schema migration has completed.
  pub fn initialize(&self, configured: Option<&str>, temporary: bool) -> DeviceId {
    let selected = if let Some(id) = configured.filter(|id| !id.is_empty()) {
      DeviceId {
        id: id.to_string(),
        id_type: DeviceIdType::DeveloperSupplied,
      }
    } else if temporary {
      DeviceId::temporary()
    } else if let Some(stored) = self.stored() {
      stored
    } else {
      DeviceId {
        id: Uuid::new_v4().to_string(),
        id_type: DeviceIdType::OpenUdid,
      }
    };

    log::info!(
      "device ID initialized: {:?} ({})",
      selected.id,
      selected.id_type
    );

    self.persist(&selected);
    *self.current.lock() = Some(selected.clone());
    selected
  }

  #[must_use]
  pub fn current(&self) -> Option<DeviceId> {
    self.current.lock().clone()
  }

  /// Switches to a new identity, returning the previous one.
  pub fn set(&self, id: &str, id_type: DeviceIdType) -> Option<DeviceId> {
    let new = DeviceId {
      id: id.to_string(),
      id_type,
    };
    self.persist(&new);

    log::debug!("device ID changed to {id:?} ({id_type})");
    self.current.lock().replace(new)
  }

  pub fn enter_temporary_mode(&self) -> Option<DeviceId> {
    let temporary = DeviceId::temporary();
    self.persist(&temporary);
    self.current.lock().replace(temporary)
  }

  fn stored(&self) -> Option<DeviceId> {
    let id = self
      .store
      .get_string(&DEVICE_ID_KEY)
      .filter(|id| !id.is_empty())?;
    let id_type = self
      .store
      .get_string(&DEVICE_ID_TYPE_KEY)
      .and_then(|t| DeviceIdType::parse(&t))
      .unwrap_or(DeviceIdType::OpenUdid);

    Some(DeviceId { id, id_type })
  }

  fn persist(&self, device_id: &DeviceId) {
    self.store.set_string(&DEVICE_ID_KEY, &device_id.id);
    self
      .store
      .set_string(&DEVICE_ID_TYPE_KEY, device_id.id_type.as_str());
  }
}

impl DeviceIdProvider for Device {
  fn device_id(&self) -> Option<String> {
    self.current.lock().as_ref().map(|d| d.id.clone())
  }

  fn is_temporary(&self) -> bool {
    self
      .current
      .lock()
      .as_ref()
      .is_some_and(DeviceId::is_temporary)
  }
}
