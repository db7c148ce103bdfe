// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{
  DEVICE_ID_KEY,
  DEVICE_ID_TYPE_KEY,
  Device,
  DeviceIdProvider,
  DeviceIdType,
  TEMPORARY_DEVICE_ID,
};
use pretty_assertions::assert_eq;
use tl_test_helpers::storage::in_memory_store;

#[test]
fn generated_device_id_is_stored_and_reused() {
  let (storage, store) = in_memory_store();

  let device = Device::new(store.clone());
  let first = device.initialize(None, false);
  assert_eq!(DeviceIdType::OpenUdid, first.id_type);
  assert_eq!(Some(first.id.clone()), store.get_string(&DEVICE_ID_KEY));
  assert_eq!(1, storage.writes_count(DEVICE_ID_KEY.key()));

  let device = Device::new(store);
  let second = device.initialize(None, false);
  assert_eq!(first, second);
}

#[test]
fn configured_id_wins_over_stored() {
  let (_storage, store) = in_memory_store();
  Device::new(store.clone()).initialize(None, false);

  let device = Device::new(store.clone());
  let id = device.initialize(Some("user-42"), false);

  assert_eq!("user-42", id.id);
  assert_eq!(DeviceIdType::DeveloperSupplied, id.id_type);
  assert_eq!(
    Some("DEVELOPER_SUPPLIED".to_string()),
    store.get_string(&DEVICE_ID_TYPE_KEY)
  );
}

#[test]
fn temporary_mode() {
  let (_storage, store) = in_memory_store();

  let device = Device::new(store.clone());
  assert_eq!(None, device.device_id());
  assert!(!device.is_temporary());

  device.initialize(None, true);
  assert!(device.is_temporary());
  assert_eq!(Some(TEMPORARY_DEVICE_ID.to_string()), device.device_id());

  // Temporary mode survives a restart.
  let device = Device::new(store.clone());
  device.initialize(None, false);
  assert!(device.is_temporary());

  let previous = device.set("real", DeviceIdType::DeveloperSupplied).unwrap();
  assert!(previous.is_temporary());
  assert!(!device.is_temporary());
  assert_eq!(Some("real".to_string()), store.get_string(&DEVICE_ID_KEY));
}

#[test]
fn parse_type_names() {
  for t in [
    DeviceIdType::DeveloperSupplied,
    DeviceIdType::OpenUdid,
    DeviceIdType::AdvertisingId,
    DeviceIdType::TemporaryId,
  ] {
    assert_eq!(Some(t), DeviceIdType::parse(t.as_str()));
  }
  assert_eq!(None, DeviceIdType::parse("UNKNOWN"));
}
