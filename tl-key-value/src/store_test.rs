// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{Key, ReadError, Storage, Store};
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

static STRING_TEST_KEY: Key<String> = Key::new("test");
static LIST_TEST_KEY: Key<Vec<u32>> = Key::new("test");

//
// MockStorage
//

#[derive(Default)]
struct MockStorage {
  state: Arc<parking_lot::Mutex<HashMap<String, String>>>,
  fail_reads: Arc<AtomicBool>,
}

impl Storage for MockStorage {
  fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()> {
    self.state.lock().insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn get_string(&self, key: &str) -> anyhow::Result<Option<String>> {
    if self.fail_reads.load(Ordering::Relaxed) {
      anyhow::bail!("EIO");
    }
    Ok(self.state.lock().get(key).cloned())
  }

  fn delete(&self, key: &str) -> anyhow::Result<()> {
    self.state.lock().remove(key);
    Ok(())
  }

  fn has_any_data(&self) -> anyhow::Result<bool> {
    Ok(!self.state.lock().is_empty())
  }
}

#[test]
fn returns_stored_value() {
  let store = Store::new(Box::<MockStorage>::default());

  store.set_string(&STRING_TEST_KEY, "foo");

  assert_eq!("foo", store.get_string(&STRING_TEST_KEY).unwrap());
}

#[test]
fn returns_stored_json_value() {
  let storage = Box::<MockStorage>::default();
  let storage_values = storage.state.clone();
  let store = Store::new(storage);

  store.set(&LIST_TEST_KEY, &vec![1, 2, 3]);

  assert_eq!(vec![1, 2, 3], store.get(&LIST_TEST_KEY).unwrap());
  assert_eq!(
    "[1,2,3]",
    storage_values.lock().get(LIST_TEST_KEY.key()).unwrap()
  );
}

#[test]
fn returns_none_and_clears_if_underlying_data_malformed() {
  let storage = Box::<MockStorage>::default();
  let storage_values = storage.state.clone();
  let store = Store::new(storage);

  store.set_string(&STRING_TEST_KEY, "not json");

  assert!(store.get(&LIST_TEST_KEY).is_none());
  assert!(storage_values.lock().is_empty());
}

#[test]
fn failed_read_keeps_stored_value() {
  let storage = Box::<MockStorage>::default();
  let storage_values = storage.state.clone();
  let fail_reads = storage.fail_reads.clone();
  let store = Store::new(storage);

  store.set(&LIST_TEST_KEY, &vec![1, 2]);
  fail_reads.store(true, Ordering::Relaxed);

  assert!(store.get(&LIST_TEST_KEY).is_none());
  assert_matches!(
    store.get_internal(&LIST_TEST_KEY),
    Err(ReadError::Storage(_))
  );
  assert_eq!(
    "[1,2]",
    storage_values.lock().get(LIST_TEST_KEY.key()).unwrap()
  );

  fail_reads.store(false, Ordering::Relaxed);
  assert_eq!(vec![1, 2], store.get(&LIST_TEST_KEY).unwrap());
}

#[test]
fn reports_data_presence() {
  let store = Store::new(Box::<MockStorage>::default());
  assert!(!store.has_any_data());

  store.set_string(&STRING_TEST_KEY, "foo");
  assert!(store.has_any_data());

  store.delete(&STRING_TEST_KEY);
  assert!(!store.has_any_data());
}
