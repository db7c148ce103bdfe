// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use std::collections::HashMap;
use std::sync::Arc;
use tl_key_value::{Storage, Store};

//
// InMemoryStorage
//

#[derive(Default)]
pub struct InMemoryStorage {
  state: parking_lot::Mutex<HashMap<String, (String, i32)>>,
  fail_writes: std::sync::atomic::AtomicBool,
  fail_reads: std::sync::atomic::AtomicBool,
}

impl InMemoryStorage {
  pub fn writes_count(&self, key: &str) -> i32 {
    self.state.lock().get(key).map_or(0, |v| v.1)
  }

  pub fn raw(&self, key: &str) -> Option<String> {
    self.state.lock().get(key).map(|v| v.0.clone())
  }

  /// Makes every subsequent write fail, simulating a full or read-only disk.
  pub fn fail_writes(&self) {
    self
      .fail_writes
      .store(true, std::sync::atomic::Ordering::Relaxed);
  }

  /// Toggles read failures, simulating an I/O error that leaves the stored data intact.
  pub fn set_fail_reads(&self, fail: bool) {
    self
      .fail_reads
      .store(fail, std::sync::atomic::Ordering::Relaxed);
  }
}

impl Storage for InMemoryStorage {
  fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()> {
    if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
      anyhow::bail!("storage is read only");
    }

    let mut guard = self.state.lock();
    let writes_count = guard.get(key).map_or(0, |v| v.1);
    guard.insert(key.to_string(), (value.to_string(), writes_count + 1));

    Ok(())
  }

  fn get_string(&self, key: &str) -> anyhow::Result<Option<String>> {
    if self.fail_reads.load(std::sync::atomic::Ordering::Relaxed) {
      anyhow::bail!("EIO");
    }

    Ok(self.state.lock().get(key).map(|v| v.0.clone()))
  }

  fn delete(&self, key: &str) -> anyhow::Result<()> {
    self.state.lock().remove(key);
    Ok(())
  }

  fn has_any_data(&self) -> anyhow::Result<bool> {
    Ok(!self.state.lock().is_empty())
  }
}

//
// SharedStorage
//

/// Allows a test to keep a handle on storage that has been handed to a `Store`.
pub struct SharedStorage(pub Arc<InMemoryStorage>);

impl Storage for SharedStorage {
  fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()> {
    self.0.set_string(key, value)
  }

  fn get_string(&self, key: &str) -> anyhow::Result<Option<String>> {
    self.0.get_string(key)
  }

  fn delete(&self, key: &str) -> anyhow::Result<()> {
    self.0.delete(key)
  }

  fn has_any_data(&self) -> anyhow::Result<bool> {
    self.0.has_any_data()
  }
}

#[must_use]
pub fn in_memory_store() -> (Arc<InMemoryStorage>, Arc<Store>) {
  let storage = Arc::new(InMemoryStorage::default());
  let store = Arc::new(Store::new(Box::new(SharedStorage(storage.clone()))));
  (storage, store)
}
