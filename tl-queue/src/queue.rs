// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./queue_test.rs"]
mod queue_test;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use time::ext::NumericalDuration;
use tl_device::TEMPORARY_DEVICE_ID;
use tl_key_value::{Key, ReadError, Store};
use tl_log::error_every;
use tokio::sync::Notify;

pub static REQUEST_QUEUE_KEY: Key<PersistedQueue> = Key::new("request_queue");

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

//
// RequestRecord
//

/// A fully formed request waiting for delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
  pub id: u64,
  pub query: String,
  /// Held back while a device ID change is in flight.
  #[serde(default)]
  pub delayed: bool,
}

impl RequestRecord {
  #[must_use]
  pub fn has_temporary_id(&self) -> bool {
    self.query.contains(&temporary_id_param())
  }
}

fn temporary_id_param() -> String {
  format!("device_id={TEMPORARY_DEVICE_ID}")
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedQueue {
  next_id: u64,
  records: VecDeque<RequestRecord>,
}

impl PersistedQueue {
  // None if the storage could not be read. A blob that can't be decoded is lost either way, so it
  // is dropped and an empty queue is returned.
  fn load(store: &Store) -> Option<Self> {
    match store.get_internal(&REQUEST_QUEUE_KEY) {
      Ok(persisted) => Some(persisted.unwrap_or_default()),
      Err(ReadError::Decode(e)) => {
        log::warn!("persisted request queue is corrupt, starting empty: {e}");
        store.delete(&REQUEST_QUEUE_KEY);
        Some(Self::default())
      },
      Err(e @ ReadError::Storage(_)) => {
        error_every!(15.seconds(), "unable to load persisted request queue: {}", e);
        None
      },
    }
  }

  fn trim(&mut self, max_size: usize) {
    while self.records.len() > max_size {
      if let Some(evicted) = self.records.pop_front() {
        log::warn!("request queue is full, dropping oldest request {}", evicted.id);
      }
    }
  }
}

//
// DurableQueue
//

/// Bounded, persisted FIFO of request records. Every mutation is written through to the store
/// so queued requests survive process death. When full, the oldest record is evicted to make
/// room for the new one.
pub struct DurableQueue {
  store: Arc<Store>,
  max_size: usize,
  state: Mutex<QueueState>,
  wake: Notify,
}

struct QueueState {
  persisted: PersistedQueue,
  device_id_change_pending: bool,
  // Set while the records persisted by an earlier run could not be read. Nothing is written
  // until they are, so they are never overwritten.
  unread: bool,
}

impl DurableQueue {
  #[must_use]
  pub fn new(store: Arc<Store>, max_size: usize) -> Self {
    let max_size = max_size.max(1);
    let (mut persisted, unread) = match PersistedQueue::load(&store) {
      Some(persisted) => (persisted, false),
      None => (PersistedQueue::default(), true),
    };

    if persisted.records.len() > max_size {
      log::warn!(
        "persisted request queue holds {} records, dropping the oldest to fit {max_size}",
        persisted.records.len()
      );
      persisted.trim(max_size);
    }

    log::debug!("loaded {} queued requests", persisted.records.len());

    Self {
      store,
      max_size,
      state: Mutex::new(QueueState {
        persisted,
        device_id_change_pending: false,
        unread,
      }),
      wake: Notify::new(),
    }
  }

  /// Appends a record, returning its ID.
  pub fn push(&self, query: String, delayed: bool) -> u64 {
    let id = self.push_locked(&mut self.state.lock(), query, delayed);
    self.wake.notify_one();
    id
  }

  /// Appends a record unless the queue stays locked for longer than `timeout`. The record is
  /// delayed if a device ID change is in flight. Used when recording a crash, which may happen on
  /// a thread that already holds the lock.
  pub fn try_push(&self, query: String, timeout: Duration) -> Option<u64> {
    let id = {
      let mut state = self.state.try_lock_for(timeout)?;
      let delayed = state.device_id_change_pending;
      self.push_locked(&mut state, query, delayed)
    };

    self.wake.notify_one();
    Some(id)
  }

  fn push_locked(&self, state: &mut QueueState, query: String, delayed: bool) -> u64 {
    let queue = &mut state.persisted;
    queue.trim(self.max_size - 1);

    let id = queue.next_id;
    queue.next_id += 1;
    queue.records.push_back(RequestRecord { id, query, delayed });

    self.persist(state);
    id
  }

  /// Removes the record with the given ID. Returns false if it was already gone (evicted while
  /// in flight).
  pub fn remove(&self, id: u64) -> bool {
    let mut state = self.state.lock();
    let records = &mut state.persisted.records;

    let Some(position) = records.iter().position(|r| r.id == id) else {
      return false;
    };
    records.remove(position);
    self.persist(&mut state);
    true
  }

  /// The head of the queue if it may be sent now. Delivery is strictly in order, so a head that
  /// must wait (a delayed record during a device ID change, or a record still carrying the
  /// temporary device ID) holds back everything behind it.
  #[must_use]
  pub fn next_deliverable(&self) -> Option<RequestRecord> {
    let state = self.state.lock();
    let head = state.persisted.records.front()?;

    if head.delayed && state.device_id_change_pending {
      log::trace!("holding delayed request {} until device ID change completes", head.id);
      return None;
    }
    if head.has_temporary_id() {
      log::trace!("holding request {} until a device ID is set", head.id);
      return None;
    }

    Some(head.clone())
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.state.lock().persisted.records.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[must_use]
  pub fn snapshot(&self) -> Vec<RequestRecord> {
    self.state.lock().persisted.records.iter().cloned().collect()
  }

  #[must_use]
  pub fn contains_temporary_id_items(&self) -> bool {
    self
      .state
      .lock()
      .persisted
      .records
      .iter()
      .any(RequestRecord::has_temporary_id)
  }

  /// Rewrites every record queued under the temporary device ID to carry `device_id`.
  pub fn replace_temporary_id(&self, device_id: &str) {
    {
      let mut state = self.state.lock();

      let from = temporary_id_param();
      let to = format!("device_id={}", urlencoding::encode(device_id));
      let mut replaced = 0;
      for record in &mut state.persisted.records {
        if record.query.contains(&from) {
          record.query = record.query.replace(&from, &to);
          replaced += 1;
        }
      }

      if replaced == 0 {
        return;
      }
      log::debug!("assigned device ID to {replaced} queued requests");
      self.persist(&mut state);
    }

    self.wake.notify_one();
  }

  pub fn begin_device_id_change(&self) {
    self.state.lock().device_id_change_pending = true;
  }

  pub fn complete_device_id_change(&self) {
    self.state.lock().device_id_change_pending = false;
    self.wake.notify_one();
  }

  #[must_use]
  pub fn device_id_change_pending(&self) -> bool {
    self.state.lock().device_id_change_pending
  }

  /// Nudges the delivery loop to re-check the head of the queue.
  pub fn tick(&self) {
    self.wake.notify_one();
  }

  /// Resolves after the queue changed in a way that may make a record deliverable.
  pub async fn changed(&self) {
    self.wake.notified().await;
  }

  fn persist(&self, state: &mut QueueState) {
    if state.unread {
      let Some(mut earlier) = PersistedQueue::load(&self.store) else {
        log::debug!(
          "holding {} requests in memory until the persisted queue can be read",
          state.persisted.records.len()
        );
        return;
      };

      // Records from the earlier run go first. They get fresh IDs since the delivery loop may
      // already hold IDs handed out in this run.
      let current = &mut state.persisted;
      for record in &mut earlier.records {
        record.id = current.next_id;
        current.next_id += 1;
      }
      log::info!(
        "recovered {} requests from the persisted queue",
        earlier.records.len()
      );
      earlier.records.append(&mut current.records);
      current.records = earlier.records;
      current.trim(self.max_size);
      state.unread = false;
    }

    self.store.set(&REQUEST_QUEUE_KEY, &state.persisted);
  }
}
