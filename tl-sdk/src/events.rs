// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./events_test.rs"]
mod events_test;

use std::collections::HashMap;
use time::OffsetDateTime;
use tl_events::{Event, events_to_json};

//
// EventBatch
//

/// Events recorded since the last flush, plus the start times of timed events still running.
pub struct EventBatch {
  threshold: usize,
  pending: Vec<Event>,
  timed: HashMap<String, OffsetDateTime>,
}

impl EventBatch {
  #[must_use]
  pub fn new(threshold: usize) -> Self {
    Self {
      threshold: threshold.max(1),
      pending: Vec::new(),
      timed: HashMap::new(),
    }
  }

  /// Adds an event. Returns true once the batch has reached the flush threshold.
  pub fn push(&mut self, event: Event) -> bool {
    self.pending.push(event);
    self.pending.len() >= self.threshold
  }

  /// Empties the batch, returning the serialized events if there were any.
  pub fn take(&mut self) -> Option<String> {
    if self.pending.is_empty() {
      return None;
    }

    let events = events_to_json(&self.pending);
    self.pending.clear();
    Some(events)
  }

  /// Returns false if an event with this key is already running.
  pub fn start_timed(&mut self, key: &str, now: OffsetDateTime) -> bool {
    if self.timed.contains_key(key) {
      return false;
    }

    self.timed.insert(key.to_string(), now);
    true
  }

  /// Stops a running timed event, returning when it started.
  pub fn end_timed(&mut self, key: &str) -> Option<OffsetDateTime> {
    self.timed.remove(key)
  }
}
