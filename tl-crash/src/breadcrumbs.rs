// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./breadcrumbs_test.rs"]
mod breadcrumbs_test;

use parking_lot::Mutex;
use std::collections::VecDeque;

//
// Breadcrumbs
//

/// The most recent log lines the host chose to attach to crash reports. Holds at most `limit`
/// entries, evicting the oldest first.
pub struct Breadcrumbs {
  entries: Mutex<VecDeque<String>>,
  limit: usize,
  max_value_size: usize,
}

impl Breadcrumbs {
  #[must_use]
  pub fn new(limit: usize, max_value_size: usize) -> Self {
    Self {
      entries: Mutex::new(VecDeque::with_capacity(limit.min(128))),
      limit,
      max_value_size,
    }
  }

  /// Returns false if the breadcrumb was rejected.
  pub fn add(&self, breadcrumb: &str) -> bool {
    if breadcrumb.is_empty() {
      log::warn!("can't add an empty crash breadcrumb");
      return false;
    }
    if self.limit == 0 {
      return false;
    }

    let breadcrumb = truncate_chars(breadcrumb, self.max_value_size);

    let mut entries = self.entries.lock();
    while entries.len() >= self.limit {
      entries.pop_front();
    }
    entries.push_back(breadcrumb.to_string());
    true
  }

  /// All breadcrumbs, oldest first, one per line. Gives up after `timeout` instead of waiting on
  /// a lock held by a thread that may never release it, as when recording from the panic hook.
  #[must_use]
  pub fn try_joined(&self, timeout: std::time::Duration) -> Option<String> {
    self
      .entries
      .try_lock_for(timeout)
      .map(|entries| Self::join(&entries))
  }

  fn join(entries: &VecDeque<String>) -> String {
    entries
      .iter()
      .map(String::as_str)
      .collect::<Vec<_>>()
      .join("\n")
  }
}

/// Cuts `value` down to at most `max` characters.
#[must_use]
pub fn truncate_chars(value: &str, max: usize) -> &str {
  value
    .char_indices()
    .nth(max)
    .map_or(value, |(index, _)| &value[.. index])
}
