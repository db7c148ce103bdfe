// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./rate_limit_log_test.rs"]
mod rate_limit_log_test;

use parking_lot::Mutex;
use time::Duration;
use tokio::time::Instant;

//
// WarnTracker
//

/// Tracks the last time a given call site emitted at its full level. Storage and delivery
/// failures tend to repeat on every call, so the macros below demote repeats to debug.
#[derive(Default)]
pub struct WarnTracker {
  last_used_time: Mutex<Option<Instant>>,
}

impl WarnTracker {
  pub fn should_warn(&self, duration: Duration) -> bool {
    let now = Instant::now();
    let mut last_used_time = self.last_used_time.lock();
    if last_used_time.is_some_and(|last| now - last <= duration) {
      return false;
    }

    *last_used_time = Some(now);
    true
  }
}

#[macro_export]
macro_rules! warn_every {
  ($duration:expr, $first:tt) => {
    $crate::log_every!(log::Level::Warn, $duration, "{}", $first);
  };
  ($duration:expr, $first:tt, $($arg:tt)+) => {
    $crate::log_every!(log::Level::Warn, $duration, $first, $($arg)+);
  };
}

#[macro_export]
macro_rules! error_every {
  ($duration:expr, $first:tt, $($arg:tt)+) => {
    $crate::log_every!(log::Level::Error, $duration, $first, $($arg)+);
  }
}

#[macro_export]
macro_rules! log_every {
  ($level:expr, $duration:expr, $first:tt, $($arg:tt)+) => {
    {
      use $crate::rate_limit_log::WarnTracker;
      use std::sync::OnceLock;

      static TRACKER: OnceLock<WarnTracker> = OnceLock::new();

      let tracker = TRACKER.get_or_init(WarnTracker::default);
      if tracker.should_warn($duration) {
        log::log!($level, $first, $($arg)+);
      } else {
        log::debug!($first, $($arg)+);
      }
    }
  };
}

pub use {error_every, log_every, warn_every};
