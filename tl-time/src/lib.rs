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
#[path = "./lib_test.rs"]
mod lib_test;

use parking_lot::Mutex;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use time::{OffsetDateTime, UtcOffset};
use tokio::time::Timeout;

//
// OffsetDateTimeExt
//

pub trait OffsetDateTimeExt {
  fn unix_timestamp_ms(&self) -> i64;
}

impl OffsetDateTimeExt for OffsetDateTime {
  fn unix_timestamp_ms(&self) -> i64 {
    self.unix_timestamp() * 1_000 + i64::from(self.nanosecond() / 1_000_000)
  }
}

//
// TimestampParts
//

/// The wall clock breakdown attached to every event and request: milliseconds since epoch plus
/// the local hour, the local day of week (Sunday = 0) and the offset from UTC in minutes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampParts {
  pub timestamp_ms: i64,
  pub hour: i32,
  pub dow: i32,
  pub tz_minutes: i32,
}

impl TimestampParts {
  #[must_use]
  pub fn new(now: OffsetDateTime, offset: UtcOffset) -> Self {
    let local = now.to_offset(offset);

    Self {
      timestamp_ms: now.unix_timestamp_ms(),
      hour: i32::from(local.hour()),
      dow: i32::from(local.weekday().number_days_from_sunday()),
      tz_minutes: offset.whole_minutes().into(),
    }
  }
}

//
// TimeDurationExt
//

pub trait TimeDurationExt {
  fn sleep(self) -> impl Future<Output = ()>;
  fn timeout<F: IntoFuture>(self, f: F) -> Timeout<F::IntoFuture>;
  fn add_tokio_now(self) -> tokio::time::Instant;
}

impl TimeDurationExt for time::Duration {
  fn sleep(self) -> impl Future<Output = ()> {
    tokio::time::sleep(self.unsigned_abs())
  }

  fn timeout<F: IntoFuture>(self, f: F) -> Timeout<F::IntoFuture> {
    tokio::time::timeout(self.unsigned_abs(), f)
  }

  fn add_tokio_now(self) -> tokio::time::Instant {
    tokio::time::Instant::now() + self.unsigned_abs()
  }
}

//
// TimeProvider
//

#[async_trait::async_trait]
pub trait TimeProvider: Send + Sync {
  fn now(&self) -> OffsetDateTime;
  async fn sleep(&self, duration: time::Duration);

  /// The offset used for the local hour and day of week. Providers default to UTC, the SDK
  /// captures the host offset once at startup.
  fn local_offset(&self) -> UtcOffset {
    UtcOffset::UTC
  }

  fn timestamp_parts(&self) -> TimestampParts {
    TimestampParts::new(self.now(), self.local_offset())
  }
}

//
// SystemTimeProvider
//

pub struct SystemTimeProvider {
  offset: UtcOffset,
}

impl SystemTimeProvider {
  /// Captures the current local offset. Reading the offset is only reliable while the process is
  /// still single threaded, so this should be constructed early; UTC is used otherwise.
  #[must_use]
  pub fn new() -> Self {
    Self {
      offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
    }
  }

  #[must_use]
  pub const fn with_offset(offset: UtcOffset) -> Self {
    Self { offset }
  }
}

impl Default for SystemTimeProvider {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait::async_trait]
impl TimeProvider for SystemTimeProvider {
  fn now(&self) -> OffsetDateTime {
    OffsetDateTime::now_utc()
  }

  async fn sleep(&self, duration: time::Duration) {
    tokio::time::sleep(duration.unsigned_abs()).await;
  }

  fn local_offset(&self) -> UtcOffset {
    self.offset
  }
}

//
// TestTimeProvider
//

#[derive(Clone)]
pub struct TestTimeProvider {
  now: Arc<Mutex<OffsetDateTime>>,
}

impl TestTimeProvider {
  #[must_use]
  pub fn new(now: OffsetDateTime) -> Self {
    Self {
      now: Arc::new(Mutex::new(now)),
    }
  }

  pub fn advance(&self, duration: time::Duration) {
    *self.now.lock() += duration;
  }

  pub fn set_time(&self, new_time: OffsetDateTime) {
    *self.now.lock() = new_time;
  }
}

#[async_trait::async_trait]
impl TimeProvider for TestTimeProvider {
  fn now(&self) -> OffsetDateTime {
    *self.now.lock()
  }

  async fn sleep(&self, duration: time::Duration) {
    // Don't actually sleep, just move the clock forward and give other tasks a chance to run.
    *self.now.lock() += duration;
    tokio::task::yield_now().await;
  }
}
