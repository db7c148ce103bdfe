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


pub mod breadcrumbs;
mod native;
mod panic;

use base64::Engine as _;
pub use breadcrumbs::Breadcrumbs;
use breadcrumbs::truncate_chars;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use time::OffsetDateTime;
use tl_client_common::{ConsentProvider, Feature};
use tl_events::Segmentation;
use tl_request::{MetricsProvider, RequestBuilder};
use tl_time::TimeProvider;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}

const LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

/// Managed crash text beyond this many characters is cut off. Native dumps are never truncated.
pub const MAX_MANAGED_CRASH_LENGTH: usize = 20_000;

//
// CrashFilter
//

/// Lets the host drop crashes before they are queued.
pub trait CrashFilter: Send + Sync {
  /// Returns true if the rendered crash should be dropped.
  fn should_drop(&self, crash: &str) -> bool;
}

//
// ThreadDumper
//

/// Produces a dump of every thread's stack, appended to crash reports when enabled.
pub trait ThreadDumper: Send + Sync {
  fn dump_all_threads(&self) -> String;
}

//
// CrashConfig
//

#[derive(Clone, Debug)]
pub struct CrashConfig {
  pub record_all_threads: bool,
  pub custom_segments: Segmentation,
  pub max_segmentation_values: usize,
  pub max_breadcrumbs: usize,
  pub max_value_size: usize,
}

impl Default for CrashConfig {
  fn default() -> Self {
    Self {
      record_all_threads: false,
      custom_segments: Segmentation::new(),
      max_segmentation_values: 30,
      max_breadcrumbs: 100,
      max_value_size: 256,
    }
  }
}

//
// CrashKind
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CrashKind {
  Handled,
  Unhandled,
  Native,
}

//
// CrashReporter
//

/// Turns errors, panics and native crash dumps into crash reports and hands each one to the
/// request queue. Every successfully processed crash produces exactly one queued request.
pub struct CrashReporter {
  record_all_threads: bool,
  max_segmentation_values: usize,
  custom_segments: Mutex<Segmentation>,
  breadcrumbs: Breadcrumbs,
  filter: Option<Arc<dyn CrashFilter>>,
  thread_dumper: Option<Arc<dyn ThreadDumper>>,
  consent: Arc<dyn ConsentProvider>,
  metrics: Arc<dyn MetricsProvider>,
  requests: Arc<RequestBuilder>,
  time: Arc<dyn TimeProvider>,
  started_at: OffsetDateTime,
}

impl CrashReporter {
  #[must_use]
  pub fn new(
    config: CrashConfig,
    filter: Option<Arc<dyn CrashFilter>>,
    thread_dumper: Option<Arc<dyn ThreadDumper>>,
    consent: Arc<dyn ConsentProvider>,
    metrics: Arc<dyn MetricsProvider>,
    requests: Arc<RequestBuilder>,
    time: Arc<dyn TimeProvider>,
  ) -> Self {
    let started_at = time.now();

    let reporter = Self {
      record_all_threads: config.record_all_threads,
      max_segmentation_values: config.max_segmentation_values,
      custom_segments: Mutex::new(Segmentation::new()),
      breadcrumbs: Breadcrumbs::new(config.max_breadcrumbs, config.max_value_size),
      filter,
      thread_dumper,
      consent,
      metrics,
      requests,
      time,
      started_at,
    };
    reporter.set_custom_segments(config.custom_segments);
    reporter
  }

  /// Replaces the segments attached to every crash report.
  pub fn set_custom_segments(&self, segments: Segmentation) {
    if !self.consent.has_consent(Feature::Crashes) {
      log::debug!("no consent for crashes, ignoring custom crash segments");
      return;
    }

    *self.custom_segments.lock() = segments;
  }

  pub fn add_breadcrumb(&self, breadcrumb: &str) {
    if !self.consent.has_consent(Feature::Crashes) {
      return;
    }

    self.breadcrumbs.add(breadcrumb);
  }

  /// Records an error together with its source chain and the current backtrace. A missing error
  /// is ignored.
  pub fn record_error(
    &self,
    error: Option<&(dyn std::error::Error + 'static)>,
    handled: bool,
    segmentation: Option<&Segmentation>,
  ) {
    let Some(error) = error else {
      log::debug!("no error provided, nothing to record");
      return;
    };

    let mut text = render_error_chain(error);
    let _ignored = write!(
      text,
      "\n\n{}",
      std::backtrace::Backtrace::force_capture()
    );
    self.record_text(text, handled, segmentation);
  }

  /// Records a crash given its already rendered description.
  pub fn record_text(&self, mut text: String, handled: bool, segmentation: Option<&Segmentation>) {
    log::debug!("recording crash, handled: {handled}");

    if !self.consent.has_consent(Feature::Crashes) {
      log::debug!("no consent for crashes, dropping crash");
      return;
    }

    if self.record_all_threads
      && let Some(dumper) = &self.thread_dumper
    {
      text.push_str("\n\n");
      text.push_str(&dumper.dump_all_threads());
    }

    if let Some(filter) = &self.filter
      && filter.should_drop(&text)
    {
      log::debug!(
        "crash filter matched, dropping crash: {:?}",
        truncate_chars(&text, 60)
      );
      return;
    }

    let kind = if handled {
      CrashKind::Handled
    } else {
      CrashKind::Unhandled
    };
    self.enqueue(&text, kind, segmentation);
  }

  /// Records the contents of a native crash dump. The dump is sent whole.
  pub fn record_native_dump(&self, dump: &[u8]) {
    if !self.consent.has_consent(Feature::Crashes) {
      log::debug!("no consent for crashes, dropping native crash dump");
      return;
    }

    let encoded = base64::engine::general_purpose::STANDARD.encode(dump);
    self.enqueue(&encoded, CrashKind::Native, None);
  }

  fn enqueue(&self, error: &str, kind: CrashKind, segmentation: Option<&Segmentation>) {
    let error = if kind == CrashKind::Native {
      error
    } else {
      truncate_chars(error, MAX_MANAGED_CRASH_LENGTH)
    };

    // Crashes can be recorded from a panicking thread that already holds one of these locks.
    let breadcrumbs = self
      .breadcrumbs
      .try_joined(LOCK_TIMEOUT)
      .unwrap_or_default();
    let mut combined = self
      .custom_segments
      .try_lock_for(LOCK_TIMEOUT)
      .map(|segments| segments.clone())
      .unwrap_or_default();
    if let Some(segmentation) = segmentation {
      combined.extend(segmentation);
    }
    combined.truncate(self.max_segmentation_values);

    let mut document = self.metrics.crash_metrics();
    document.insert("_error".to_string(), error.into());
    document.insert("_nonfatal".to_string(), (kind == CrashKind::Handled).into());
    document.insert("_native_cpp".to_string(), (kind == CrashKind::Native).into());
    document.insert("_logs".to_string(), breadcrumbs.into());
    document.insert(
      "_run".to_string(),
      (self.time.now() - self.started_at).whole_seconds().into(),
    );
    if !combined.is_empty() {
      document.insert("_custom".to_string(), Value::Object(combined.to_json()));
    }

    self
      .requests
      .send_crash_report(&Value::Object(document).to_string(), LOCK_TIMEOUT);
  }
}

/// The error's message followed by one `Caused by:` line per source.
#[must_use]
pub fn render_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
  let mut text = error.to_string();
  let mut source = error.source();
  while let Some(cause) = source {
    let _ignored = write!(text, "\nCaused by: {cause}");
    source = cause.source();
  }
  text
}
