// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./error_test.rs"]
mod error_test;

use std::cell::RefCell;
use std::sync::{Arc, LazyLock};

//
// Reporter
//

/// Trait for a reporter that reports a single unexpected error to the host.
pub trait Reporter: Send + Sync {
  fn report(&self, message: &str, details: Option<&str>);
}

// Without a host reporter errors only end up in the log.
struct LoggingReporter;

impl Reporter for LoggingReporter {
  fn report(&self, message: &str, details: Option<&str>) {
    log::error!("unexpected error: {message} {details:?}");
  }
}

//
// UnexpectedErrorHandler
//

/// Forwards errors that should never happen (background task failures, persistence failures that
/// can't be attributed to a caller) to the host. Reports are capped so that a persistent failure
/// doesn't flood the host.
pub struct UnexpectedErrorHandler {
  reporter: Arc<dyn Reporter>,
  remaining_reports: usize,
}

impl UnexpectedErrorHandler {
  fn new() -> Self {
    Self {
      reporter: Arc::new(LoggingReporter),
      remaining_reports: 5,
    }
  }

  pub fn set_reporter(reporter: Arc<dyn Reporter>) {
    ERROR_HANDLER.lock().reporter = reporter;
  }

  pub fn clear_reporter() {
    ERROR_HANDLER.lock().reporter = Arc::new(LoggingReporter);
  }

  /// Runs `f` with `reporter` overriding the global reporter on the current thread. Tests run in
  /// parallel so they can't share the global one.
  pub fn with_reporter<T>(reporter: Arc<dyn Reporter>, f: impl FnOnce() -> T) -> T {
    PER_THREAD_REPORTER.with(|per_thread| *per_thread.borrow_mut() = Some(reporter));
    let r = f();
    PER_THREAD_REPORTER.with(|per_thread| *per_thread.borrow_mut() = None);
    r
  }

  fn report(&mut self, message: &str, description: &str, details: Option<String>) {
    let formatted = format!("{description}: {message}");

    log::warn!("unexpected error: {formatted}");

    if let Some(reporter) = PER_THREAD_REPORTER.with(|r| r.borrow().clone()) {
      reporter.report(&formatted, details.as_deref());
      return;
    }

    if self.remaining_reports == 0 {
      log::warn!("not reporting error, limit hit");
      return;
    }
    self.remaining_reports -= 1;

    self.reporter.report(&formatted, details.as_deref());
  }
}

static ERROR_HANDLER: LazyLock<parking_lot::Mutex<UnexpectedErrorHandler>> =
  LazyLock::new(|| parking_lot::Mutex::new(UnexpectedErrorHandler::new()));

thread_local! {
  static PER_THREAD_REPORTER: RefCell<Option<Arc<dyn Reporter>>> = const { RefCell::new(None) };
}

pub fn handle_unexpected_error_with_details<E: Into<anyhow::Error>>(
  e: E,
  description: &str,
  details: Option<String>,
) {
  let e: anyhow::Error = e.into();
  ERROR_HANDLER
    .lock()
    .report(&format!("{e:#}"), description, details);
}

pub fn handle_unexpected<T, E: Into<anyhow::Error>>(r: Result<T, E>, description: &str) {
  if let Err(e) = r {
    handle_unexpected_error_with_details(e, description, None);
  }
}
