// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use parking_lot::Mutex;
use std::sync::Arc;
use tl_client_common::error::{Reporter, UnexpectedErrorHandler};

pub mod storage;
pub mod transport;

pub fn test_global_init() {
  tl_log::SwapLogger::initialize();
}

//
// RecordingErrorReporter
//

/// Test helper that is used to capture an error reported via `error::handle_unexpected`.
#[derive(Default)]
pub struct RecordingErrorReporter {
  recorded_error: Mutex<Option<String>>,
}

impl RecordingErrorReporter {
  /// Executes the provided closure with the expectation that it should result in an error
  /// reported via `error::handle_unexpected`. Returns the return value of the closure and the
  /// captured error message.
  pub fn record_error<T>(f: impl FnOnce() -> T) -> (T, String) {
    let reporter = Arc::new(Self::default());

    let r = UnexpectedErrorHandler::with_reporter(reporter.clone(), f);

    (r, reporter.error().unwrap())
  }

  pub fn error(&self) -> Option<String> {
    self.recorded_error.lock().take()
  }
}

impl Drop for RecordingErrorReporter {
  fn drop(&mut self) {
    assert!(self.recorded_error.lock().is_none());
  }
}

impl Reporter for RecordingErrorReporter {
  fn report(&self, message: &str, _details: Option<&str>) {
    let mut l = self.recorded_error.lock();

    assert!(l.is_none(), "multiple errors captured");
    *l = Some(message.to_string());
  }
}
