// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{Reporter, UnexpectedErrorHandler, handle_unexpected};
use anyhow::anyhow;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[derive(Default)]
struct TestReporter {
  messages: Mutex<Vec<String>>,
}

impl Reporter for TestReporter {
  fn report(&self, message: &str, _details: Option<&str>) {
    self.messages.lock().push(message.to_string());
  }
}

#[test]
fn reports_with_description() {
  let reporter = Arc::new(TestReporter::default());

  UnexpectedErrorHandler::with_reporter(reporter.clone(), || {
    handle_unexpected::<(), _>(Err(anyhow!("disk full")), "queue persistence");
    handle_unexpected::<(), anyhow::Error>(Ok(()), "queue persistence");
  });

  assert_eq!(
    vec!["queue persistence: disk full".to_string()],
    *reporter.messages.lock()
  );
}
