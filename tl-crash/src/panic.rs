// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::CrashReporter;
use std::panic::PanicHookInfo;
use std::sync::Arc;

impl CrashReporter {
  /// Reports unhandled panics as fatal crashes. The previously installed hook still runs after
  /// the report is queued. The hook only holds a weak reference, so it becomes a pass-through
  /// once the reporter is dropped.
  pub fn install_panic_hook(self: &Arc<Self>) {
    let reporter = Arc::downgrade(self);
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
      if let Some(reporter) = reporter.upgrade() {
        reporter.record_text(render_panic(info), false, None);
      }
      previous(info);
    }));

    log::debug!("registered crash reporting panic hook");
  }
}

fn render_panic(info: &PanicHookInfo<'_>) -> String {
  let message = info.payload().downcast_ref::<&str>().map_or_else(
    || {
      info
        .payload()
        .downcast_ref::<String>()
        .map_or("<none>", |s| s)
    },
    |s| s,
  );

  let location = info.location().map_or_else(
    || "<none>".to_string(),
    |location| format!("{}:{}", location.file(), location.line()),
  );

  let thread = std::thread::current();
  format!(
    "thread '{}' panicked at {location}:\n{message}\n\n{}",
    thread.name().unwrap_or("<unnamed>"),
    std::backtrace::Backtrace::force_capture()
  )
}
