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


pub mod rate_limit_log;

use parking_lot::Mutex;
use std::sync::Arc;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::reload::Handle as ReloadHandle;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const DEFAULT_FILTER_RULES: &str = "info";

//
// LogListener
//

/// Host supplied sink for SDK diagnostics. Every record that passes the active filter is
/// formatted and handed to the listener in addition to being written to stderr.
pub trait LogListener: Send + Sync {
  fn log(&self, level: log::Level, message: &str);
}

//
// ListenerLayer
//

struct ListenerLayer {
  listener: Arc<dyn LogListener>,
}

impl<S: tracing::Subscriber> Layer<S> for ListenerLayer {
  fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
    let mut visitor = MessageVisitor::default();
    event.record(&mut visitor);

    let level = tracing_log::AsLog::as_log(event.metadata().level());
    self.listener.log(level, &visitor.message);
  }
}

#[derive(Default)]
struct MessageVisitor {
  message: String,
}

impl tracing::field::Visit for MessageVisitor {
  fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
    if field.name() == "message" {
      self.message = value.to_string();
    }
  }

  fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
    if field.name() == "message" {
      self.message = format!("{value:?}");
    }
  }
}

//
// SwapLogger
//

// Process wide logging setup which allows for atomically swapping the active filter.
#[derive(Default)]
pub struct SwapLogger {
  handle: Mutex<Option<ReloadHandle<EnvFilter, Registry>>>,
}

impl SwapLogger {
  const fn new() -> Self {
    Self {
      handle: Mutex::new(None),
    }
  }

  fn get() -> &'static Self {
    static LOGGER: SwapLogger = SwapLogger::new();

    &LOGGER
  }

  // Initialize the logger to the default. This can only be called once and should be called as
  // early as possible in the program.
  pub fn initialize() {
    if let Err(e) = Self::try_initialize(None) {
      eprintln!("failed to initialize logging: {e}");
    }
  }

  /// Initializes logging with an additional host listener. Returns an error if a global subscriber
  /// has already been installed, in which case the listener is not attached.
  pub fn initialize_with_listener(listener: Arc<dyn LogListener>) -> anyhow::Result<()> {
    Self::try_initialize(Some(listener))
  }

  fn try_initialize(listener: Option<Arc<dyn LogListener>>) -> anyhow::Result<()> {
    // Gate ANSI on whether TL_LOG_ANSI is set so that log collectors don't receive escape codes
    // by default.
    let stderr = tracing_subscriber::fmt::layer()
      .with_writer(std::io::stderr)
      .with_ansi(std::env::var("TL_LOG_ANSI").is_ok())
      .with_line_number(true)
      .with_thread_ids(true)
      .compact();

    let filter = EnvFilter::new(
      std::env::var("RUST_LOG")
        .as_deref()
        .unwrap_or(DEFAULT_FILTER_RULES),
    );

    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);

    Registry::default()
      .with(filter)
      .with(stderr)
      .with(listener.map(|listener| ListenerLayer { listener }))
      .try_init()?;

    *Self::get().handle.lock() = Some(reload_handle);
    Ok(())
  }

  // Swap in a new filter with the provided RUST_LOG string.
  pub fn swap(new_rust_log: &str) -> anyhow::Result<()> {
    let guard = Self::get().handle.lock();
    let Some(handle) = guard.as_ref() else {
      anyhow::bail!("logging has not been initialized");
    };

    handle.reload(new_rust_log)?;

    // tracing_subscriber does not update the log crate's max level on reload, so mirror it here.
    log::set_max_level(tracing_log::AsLog::as_log(
      &tracing_subscriber::filter::LevelFilter::current(),
    ));

    Ok(())
  }
}
