// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::config::Config;
use crate::sdk::{Components, Sdk};
use crate::{SDK_NAME, SDK_VERSION};
use std::pin::Pin;
use std::sync::Arc;
use tl_client_common::consent::Consent;
use tl_client_common::error::handle_unexpected;
use tl_client_common::{ConsentProvider, Feature};
use tl_crash::{CrashConfig, CrashFilter, CrashReporter, ThreadDumper};
use tl_device::Device;
use tl_events::Segmentation;
use tl_key_value::{Storage, Store};
use tl_log::{LogListener, SwapLogger};
use tl_migration::{MigrationParams, Migrator};
use tl_network::{HttpTransport, HttpTransportConfig, Transport};
use tl_queue::{
  ComponentShutdown,
  ComponentShutdownTrigger,
  DeliveryConfig,
  DeliveryLoop,
  DurableQueue,
};
use tl_remote_config::{
  DEFAULT_ID_CHANGE_FETCH_DELAY,
  RemoteConfig,
  RemoteConfigListener,
  RemoteConfigParams,
};
use tl_request::{
  LocationParams,
  MetricsProvider,
  RequestBuilder,
  RequestBuilderConfig,
  StaticMetrics,
};
use tl_time::{SystemTimeProvider, TimeProvider};

pub type SdkFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

//
// InitParams
//

/// Everything the SDK needs from its host. Collaborators left as None fall back to the built in
/// implementations.
pub struct InitParams {
  pub config: Config,
  pub storage: Box<dyn Storage>,
  /// Defaults to HTTP against the configured server URL.
  pub transport: Option<Arc<dyn Transport>>,
  /// Defaults to the OS, architecture and configured app version.
  pub metrics: Option<Arc<dyn MetricsProvider>>,
  pub crash_filter: Option<Arc<dyn CrashFilter>>,
  pub thread_dumper: Option<Arc<dyn ThreadDumper>>,
  pub remote_config_listener: Option<Arc<dyn RemoteConfigListener>>,
  /// Receives the SDK's own diagnostics. Only attached if no global subscriber has been installed
  /// yet.
  pub log_listener: Option<Arc<dyn LogListener>>,
  pub time_provider: Option<Arc<dyn TimeProvider>>,
}

impl InitParams {
  #[must_use]
  pub fn new(config: Config, storage: Box<dyn Storage>) -> Self {
    Self {
      config,
      storage,
      transport: None,
      metrics: None,
      crash_filter: None,
      thread_dumper: None,
      remote_config_listener: None,
      log_listener: None,
      time_provider: None,
    }
  }
}

//
// SdkBuilder
//

pub struct SdkBuilder {
  params: InitParams,
}

impl SdkBuilder {
  #[must_use]
  pub const fn new(params: InitParams) -> Self {
    Self { params }
  }

  /// Builds the SDK. The returned future runs the background work (request delivery, periodic
  /// session updates, native crash dump processing) and must be driven on `runtime`, which is
  /// also where fetches are spawned.
  ///
  /// Persisted state is migrated before anything reads the device ID, and the device ID is in
  /// place before the first request is built.
  pub fn build(self, runtime: tokio::runtime::Handle) -> anyhow::Result<(Arc<Sdk>, SdkFuture)> {
    let params = self.params;
    let config = params.config.validate()?;

    if let Some(listener) = params.log_listener
      && let Err(e) = SwapLogger::initialize_with_listener(listener)
    {
      log::warn!("unable to attach log listener: {e}");
    }

    if let Some(filter) = &config.log_filter
      && let Err(e) = SwapLogger::swap(filter)
    {
      log::warn!("unable to apply log filter {filter:?}: {e}");
    }

    log::info!("starting {SDK_NAME} {SDK_VERSION} for {}", config.server_url);

    let time = params
      .time_provider
      .unwrap_or_else(|| Arc::new(SystemTimeProvider::new()));
    let store = Arc::new(Store::new(params.storage));

    let custom_id_set = config.device_id.as_deref().is_some_and(|id| !id.is_empty());
    match Migrator::new(store.clone()).run(MigrationParams { custom_id_set }) {
      Ok(version) => log::debug!("persisted state is at schema version {version}"),
      Err(e) => log::error!("schema migration halted: {e}"),
    }

    let device = Arc::new(Device::new(store.clone()));
    device.initialize(config.device_id.as_deref(), config.temporary_device_id);

    let consent = Arc::new(Consent::new(
      config.requires_consent,
      &config.consent_granted,
    ));
    let queue = Arc::new(DurableQueue::new(
      store.clone(),
      config.max_request_queue_size,
    ));

    let transport: Arc<dyn Transport> = match params.transport {
      Some(transport) => transport,
      None => Arc::new(HttpTransport::new(HttpTransportConfig {
        server_url: config.server_url.clone(),
        force_post: config.force_http_post,
        salt: config.tamper_protection_salt.clone(),
        headers: config.headers(),
        timeout: config.request_timeout(),
      })?),
    };

    let shutdown_trigger = ComponentShutdownTrigger::default();
    let (delivery, immediate) = DeliveryLoop::new(
      queue.clone(),
      transport,
      DeliveryConfig {
        request_timeout: config.request_timeout(),
        initial_backoff: config.retry_initial_backoff(),
        max_backoff: config.retry_max_backoff(),
      },
      shutdown_trigger.make_shutdown(),
    );
    let timer_shutdown = shutdown_trigger.make_shutdown();

    let metrics = params
      .metrics
      .unwrap_or_else(|| Arc::new(StaticMetrics::host(&config.app_version)));
    let requests = Arc::new(RequestBuilder::new(
      RequestBuilderConfig {
        app_key: config.app_key.clone(),
        sdk_name: SDK_NAME.to_string(),
        sdk_version: SDK_VERSION.to_string(),
        metric_override: config.metric_override.clone(),
      },
      queue.clone(),
      device.clone(),
      consent.clone(),
      metrics.clone(),
      time.clone(),
    ));

    if consent.requires_consent() {
      requests.send_consent_changes(&consent.snapshot());
    }

    let crashes = Arc::new(CrashReporter::new(
      CrashConfig {
        record_all_threads: config.record_all_threads_with_crash,
        custom_segments: Segmentation::from_json(&config.custom_crash_segments),
        max_segmentation_values: config.max_segmentation_values,
        max_breadcrumbs: config.max_breadcrumb_count,
        max_value_size: config.max_value_size,
      },
      params.crash_filter,
      params.thread_dumper,
      consent.clone(),
      metrics,
      requests.clone(),
      time.clone(),
    ));
    if config.enable_unhandled_crash_reporting {
      crashes.install_panic_hook();
    }

    let remote_config = RemoteConfig::new(RemoteConfigParams {
      store,
      requests: requests.clone(),
      immediate: immediate.clone(),
      consent: consent.clone(),
      listener: params.remote_config_listener,
      automatic_download: config.remote_config_automatic_download,
      id_change_fetch_delay: DEFAULT_ID_CHANGE_FETCH_DELAY,
      runtime: runtime.clone(),
    });

    let location = if config.disable_location {
      if consent.has_consent(Feature::Location) {
        requests.send_location(&LocationParams::Disabled);
      }
      Some(LocationParams::Disabled)
    } else {
      config.location.clone().map(LocationParams::Known)
    };

    let sdk = Arc::new(Sdk::new(
      Components {
        device,
        consent,
        queue,
        requests,
        crashes: crashes.clone(),
        remote_config,
        immediate,
        time,
        runtime,
        shutdown_trigger,
      },
      config.event_queue_threshold,
      config.max_segmentation_values,
      location,
    ));

    if let Some(attribution) = &config.direct_attribution {
      sdk.record_direct_attribution(&attribution.campaign_type, &attribution.campaign_data);
    }
    if !config.indirect_attribution.is_empty() {
      sdk.record_indirect_attribution(&config.indirect_attribution);
    }
    sdk.download_remote_config_at_init();

    let timer_sdk = sdk.clone();
    let session_update_interval = config.session_update_interval();
    let native_crash_dump_directory = config.native_crash_dump_directory;

    let future = async move {
      if let Some(directory) = native_crash_dump_directory {
        let processed = crashes.process_native_dumps(&directory).await;
        log::debug!("processed {processed} native crash dumps");
      }

      tokio::join!(
        async move {
          delivery.run().await;
          log::info!("delivery loop ended");
        },
        async move {
          run_timer(&timer_sdk, session_update_interval, timer_shutdown).await;
          log::info!("session timer ended");
        }
      );

      anyhow::Ok(())
    };

    Ok((sdk, Box::pin(future)))
  }

  /// Builds the SDK and runs its background work on a dedicated thread with its own runtime. This
  /// is useful for hosts that don't run tokio.
  pub fn build_dedicated_thread(self) -> anyhow::Result<Arc<Sdk>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
      .thread_name("tl-sdk")
      .enable_all()
      .build()?;

    let (sdk, future) = self.build(runtime.handle().clone())?;

    std::thread::Builder::new()
      .name("tl-sdk".to_string())
      .spawn(move || {
        runtime.block_on(async {
          let result = future.await;
          log::info!("sdk runtime has finished running with result: {result:?}");
          handle_unexpected(result, "sdk top level run loop");
        });
      })?;

    Ok(sdk)
  }
}

async fn run_timer(sdk: &Sdk, interval: time::Duration, mut shutdown: ComponentShutdown) {
  let interval = interval.unsigned_abs();

  loop {
    tokio::select! {
      () = shutdown.cancelled() => break,
      () = tokio::time::sleep(interval) => sdk.on_timer(),
    }
  }
}
