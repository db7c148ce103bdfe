// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::Sdk;
use crate::{Config, FetchError, InitParams, SdkBuilder, SdkFuture};
use pretty_assertions::assert_eq;
use serde_json::{Map, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::ext::NumericalDuration;
use time::macros::datetime;
use tl_client_common::Feature;
use tl_device::{DeviceIdType, TEMPORARY_DEVICE_ID};
use tl_events::Segmentation;
use tl_network::Endpoint;
use tl_request::{Location, StaticMetrics};
use tl_test_helpers::storage::{InMemoryStorage, SharedStorage};
use tl_test_helpers::transport::RecordingTransport;
use tl_time::{TestTimeProvider, TimeProvider};

struct Setup {
  storage: Arc<InMemoryStorage>,
  transport: Arc<RecordingTransport>,
  time: TestTimeProvider,
  sdk: Arc<Sdk>,
  future: Option<SdkFuture>,
}

impl Setup {
  fn new(config: Config) -> Self {
    Self::with_storage(config, Arc::new(InMemoryStorage::default()))
  }

  fn with_storage(config: Config, storage: Arc<InMemoryStorage>) -> Self {
    let transport = Arc::new(RecordingTransport::default());
    let time = TestTimeProvider::new(datetime!(2024-03-05 14:30:00 UTC));

    let mut params = InitParams::new(config, Box::new(SharedStorage(storage.clone())));
    params.transport = Some(transport.clone());
    params.time_provider = Some(Arc::new(time.clone()));
    params.metrics = Some(Arc::new(StaticMetrics::default()));

    let (sdk, future) = SdkBuilder::new(params)
      .build(tokio::runtime::Handle::current())
      .unwrap();

    Self {
      storage,
      transport,
      time,
      sdk,
      future: Some(future),
    }
  }

  // Starts delivering requests.
  fn run(&mut self) {
    tokio::spawn(self.future.take().unwrap());
  }

  fn queued(&self) -> Vec<String> {
    self
      .sdk
      .queued_queries()
      .iter()
      .map(|query| urlencoding::decode(query).unwrap().into_owned())
      .collect()
  }
}

fn config() -> Config {
  Config::new("https://collector.example.com", "key").with_device_id("dev")
}

#[tokio::test]
async fn consent_snapshot_is_the_first_request() {
  let setup = Setup::new(config().with_consent_required(&[Feature::Sessions]));

  assert_eq!(Some("dev".to_string()), setup.sdk.device_id());
  assert_eq!(
    Some(DeviceIdType::DeveloperSupplied),
    setup.sdk.device_id_type()
  );

  let queued = setup.queued();
  assert_eq!(1, queued.len());
  assert!(queued[0].starts_with("app_key=key&timestamp=1709649000000&hour=14&dow=2&tz=0&"));
  assert!(queued[0].contains("&device_id=dev&consent={"));
  assert!(queued[0].contains(r#""sessions":true"#));
  assert!(queued[0].contains(r#""events":false"#));
}

#[tokio::test]
async fn events_are_batched() {
  let setup = Setup::new(config().with_event_queue_threshold(2));

  setup.sdk.record_event("a", 1, 0.0, 0.0, None);
  assert!(setup.queued().is_empty());

  // Invalid events are dropped.
  setup.sdk.record_event("", 1, 0.0, 0.0, None);
  setup.sdk.record_event("zero", 0, 0.0, 0.0, None);
  assert!(setup.queued().is_empty());

  let segmentation = Segmentation::new().with("screen", "home");
  setup
    .sdk
    .record_event("b", 2, 1.5, 0.0, Some(&segmentation));

  let queued = setup.queued();
  assert_eq!(1, queued.len());
  assert!(queued[0].contains("&events=[{"));
  assert!(queued[0].contains(r#""key":"a""#));
  assert!(queued[0].contains(r#""segmentation":{"screen":"home"}"#));

  setup.sdk.flush_events();
  assert_eq!(1, setup.queued().len());
}

#[tokio::test]
async fn timed_events() {
  let setup = Setup::new(config().with_event_queue_threshold(1));

  assert!(setup.sdk.start_event("load"));
  assert!(!setup.sdk.start_event("load"));
  setup.time.advance(1500.milliseconds());
  assert!(setup.sdk.end_event("load", 1, 0.0, None));
  assert!(!setup.sdk.end_event("load", 1, 0.0, None));

  let queued = setup.queued();
  assert_eq!(1, queued.len());
  assert!(queued[0].contains(r#""dur":1.5"#));
}

#[tokio::test]
async fn session_lifecycle() {
  let setup = Setup::new(config());

  setup.sdk.begin_session();
  setup.sdk.begin_session();
  assert!(setup.sdk.session_running());

  setup.sdk.record_event("a", 1, 0.0, 0.0, None);
  setup.time.advance(30500.milliseconds());
  setup.sdk.update_session();
  setup.time.advance(20.seconds());
  setup.sdk.end_session();
  assert!(!setup.sdk.session_running());

  let queued = setup.queued();
  assert_eq!(4, queued.len());
  assert!(queued[0].ends_with("&device_id=dev&begin_session=1&metrics={}"));
  assert!(queued[1].contains("&events=["));
  assert!(queued[2].ends_with("&session_duration=30"));
  // The half second left over from the update is carried into the end.
  assert!(queued[3].ends_with("&end_session=1&session_duration=20"));

  // Nothing is running any more.
  setup.sdk.end_session();
  assert_eq!(4, setup.queued().len());
}

#[tokio::test]
async fn timer_updates_running_session() {
  let setup = Setup::new(config());

  setup.sdk.record_event("a", 1, 0.0, 0.0, None);
  setup.sdk.on_timer();
  assert_eq!(1, setup.queued().len());

  setup.sdk.begin_session();
  setup.time.advance(60.seconds());
  setup.sdk.on_timer();

  let queued = setup.queued();
  assert_eq!(3, queued.len());
  assert!(queued[2].ends_with("&session_duration=60"));
}

#[tokio::test]
async fn removing_consent_winds_features_down() {
  let setup = Setup::new(config().with_consent_required(&[
    Feature::Sessions,
    Feature::Location,
    Feature::Events,
  ]));

  setup.sdk.begin_session();
  setup.sdk.record_event("a", 1, 0.0, 0.0, None);
  setup
    .sdk
    .remove_consent(&[Feature::Sessions, Feature::Location, Feature::Events]);

  let queued = setup.queued();
  assert_eq!(6, queued.len());
  assert!(queued[1].contains("&begin_session=1"));
  assert!(queued[2].contains("&events=["));
  assert!(queued[3].contains("&end_session=1"));
  assert!(queued[4].ends_with(r#"&consent={"events":false,"location":false,"sessions":false}"#));
  assert!(queued[5].ends_with("&location="));

  setup.sdk.begin_session();
  setup.sdk.record_event("b", 1, 0.0, 0.0, None);
  setup.sdk.flush_events();
  setup.sdk.remove_consent(&[Feature::Sessions]);
  assert_eq!(6, setup.queued().len());
}

#[tokio::test]
async fn missing_consent_sends_nothing() {
  let setup = Setup::new(config().with_consent_required(&[]));

  setup.sdk.begin_session();
  setup.sdk.record_event("a", 1, 0.0, 0.0, None);
  setup.sdk.flush_events();
  setup.sdk.set_location(Location::default());
  let mut user = Map::new();
  user.insert("name".to_string(), "Ada".into());
  setup.sdk.set_user_data(&user);
  setup.sdk.set_push_token(
    "token",
    tl_request::MessagingMode::Production,
    tl_request::MessagingProvider::Fcm,
  );
  setup
    .sdk
    .record_direct_attribution("_special_test", "{}");
  assert!(!setup.sdk.start_trace("load"));
  setup
    .sdk
    .record_handled_error(&std::io::Error::other("disk full"), None);

  assert_eq!(1, setup.queued().len());
  assert_eq!(
    Err(FetchError::Failed("No consent given".to_string())),
    setup.sdk.fetch_rating_widget("w1").wait().await
  );
  assert_eq!(None, setup.sdk.remote_config_values());
}

#[tokio::test]
async fn giving_consent_reports_changes_once() {
  let setup = Setup::new(config().with_consent_required(&[]));

  setup.sdk.give_consent(&[Feature::Events]);
  setup.sdk.give_consent(&[Feature::Events]);

  let queued = setup.queued();
  assert_eq!(2, queued.len());
  assert!(queued[1].ends_with(r#"&consent={"events":true}"#));
  assert!(setup.sdk.has_consent(Feature::Events));
}

#[tokio::test]
async fn device_id_change_with_merge() {
  let setup = Setup::new(config());

  setup.sdk.begin_session();
  setup.time.advance(10.seconds());
  setup.sdk.change_device_id_with_merge("new");
  setup.sdk.change_device_id_with_merge("new");
  setup.sdk.change_device_id_with_merge("");

  assert_eq!(Some("new".to_string()), setup.sdk.device_id());
  let queued = setup.queued();
  assert_eq!(2, queued.len());
  assert!(queued[1].contains("&device_id=new&"));
  assert!(queued[1].ends_with("&session_duration=10&old_device_id=dev"));
}

#[tokio::test]
async fn device_id_change_without_merge_restarts_session() {
  let setup = Setup::new(config());

  setup.sdk.begin_session();
  setup.time.advance(10.seconds());
  setup.sdk.change_device_id_without_merge("new");

  assert!(setup.sdk.session_running());
  let queued = setup.queued();
  assert_eq!(3, queued.len());
  assert!(queued[1].contains("&device_id=dev&end_session=1&session_duration=10"));
  assert!(queued[2].contains("&device_id=new&begin_session=1"));
}

#[tokio::test]
async fn temporary_id_mode_round_trip() {
  let setup = Setup::new(
    Config::new("https://collector.example.com", "key").with_temporary_device_id(),
  );
  assert!(setup.sdk.is_temporary_id_mode());

  setup.sdk.record_event("a", 1, 0.0, 0.0, None);
  setup.sdk.flush_events();
  assert!(setup.queued()[0].contains(&format!("&device_id={TEMPORARY_DEVICE_ID}&")));

  assert_eq!(
    Err(FetchError::Failed(
      "Can't complete call, temporary device ID is set".to_string()
    )),
    setup.sdk.fetch_feedback_widgets().wait().await
  );

  setup.sdk.change_device_id_with_merge("real");

  assert!(!setup.sdk.is_temporary_id_mode());
  assert_eq!(
    Some(DeviceIdType::DeveloperSupplied),
    setup.sdk.device_id_type()
  );
  let queued = setup.queued();
  assert_eq!(1, queued.len());
  assert!(queued[0].contains("&device_id=real&events="));
}

#[tokio::test]
async fn changing_to_the_temporary_id_enters_temporary_mode() {
  let setup = Setup::new(config());

  setup.sdk.change_device_id_with_merge(TEMPORARY_DEVICE_ID);

  assert!(setup.sdk.is_temporary_id_mode());
  assert!(setup.queued().is_empty());
}

#[tokio::test]
async fn widget_fetches() {
  let mut setup = Setup::new(config());
  setup.run();

  assert_eq!(
    Err(FetchError::Failed("Widget ID is empty".to_string())),
    setup.sdk.fetch_rating_widget("").wait().await
  );

  setup
    .transport
    .push_status(200, r#"{"result":[{"_id":"f1"}]}"#);
  assert_eq!(
    Ok(json!({"result": [{"_id": "f1"}]})),
    setup.sdk.fetch_feedback_widgets().wait().await
  );

  setup.transport.push_status(500, "{}");
  assert_eq!(
    Err(FetchError::Failed(
      tl_queue::NETWORK_FAILURE_MESSAGE.to_string()
    )),
    setup.sdk.fetch_rating_widget("w1").wait().await
  );

  let sent = setup.transport.sent();
  assert_eq!(2, sent.len());
  assert_eq!(Endpoint::Sdk, sent[0].0);
  assert!(sent[0].1.contains("&method=feedback"));
  assert!(sent[1].1.contains("&widget_id=w1"));
}

#[tokio::test]
async fn attribution() {
  let setup = Setup::new(
    config()
      .with_direct_attribution("countly", r#"{"cid":"c1","cuid":"u1"}"#)
      .with_indirect_attribution(BTreeMap::from([
        ("idfa".to_string(), "abc".to_string()),
        ("empty".to_string(), String::new()),
      ])),
  );

  setup
    .sdk
    .record_direct_attribution("_special_test", r#"{"a":1}"#);
  setup.sdk.record_direct_attribution("unknown", "data");
  setup
    .sdk
    .record_direct_attribution("countly", r#"{"cuid":"u1"}"#);

  let queued = setup.queued();
  assert_eq!(3, queued.len());
  assert!(queued[0].ends_with("&campaign_id=c1&campaign_user=u1"));
  assert!(queued[1].ends_with(r#"&aid={"idfa":"abc"}"#));
  assert!(queued[2].ends_with(r#"&attribution_data={"a":1}"#));
}

#[tokio::test]
async fn location() {
  let setup = Setup::new(config().with_location_disabled());

  setup.sdk.begin_session();
  setup.sdk.set_location(Location {
    city: Some("Tallinn".to_string()),
    ..Default::default()
  });
  setup.sdk.end_session();
  setup.sdk.begin_session();

  let queued = setup.queued();
  assert_eq!(5, queued.len());
  assert!(queued[0].ends_with("&location="));
  assert!(queued[1].ends_with("&begin_session=1&metrics={}&location="));
  assert!(queued[2].ends_with("&city=Tallinn"));
  assert!(queued[4].ends_with("&begin_session=1&metrics={}&city=Tallinn"));
}

#[tokio::test]
async fn apm() {
  let setup = Setup::new(config());

  assert!(setup.sdk.start_trace("load"));
  assert!(!setup.sdk.start_trace("load"));
  setup.time.advance(250.milliseconds());

  let mut metrics = Map::new();
  metrics.insert("items".to_string(), 3.into());
  metrics.insert("label".to_string(), "x".into());
  assert!(setup.sdk.end_trace("load", &metrics));
  assert!(!setup.sdk.end_trace("load", &metrics));

  assert!(setup.sdk.start_trace("cancelled"));
  assert!(setup.sdk.cancel_trace("cancelled"));

  setup
    .sdk
    .record_app_start(setup.time.now() - 2.seconds());

  let queued = setup.queued();
  assert_eq!(2, queued.len());
  assert!(queued[0].contains(r#""apm_metrics":{"duration":250,"items":3}"#));
  assert!(queued[0].contains(r#""name":"load""#));
  assert!(queued[1].contains(r#""apm_metrics":{"duration":2000}"#));
  assert!(queued[1].contains(r#""name":"app_start""#));
}

#[tokio::test]
async fn crashes() {
  let setup = Setup::new(config());

  setup.sdk.add_crash_breadcrumb("opened settings");
  setup
    .sdk
    .record_handled_error(&std::io::Error::other("disk full"), None);

  let queued = setup.queued();
  assert_eq!(1, queued.len());
  assert!(queued[0].contains("&crash={"));
  assert!(queued[0].contains(r#""_error":"disk full"#));
  assert!(queued[0].contains(r#""_logs":"opened settings""#));
  assert!(queued[0].contains(r#""_nonfatal":true"#));
}

#[tokio::test]
async fn native_dumps_are_processed_in_the_background() {
  let directory = tempfile::TempDir::with_prefix("native-dumps").unwrap();
  std::fs::write(directory.path().join("1.dmp"), b"first").unwrap();

  let mut setup = Setup::new(config().with_native_crash_dump_directory(directory.path()));
  setup.run();
  setup.transport.wait_for_sends(1).await;

  let sent = urlencoding::decode(&setup.transport.sent_queries()[0])
    .unwrap()
    .into_owned();
  assert!(sent.contains(r#""_native_cpp":true"#));
  assert_eq!(0, std::fs::read_dir(directory.path()).unwrap().count());
}

#[tokio::test]
async fn remote_config() {
  let mut setup = Setup::new(config());
  setup.run();

  setup.transport.push_status(200, r#"{"a":1,"b":2}"#);
  assert_eq!(Ok(None), setup.sdk.update_remote_config().wait().await);
  assert_eq!(Some(json!(1)), setup.sdk.remote_config_value("a"));

  setup.transport.push_status(200, r#"{"b":3}"#);
  assert_eq!(
    Ok(None),
    setup
      .sdk
      .update_remote_config_for_keys(vec!["b".to_string()])
      .wait()
      .await
  );
  assert_eq!(Some(json!(3)), setup.sdk.remote_config_value("b"));
  assert_eq!(Some(json!(1)), setup.sdk.remote_config_value("a"));

  // An empty exclude list still merges.
  setup.transport.push_status(200, r#"{"c":4}"#);
  assert_eq!(
    Ok(None),
    setup
      .sdk
      .update_remote_config_except_keys(vec![])
      .wait()
      .await
  );
  assert_eq!(
    Some(json!({"a": 1, "b": 3, "c": 4}).as_object().unwrap().clone()),
    setup.sdk.remote_config_values()
  );

  // Values belong to the device ID they were fetched for.
  setup.sdk.change_device_id_without_merge("new");
  assert_eq!(Some(Map::new()), setup.sdk.remote_config_values());
}

#[tokio::test]
async fn state_survives_restart() {
  let storage = Arc::new(InMemoryStorage::default());
  let config = Config::new("https://collector.example.com", "key");

  let setup = Setup::with_storage(config.clone(), storage.clone());
  let device_id = setup.sdk.device_id().unwrap();
  assert_eq!(Some(DeviceIdType::OpenUdid), setup.sdk.device_id_type());
  setup.sdk.record_event("a", 1, 0.0, 0.0, None);
  setup.sdk.shutdown(false);
  assert_eq!(1, setup.sdk.pending_request_count());
  assert!(storage.raw("schema_version").is_some());
  drop(setup);

  let setup = Setup::with_storage(config, storage);
  assert_eq!(Some(device_id), setup.sdk.device_id());
  assert_eq!(1, setup.sdk.pending_request_count());
  assert!(setup.storage.raw("request_queue").is_some());
}

#[tokio::test]
async fn log_filter_can_be_replaced() {
  let setup = Setup::new(config().with_log_filter("info"));

  assert!(setup.sdk.set_log_filter("debug,hyper=info"));
  assert!(setup.sdk.set_log_filter("info"));
}
