// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{
  Location,
  LocationParams,
  MessagingMode,
  MessagingProvider,
  NetworkTrace,
  RequestBuilder,
  RequestBuilderConfig,
  RequestError,
  StaticMetrics,
};
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use time::macros::datetime;
use tl_client_common::Feature;
use tl_client_common::consent::Consent;
use tl_device::Device;
use tl_queue::DurableQueue;
use tl_test_helpers::storage::in_memory_store;
use tl_time::TestTimeProvider;

const METRICS: &str = "%7B%22_app_version%22%3A%222.0%22%2C%22_os%22%3A%22linux%22%7D";

fn header(device_id: &str) -> String {
  format!(
    "app_key=key&timestamp=1709649000000&hour=14&dow=2&tz=0&sdk_version=1.0.0&sdk_name=tl-rust&\
     device_id={device_id}"
  )
}

struct Setup {
  queue: Arc<DurableQueue>,
  device: Arc<Device>,
  builder: RequestBuilder,
}

impl Setup {
  fn new(consent: Consent) -> Self {
    let (_storage, store) = in_memory_store();
    let queue = Arc::new(DurableQueue::new(store.clone(), 100));
    let device = Arc::new(Device::new(store));

    let mut metrics = Map::new();
    metrics.insert("_os".to_string(), "linux".into());
    metrics.insert("_app_version".to_string(), "1.2".into());
    let mut metric_override = Map::new();
    metric_override.insert("_app_version".to_string(), "2.0".into());

    let builder = RequestBuilder::new(
      RequestBuilderConfig {
        app_key: "key".to_string(),
        sdk_name: "tl-rust".to_string(),
        sdk_version: "1.0.0".to_string(),
        metric_override,
      },
      queue.clone(),
      device.clone(),
      Arc::new(consent),
      Arc::new(StaticMetrics::new(metrics)),
      Arc::new(TestTimeProvider::new(datetime!(2024-03-05 14:30:00 UTC))),
    );

    Self {
      queue,
      device,
      builder,
    }
  }

  fn with_device_id() -> Self {
    let setup = Self::new(Consent::new(false, &[]));
    setup.device.initialize(Some("dev 1"), false);
    setup
  }

  fn queries(&self) -> Vec<String> {
    self
      .queue
      .snapshot()
      .into_iter()
      .map(|record| record.query)
      .collect()
  }

  fn single_query(&self) -> String {
    let queries = self.queries();
    assert_eq!(1, queries.len(), "{queries:?}");
    queries.into_iter().next().unwrap()
  }
}

fn decoded_param(query: &str, name: &str) -> Value {
  let prefix = format!("{name}=");
  let raw = query
    .split('&')
    .find_map(|pair| pair.strip_prefix(&prefix))
    .unwrap();
  serde_json::from_str(&urlencoding::decode(raw).unwrap()).unwrap()
}

#[test]
fn begin_session_carries_metrics_and_location() {
  let setup = Setup::with_device_id();

  setup
    .builder
    .begin_session(Some(&LocationParams::Known(Location {
      country_code: Some("EE".to_string()),
      city: Some("Tallinn".to_string()),
      ..Default::default()
    })));

  assert_eq!(
    format!(
      "{}&begin_session=1&metrics={METRICS}&city=Tallinn&country_code=EE",
      header("dev%201")
    ),
    setup.single_query()
  );
}

#[test]
fn location_is_left_out_without_consent() {
  let setup = Setup::new(Consent::new(true, &[Feature::Sessions]));
  setup.device.initialize(Some("dev 1"), false);

  setup
    .builder
    .begin_session(Some(&LocationParams::Known(Location {
      city: Some("Tallinn".to_string()),
      ..Default::default()
    })));

  assert_eq!(
    format!("{}&begin_session=1&metrics={METRICS}", header("dev%201")),
    setup.single_query()
  );
}

#[test]
fn disabled_location_sends_empty_value() {
  let setup = Setup::with_device_id();

  setup.builder.send_location(&LocationParams::Disabled);

  assert_eq!(
    format!("{}&location=", header("dev%201")),
    setup.single_query()
  );
}

#[test]
fn session_lifecycle() {
  let setup = Setup::with_device_id();

  setup.builder.update_session(0);
  assert!(setup.queue.is_empty());

  setup.builder.update_session(60);
  setup.builder.end_session(12, Some("old id"));
  setup.builder.end_session(0, None);

  assert_eq!(
    vec![
      format!("{}&session_duration=60", header("dev%201")),
      format!(
        "{}&end_session=1&session_duration=12",
        header("old%20id")
      ),
      format!("{}&end_session=1", header("dev%201")),
    ],
    setup.queries()
  );
}

#[test]
fn identity_requests() {
  let setup = Setup::with_device_id();

  setup.builder.change_device_id("old", 5);
  setup
    .builder
    .token_session("tok", MessagingMode::Test, MessagingProvider::Hms);
  setup.builder.send_user_data(r#"{"name":"a"}"#);
  setup.builder.send_user_data("");

  assert_eq!(
    vec![
      format!("{}&session_duration=5&old_device_id=old", header("dev%201")),
      format!(
        "{}&token_session=1&android_token=tok&token_provider=HMS&test_mode=2",
        header("dev%201")
      ),
      format!(
        "{}&user_details=%7B%22name%22%3A%22a%22%7D",
        header("dev%201")
      ),
    ],
    setup.queries()
  );
}

#[test]
fn attribution_requests() {
  let setup = Setup::with_device_id();

  setup.builder.send_direct_attribution_legacy("c1", None);
  setup.builder.send_direct_attribution_legacy("c1", Some(""));
  setup.builder.send_direct_attribution_legacy("c1", Some("u1"));
  setup.builder.send_indirect_attribution(r#"{"adid":"x"}"#);
  setup.builder.send_direct_attribution_test("data");

  assert_eq!(
    vec![
      format!("{}&campaign_id=c1", header("dev%201")),
      format!("{}&campaign_id=c1", header("dev%201")),
      format!("{}&campaign_id=c1&campaign_user=u1", header("dev%201")),
      format!("{}&aid=%7B%22adid%22%3A%22x%22%7D", header("dev%201")),
      format!("{}&attribution_data=data", header("dev%201")),
    ],
    setup.queries()
  );
}

#[test]
fn payload_requests() {
  let setup = Setup::with_device_id();

  setup.builder.record_events(r#"[{"key":"a"}]"#);
  setup.builder.send_consent_changes(r#"{"events":true}"#);
  assert!(
    setup
      .builder
      .send_crash_report(r#"{"_error":"boom"}"#, Duration::from_millis(100))
  );

  let queries = setup.queries();
  assert_eq!(json!([{"key": "a"}]), decoded_param(&queries[0], "events"));
  assert_eq!(json!({"events": true}), decoded_param(&queries[1], "consent"));
  assert_eq!(json!({"_error": "boom"}), decoded_param(&queries[2], "crash"));
}

#[test]
fn apm_requests() {
  let setup = Setup::with_device_id();

  setup.builder.send_apm_network_trace(&NetworkTrace {
    key: "/api".to_string(),
    response_time_ms: 120,
    response_code: 200,
    request_payload_size: 10,
    response_payload_size: 2000,
    start_ms: 1000,
    end_ms: 1120,
  });
  let mut custom = Map::new();
  custom.insert("frames".to_string(), 3.into());
  setup
    .builder
    .send_apm_custom_trace("render", 50, 2000, 2050, &custom);
  setup.builder.send_apm_app_start(800, 0, 800);
  setup.builder.send_apm_screen_time(false, 9000, 100, 9100);

  let queries = setup.queries();
  assert!(queries.iter().all(|q| q.contains("&count=1&apm=")));
  assert_eq!(
    json!({
      "type": "network",
      "name": "/api",
      "apm_metrics": {
        "response_time": 120,
        "response_code": 200,
        "request_payload_size": 10,
        "response_payload_size": 2000,
      },
      "stz": 1000,
      "etz": 1120,
    }),
    decoded_param(&queries[0], "apm")
  );
  assert_eq!(
    json!({
      "type": "device",
      "name": "render",
      "apm_metrics": {"frames": 3, "duration": 50},
      "stz": 2000,
      "etz": 2050,
    }),
    decoded_param(&queries[1], "apm")
  );
  assert_eq!(
    json!("app_start"),
    decoded_param(&queries[2], "apm")["name"]
  );
  assert_eq!(
    json!("app_in_background"),
    decoded_param(&queries[3], "apm")["name"]
  );
}

#[test]
fn remote_config_request_keys() {
  let setup = Setup::with_device_id();
  let a = vec!["a".to_string()];
  let b = vec!["b".to_string()];

  let both = setup
    .builder
    .prepare_remote_config_request(&a, &b)
    .unwrap();
  assert_eq!(
    format!(
      "{}&method=fetch_remote_config&keys=%5B%22a%22%5D&metrics={METRICS}",
      header("dev%201")
    ),
    both
  );

  let except = setup.builder.prepare_remote_config_request(&[], &b).unwrap();
  assert!(except.contains("&omit_keys=%5B%22b%22%5D"));
  assert!(!except.contains("&keys="));

  let all = setup.builder.prepare_remote_config_request(&[], &[]).unwrap();
  assert!(!all.contains("keys="));

  // Prepared requests bypass the queue.
  assert!(setup.queue.is_empty());
}

#[test]
fn widget_and_feedback_requests() {
  let setup = Setup::with_device_id();

  assert_eq!(
    format!("{}&widget_id=w1", header("dev%201")),
    setup.builder.prepare_rating_widget_request("w1").unwrap()
  );
  assert_eq!(
    format!("{}&method=feedback", header("dev%201")),
    setup.builder.prepare_feedback_list_request().unwrap()
  );
}

#[test]
fn device_id_dependent_requests_are_refused() {
  let setup = Setup::new(Consent::new(false, &[]));
  assert_matches!(
    setup.builder.prepare_feedback_list_request(),
    Err(RequestError::NoDeviceId)
  );

  setup.device.initialize(None, true);
  assert_matches!(
    setup.builder.prepare_remote_config_request(&[], &[]),
    Err(RequestError::TemporaryDeviceId)
  );
  assert_eq!(
    "Can't complete call, temporary device ID is set",
    RequestError::TemporaryDeviceId.to_string()
  );

  // Records still tagged with the temporary ID block fetches after a real ID is set.
  setup.builder.begin_session(None);
  assert!(setup.builder.queue_contains_temporary_id_items());
  setup
    .device
    .set("real", tl_device::DeviceIdType::DeveloperSupplied);
  assert_matches!(
    setup.builder.prepare_rating_widget_request("w1"),
    Err(RequestError::TemporaryDeviceId)
  );

  assert_eq!(1, setup.queue.len());
}

#[test]
fn requests_during_device_id_change_are_delayed() {
  let setup = Setup::with_device_id();

  setup.builder.record_events("[]");
  setup.queue.begin_device_id_change();
  setup.builder.record_events("[]");
  setup.queue.complete_device_id_change();

  let delayed: Vec<_> = setup.queue.snapshot().iter().map(|r| r.delayed).collect();
  assert_eq!(vec![false, true], delayed);
}
