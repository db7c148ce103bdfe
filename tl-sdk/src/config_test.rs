// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{Config, ConfigError, DirectAttribution};
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::json;
use time::ext::NumericalDuration;
use tl_client_common::Feature;
use tl_events::Segmentation;
use tl_request::Location;

#[test]
fn yaml_with_defaults() {
  let config = Config::from_yaml(
    r#"
server_url: https://collector.example.com
app_key: abc
requires_consent: true
consent_granted: [sessions, star-rating]
custom_headers:
  X-Team: mobile
location:
  city: Tallinn
  country_code: EE
direct_attribution:
  campaign_type: countly
  campaign_data: '{"cid":"c1"}'
log_filter: debug
"#,
  )
  .unwrap();

  assert_eq!("https://collector.example.com", config.server_url);
  assert_eq!(vec![Feature::Sessions, Feature::StarRating], config.consent_granted);
  assert_eq!(
    vec![("X-Team".to_string(), "mobile".to_string())],
    config.headers()
  );
  assert_eq!(
    Some(Location {
      city: Some("Tallinn".to_string()),
      country_code: Some("EE".to_string()),
      ..Default::default()
    }),
    config.location
  );
  assert_eq!(
    Some(DirectAttribution {
      campaign_type: "countly".to_string(),
      campaign_data: r#"{"cid":"c1"}"#.to_string(),
    }),
    config.direct_attribution
  );

  assert_eq!(10, config.event_queue_threshold);
  assert_eq!(1000, config.max_request_queue_size);
  assert_eq!(30.seconds(), config.request_timeout());
  assert_eq!(1.seconds(), config.retry_initial_backoff());
  assert_eq!(60.seconds(), config.retry_max_backoff());
  assert_eq!(60.seconds(), config.session_update_interval());
  assert_eq!(100, config.max_breadcrumb_count);
  assert_eq!(30, config.max_segmentation_values);
  assert_eq!(256, config.max_value_size);
  assert_eq!(Some("debug".to_string()), config.log_filter);
  assert_eq!(None, Config::default().log_filter);
}

#[test]
fn validation() {
  assert_eq!(
    Err(ConfigError::MissingServerUrl),
    Config::new(" ", "abc").validate()
  );
  assert_eq!(
    Err(ConfigError::MissingAppKey),
    Config::new("https://collector.example.com", "").validate()
  );
  assert_matches!(
    Config::from_yaml("server_url: [not, a, string]"),
    Err(ConfigError::Parse(_))
  );

  let config = Config::new("https://collector.example.com", "abc")
    .with_max_request_queue_size(0)
    .with_event_queue_threshold(0)
    .validate()
    .unwrap();
  assert_eq!(1, config.max_request_queue_size);
  assert_eq!(1, config.event_queue_threshold);
}

#[test]
fn builder_methods() {
  let config = Config::new("https://collector.example.com", "abc")
    .with_location(Location::default())
    .with_location_disabled()
    .with_custom_crash_segments(&Segmentation::new().with("build", 7))
    .with_consent_required(&[Feature::Crashes]);

  assert!(config.disable_location);
  assert_eq!(None, config.location);
  assert_eq!(
    json!({"build": 7}),
    serde_json::Value::Object(config.custom_crash_segments.clone())
  );
  assert!(config.requires_consent);
  assert_eq!(vec![Feature::Crashes], config.consent_granted);
}
