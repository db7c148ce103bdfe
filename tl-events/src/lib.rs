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


mod segmentation;

pub use segmentation::{Segmentation, SegmentationValue};
use serde_json::{Map, Number, Value};
use tl_time::TimestampParts;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  tl_test_helpers::test_global_init();
}

const KEY_KEY: &str = "key";
const COUNT_KEY: &str = "count";
const SUM_KEY: &str = "sum";
const DUR_KEY: &str = "dur";
const TIMESTAMP_KEY: &str = "timestamp";
const HOUR_KEY: &str = "hour";
const DOW_KEY: &str = "dow";
const SEGMENTATION_KEY: &str = "segmentation";

//
// Event
//

/// A single recorded measurement.
#[derive(Clone, Debug)]
pub struct Event {
  pub key: String,
  pub count: i32,
  pub sum: f64,
  /// Seconds. Only serialized when positive.
  pub duration: f64,
  pub timestamp_ms: i64,
  pub hour: i32,
  pub dow: i32,
  pub segmentation: Segmentation,
}

impl Event {
  #[must_use]
  pub fn new(key: impl Into<String>, parts: TimestampParts) -> Self {
    Self {
      key: key.into(),
      count: 1,
      sum: 0.0,
      duration: 0.0,
      timestamp_ms: parts.timestamp_ms,
      hour: parts.hour,
      dow: parts.dow,
      segmentation: Segmentation::default(),
    }
  }

  /// Canonical JSON form. Never fails: the sum is written last, so if it can't be represented
  /// the document carries every other field.
  #[must_use]
  pub fn to_json(&self) -> Value {
    let mut json = Map::new();
    json.insert(KEY_KEY.to_string(), self.key.clone().into());
    json.insert(COUNT_KEY.to_string(), self.count.into());
    json.insert(TIMESTAMP_KEY.to_string(), self.timestamp_ms.into());
    json.insert(HOUR_KEY.to_string(), self.hour.into());
    json.insert(DOW_KEY.to_string(), self.dow.into());

    if !self.segmentation.is_empty() {
      json.insert(
        SEGMENTATION_KEY.to_string(),
        Value::Object(self.segmentation.to_json()),
      );
    }

    let Some(sum) = Number::from_f64(self.sum) else {
      log::warn!("event {:?} has a non-finite sum, serializing without it", self.key);
      return Value::Object(json);
    };
    json.insert(SUM_KEY.to_string(), Value::Number(sum));

    if self.duration > 0.0
      && let Some(duration) = Number::from_f64(self.duration)
    {
      json.insert(DUR_KEY.to_string(), Value::Number(duration));
    }

    Value::Object(json)
  }

  /// Rebuilds an event from its canonical JSON form. Returns None if the key is missing, empty
  /// or not a string, or if the document is otherwise structurally invalid. Numeric fields that
  /// are missing or malformed default to zero.
  #[must_use]
  pub fn from_json(json: &Value) -> Option<Self> {
    let json = json.as_object()?;

    let key = match json.get(KEY_KEY) {
      Some(Value::String(key)) if !key.is_empty() => key.clone(),
      _ => return None,
    };

    let segmentation = match json.get(SEGMENTATION_KEY) {
      None | Some(Value::Null) => Segmentation::default(),
      Some(Value::Object(map)) => Segmentation::from_json(map),
      Some(other) => {
        log::warn!("event {key:?} has a malformed segmentation: {other}");
        return None;
      },
    };

    Some(Self {
      key,
      count: opt_i64(json.get(COUNT_KEY)).try_into().unwrap_or_default(),
      sum: opt_f64(json.get(SUM_KEY)),
      duration: opt_f64(json.get(DUR_KEY)),
      timestamp_ms: opt_i64(json.get(TIMESTAMP_KEY)),
      hour: opt_i64(json.get(HOUR_KEY)).try_into().unwrap_or_default(),
      dow: opt_i64(json.get(DOW_KEY)).try_into().unwrap_or_default(),
      segmentation,
    })
  }
}

// Identity of an event for comparison purposes. Count, sum and duration are measurements and
// don't participate.
impl PartialEq for Event {
  fn eq(&self, other: &Self) -> bool {
    self.key == other.key
      && self.timestamp_ms == other.timestamp_ms
      && self.hour == other.hour
      && self.dow == other.dow
      && self.segmentation == other.segmentation
  }
}

/// Serializes a batch of events as the JSON array carried by an `events` request.
#[must_use]
pub fn events_to_json(events: &[Event]) -> String {
  Value::Array(events.iter().map(Event::to_json).collect()).to_string()
}

/// Parses a JSON array of events, dropping entries that don't form a valid event.
#[must_use]
pub fn events_from_json(json: &str) -> Vec<Event> {
  match serde_json::from_str::<Value>(json) {
    Ok(Value::Array(values)) => values.iter().filter_map(Event::from_json).collect(),
    Ok(_) | Err(_) => {
      log::warn!("failed to parse event batch");
      vec![]
    },
  }
}

#[allow(clippy::cast_possible_truncation)]
fn opt_i64(value: Option<&Value>) -> i64 {
  match value {
    Some(Value::Number(n)) => n
      .as_i64()
      .or_else(|| n.as_f64().map(|f| f as i64))
      .unwrap_or_default(),
    Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
    _ => 0,
  }
}

fn opt_f64(value: Option<&Value>) -> f64 {
  match value {
    Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
    Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
    _ => 0.0,
  }
}
