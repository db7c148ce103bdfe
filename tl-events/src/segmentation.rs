// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./segmentation_test.rs"]
mod segmentation_test;

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

//
// SegmentationValue
//

#[derive(Clone, Debug, PartialEq)]
pub enum SegmentationValue {
  String(String),
  Int(i32),
  Double(f64),
  Bool(bool),
}

impl From<&str> for SegmentationValue {
  fn from(value: &str) -> Self {
    Self::String(value.to_string())
  }
}

impl From<String> for SegmentationValue {
  fn from(value: String) -> Self {
    Self::String(value)
  }
}

impl From<i32> for SegmentationValue {
  fn from(value: i32) -> Self {
    Self::Int(value)
  }
}

impl From<f64> for SegmentationValue {
  fn from(value: f64) -> Self {
    Self::Double(value)
  }
}

impl From<bool> for SegmentationValue {
  fn from(value: bool) -> Self {
    Self::Bool(value)
  }
}

impl SegmentationValue {
  /// Classifies a decoded JSON value. The type is inferred from the value itself: a number
  /// written with a fractional part or exponent is a double, one that fits in an i32 is an int,
  /// and anything else (including integers outside the i32 range and nested structures) is kept
  /// as its string form. Null has no representation.
  #[must_use]
  pub fn from_json(value: &Value) -> Option<Self> {
    match value {
      Value::Null => None,
      Value::Bool(b) => Some(Self::Bool(*b)),
      Value::Number(n) if n.is_f64() => n.as_f64().map(Self::Double),
      Value::Number(n) => Some(
        n.as_i64()
          .and_then(|i| i32::try_from(i).ok())
          .map_or_else(|| Self::String(n.to_string()), Self::Int),
      ),
      Value::String(s) => Some(Self::String(s.clone())),
      other => Some(Self::String(other.to_string())),
    }
  }

  /// Returns None for non-finite doubles, which JSON can't represent.
  #[must_use]
  pub fn to_json(&self) -> Option<Value> {
    match self {
      Self::String(s) => Some(Value::String(s.clone())),
      Self::Int(i) => Some(Value::from(*i)),
      Self::Double(d) => Number::from_f64(*d).map(Value::Number),
      Self::Bool(b) => Some(Value::Bool(*b)),
    }
  }
}

//
// Segmentation
//

/// Flat key/value breakdown attached to events and crashes. Every key lives in exactly one of
/// four typed buckets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Segmentation {
  strings: BTreeMap<String, String>,
  ints: BTreeMap<String, i32>,
  doubles: BTreeMap<String, f64>,
  bools: BTreeMap<String, bool>,
}

impl Segmentation {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts the value into the bucket matching its type, removing the key from any other
  /// bucket.
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<SegmentationValue>) {
    let key = key.into();
    self.remove(&key);

    match value.into() {
      SegmentationValue::String(v) => {
        self.strings.insert(key, v);
      },
      SegmentationValue::Int(v) => {
        self.ints.insert(key, v);
      },
      SegmentationValue::Double(v) => {
        self.doubles.insert(key, v);
      },
      SegmentationValue::Bool(v) => {
        self.bools.insert(key, v);
      },
    }
  }

  #[must_use]
  pub fn with(mut self, key: impl Into<String>, value: impl Into<SegmentationValue>) -> Self {
    self.insert(key, value);
    self
  }

  pub fn remove(&mut self, key: &str) -> Option<SegmentationValue> {
    self
      .strings
      .remove(key)
      .map(SegmentationValue::String)
      .or_else(|| self.ints.remove(key).map(SegmentationValue::Int))
      .or_else(|| self.doubles.remove(key).map(SegmentationValue::Double))
      .or_else(|| self.bools.remove(key).map(SegmentationValue::Bool))
  }

  #[must_use]
  pub fn get(&self, key: &str) -> Option<SegmentationValue> {
    self
      .strings
      .get(key)
      .map(|v| SegmentationValue::String(v.clone()))
      .or_else(|| self.ints.get(key).map(|v| SegmentationValue::Int(*v)))
      .or_else(|| self.doubles.get(key).map(|v| SegmentationValue::Double(*v)))
      .or_else(|| self.bools.get(key).map(|v| SegmentationValue::Bool(*v)))
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.strings.len() + self.ints.len() + self.doubles.len() + self.bools.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// All entries ordered by key.
  #[must_use]
  pub fn entries(&self) -> BTreeMap<&str, SegmentationValue> {
    let mut entries = BTreeMap::new();
    for (k, v) in &self.strings {
      entries.insert(k.as_str(), SegmentationValue::String(v.clone()));
    }
    for (k, v) in &self.ints {
      entries.insert(k.as_str(), SegmentationValue::Int(*v));
    }
    for (k, v) in &self.doubles {
      entries.insert(k.as_str(), SegmentationValue::Double(*v));
    }
    for (k, v) in &self.bools {
      entries.insert(k.as_str(), SegmentationValue::Bool(*v));
    }
    entries
  }

  /// Copies every entry of `other` over this one, `other` winning on conflicts.
  pub fn extend(&mut self, other: &Self) {
    for (k, v) in other.entries() {
      self.insert(k, v);
    }
  }

  /// Keeps at most `max` entries, dropping the excess in key order.
  pub fn truncate(&mut self, max: usize) {
    let excess: Vec<String> = self
      .entries()
      .keys()
      .skip(max)
      .map(ToString::to_string)
      .collect();

    if !excess.is_empty() {
      log::debug!("dropping {} segmentation entries over the limit of {max}", excess.len());
    }
    for key in excess {
      self.remove(&key);
    }
  }

  /// Non-finite doubles are skipped with a warning.
  #[must_use]
  pub fn to_json(&self) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in self.entries() {
      match v.to_json() {
        Some(json) => {
          map.insert(k.to_string(), json);
        },
        None => log::warn!("skipping non-finite segmentation value for {k:?}"),
      }
    }
    map
  }

  #[must_use]
  pub fn from_json(map: &Map<String, Value>) -> Self {
    let mut segmentation = Self::default();
    for (k, v) in map {
      if let Some(value) = SegmentationValue::from_json(v) {
        segmentation.insert(k.clone(), value);
      }
    }
    segmentation
  }
}
