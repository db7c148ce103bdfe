// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./consent_test.rs"]
mod consent_test;

use parking_lot::Mutex;
use std::collections::BTreeSet;

//
// Feature
//

/// A consent-gated feature. The string form is the name used on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
  Sessions,
  Events,
  Location,
  Crashes,
  Attribution,
  Users,
  Push,
  StarRating,
  RemoteConfig,
  Apm,
  Feedback,
}

impl Feature {
  pub const ALL: [Self; 11] = [
    Self::Sessions,
    Self::Events,
    Self::Location,
    Self::Crashes,
    Self::Attribution,
    Self::Users,
    Self::Push,
    Self::StarRating,
    Self::RemoteConfig,
    Self::Apm,
    Self::Feedback,
  ];

  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Sessions => "sessions",
      Self::Events => "events",
      Self::Location => "location",
      Self::Crashes => "crashes",
      Self::Attribution => "attribution",
      Self::Users => "users",
      Self::Push => "push",
      Self::StarRating => "star-rating",
      Self::RemoteConfig => "remote-config",
      Self::Apm => "apm",
      Self::Feedback => "feedback",
    }
  }
}

//
// ConsentProvider
//

pub trait ConsentProvider: Send + Sync {
  fn has_consent(&self, feature: Feature) -> bool;
}

//
// Consent
//

/// Consent state for the SDK instance. When consent isn't required every feature is allowed and
/// changes are not reported.
pub struct Consent {
  requires_consent: bool,
  granted: Mutex<BTreeSet<Feature>>,
}

impl Consent {
  #[must_use]
  pub fn new(requires_consent: bool, initially_granted: &[Feature]) -> Self {
    Self {
      requires_consent,
      granted: Mutex::new(initially_granted.iter().copied().collect()),
    }
  }

  #[must_use]
  pub const fn requires_consent(&self) -> bool {
    self.requires_consent
  }

  /// Updates the consent for the provided features. Returns the change set to report to the
  /// collector as a JSON object, or None if nothing needs to be reported.
  pub fn set(&self, features: &[Feature], granted: bool) -> Option<String> {
    if !self.requires_consent {
      log::debug!("consent is not required, ignoring change for {features:?}");
      return None;
    }

    let mut changes = serde_json::Map::new();
    let mut guard = self.granted.lock();
    for feature in features {
      let changed = if granted {
        guard.insert(*feature)
      } else {
        guard.remove(feature)
      };

      if changed {
        changes.insert(feature.as_str().to_string(), granted.into());
      }
    }

    (!changes.is_empty()).then(|| serde_json::Value::Object(changes).to_string())
  }

  /// The full consent state, reported once at init when consent is required.
  #[must_use]
  pub fn snapshot(&self) -> String {
    let guard = self.granted.lock();
    let state: serde_json::Map<_, _> = Feature::ALL
      .iter()
      .map(|f| (f.as_str().to_string(), guard.contains(f).into()))
      .collect();

    serde_json::Value::Object(state).to_string()
  }
}

impl ConsentProvider for Consent {
  fn has_consent(&self, feature: Feature) -> bool {
    !self.requires_consent || self.granted.lock().contains(&feature)
  }
}
