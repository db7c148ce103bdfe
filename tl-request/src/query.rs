// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use std::fmt::Display;

//
// Query
//

/// An `&` joined list of URL-encoded `name=value` pairs, in insertion order.
#[derive(Clone, Debug, Default)]
pub struct Query {
  buffer: String,
}

impl Query {
  pub fn push(&mut self, name: &str, value: impl Display) -> &mut Self {
    if !self.buffer.is_empty() {
      self.buffer.push('&');
    }
    self.buffer.push_str(name);
    self.buffer.push('=');
    self
      .buffer
      .push_str(&urlencoding::encode(&value.to_string()));
    self
  }

  pub fn push_opt(&mut self, name: &str, value: Option<impl Display>) -> &mut Self {
    if let Some(value) = value {
      self.push(name, value);
    }
    self
  }

  #[must_use]
  pub fn finish(self) -> String {
    self.buffer
  }
}
