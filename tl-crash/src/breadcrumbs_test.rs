// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{Breadcrumbs, truncate_chars};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn joined(breadcrumbs: &Breadcrumbs) -> String {
  breadcrumbs.try_joined(Duration::from_millis(10)).unwrap()
}

#[test]
fn evicts_oldest_over_limit() {
  let breadcrumbs = Breadcrumbs::new(2, 100);

  assert!(breadcrumbs.add("one"));
  assert!(breadcrumbs.add("two"));
  assert!(breadcrumbs.add("three"));

  assert_eq!("two\nthree", joined(&breadcrumbs));
}

#[test]
fn rejects_empty_and_truncates_long() {
  let breadcrumbs = Breadcrumbs::new(5, 4);

  assert!(!breadcrumbs.add(""));
  assert!(breadcrumbs.add("abcdefgh"));

  assert_eq!("abcd", joined(&breadcrumbs));
}

#[test]
fn held_lock_gives_up() {
  let breadcrumbs = Breadcrumbs::new(5, 100);
  assert!(breadcrumbs.add("one"));

  let _held = breadcrumbs.entries.lock();
  assert_eq!(None, breadcrumbs.try_joined(Duration::from_millis(10)));
}

#[test]
fn truncation_respects_char_boundaries() {
  assert_eq!("hé", truncate_chars("héllo", 2));
  assert_eq!("abc", truncate_chars("abc", 10));
  assert_eq!("", truncate_chars("abc", 0));
}
