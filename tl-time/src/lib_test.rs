// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{OffsetDateTimeExt as _, TestTimeProvider, TimeProvider, TimestampParts};
use pretty_assertions::assert_eq;
use time::ext::NumericalDuration;
use time::macros::{datetime, offset};

#[test]
fn unix_timestamp_ms() {
  assert_eq!(
    1_609_459_203_250,
    datetime!(2021-01-01 00:00:03.25 UTC).unix_timestamp_ms()
  );
}

#[test]
fn timestamp_parts_use_local_offset() {
  // 2021-01-03 is a Sunday in UTC, but still Saturday evening in New York.
  let now = datetime!(2021-01-03 02:30:00 UTC);

  assert_eq!(
    TimestampParts {
      timestamp_ms: 1_609_641_000_000,
      hour: 2,
      dow: 0,
      tz_minutes: 0,
    },
    TimestampParts::new(now, offset!(UTC))
  );

  assert_eq!(
    TimestampParts {
      timestamp_ms: 1_609_641_000_000,
      hour: 21,
      dow: 6,
      tz_minutes: -300,
    },
    TimestampParts::new(now, offset!(-5))
  );
}

#[tokio::test]
async fn test_provider_sleep_advances_clock() {
  let provider = TestTimeProvider::new(datetime!(2021-01-01 00:00:00 UTC));
  provider.sleep(90.seconds()).await;
  provider.advance(30.seconds());

  assert_eq!(datetime!(2021-01-01 00:02:00 UTC), provider.now());
  assert_eq!(
    datetime!(2021-01-01 00:02:00 UTC).unix_timestamp_ms(),
    provider.timestamp_parts().timestamp_ms
  );
}
