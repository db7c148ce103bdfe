// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::CrashReporter;
use std::path::Path;

impl CrashReporter {
  /// Records every dump file left in `directory` by a previous run, then deletes it. A file is
  /// deleted exactly once whether or not it could be recorded, so a dump that can't be read is
  /// not retried forever. Returns the number of dumps recorded.
  pub async fn process_native_dumps(&self, directory: &Path) -> usize {
    let mut dir = match tokio::fs::read_dir(directory).await {
      Ok(dir) => dir,
      Err(e) => {
        if directory.exists() {
          log::warn!("failed to read native crash directory {directory:?}: {e}");
        } else {
          log::debug!("native crash directory {directory:?} does not exist");
        }
        return 0;
      },
    };

    let mut recorded = 0;
    while let Ok(Some(entry)) = dir.next_entry().await {
      let path = entry.path();
      if !path.is_file() {
        continue;
      }

      log::debug!("processing native crash dump {path:?}");
      match tokio::fs::read(&path).await {
        Ok(contents) => {
          self.record_native_dump(&contents);
          recorded += 1;
        },
        Err(e) => log::warn!("failed to read native crash dump {path:?}: {e}"),
      }

      if let Err(e) = tokio::fs::remove_file(&path).await {
        log::warn!("failed to remove native crash dump {path:?}: {e}");
      }
    }

    recorded
  }
}
