// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./directory_test.rs"]
mod directory_test;

use crate::Storage;
use parking_lot::Mutex;
use std::path::PathBuf;

//
// DirectoryStorage
//

/// Stores each key as a file under a root directory. Writes go through a temporary file and a
/// rename so a crash mid-write leaves the previous value intact.
pub struct DirectoryStorage {
  root: Mutex<PathBuf>,
}

impl DirectoryStorage {
  pub fn new(root: PathBuf) -> anyhow::Result<Self> {
    std::fs::create_dir_all(&root)?;

    Ok(Self { root: root.into() })
  }
}

impl Storage for DirectoryStorage {
  fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()> {
    let guard = self.root.lock();

    let tmp = guard.join(format!("{key}.tmp"));
    std::fs::write(&tmp, value)?;
    std::fs::rename(&tmp, guard.join(key))?;

    Ok(())
  }

  fn get_string(&self, key: &str) -> anyhow::Result<Option<String>> {
    let guard = self.root.lock();

    match std::fs::read_to_string(guard.join(key)) {
      Ok(value) => Ok(Some(value)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  fn delete(&self, key: &str) -> anyhow::Result<()> {
    let guard = self.root.lock();

    match std::fs::remove_file(guard.join(key)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  fn has_any_data(&self) -> anyhow::Result<bool> {
    let guard = self.root.lock();

    for entry in std::fs::read_dir(&*guard)? {
      let entry = entry?;
      if entry.file_type()?.is_file()
        && entry.path().extension().is_none_or(|ext| ext != "tmp")
      {
        return Ok(true);
      }
    }

    Ok(false)
  }
}
