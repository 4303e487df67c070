// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable single-file boolean markers.
//!
//! A marker records that some one-way event happened to a data directory,
//! e.g. that a registry node reached quorum at least once. The presence of the
//! file is the only signal; its contents are informational. There is
//! deliberately no way to clear a marker through this type.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Handle to a durable marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableMarker {
    path: PathBuf,
}

impl DurableMarker {
    /// Returns a handle to the marker at `path`. The file is not touched.
    pub fn new(path: impl Into<PathBuf>) -> DurableMarker {
        DurableMarker { path: path.into() }
    }

    /// Returns a handle to the marker named `name` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>, name: &str) -> DurableMarker {
        DurableMarker::new(dir.as_ref().join(name))
    }

    /// The path of the marker file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reports whether the marker has been set.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Sets the marker.
    ///
    /// The file and its parent directory are synced before returning, so a
    /// marker that was reported as set survives a crash. Setting an already
    /// set marker is a no-op that returns `Ok(false)`.
    pub fn mark(&self) -> Result<bool, io::Error> {
        if self.exists() {
            return Ok(false);
        }
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(&self.path)?;
        write!(file, "1")?;
        file.sync_all()?;
        if let Some(parent_path) = self.path.parent() {
            File::open(parent_path).and_then(|h| h.sync_all())?;
        }
        Ok(true)
    }
}
