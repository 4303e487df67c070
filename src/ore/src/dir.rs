// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Data directory utilities.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

/// Reports whether `path` is a directory with at least one entry.
///
/// A missing directory has no entries.
pub async fn has_entries(path: &Path) -> Result<bool, io::Error> {
    match fs::read_dir(path).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Removes every entry of the directory at `path` except those listed in
/// `preserve`. The directory itself is kept.
///
/// Entries of `preserve` are compared against the direct children of `path`;
/// to keep a nested path, preserve the top-level entry that contains it.
/// Returns the removed paths. A missing directory is treated as empty.
pub async fn clear_directory(path: &Path, preserve: &[PathBuf]) -> Result<Vec<PathBuf>, io::Error> {
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e),
    };
    let mut removed = vec![];
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        if preserve.iter().any(|p| p == &entry_path) {
            continue;
        }
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&entry_path).await?;
        } else {
            fs::remove_file(&entry_path).await?;
        }
        removed.push(entry_path);
    }
    removed.sort();
    Ok(removed)
}
