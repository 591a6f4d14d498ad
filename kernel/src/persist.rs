// Copyright (c) 2025 vivo Mobile Communication Co., Ltd.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared load/save helpers for the on-disk databases. Every database is
//! one bincode-encoded record. A missing or unparsable file loads as
//! "start fresh"; a failed save is reported and skipped.

use crate::error::Result;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

pub fn load<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("no database at {}: {}", path.display(), e);
            return None;
        }
    };
    match bincode::deserialize(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                "unparsable database at {}, starting fresh: {}",
                path.display(),
                e
            );
            None
        }
    }
}

pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, bytes)?;
    Ok(())
}

/// Save, but only warn on failure. Used at program exit where there is
/// nothing better to do than report and move on.
pub fn save_or_warn<T: Serialize>(path: &Path, value: &T, what: &str) {
    if let Err(e) = save(path, value) {
        warn!("failed to save {} to {}: {}", what, path.display(), e);
    }
}
