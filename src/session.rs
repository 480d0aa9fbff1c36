// src/session.rs

//! Session resumability: a small on-disk marker naming the replication
//! set currently (or most recently) in progress, so a crash mid-run picks
//! up at the right set on the next invocation instead of silently
//! skipping ahead or starting over from the first set every time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

const DEFAULT_FILE_NAME: &str = "current_session.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SessionMarker {
    pub in_progress: bool,
    pub destination_name: String,
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A session store rooted at the default file name in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(DEFAULT_FILE_NAME))
    }

    /// Read the current marker, if any. A missing file means no
    /// replication set was in progress when the process last exited
    /// cleanly (or ever ran).
    pub fn read(&self) -> Result<Option<SessionMarker>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let marker = serde_json::from_str(&raw)
            .map_err(|e| crate::error::Error::Config(format!("malformed session marker: {e}")))?;
        Ok(Some(marker))
    }

    /// Write the marker for the replication set now starting.
    pub fn mark_in_progress(&self, destination_name: &str) -> Result<()> {
        debug!(destination_name, "marking replication set in progress");
        self.write(&SessionMarker { in_progress: true, destination_name: destination_name.to_string() })
    }

    /// Clear the marker once a set has completed (successfully or not —
    /// the marker only guards against picking up mid-batch, not against
    /// retrying a set that errored).
    pub fn clear(&self) -> Result<()> {
        self.write(&SessionMarker { in_progress: false, destination_name: String::new() })
    }

    fn write(&self, marker: &SessionMarker) -> Result<()> {
        let raw = serde_json::to_string_pretty(marker)
            .map_err(|e| crate::error::Error::Other(format!("failed to serialize session marker: {e}")))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}
