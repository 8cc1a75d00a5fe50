//! Task definitions and content fingerprints
//!
//! A [`TaskDefinition`] is the source text of a state-machine task plus the
//! file it was read from, if any. Its [`Fingerprint`] is the djb2 hash the
//! board firmware uses to decide whether a task file needs re-transferring,
//! and the host uses the same hash to notice out-of-band edits to a task
//! file after it was uploaded.

use crate::error::{Result, TaskRunError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// File extension of task definitions
pub const TASK_FILE_EXTENSION: &str = "py";

/// djb2 content hash of a task definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub u32);

impl Fingerprint {
    /// Hash a byte sequence
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let hash = bytes.iter().fold(5381u32, |h, &b| {
            (h << 5).wrapping_add(h).wrapping_add(b as u32)
        });
        Fingerprint(hash)
    }

    /// Hash a source string
    pub fn of_source(source: &str) -> Self {
        Self::of_bytes(source.as_bytes())
    }

    /// Hash the current contents of a file
    pub fn of_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(Self::of_bytes(&bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A task to upload to the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task name (file stem)
    pub name: String,
    /// Source text as uploaded
    pub source: String,
    /// File the source was read from, used for freshness checks
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl TaskDefinition {
    /// Create an in-memory task definition
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            path: None,
        }
    }

    /// Load a task definition from a file; the name is the file stem
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| TaskRunError::Config(format!("Invalid task file name {:?}", path)))?
            .to_string();
        let source = std::fs::read_to_string(path).map_err(|e| {
            TaskRunError::Config(format!("Failed to read task file {:?}: {}", path, e))
        })?;

        Ok(Self {
            name,
            source,
            path: Some(path.to_path_buf()),
        })
    }

    /// Load `<tasks_dir>/<name>.py`
    pub fn load_named(tasks_dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        Self::load(
            tasks_dir
                .as_ref()
                .join(format!("{}.{}", name, TASK_FILE_EXTENSION)),
        )
    }

    /// Fingerprint of the source as held in memory
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_source(&self.source)
    }

    /// Fingerprint of the task's source as it is now
    ///
    /// Re-reads the backing file when there is one. Returns `None` when the
    /// file has disappeared, since a missing file cannot be compared.
    pub fn current_fingerprint(&self) -> Option<Fingerprint> {
        match &self.path {
            Some(path) => Fingerprint::of_file(path).ok(),
            None => Some(self.fingerprint()),
        }
    }
}
