//! Track type representing a single playable file.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry of a playlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    /// Unique identifier, stable across playlist edits.
    pub id: Uuid,
    /// Location handed to the decoder manager.
    pub path: PathBuf,
    /// Display title, when tags provided one.
    pub title: Option<String>,
}

impl Track {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            title: None,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Title if present, otherwise the file name.
    pub fn display_name(&self) -> String {
        self.title.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map_or_else(|| self.path.display().to_string(), |name| {
                    name.to_string_lossy().into_owned()
                })
        })
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.id)
    }
}
