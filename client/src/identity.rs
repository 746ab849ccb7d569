//! Local persistence of the registered participant id

use crate::error::ClientError;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

pub trait IdentityStore: Send {
    /// Previously saved participant id, if any.
    fn load(&self) -> Option<String>;

    fn save(&mut self, participant_id: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityStore {
    participant_id: Option<String>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_saved(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: Some(participant_id.into()),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Option<String> {
        self.participant_id.clone()
    }

    fn save(&mut self, participant_id: &str) -> Result<(), ClientError> {
        self.participant_id = Some(participant_id.to_string());
        Ok(())
    }
}

/// Stores the id as a single line of plain text.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Some(text.trim().to_string()).filter(|id| !id.is_empty()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("Could not read saved id from {:?}: {}", self.path, e);
                None
            }
        }
    }

    fn save(&mut self, participant_id: &str) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ClientError::Identity(e.to_string()))?;
        }
        fs::write(&self.path, format!("{}\n", participant_id))
            .map_err(|e| ClientError::Identity(format!("{:?}: {}", self.path, e)))
    }
}
