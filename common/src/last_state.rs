use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, store::write_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupState {
    None,
    #[default]
    Off,
    On,
    LastState,
}

/// Single-line `<id>:<0|1>` file remembering one output's last level.
pub struct LastStateFile {
    path: PathBuf,
    id: String,
}

impl LastStateFile {
    pub fn new(path: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id: id.into(),
        }
    }

    pub fn in_dir(dir: &Path, id: &str) -> Self {
        Self::new(dir.join(format!("{id}.state")), id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Option<bool>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let line = raw.trim();
        match line.split_once(':') {
            Some((id, "1")) if id == self.id => Ok(Some(true)),
            Some((id, "0")) if id == self.id => Ok(Some(false)),
            _ => {
                warn!("ignoring malformed last state `{line}` in {}", self.path.display());
                Ok(None)
            }
        }
    }

    pub fn write(&self, on: bool) -> Result<(), StoreError> {
        let line = format!("{}:{}\n", self.id, u8::from(on));
        write_atomic(&self.path, line.as_bytes())
    }
}
