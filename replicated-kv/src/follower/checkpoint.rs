//! Durable record of the last sequence a follower applied.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CheckpointFile {
    follower_id: u32,
    last_applied: u64,
}

/// `follower_<id>_seq.json` inside a state directory.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    follower_id: u32,
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(dir: impl AsRef<Path>, follower_id: u32) -> Self {
        Self {
            follower_id,
            path: dir.as_ref().join(format!("follower_{follower_id}_seq.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted sequence; a missing file means nothing was applied.
    pub async fn load(&self) -> Result<u64> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let file: CheckpointFile = serde_json::from_slice(&bytes)?;
        Ok(file.last_applied)
    }

    /// Replaces the checkpoint through a temporary file and a rename, so a
    /// crash leaves either the old or the new value on disk.
    pub async fn save(&self, last_applied: u64) -> Result<()> {
        let file = CheckpointFile {
            follower_id: self.follower_id,
            last_applied,
        };
        let bytes = serde_json::to_vec(&file)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
