//! Per-playback scratch directory holding large raw-audio chunks.
//!
//! Chunks are plain files named by their index. The directory is created
//! lazily with an unpredictable name under the scratch root and removed
//! entirely by [`ChunkStore::destroy`].

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::{
    path::PathBuf,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tempfile::TempDir;

#[derive(Default)]
enum Dir {
    #[default]
    Pending,
    Created(TempDir),
    Destroyed,
}

pub struct ChunkStore {
    root: PathBuf,
    dir: Mutex<Dir>,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dir: Mutex::new(Dir::Pending),
        }
    }

    fn dir(&self) -> MutexGuard<'_, Dir> {
        self.dir.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the scratch directory if it does not exist yet.
    pub fn ensure_created(&self) -> Result<PathBuf> {
        let mut dir = self.dir();
        match &*dir {
            Dir::Created(tmp) => Ok(tmp.path().to_path_buf()),
            Dir::Destroyed => bail!("Chunk store has been destroyed"),
            Dir::Pending => {
                std::fs::create_dir_all(&self.root).with_context(|| {
                    format!("Failed to create scratch root {}", self.root.display())
                })?;

                let tmp = tempfile::Builder::new()
                    .prefix("guild-player-")
                    .tempdir_in(&self.root)
                    .context("Failed to create chunk store directory")?;

                let path = tmp.path().to_path_buf();
                debug!("Created chunk store {}", path.display());
                *dir = Dir::Created(tmp);
                Ok(path)
            }
        }
    }

    /// Directory of the store, `None` before creation or after destruction.
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.dir() {
            Dir::Created(tmp) => Some(tmp.path().to_path_buf()),
            _ => None,
        }
    }

    fn chunk_path(&self, index: usize) -> Result<PathBuf> {
        match self.path() {
            Some(path) => Ok(path.join(format!("{index}.pcm"))),
            None => bail!("Chunk store is not available"),
        }
    }

    pub async fn write(&self, index: usize, data: &[u8]) -> Result<()> {
        let path = self.chunk_path(index)?;
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write chunk {index}"))
    }

    /// Reads a chunk, retrying transient failures a bounded number of times.
    pub async fn read(&self, index: usize, retries: u32, delay: Duration) -> Result<Bytes> {
        let path = self.chunk_path(index)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::fs::read(&path).await {
                Ok(data) => return Ok(Bytes::from(data)),
                Err(e) if attempt < retries => {
                    warn!("Reading chunk {index} failed (attempt {attempt}/{retries}): {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to read chunk {index} after {attempt} attempts")
                    })
                }
            }
        }
    }

    pub async fn remove(&self, index: usize) {
        let Ok(path) = self.chunk_path(index) else {
            return;
        };

        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove chunk {index}: {e}");
            }
        }
    }

    /// Removes every chunk file but keeps the directory.
    pub async fn clear(&self) -> Result<()> {
        let Some(path) = self.path() else {
            return Ok(());
        };

        let mut entries = tokio::fs::read_dir(&path)
            .await
            .context("Failed to list chunk store")?;

        while let Some(entry) = entries.next_entry().await? {
            tokio::fs::remove_file(entry.path()).await?;
        }

        Ok(())
    }

    /// Number of chunk files currently on disk.
    pub async fn len(&self) -> usize {
        let Some(path) = self.path() else {
            return 0;
        };
        let Ok(mut entries) = tokio::fs::read_dir(&path).await else {
            return 0;
        };

        let mut count = 0;
        while let Ok(Some(_)) = entries.next_entry().await {
            count += 1;
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(*self.dir(), Dir::Destroyed)
    }

    /// Deletes the directory and everything in it. Errors are logged only.
    pub fn destroy(&self) {
        let dir = std::mem::replace(&mut *self.dir(), Dir::Destroyed);

        if let Dir::Created(tmp) = dir {
            let path = tmp.path().to_path_buf();
            match tmp.close() {
                Ok(()) => debug!("Removed chunk store {}", path.display()),
                Err(e) => error!("Failed to remove chunk store {}: {e}", path.display()),
            }
        }
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        self.destroy();
    }
}
