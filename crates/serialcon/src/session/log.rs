//! Size-bounded console transcript.
//!
//! The active log is appended to until it reaches `max_size`. The next
//! append then rotates: the previous generation (`console.log.1`) is
//! deleted, the active file is renamed into its place and a fresh active
//! file is opened. Exactly one rotated generation is ever kept.

use std::io;
use std::path::Path;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::host::ConsoleLogPaths;

/// Append-only console log with single-generation rotation.
#[derive(Debug)]
pub struct ConsoleLog {
    paths: ConsoleLogPaths,
    max_size: u64,
    file: Option<File>,
    /// Bytes in the active file.
    size: u64,
}

impl ConsoleLog {
    /// Opens the active log for append, creating it and its directory if needed.
    pub async fn open(paths: ConsoleLogPaths, max_size: u64) -> io::Result<Self> {
        if let Some(parent) = paths.active.parent() {
            fs::create_dir_all(parent).await?;
        }
        let (file, size) = open_append(&paths.active).await?;

        Ok(Self {
            paths,
            max_size,
            file: Some(file),
            size,
        })
    }

    /// Returns the active and rotated log paths.
    pub fn paths(&self) -> &ConsoleLogPaths {
        &self.paths
    }

    /// Size of the active file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends `data`, rotating first if the active file is full.
    pub async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        if self.size >= self.max_size {
            self.rotate().await?;
        }

        if self.file.is_none() {
            // A previous rotation failed part way; pick up whatever is there.
            let (file, size) = open_append(&self.paths.active).await?;
            self.file = Some(file);
            self.size = size;
        }

        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("console log is closed"));
        };
        file.write_all(data).await?;
        file.flush().await?;
        self.size += data.len() as u64;
        Ok(())
    }

    async fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        match fs::remove_file(&self.paths.rotated).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        match fs::rename(&self.paths.active, &self.paths.rotated).await {
            Ok(()) => {}
            // Active file removed behind our back: nothing to keep.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let (file, size) = open_append(&self.paths.active).await?;
        self.file = Some(file);
        self.size = size;

        tracing::debug!(
            log = %self.paths.active.display(),
            "Rotated console log"
        );
        Ok(())
    }

    /// Flushes and closes the active file.
    pub async fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush().await,
            None => Ok(()),
        }
    }
}

async fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let size = file.metadata().await?.len();
    Ok((file, size))
}

/// Reads the rotated log followed by the active log.
///
/// Missing files contribute nothing; any other error is returned.
pub async fn read_transcript(paths: &ConsoleLogPaths) -> io::Result<Vec<u8>> {
    let mut transcript = Vec::new();
    for path in paths.oldest_first() {
        match fs::read(path).await {
            Ok(contents) => transcript.extend_from_slice(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(transcript)
}
