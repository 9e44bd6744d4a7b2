//! Append-only record of what was deployed.
//!
//! One JSON object per line, oldest first. Lines are only ever added, so a
//! rollback tool reading the file sees deployments in the order they happened.
//!
//! A line without its newline was never a finished entry: a crash or a full
//! disk stopped the write. The next append cuts it off before writing.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    // commit hash the image was built from
    pub version: String,
    pub image: String,
    pub message: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("could not write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}:{line}: bad entry: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct VersionLedger {
    path: PathBuf,
}

impl VersionLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        VersionLedger { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add `entry` as the last line and sync it to disk before returning.
    ///
    /// The file is opened in append mode, so existing lines are never rewritten.
    /// If the write or the sync fails the file is cut back to where it was, so
    /// no partial line is left for the next append to land on.
    /// The handle is dropped on every path out of this function.
    pub fn append(&self, entry: &VersionEntry) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let write_err = |source| LedgerError::Write {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;
        let start = self.drop_torn_tail(&mut file).map_err(write_err)?;

        // one write call for the whole line
        let written = file
            .write_all(line.as_bytes())
            .and_then(|()| file.sync_all());
        if let Err(source) = written {
            if let Err(err) = file.set_len(start) {
                warn!("could not undo partial write to {}: {err}", self.path.display());
            }
            return Err(write_err(source));
        }
        Ok(())
    }

    // Length of the file up to its last newline, after cutting off anything past it.
    fn drop_torn_tail(&self, file: &mut File) -> io::Result<u64> {
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        let end = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |idx| idx + 1);
        if end < content.len() {
            warn!(
                "{}: discarding unfinished last line ({} bytes)",
                self.path.display(),
                content.len() - end
            );
            file.set_len(end as u64)?;
        }
        Ok(end as u64)
    }

    /// All entries, oldest first. A ledger that was never written is empty.
    pub fn entries(&self) -> Result<Vec<VersionEntry>, LedgerError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LedgerError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| LedgerError::Read {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|source| LedgerError::Corrupt {
                path: self.path.clone(),
                line: idx + 1,
                source,
            })?;
            out.push(entry);
        }
        Ok(out)
    }

    pub fn latest(&self) -> Result<Option<VersionEntry>, LedgerError> {
        Ok(self.entries()?.pop())
    }
}
