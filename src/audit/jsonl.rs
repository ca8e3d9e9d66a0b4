//! JSON-lines audit sink: one entry per line, append-only.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use super::sink::{check_order, page_of};
use super::{AuditCursor, AuditEntry, AuditFilter, AuditSink};
use crate::{Error, Result};

/// File-backed audit sink.
///
/// Existing lines are loaded on open so queries never re-read the file.
/// Writes go straight to the file before the entry becomes queryable; a
/// failed write is truncated away, and a torn last line left by a crash is
/// dropped on the next open.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
    entries: RwLock<Vec<AuditEntry>>,
}

impl JsonlAuditSink {
    /// Open (or create) the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a line fails to parse.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Vec::new();
        let mut torn_at = None;

        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut line = Vec::new();
            let mut offset = 0u64;
            let mut lineno = 0usize;
            loop {
                line.clear();
                let read = reader.read_until(b'\n', &mut line)?;
                if read == 0 {
                    break;
                }
                lineno += 1;
                // an unterminated last line is a write that never completed
                if line.last() != Some(&b'\n') {
                    torn_at = Some(offset);
                    break;
                }
                offset += read as u64;
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let entry: AuditEntry = serde_json::from_slice(&line).map_err(|e| {
                    Error::StorageError(format!(
                        "corrupt audit line {lineno} in {}: {e}",
                        path.display()
                    ))
                })?;
                entries.push(entry);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if let Some(len) = torn_at {
            tracing::warn!(path = %path.display(), len, "dropping incomplete trailing audit line");
            file.set_len(len)?;
        }
        entries.sort_by_key(AuditEntry::cursor);
        tracing::debug!(path = %path.display(), entries = entries.len(), "opened audit log");

        Ok(Self {
            path,
            file: Mutex::new(file),
            entries: RwLock::new(entries),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        check_order(entries.last(), entry)?;

        let len = file
            .metadata()
            .map_err(|e| Error::StorageError(format!("audit file unreadable: {e}")))?
            .len();
        if let Err(e) = file.write_all(&line).and_then(|()| file.flush()) {
            // cut any partial line so the next append starts clean
            if let Err(trunc) = file.set_len(len) {
                tracing::warn!(path = %self.path.display(), error = %trunc, "could not roll back audit write");
            }
            return Err(Error::StorageError(format!("audit write failed: {e}")));
        }

        entries.push(entry.clone());
        Ok(())
    }

    fn page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(page_of(&entries, filter, after, limit))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    fn last_id(&self) -> Result<u64> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.iter().map(AuditEntry::id).max().unwrap_or(0))
    }
}
