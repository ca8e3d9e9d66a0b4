//! Audit storage backends.
//!
//! The in-memory sink is the default - entries are lost on process restart.
//! For durability, use [`JsonlAuditSink`](super::JsonlAuditSink).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use super::{AuditCursor, AuditEntry, AuditFilter};
use crate::{Error, Result};

/// Append-only storage for audit entries.
///
/// Implementations never edit or delete an entry once `append` returned `Ok`.
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Durably store one entry.
    ///
    /// Entries arrive in ascending cursor order; an entry that is not newer
    /// than the last one is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageError`] when the backend is unavailable and
    /// [`Error::Validation`] for an out-of-order entry.
    fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Matching entries older than `after`, newest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageError`] when the backend is unavailable.
    fn page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>>;

    /// Number of stored entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageError`] when the backend is unavailable.
    fn len(&self) -> Result<usize>;

    /// Highest id stored, 0 when empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageError`] when the backend is unavailable.
    fn last_id(&self) -> Result<u64>;
}

/// Shared paging logic for backends that keep entries in append order.
///
/// Append order is cursor order, so the scan starts just below `after` and
/// walks backwards until `limit` matches are found.
pub(crate) fn page_of(
    entries: &[AuditEntry],
    filter: &AuditFilter,
    after: Option<AuditCursor>,
    limit: usize,
) -> Vec<AuditEntry> {
    let end = after.map_or(entries.len(), |cursor| {
        entries.partition_point(|e| e.cursor() < cursor)
    });
    entries[..end]
        .iter()
        .rev()
        .filter(|e| filter.matches(e))
        .take(limit)
        .cloned()
        .collect()
}

/// Reject an entry that would break append-order == cursor-order.
pub(crate) fn check_order(last: Option<&AuditEntry>, entry: &AuditEntry) -> Result<()> {
    match last {
        Some(last) if last.cursor() >= entry.cursor() => Err(Error::Validation(format!(
            "audit entry {} is not newer than entry {}",
            entry.id(),
            last.id()
        ))),
        _ => Ok(()),
    }
}

/// In-memory audit sink.
///
/// Thread-safe; appends take a short write lock. Can be switched
/// unavailable to rehearse storage outages.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
    unavailable: AtomicBool,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going down (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StorageError("audit store unavailable".to_string()));
        }
        Ok(())
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        check_order(entries.last(), entry)?;
        entries.push(entry.clone());
        Ok(())
    }

    fn page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        self.check_available()?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(page_of(&entries, filter, after, limit))
    }

    fn len(&self) -> Result<usize> {
        self.check_available()?;
        Ok(self.entries.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    fn last_id(&self) -> Result<u64> {
        self.check_available()?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.iter().map(AuditEntry::id).max().unwrap_or(0))
    }
}
