//! Audit Log (compliance record for trial, policy and experiment changes)
//!
//! Every state-changing operation in the crate appends exactly one
//! [`AuditEntry`] inside the same unit of work as the mutation. Entries are
//! never edited or deleted here; retention is handled by whoever reads the
//! export.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use protrial::audit::{AuditAction, AuditDraft, AuditFilter, AuditLog, AuditCategory};
//! use protrial::clock::SystemClock;
//!
//! let log = AuditLog::in_memory(Arc::new(SystemClock));
//! log.append(AuditDraft::new(AuditAction::MessageUpdated))?;
//!
//! let config_changes = log.collect(&AuditFilter::all().category(AuditCategory::Config))?;
//! assert_eq!(config_changes.len(), 1);
//! # Ok::<(), protrial::Error>(())
//! ```

mod entry;
mod jsonl;
mod sink;

pub use entry::{
    AuditAction, AuditCategory, AuditContext, AuditCursor, AuditDraft, AuditEntry, AuditFilter,
};
pub use jsonl::JsonlAuditSink;
pub use sink::{AuditSink, MemoryAuditSink};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::Result;

/// Default number of entries fetched per page by [`AuditQuery`].
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Serialization used by [`AuditLog::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// One JSON array
    #[default]
    Json,
    /// One JSON object per line
    JsonLines,
}

#[derive(Debug)]
struct AppendState {
    next_id: u64,
    last_at: Option<DateTime<Utc>>,
}

/// Append-only, queryable audit log.
#[derive(Debug)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    state: Mutex<AppendState>,
    page_size: usize,
}

impl AuditLog {
    /// Create a log over `sink`, continuing its id sequence.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StorageError`] if the sink cannot be read.
    pub fn new(sink: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Result<Self> {
        let next_id = sink.last_id()? + 1;
        let last_at = sink
            .page(&AuditFilter::all(), None, 1)?
            .first()
            .map(AuditEntry::created_at);
        Ok(Self {
            sink,
            clock,
            state: Mutex::new(AppendState { next_id, last_at }),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Log backed by a fresh [`MemoryAuditSink`].
    #[must_use]
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            sink: Arc::new(MemoryAuditSink::new()),
            clock,
            state: Mutex::new(AppendState {
                next_id: 1,
                last_at: None,
            }),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set the page size used by lazy queries.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Append one entry, assigning its id, timestamp and category.
    ///
    /// Timestamps never go backwards within one log, so append order and
    /// `createdAt` order agree.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StorageError`] if the sink rejects the write;
    /// no id is consumed in that case.
    pub fn append(&self, draft: AuditDraft) -> Result<AuditEntry> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let now = self.clock.now();
        let created_at = state.last_at.map_or(now, |last| last.max(now));
        let entry = AuditEntry::from_draft(state.next_id, created_at, draft);

        self.sink.append(&entry)?;

        state.next_id += 1;
        state.last_at = Some(created_at);
        tracing::debug!(id = entry.id(), action = %entry.action(), "audit entry appended");
        Ok(entry)
    }

    /// Lazily iterate matching entries, newest first.
    #[must_use]
    pub fn query(&self, filter: &AuditFilter) -> AuditQuery<'_> {
        self.query_after(filter, None)
    }

    /// Resume a query after `cursor` (exclusive).
    #[must_use]
    pub fn query_after(&self, filter: &AuditFilter, cursor: Option<AuditCursor>) -> AuditQuery<'_> {
        AuditQuery {
            sink: self.sink.as_ref(),
            filter: filter.clone(),
            cursor,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Collect every matching entry, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StorageError`] if the sink cannot be read.
    pub fn collect(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.query(filter).collect()
    }

    /// Serialize the matching entries for compliance review.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be read or serialization fails.
    pub fn export(&self, filter: &AuditFilter, format: ExportFormat) -> Result<Vec<u8>> {
        let entries = self.collect(filter)?;
        let bytes = match format {
            ExportFormat::Json => serde_json::to_vec_pretty(&entries)?,
            ExportFormat::JsonLines => {
                let mut out = Vec::new();
                for entry in &entries {
                    serde_json::to_writer(&mut out, entry)?;
                    out.push(b'\n');
                }
                out
            }
        };
        tracing::info!(entries = entries.len(), bytes = bytes.len(), "audit export");
        Ok(bytes)
    }

    /// Number of entries stored.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StorageError`] if the sink cannot be read.
    pub fn len(&self) -> Result<usize> {
        self.sink.len()
    }

    /// Whether the log is empty.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StorageError`] if the sink cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.sink.len()? == 0)
    }
}

/// Lazy, finite, restartable audit query.
///
/// Pages are fetched on demand; [`AuditQuery::cursor`] can be stored and
/// handed back to [`AuditLog::query_after`] to continue later.
#[derive(Debug)]
pub struct AuditQuery<'a> {
    sink: &'a dyn AuditSink,
    filter: AuditFilter,
    cursor: Option<AuditCursor>,
    page_size: usize,
    buffer: VecDeque<AuditEntry>,
    exhausted: bool,
}

impl AuditQuery<'_> {
    /// Position after the last entry yielded.
    #[must_use]
    pub const fn cursor(&self) -> Option<AuditCursor> {
        self.cursor
    }
}

impl Iterator for AuditQuery<'_> {
    type Item = Result<AuditEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.sink.page(&self.filter, self.cursor, self.page_size) {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let entry = self.buffer.pop_front()?;
        self.cursor = Some(entry.cursor());
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::Error;
    use chrono::Duration;

    fn log_with_clock() -> (AuditLog, Arc<ManualClock>, Arc<MemoryAuditSink>) {
        let clock = Arc::new(ManualClock::default());
        let sink = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::new(sink.clone(), clock.clone()).unwrap();
        (log, clock, sink)
    }

    #[test]
    fn test_append_assigns_ids_and_category() {
        let (log, _, _) = log_with_clock();
        let a = log
            .append(AuditDraft::new(AuditAction::TrialStarted).affected_user("u1"))
            .unwrap();
        let b = log.append(AuditDraft::new(AuditAction::ConfigUpdated)).unwrap();

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(a.category(), AuditCategory::Trial);
        assert_eq!(b.category(), AuditCategory::Config);
        assert_eq!(a.affected_user_id(), Some("u1"));
    }

    #[test]
    fn test_failed_append_consumes_no_id() {
        let (log, _, sink) = log_with_clock();
        sink.set_unavailable(true);
        assert!(matches!(
            log.append(AuditDraft::new(AuditAction::TrialStarted)),
            Err(Error::StorageError(_))
        ));
        sink.set_unavailable(false);

        let entry = log.append(AuditDraft::new(AuditAction::TrialStarted)).unwrap();
        assert_eq!(entry.id(), 1);
    }

    #[test]
    fn test_timestamps_do_not_go_backwards() {
        let (log, clock, _) = log_with_clock();
        let first = log.append(AuditDraft::new(AuditAction::TrialStarted)).unwrap();
        clock.advance(Duration::hours(-1));
        let second = log.append(AuditDraft::new(AuditAction::TrialStarted)).unwrap();
        assert!(second.created_at() >= first.created_at());
    }

    #[test]
    fn test_query_pages_lazily_and_resumes() {
        let (log, clock, _) = log_with_clock();
        let log = log.with_page_size(2);
        for _ in 0..5 {
            clock.advance(Duration::seconds(1));
            log.append(AuditDraft::new(AuditAction::TrialExtended)).unwrap();
        }

        let mut query = log.query(&AuditFilter::all());
        let first: Vec<u64> = query.by_ref().take(3).map(|e| e.unwrap().id()).collect();
        assert_eq!(first, vec![5, 4, 3]);

        let rest: Vec<u64> = log
            .query_after(&AuditFilter::all(), query.cursor())
            .map(|e| e.unwrap().id())
            .collect();
        assert_eq!(rest, vec![2, 1]);
    }

    #[test]
    fn test_query_time_range() {
        let (log, clock, _) = log_with_clock();
        let start = clock.now();
        log.append(AuditDraft::new(AuditAction::TrialStarted)).unwrap();
        clock.advance(Duration::days(2));
        log.append(AuditDraft::new(AuditAction::TrialRevoked)).unwrap();

        let window = AuditFilter::all().between(start, start + Duration::days(1));
        let hits = log.collect(&window).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].action(), &AuditAction::TrialStarted);
    }

    #[test]
    fn test_export_formats() {
        let (log, _, _) = log_with_clock();
        log.append(AuditDraft::new(AuditAction::ExperimentStarted)).unwrap();
        log.append(AuditDraft::new(AuditAction::ExperimentConcluded)).unwrap();

        let json = log.export(&AuditFilter::all(), ExportFormat::Json).unwrap();
        let parsed: Vec<AuditEntry> = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed.len(), 2);

        let lines = log.export(&AuditFilter::all(), ExportFormat::JsonLines).unwrap();
        let text = String::from_utf8(lines).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().contains("experiment_concluded"));
    }

    #[test]
    fn test_reopened_log_continues_after_newest_entry() {
        let (log, clock, sink) = log_with_clock();
        let first = log.append(AuditDraft::new(AuditAction::TrialStarted)).unwrap();
        drop(log);

        clock.advance(Duration::hours(-2));
        let reopened = AuditLog::new(sink, clock).unwrap();
        let second = reopened
            .append(AuditDraft::new(AuditAction::TrialRevoked))
            .unwrap();

        assert_eq!(second.id(), 2);
        assert!(second.created_at() >= first.created_at());
    }
}
