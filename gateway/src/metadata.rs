//! Reader metadata fed by priority-convention results.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared_types::PriorityReport;
use tracing::{debug, warn};

/// Reader metadata updated by priority-convention results.
pub trait MetadataStore: Send + Sync {
    /// Returns false when no reader with that name is known.
    fn update_priority(&self, reader: &str, priority: i64) -> bool;

    fn set_counters(&self, last_priority: i64, max_readers: i64);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderRecord {
    pub priority: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// In-memory store keyed by reader name.
#[derive(Debug, Default)]
pub struct ReaderMetadataStore {
    readers: DashMap<String, ReaderRecord>,
    last_priority: AtomicI64,
    max_readers: AtomicI64,
}

impl ReaderMetadataStore {
    pub fn new<I, S>(readers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::default();
        for name in readers {
            store.insert_reader(name);
        }
        store
    }

    pub fn insert_reader(&self, name: impl Into<String>) {
        self.readers.entry(name.into()).or_insert(ReaderRecord {
            priority: 0,
            updated_at: None,
        });
    }

    pub fn priority(&self, reader: &str) -> Option<i64> {
        self.readers.get(reader).map(|r| r.priority)
    }

    pub fn record(&self, reader: &str) -> Option<ReaderRecord> {
        self.readers.get(reader).map(|r| r.clone())
    }

    /// `(last_priority, max_readers)`
    pub fn counters(&self) -> (i64, i64) {
        (
            self.last_priority.load(Ordering::SeqCst),
            self.max_readers.load(Ordering::SeqCst),
        )
    }
}

impl MetadataStore for ReaderMetadataStore {
    fn update_priority(&self, reader: &str, priority: i64) -> bool {
        match self.readers.get_mut(reader) {
            Some(mut record) => {
                record.priority = priority;
                record.updated_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    fn set_counters(&self, last_priority: i64, max_readers: i64) {
        self.last_priority.store(last_priority, Ordering::SeqCst);
        self.max_readers.store(max_readers, Ordering::SeqCst);
    }
}

/// How a priority report landed in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityMerge {
    pub returned: usize,
    pub matched: Vec<String>,
    pub unmatched: Vec<String>,
}

impl PriorityMerge {
    pub fn is_complete(&self) -> bool {
        self.matched.len() == self.returned
    }
}

/// Set the counters, then merge every returned priority into `store`.
pub fn apply_priority_report(store: &dyn MetadataStore, report: &PriorityReport) -> PriorityMerge {
    store.set_counters(report.last_priority, report.max_readers);

    let mut merge = PriorityMerge {
        returned: report.priorities.len(),
        ..PriorityMerge::default()
    };
    for (reader, priority) in &report.priorities {
        if store.update_priority(reader, *priority) {
            debug!(
                reader = %reader,
                priority,
                last_priority = report.last_priority,
                max_readers = report.max_readers,
                "reader priority updated"
            );
            merge.matched.push(reader.clone());
        } else {
            merge.unmatched.push(reader.clone());
        }
    }

    if !merge.is_complete() {
        warn!(
            returned = %report.priorities.keys().cloned().collect::<Vec<_>>().join(", "),
            set = %merge.matched.join(", "),
            "priority update matched fewer readers than returned"
        );
    }
    merge
}
