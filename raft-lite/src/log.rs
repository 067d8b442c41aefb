//! The in-memory replicated log.
//!
//! Indices are 1-based; index 0 is the empty prefix every log shares, with
//! term 0. Entries are always contiguous.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::mutation::Mutation;
use crate::{LogIndex, PeerId, RequestId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Carries a client mutation for the sink.
    Mutation,
    /// Appended by a new leader to commit entries from earlier terms.
    Noop,
}

/// One replicated unit of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Mutation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<PeerId>,
    /// Milliseconds since the Unix epoch at which the leader appended it.
    pub timestamp: u64,
}

impl LogEntry {
    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            index: self.index,
            term: self.term,
            kind: self.kind,
            request_id: self.request_id.clone(),
            origin_id: self.origin_id,
            timestamp: self.timestamp,
        }
    }
}

/// Payload-free view of a log entry, used for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    pub request_id: Option<RequestId>,
    pub origin_id: Option<PeerId>,
    pub timestamp: u64,
}

/// Result of splicing a leader's entries into a follower log.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SpliceOutcome {
    /// `(index, term)` of every entry that was newly written.
    pub appended: Vec<(LogIndex, Term)>,
    /// First index removed because of a term conflict, if any.
    pub truncated_from: Option<LogIndex>,
}

#[derive(Debug, Default, Clone)]
pub struct Log {
    entries: Vec<LogEntry>,
    /// Index of the entry carrying each client request id.
    requests: HashMap<RequestId, LogIndex>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |entry| entry.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term stored at `index`. Index 0 always has term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|entry| entry.term)
    }

    /// Appends a new entry at the tail and returns its index.
    pub fn append(
        &mut self,
        term: Term,
        kind: EntryKind,
        payload: Option<Mutation>,
        request_id: Option<RequestId>,
        origin_id: Option<PeerId>,
    ) -> LogIndex {
        let index = self.last_index() + 1;
        self.push(LogEntry {
            index,
            term,
            kind,
            payload,
            request_id,
            origin_id,
            timestamp: now_millis(),
        });
        index
    }

    /// Index of the entry that carries `request_id`, if any.
    pub fn index_of_request(&self, request_id: &str) -> Option<LogIndex> {
        self.requests.get(request_id).copied()
    }

    /// Clones up to `max` entries starting at `index`.
    pub fn entries_from(&self, index: LogIndex, max: usize) -> Vec<LogEntry> {
        if index == 0 || index > self.last_index() {
            return Vec::new();
        }
        let start = (index - 1) as usize;
        let end = start.saturating_add(max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// Removes the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        let keep = index.saturating_sub(1) as usize;
        if keep >= self.entries.len() {
            return;
        }
        for removed in self.entries.drain(keep..) {
            if let Some(request_id) = removed.request_id {
                if self.requests.get(&request_id) == Some(&removed.index) {
                    self.requests.remove(&request_id);
                }
            }
        }
    }

    /// Merges entries received from a leader.
    ///
    /// Entries already present with the same term are left alone. A term
    /// conflict truncates the log from that index before appending. Entries
    /// at or below `protected` (the commit index) are never rewritten.
    pub fn splice(&mut self, entries: &[LogEntry], protected: LogIndex) -> SpliceOutcome {
        let mut outcome = SpliceOutcome::default();
        for entry in entries {
            if entry.index <= protected {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    outcome.truncated_from.get_or_insert(entry.index);
                }
                None => {}
            }
            if entry.index != self.last_index() + 1 {
                // Entries are validated as contiguous, so a gap means the
                // batch started past our tail; stop rather than leave a hole.
                break;
            }
            self.push(entry.clone());
            outcome.appended.push((entry.index, entry.term));
        }
        outcome
    }

    /// Whether a candidate whose log ends at `(last_log_term, last_log_index)`
    /// is at least as up to date as this log.
    pub fn is_up_to_date(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        (last_log_term, last_log_index) >= (self.last_term(), self.last_index())
    }

    pub fn meta(&self) -> Vec<EntryMeta> {
        self.entries.iter().map(LogEntry::meta).collect()
    }

    fn push(&mut self, entry: LogEntry) {
        if let Some(request_id) = &entry.request_id {
            self.requests.insert(request_id.clone(), entry.index);
        }
        self.entries.push(entry);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
