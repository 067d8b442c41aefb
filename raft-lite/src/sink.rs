//! Destinations for committed mutations.
//!
//! The node runtime hands each committed mutation to a [`MutationSink`], one
//! at a time and in log order. A sink error does not stop the log: the entry
//! is still marked applied and the error is reported in the `EntryApplied`
//! event.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::mutation::Mutation;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("unsupported operation {0:?}")]
    Unsupported(Option<String>),
    #[error("mutation is missing field `{0}`")]
    MissingField(&'static str),
    #[error("no such path: {0}")]
    NotFound(String),
}

/// Executes committed mutations.
pub trait MutationSink: Send + 'static {
    fn apply(&mut self, mutation: &Mutation) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Accepts every mutation and does nothing with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MutationSink for NullSink {
    async fn apply(&mut self, _mutation: &Mutation) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FsState {
    files: BTreeMap<String, String>,
    history: Vec<Mutation>,
}

/// Shared in-memory file tree that understands `write` and `delete`.
///
/// Clones share the same tree, so a test or the operator console can keep a
/// handle while the runtime owns another.
#[derive(Debug, Default, Clone)]
pub struct MemoryFs {
    state: Arc<Mutex<FsState>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content of `path`, as seen by this replica.
    pub fn read(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().files.clone()
    }

    /// Every mutation handed to the sink, in apply order, including the
    /// ones it rejected.
    pub fn applied(&self) -> Vec<Mutation> {
        self.lock().history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn execute(&self, mutation: &Mutation) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.history.push(mutation.clone());
        let path = || mutation.path().ok_or(SinkError::MissingField("path"));
        match mutation.op() {
            Some("write") => {
                let path = path()?.to_string();
                let content = mutation.content().unwrap_or_default().to_string();
                state.files.insert(path, content);
                Ok(())
            }
            Some("delete") => {
                let path = path()?;
                state
                    .files
                    .remove(path)
                    .map(|_| ())
                    .ok_or_else(|| SinkError::NotFound(path.to_string()))
            }
            other => Err(SinkError::Unsupported(other.map(str::to_string))),
        }
    }
}

impl MutationSink for MemoryFs {
    async fn apply(&mut self, mutation: &Mutation) -> Result<(), SinkError> {
        self.execute(mutation)
    }
}
