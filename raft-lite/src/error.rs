//! Errors surfaced to callers that submit mutations.
//!
//! Protocol-level problems (stale terms, log conflicts, malformed messages)
//! never reach callers; they are resolved inside the replica and only show
//! up in logs. What remains is the small set of reasons a client request can
//! fail, each with a stable wire string carried in `ClientResponse::reason`.

use thiserror::Error;

use crate::RequestId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// No leader is known, or a forwarded request reached a non-leader.
    #[error("no leader available")]
    NotLeader,
    /// The leader cannot currently reach a quorum of replicas.
    #[error("no quorum of replicas is reachable")]
    NoQuorum,
    #[error("entry of {size} bytes exceeds the {limit} byte limit")]
    EntryTooLarge { size: usize, limit: usize },
    #[error("request timed out before it was committed")]
    RequestTimeout,
    #[error("request {0} is already pending")]
    DuplicateRequest(RequestId),
    #[error("replica is shut down")]
    Shutdown,
    /// A rejection reason this replica does not recognise.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RaftError {
    /// Reason string used on the wire.
    pub fn reason(&self) -> String {
        match self {
            RaftError::NotLeader => "no_leader".to_string(),
            RaftError::NoQuorum => "no_quorum".to_string(),
            RaftError::EntryTooLarge { .. } => "entry_too_large".to_string(),
            RaftError::RequestTimeout => "timeout".to_string(),
            RaftError::DuplicateRequest(_) => "duplicate_request".to_string(),
            RaftError::Shutdown => "shutdown".to_string(),
            RaftError::Rejected(reason) => reason.clone(),
        }
    }

    /// Maps a wire reason back to an error. Size details are not carried on
    /// the wire, so `entry_too_large` comes back with zeroed fields.
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "no_leader" => RaftError::NotLeader,
            "no_quorum" => RaftError::NoQuorum,
            "entry_too_large" => RaftError::EntryTooLarge { size: 0, limit: 0 },
            "timeout" => RaftError::RequestTimeout,
            "shutdown" => RaftError::Shutdown,
            other => RaftError::Rejected(other.to_string()),
        }
    }
}
