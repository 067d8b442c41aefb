//! Peer-to-peer message contract and its JSON encoding.
//!
//! Every message travels inside an [`Envelope`] that records the sender as
//! reported by the transport. Messages are validated against that sender
//! before they reach the replica; anything malformed is dropped.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log::{EntryKind, LogEntry};
use crate::mutation::Mutation;
use crate::{LogIndex, PeerId, RequestId, Term};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: PeerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: PeerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub request_id: RequestId,
    pub mutation: Mutation,
    pub origin_id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Committed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub request_id: RequestId,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<LogIndex>,
}

impl ClientResponse {
    pub fn committed(request_id: RequestId, index: LogIndex) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Committed,
            reason: None,
            index: Some(index),
        }
    }

    pub fn rejected(request_id: RequestId, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Rejected,
            reason: Some(reason.into()),
            index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    ClientRequest(ClientRequest),
    ClientResponse(ClientResponse),
}

/// Reasons a message is refused before it reaches the replica.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("{field} {claimed} does not match sender {from}")]
    SenderMismatch {
        field: &'static str,
        claimed: PeerId,
        from: PeerId,
    },
    #[error("entry index {found} does not follow {expected_after}")]
    NonContiguous {
        expected_after: LogIndex,
        found: LogIndex,
    },
    #[error("entry at index {index} has term {entry_term} newer than message term {term}")]
    EntryFromFuture {
        index: LogIndex,
        entry_term: Term,
        term: Term,
    },
    #[error("mutation entry at index {0} has no payload")]
    MissingPayload(LogIndex),
    #[error("request id is empty")]
    EmptyRequestId,
    #[error("committed response for {0} carries no index")]
    MissingIndex(RequestId),
}

impl Message {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteResponse(_) => "request_vote_response",
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesResponse(_) => "append_entries_response",
            Message::ClientRequest(_) => "client_request",
            Message::ClientResponse(_) => "client_response",
        }
    }

    /// Term carried by the message, if it participates in term tracking.
    pub fn term(&self) -> Option<Term> {
        match self {
            Message::RequestVote(m) => Some(m.term),
            Message::RequestVoteResponse(m) => Some(m.term),
            Message::AppendEntries(m) => Some(m.term),
            Message::AppendEntriesResponse(m) => Some(m.term),
            Message::ClientRequest(_) | Message::ClientResponse(_) => None,
        }
    }

    /// Checks the structural rules a well-formed message from `from` obeys.
    pub fn validate(&self, from: PeerId) -> Result<(), ProtocolViolation> {
        if self.term() == Some(Term::MAX) {
            return Err(ProtocolViolation::Malformed("term out of range".into()));
        }
        match self {
            Message::RequestVote(m) if m.candidate_id != from => {
                Err(ProtocolViolation::SenderMismatch {
                    field: "candidate_id",
                    claimed: m.candidate_id,
                    from,
                })
            }
            Message::AppendEntries(m) => {
                if m.leader_id != from {
                    return Err(ProtocolViolation::SenderMismatch {
                        field: "leader_id",
                        claimed: m.leader_id,
                        from,
                    });
                }
                let mut expected = m.prev_log_index;
                for entry in &m.entries {
                    let Some(next) = expected.checked_add(1) else {
                        return Err(ProtocolViolation::Malformed("log index overflow".into()));
                    };
                    if entry.index != next {
                        return Err(ProtocolViolation::NonContiguous {
                            expected_after: expected,
                            found: entry.index,
                        });
                    }
                    if entry.term > m.term {
                        return Err(ProtocolViolation::EntryFromFuture {
                            index: entry.index,
                            entry_term: entry.term,
                            term: m.term,
                        });
                    }
                    if entry.kind == EntryKind::Mutation && entry.payload.is_none() {
                        return Err(ProtocolViolation::MissingPayload(entry.index));
                    }
                    expected = entry.index;
                }
                Ok(())
            }
            Message::ClientRequest(m) => {
                if m.request_id.is_empty() {
                    return Err(ProtocolViolation::EmptyRequestId);
                }
                if m.origin_id != from {
                    return Err(ProtocolViolation::SenderMismatch {
                        field: "origin_id",
                        claimed: m.origin_id,
                        from,
                    });
                }
                Ok(())
            }
            Message::ClientResponse(m) => {
                if m.request_id.is_empty() {
                    return Err(ProtocolViolation::EmptyRequestId);
                }
                if m.status == ResponseStatus::Committed && m.index.is_none() {
                    return Err(ProtocolViolation::MissingIndex(m.request_id.clone()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// A message together with the peer that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PeerId,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: PeerId, message: Message) -> Self {
        Self { from, message }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolViolation> {
        serde_json::from_slice(bytes).map_err(|err| ProtocolViolation::Malformed(err.to_string()))
    }
}
