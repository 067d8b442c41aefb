//! Client request routing and response correlation.
//!
//! A mutation enters through [`Replica::submit`] on whichever replica the
//! caller talks to. That replica tracks the request in its pending map until
//! it commits, is rejected, or expires. Depending on what the replica knows
//! about leadership, the request is appended locally, forwarded to the
//! leader, or queued until a leader emerges.

use tracing::{debug, info, warn};

use super::{Replica, Role};
use crate::error::RaftError;
use crate::log::{EntryKind, LogEntry};
use crate::message::{ClientRequest, ClientResponse, Message, ResponseStatus};
use crate::mutation::Mutation;
use crate::{LogIndex, PeerId, RequestId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    /// Leader the request was forwarded to, if it left this replica.
    pub(crate) forwarded_to: Option<PeerId>,
    /// Index the leader reported it committed at. The request resolves once
    /// this replica has applied that far.
    pub(crate) committed_at: Option<LogIndex>,
}

impl PendingRequest {
    fn local() -> Self {
        Self {
            forwarded_to: None,
            committed_at: None,
        }
    }

    fn forwarded(leader: PeerId) -> Self {
        Self {
            forwarded_to: Some(leader),
            committed_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QueuedRequest {
    pub(crate) request_id: RequestId,
    pub(crate) mutation: Mutation,
}

/// Proof that a mutation was committed and applied at `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub request_id: RequestId,
    pub index: LogIndex,
}

/// Final result of a request submitted on this replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOutcome {
    pub request_id: RequestId,
    pub result: Result<CommitReceipt, RaftError>,
}

impl Replica {
    /// Accepts a new client mutation under `request_id`.
    ///
    /// `Err` means the request was refused outright and nothing was
    /// recorded. `Ok` means it is pending; its result will show up later in
    /// [`super::ReadyBundle::outcomes`], or the caller may give up with
    /// [`Replica::expire_request`].
    pub fn submit(&mut self, request_id: RequestId, mutation: Mutation) -> Result<(), RaftError> {
        if !self.running {
            return Err(RaftError::Shutdown);
        }
        self.check_entry_size(&mutation)?;
        if self.pending.contains_key(&request_id) {
            return Err(RaftError::DuplicateRequest(request_id));
        }

        match (self.role, self.leader_id) {
            (Role::Leader, _) => {
                self.pending.insert(request_id.clone(), PendingRequest::local());
                self.append_client_entry(mutation, request_id, self.id);
            }
            (_, Some(leader)) => {
                debug!(node = self.id, leader, request = %request_id, "forwarding request");
                self.pending
                    .insert(request_id.clone(), PendingRequest::forwarded(leader));
                self.forward(leader, request_id, mutation);
            }
            (role, None) => {
                info!(node = self.id, request = %request_id, "no leader known, queuing request");
                self.pending.insert(request_id.clone(), PendingRequest::local());
                self.queued.push_back(QueuedRequest {
                    request_id,
                    mutation,
                });
                if role == Role::Follower {
                    self.campaign();
                }
            }
        }
        Ok(())
    }

    /// Drops every trace of `request_id` and rejects it with a timeout.
    /// Returns `false` if the request had already resolved.
    pub fn expire_request(&mut self, request_id: &str) -> bool {
        self.queued.retain(|queued| queued.request_id != request_id);
        let Some(pending) = self.pending.remove(request_id) else {
            return false;
        };
        warn!(
            node = self.id,
            request = %request_id,
            forwarded_to = ?pending.forwarded_to,
            committed_at = ?pending.committed_at,
            "request timed out"
        );
        self.ready.outcomes.push(ClientOutcome {
            request_id: request_id.to_string(),
            result: Err(RaftError::RequestTimeout),
        });
        true
    }

    pub(super) fn handle_client_request(&mut self, from: PeerId, request: ClientRequest) {
        if self.role == Role::Leader {
            if let Some(index) = self.log.index_of_request(&request.request_id) {
                debug!(
                    node = self.id,
                    peer = from,
                    request = %request.request_id,
                    index,
                    "request already in log"
                );
                // Entries not yet applied are answered when they are.
                if index <= self.last_applied {
                    self.send(
                        from,
                        Message::ClientResponse(ClientResponse::committed(
                            request.request_id,
                            index,
                        )),
                    );
                }
                return;
            }
        }
        let rejection = if self.role != Role::Leader {
            Some(RaftError::NotLeader)
        } else if let Err(err) = self.check_entry_size(&request.mutation) {
            Some(err)
        } else if !self.topology.has_reachable_quorum() {
            Some(RaftError::NoQuorum)
        } else {
            None
        };
        if let Some(err) = rejection {
            debug!(
                node = self.id,
                peer = from,
                request = %request.request_id,
                %err,
                "rejecting forwarded request"
            );
            self.send(
                from,
                Message::ClientResponse(ClientResponse::rejected(request.request_id, err.reason())),
            );
            return;
        }
        self.append_client_entry(request.mutation, request.request_id, request.origin_id);
    }

    pub(super) fn handle_client_response(&mut self, response: ClientResponse) {
        let Some(pending) = self.pending.get_mut(&response.request_id) else {
            debug!(node = self.id, request = %response.request_id, "response for unknown request");
            return;
        };
        let result = match (response.status, response.index) {
            (ResponseStatus::Committed, Some(index)) if index > self.last_applied => {
                debug!(
                    node = self.id,
                    request = %response.request_id,
                    index,
                    last_applied = self.last_applied,
                    "committed by leader, waiting for local apply"
                );
                pending.committed_at = Some(index);
                return;
            }
            (ResponseStatus::Committed, Some(index)) => Ok(CommitReceipt {
                request_id: response.request_id.clone(),
                index,
            }),
            (ResponseStatus::Committed, None) => Err(RaftError::Rejected("missing_index".into())),
            (ResponseStatus::Rejected, _) => Err(RaftError::from_reason(
                response.reason.as_deref().unwrap_or("rejected"),
            )),
        };
        self.pending.remove(&response.request_id);
        self.queued
            .retain(|queued| queued.request_id != response.request_id);
        self.ready.outcomes.push(ClientOutcome {
            request_id: response.request_id,
            result,
        });
    }

    /// Resolves requests the leader reported committed at or below the
    /// applied index, then resolves or answers the request behind `entry`.
    pub(super) fn complete_request(&mut self, entry: &LogEntry) {
        self.resolve_acknowledged();
        let Some(request_id) = entry.request_id.clone() else {
            return;
        };
        match entry.origin_id {
            Some(origin) if origin == self.id => {
                if self.pending.remove(&request_id).is_some() {
                    self.ready.outcomes.push(ClientOutcome {
                        request_id: request_id.clone(),
                        result: Ok(CommitReceipt {
                            request_id,
                            index: entry.index,
                        }),
                    });
                }
            }
            Some(origin) if self.role == Role::Leader => {
                self.send(
                    origin,
                    Message::ClientResponse(ClientResponse::committed(request_id, entry.index)),
                );
            }
            _ => {}
        }
    }

    fn resolve_acknowledged(&mut self) {
        let applied = self.last_applied;
        let done: Vec<(RequestId, LogIndex)> = self
            .pending
            .iter()
            .filter_map(|(id, pending)| Some((id.clone(), pending.committed_at?)))
            .filter(|(_, index)| *index <= applied)
            .collect();
        for (request_id, index) in done {
            self.pending.remove(&request_id);
            self.ready.outcomes.push(ClientOutcome {
                request_id: request_id.clone(),
                result: Ok(CommitReceipt { request_id, index }),
            });
        }
    }

    /// Appends queued requests on a fresh leader.
    pub(super) fn append_queued(&mut self) {
        while let Some(queued) = self.queued.pop_front() {
            if !self.pending.contains_key(&queued.request_id) {
                continue;
            }
            debug!(node = self.id, request = %queued.request_id, "replaying queued request");
            let origin = self.id;
            self.append_entry(
                EntryKind::Mutation,
                Some(queued.mutation),
                Some(queued.request_id),
                Some(origin),
            );
        }
    }

    /// Sends queued requests to a newly learned leader.
    pub(super) fn forward_queued(&mut self) {
        let Some(leader) = self.leader_id else {
            return;
        };
        while let Some(queued) = self.queued.pop_front() {
            if let Some(pending) = self.pending.get_mut(&queued.request_id) {
                pending.forwarded_to = Some(leader);
                debug!(
                    node = self.id,
                    leader,
                    request = %queued.request_id,
                    "forwarding queued request"
                );
                self.forward(leader, queued.request_id, queued.mutation);
            }
        }
    }

    fn append_client_entry(&mut self, mutation: Mutation, request_id: RequestId, origin: PeerId) {
        self.append_entry(
            EntryKind::Mutation,
            Some(mutation),
            Some(request_id),
            Some(origin),
        );
        self.replicate_all();
        self.advance_commit_index();
    }

    fn forward(&mut self, leader: PeerId, request_id: RequestId, mutation: Mutation) {
        self.send(
            leader,
            Message::ClientRequest(ClientRequest {
                request_id,
                mutation,
                origin_id: self.id,
            }),
        );
    }

    fn check_entry_size(&self, mutation: &Mutation) -> Result<(), RaftError> {
        let size = mutation.encoded_len();
        let limit = self.config.max_entry_bytes;
        if size > limit {
            return Err(RaftError::EntryTooLarge { size, limit });
        }
        Ok(())
    }
}
