//! Election timeouts, vote requests and vote counting.

use tracing::{debug, info};

use super::{Replica, Role, TimerCommand};
use crate::message::{Message, RequestVote, RequestVoteResponse};
use crate::PeerId;

impl Replica {
    /// Called when the election timer fires. Leaders ignore it.
    pub fn on_election_timeout(&mut self) {
        if !self.running || self.role == Role::Leader {
            return;
        }
        debug!(node = self.id, term = self.current_term, "election timeout");
        self.campaign();
    }

    /// Starts an election for the next term.
    ///
    /// Works from any role: a leader that campaigns steps down first. When
    /// this replica alone forms a quorum it wins immediately without sending
    /// anything.
    pub fn campaign(&mut self) {
        if !self.running {
            return;
        }
        if self.role == Role::Leader {
            self.ready.timers.push(TimerCommand::StopHeartbeat);
            self.next_index.clear();
            self.match_index.clear();
        }
        self.current_term = self.current_term.saturating_add(1);
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id);
        info!(
            node = self.id,
            term = self.current_term,
            quorum = self.topology.quorum_size(),
            "starting election"
        );
        self.emit_role_changed();

        if self.votes.len() >= self.topology.quorum_size() {
            self.become_leader();
            return;
        }
        self.arm_election_timer();
        self.broadcast(Message::RequestVote(RequestVote {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }));
    }

    pub(super) fn handle_request_vote(&mut self, from: PeerId, request: RequestVote) {
        if request.term < self.current_term {
            debug!(
                node = self.id,
                peer = from,
                term = self.current_term,
                stale_term = request.term,
                "rejecting stale vote request"
            );
            self.reply_vote(from, false);
            return;
        }
        self.observe_term(request.term);

        let free_to_vote = self
            .voted_for
            .map_or(true, |candidate| candidate == request.candidate_id);
        let log_ok = self
            .log
            .is_up_to_date(request.last_log_term, request.last_log_index);
        let granted = free_to_vote && log_ok;
        if granted {
            self.voted_for = Some(request.candidate_id);
            self.arm_election_timer();
        }
        debug!(
            node = self.id,
            peer = from,
            term = self.current_term,
            granted,
            log_ok,
            "answered vote request"
        );
        self.reply_vote(from, granted);
    }

    pub(super) fn handle_vote_response(&mut self, from: PeerId, response: RequestVoteResponse) {
        if self.observe_term(response.term) {
            return;
        }
        if self.role != Role::Candidate
            || response.term != self.current_term
            || !response.vote_granted
        {
            return;
        }
        self.votes.insert(from);
        debug!(
            node = self.id,
            term = self.current_term,
            votes = self.votes.len(),
            quorum = self.topology.quorum_size(),
            "vote received"
        );
        if self.votes.len() >= self.topology.quorum_size() {
            self.become_leader();
        }
    }

    fn reply_vote(&mut self, to: PeerId, vote_granted: bool) {
        self.send(
            to,
            Message::RequestVoteResponse(RequestVoteResponse {
                term: self.current_term,
                vote_granted,
            }),
        );
    }
}
