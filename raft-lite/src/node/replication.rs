//! Log replication on both the leader and follower side, plus the commit
//! engine that runs on the leader.

use tracing::{debug, warn};

use super::{Replica, Role};
use crate::events::RaftEvent;
use crate::message::{AppendEntries, AppendEntriesResponse, Message};
use crate::{LogIndex, PeerId};

impl Replica {
    /// Called on every heartbeat tick. Sends an empty AppendEntries to each
    /// member, reachable or not, to assert leadership and carry the commit
    /// index forward.
    pub fn on_heartbeat(&mut self) {
        if !self.running || self.role != Role::Leader {
            return;
        }
        let peers: Vec<PeerId> = self.topology.members().collect();
        for peer in peers {
            self.send_append(peer, false);
        }
    }

    /// Sends every member whatever it is missing, starting at its
    /// `next_index`.
    pub(super) fn replicate_all(&mut self) {
        let peers: Vec<PeerId> = self.topology.members().collect();
        for peer in peers {
            self.send_append(peer, true);
        }
    }

    pub(super) fn send_append(&mut self, peer: PeerId, with_entries: bool) {
        let last = self.log.last_index();
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = if with_entries {
            self.log
                .entries_from(next, self.config.max_entries_per_append)
        } else {
            Vec::new()
        };
        self.send(
            peer,
            Message::AppendEntries(AppendEntries {
                term: self.current_term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            }),
        );
    }

    pub(super) fn handle_append_entries(&mut self, from: PeerId, request: AppendEntries) {
        if request.term < self.current_term {
            debug!(
                node = self.id,
                peer = from,
                term = self.current_term,
                stale_term = request.term,
                "rejecting stale append"
            );
            self.reply_append(from, false, self.log.last_index());
            return;
        }
        self.become_follower(request.term, Some(request.leader_id));

        if request.prev_log_index > self.log.last_index() {
            debug!(
                node = self.id,
                prev = request.prev_log_index,
                last = self.log.last_index(),
                "append leaves a gap"
            );
            self.reply_append(from, false, self.log.last_index());
            return;
        }
        if self.log.term_at(request.prev_log_index) != Some(request.prev_log_term) {
            if request.prev_log_index > self.commit_index {
                debug!(
                    node = self.id,
                    prev = request.prev_log_index,
                    prev_term = request.prev_log_term,
                    "log conflict, truncating"
                );
                self.log.truncate_from(request.prev_log_index);
            } else {
                warn!(
                    node = self.id,
                    prev = request.prev_log_index,
                    commit = self.commit_index,
                    "leader disagrees with a committed entry"
                );
            }
            self.reply_append(from, false, self.log.last_index());
            return;
        }

        let outcome = self.log.splice(&request.entries, self.commit_index);
        if let Some(index) = outcome.truncated_from {
            debug!(node = self.id, index, "replaced conflicting suffix");
        }
        for (index, term) in outcome.appended {
            self.ready.events.push(RaftEvent::EntryAppended {
                node_id: self.id,
                index,
                term,
            });
        }

        // Only the prefix the leader just vouched for is known to match.
        let match_index = request.prev_log_index + request.entries.len() as LogIndex;
        self.commit_to(request.leader_commit.min(match_index));
        self.reply_append(from, true, match_index);
    }

    pub(super) fn handle_append_response(&mut self, from: PeerId, response: AppendEntriesResponse) {
        if self.observe_term(response.term) {
            return;
        }
        if self.role != Role::Leader || response.term != self.current_term {
            return;
        }
        let last = self.log.last_index();
        let matched = self.match_index.get(&from).copied().unwrap_or(0);

        if response.success {
            let matched = matched.max(response.match_index.min(last));
            self.match_index.insert(from, matched);
            self.next_index.insert(from, matched + 1);
            self.advance_commit_index();
            if matched < self.log.last_index() {
                self.send_append(from, true);
            }
            return;
        }

        // Within a term a follower keeps every entry it acknowledged, so a
        // rejection reporting less than the recorded match is stale.
        if response.match_index < matched {
            debug!(
                node = self.id,
                peer = from,
                recorded = matched,
                reported = response.match_index,
                "ignoring stale rejection"
            );
            return;
        }
        let next = self.next_index.get(&from).copied().unwrap_or(last + 1);
        let next = next.saturating_sub(1).max(matched + 1);
        debug!(node = self.id, peer = from, next, "append rejected, backing off");
        self.next_index.insert(from, next);
        self.send_append(from, true);
    }

    /// Commits the highest index that a quorum has replicated, provided the
    /// entry there was written in the current term.
    pub(super) fn advance_commit_index(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let quorum = self.topology.quorum_size();
        let mut candidate = self.commit_index;
        for index in (self.commit_index + 1)..=self.log.last_index() {
            let replicas = 1 + self
                .match_index
                .values()
                .filter(|&&matched| matched >= index)
                .count();
            if replicas < quorum {
                break;
            }
            if self.log.term_at(index) == Some(self.current_term) {
                candidate = index;
            }
        }
        self.commit_to(candidate);
    }

    fn reply_append(&mut self, to: PeerId, success: bool, match_index: LogIndex) {
        self.send(
            to,
            Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.current_term,
                success,
                match_index,
            }),
        );
    }
}
