//! MultiPaxos -- peer-to-peer messages and their handlers.

use std::sync::atomic::Ordering;

use super::*;

use crate::server::{Instance, LogIndex, RpcHandler};

use serde::{Deserialize, Serialize};

/// Verdict carried by every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    Ok,
    Reject,
}

/// Peer-to-peer request message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Prepare message from a challenger.
    Prepare { ballot: Ballot, sender: ReplicaId },

    /// Accept message from the leader.
    Accept {
        instance: Instance,
        sender: ReplicaId,
    },

    /// Commit (heartbeat) message from the leader.
    Commit {
        ballot: Ballot,
        sender: ReplicaId,
        last_executed: LogIndex,
        global_last_executed: LogIndex,
    },
}

/// Peer-to-peer reply message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerReply {
    /// Reply to Prepare; carries all instances the replier holds when OK.
    Prepare {
        kind: ResponseType,
        ballot: Ballot,
        instances: Vec<Instance>,
    },

    /// Reply to Accept.
    Accept { kind: ResponseType, ballot: Ballot },

    /// Reply to Commit; carries the replier's last executed index.
    Commit {
        kind: ResponseType,
        ballot: Ballot,
        last_executed: LogIndex,
    },
}

impl PeerReply {
    /// The replier's ballot if this is a REJECT.
    pub fn rejected_ballot(&self) -> Option<Ballot> {
        match *self {
            PeerReply::Prepare {
                kind: ResponseType::Reject,
                ballot,
                ..
            }
            | PeerReply::Accept {
                kind: ResponseType::Reject,
                ballot,
            }
            | PeerReply::Commit {
                kind: ResponseType::Reject,
                ballot,
                ..
            } => Some(ballot),
            _ => None,
        }
    }
}

// MultiPaxos peer message handlers
impl MultiPaxos {
    /// Handler of Prepare message from a challenger.
    pub fn handle_prepare(
        &self,
        ballot: Ballot,
        sender: ReplicaId,
    ) -> PeerReply {
        pf_trace!("received Prepare <- {} bal {}", sender, ballot);

        if ballot > self.ballot() {
            self.become_follower(ballot);
            PeerReply::Prepare {
                kind: ResponseType::Ok,
                ballot,
                instances: self.log.instances(),
            }
        } else {
            PeerReply::Prepare {
                kind: ResponseType::Reject,
                ballot: self.ballot(),
                instances: vec![],
            }
        }
    }

    /// Handler of Accept message from the leader.
    pub fn handle_accept(
        &self,
        instance: Instance,
        sender: ReplicaId,
    ) -> PeerReply {
        pf_trace!("received Accept <- {} for index {} bal {}",
                  sender, instance.index, instance.ballot);

        let ballot = instance.ballot;
        let current = self.ballot();
        if ballot >= current {
            self.log.append(instance);
            if ballot > current {
                self.become_follower(ballot);
            }
            PeerReply::Accept {
                kind: ResponseType::Ok,
                ballot,
            }
        } else {
            PeerReply::Accept {
                kind: ResponseType::Reject,
                ballot: current,
            }
        }
    }

    /// Handler of Commit (heartbeat) message from the leader.
    pub fn handle_commit(
        &self,
        ballot: Ballot,
        sender: ReplicaId,
        last_executed: LogIndex,
        global_last_executed: LogIndex,
    ) -> PeerReply {
        pf_trace!("received Commit <- {} bal {} le {} gle {}",
                  sender, ballot, last_executed, global_last_executed);

        let current = self.ballot();
        if ballot >= current {
            self.commit_received.store(true, Ordering::SeqCst);
            self.log.commit_until(last_executed, ballot);
            self.log.trim_until(global_last_executed);
            let reply = PeerReply::Commit {
                kind: ResponseType::Ok,
                ballot,
                last_executed: self.log.last_executed(),
            };
            if ballot > current {
                self.become_follower(ballot);
            }
            reply
        } else {
            PeerReply::Commit {
                kind: ResponseType::Reject,
                ballot: current,
                last_executed: 0,
            }
        }
    }
}

impl RpcHandler for MultiPaxos {
    type Req = PeerRequest;
    type Rep = PeerReply;

    fn handle(&self, req: PeerRequest) -> PeerReply {
        match req {
            PeerRequest::Prepare { ballot, sender } => {
                self.handle_prepare(ballot, sender)
            }
            PeerRequest::Accept { instance, sender } => {
                self.handle_accept(instance, sender)
            }
            PeerRequest::Commit {
                ballot,
                sender,
                last_executed,
                global_last_executed,
            } => self.handle_commit(
                ballot,
                sender,
                last_executed,
                global_last_executed,
            ),
        }
    }
}
