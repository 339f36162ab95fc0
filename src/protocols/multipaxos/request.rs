//! MultiPaxos -- Accept phase and replay of recovered instances.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::*;

use crate::server::{Instance, LogIndex, LogMap};

/// Per-call aggregation state of an Accept phase.
#[derive(Debug, Default)]
struct AcceptState {
    num_rpcs: u8,
    num_oks: u8,
}

// MultiPaxos replication logic
impl MultiPaxos {
    /// Runs an Accept phase proposing `command` at `index` under `ballot`.
    /// Commits the instance locally once a quorum accepted it.
    pub(crate) async fn run_accept_phase(
        self: &Arc<Self>,
        ballot: Ballot,
        index: LogIndex,
        command: Command,
        client_id: ClientId,
    ) -> MultiPaxosResult {
        let mut state = AcceptState::default();
        let instance = Instance::new(ballot, index, client_id, command);

        if ballot == self.ballot() {
            state.num_rpcs += 1;
            state.num_oks += 1;
            self.log.append(instance.clone());
        } else {
            let leader = extract_leader_id(self.ballot());
            return MultiPaxosResult::SomeoneElseLeader(leader);
        }
        pf_trace!("running accept phase for index {} bal {}",
                  index, ballot);

        let mut rx_ballot = self.tx_ballot.subscribe();
        let mut rx_reply = self.fanout(PeerRequest::Accept {
            instance,
            sender: self.id,
        });

        while is_leader(self.ballot(), self.id)
            && state.num_oks <= self.half()
            && state.num_rpcs != self.population
        {
            match Self::next_event(&mut rx_reply, &mut rx_ballot).await {
                FanoutEvent::Reply(_, reply) => {
                    state.num_rpcs += 1;
                    if let Ok(PeerReply::Accept {
                        kind: ResponseType::Ok,
                        ..
                    }) = reply
                    {
                        state.num_oks += 1;
                    }
                }
                FanoutEvent::BallotChanged => {}
                FanoutEvent::Exhausted => break,
            }
        }

        if state.num_oks > self.half() {
            self.log.commit(index);
            pf_trace!("committed index {} bal {}", index, ballot);
            return MultiPaxosResult::Ok;
        }
        let current = self.ballot();
        if !is_leader(current, self.id) {
            return MultiPaxosResult::SomeoneElseLeader(extract_leader_id(
                current,
            ));
        }
        MultiPaxosResult::Retry
    }

    /// Re-proposes every instance of the merged log from a won Prepare phase
    /// under `ballot`, in index order. Gives up as soon as someone else is
    /// found to be the leader.
    pub(crate) async fn replay(self: &Arc<Self>, ballot: Ballot, log: LogMap) {
        if !log.is_empty() {
            pf_info!("replaying {} instances under bal {}",
                     log.len(), ballot);
        }

        for (index, inst) in log {
            loop {
                let result = self
                    .run_accept_phase(
                        ballot,
                        index,
                        inst.command.clone(),
                        inst.client_id,
                    )
                    .await;
                match result {
                    MultiPaxosResult::Ok => break,
                    MultiPaxosResult::Retry => {
                        if !self.prepare_running.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                    MultiPaxosResult::SomeoneElseLeader(leader) => {
                        pf_debug!("replay aborted at index {}, leader {}",
                                  index, leader);
                        return;
                    }
                }
            }
        }
    }
}
