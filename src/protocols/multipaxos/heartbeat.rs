//! MultiPaxos -- leader heartbeats carrying commits and the trim watermark.

use std::cmp;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::*;

use crate::server::LogIndex;

/// Per-call aggregation state of a Commit phase.
#[derive(Debug)]
struct CommitState {
    num_rpcs: u8,
    num_oks: u8,
    min_last_executed: LogIndex,
}

// MultiPaxos commit and heartbeat logic
impl MultiPaxos {
    /// Runs a Commit phase under `ballot`, announcing the watermark
    /// `global_last_executed`. Returns the new watermark, which only
    /// advances if every node in the cluster replied OK.
    pub(crate) async fn run_commit_phase(
        self: &Arc<Self>,
        ballot: Ballot,
        global_last_executed: LogIndex,
    ) -> LogIndex {
        let last_executed = self.log.last_executed();
        let mut state = CommitState {
            num_rpcs: 1,
            num_oks: 1,
            min_last_executed: last_executed,
        };
        self.log.trim_until(global_last_executed);

        let mut rx_ballot = self.tx_ballot.subscribe();
        let mut rx_reply = self.fanout(PeerRequest::Commit {
            ballot,
            sender: self.id,
            last_executed,
            global_last_executed,
        });

        while is_leader(self.ballot(), self.id)
            && state.num_rpcs != self.population
        {
            match Self::next_event(&mut rx_reply, &mut rx_ballot).await {
                FanoutEvent::Reply(_, reply) => {
                    state.num_rpcs += 1;
                    if let Ok(PeerReply::Commit {
                        kind: ResponseType::Ok,
                        last_executed,
                        ..
                    }) = reply
                    {
                        state.num_oks += 1;
                        state.min_last_executed =
                            cmp::min(state.min_last_executed, last_executed);
                    }
                }
                FanoutEvent::BallotChanged => {}
                FanoutEvent::Exhausted => break,
            }
        }

        if state.num_oks == self.population {
            state.min_last_executed
        } else {
            global_last_executed
        }
    }

    /// Heartbeat/commit thread function. Idles while I am not the leader;
    /// otherwise runs a Commit phase every commit interval.
    pub(super) async fn commit_thread(self: Arc<Self>) {
        pf_debug!("commit thread spawned");

        while self.commit_running.load(Ordering::SeqCst) {
            loop {
                let notified = self.cv_leader.notified();
                if !self.commit_running.load(Ordering::SeqCst)
                    || is_leader(self.ballot(), self.id)
                {
                    break;
                }
                notified.await;
            }

            let mut global_last_executed = self.log.global_last_executed();
            while self.commit_running.load(Ordering::SeqCst) {
                let ballot = self.ballot();
                if !is_leader(ballot, self.id) {
                    break;
                }
                global_last_executed =
                    self.run_commit_phase(ballot, global_last_executed).await;
                pf_trace!("commit round done, gle {}", global_last_executed);
                time::sleep(self.commit_interval).await;
            }
        }

        pf_debug!("commit thread exitted");
    }
}
