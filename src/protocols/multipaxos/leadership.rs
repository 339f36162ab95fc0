//! MultiPaxos -- ballots, role transitions, and leader election.

use std::cmp;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::*;

use crate::server::{insert, LogIndex, LogMap};

use rand::prelude::*;

/// Per-call aggregation state of a Prepare phase.
#[derive(Debug, Default)]
struct PrepareState {
    num_rpcs: u8,
    num_oks: u8,
    max_last_index: LogIndex,
    log: LogMap,
}

// MultiPaxos ballot and role transition logic
impl MultiPaxos {
    /// Makes a ballot one round above my current one, owned by me.
    pub fn next_ballot(&self) -> Ballot {
        let next = self.ballot() + ROUND_INCREMENT;
        (next & !ID_BITS) | self.id as Ballot
    }

    /// Takes over leadership under `new_ballot`; new client commands will be
    /// assigned indices after `new_last_index`.
    pub(crate) fn become_leader(
        &self,
        new_ballot: Ballot,
        new_last_index: LogIndex,
    ) {
        let _guard = self.lock_role();
        pf_info!("became a leader: ballot {} -> {}",
                 self.ballot(), new_ballot);
        self.ballot.store(new_ballot, Ordering::SeqCst);
        self.log.set_last_index(new_last_index);
        self.tx_ballot.send_replace(new_ballot);
        self.cv_leader.notify_one();
    }

    /// Adopts a higher ballot seen from some other node. Stale ballots are
    /// ignored, so the ballot never decreases.
    pub(crate) fn become_follower(&self, new_ballot: Ballot) {
        let _guard = self.lock_role();
        let old_ballot = self.ballot();
        if new_ballot <= old_ballot {
            return;
        }

        let old_leader = extract_leader_id(old_ballot);
        let new_leader = extract_leader_id(new_ballot);
        if new_leader != self.id
            && (old_leader == self.id
                || old_leader as Ballot == MAX_NUM_PEERS)
        {
            pf_info!("became a follower: ballot {} -> {}",
                     old_ballot, new_ballot);
            self.cv_follower.notify_one();
        }
        self.ballot.store(new_ballot, Ordering::SeqCst);
        self.tx_ballot.send_replace(new_ballot);
    }

    /// Consumes the "Commit heard" flag, returning whether it was set.
    pub(super) fn received_commit(&self) -> bool {
        self.commit_received.swap(false, Ordering::SeqCst)
    }

    /// Sleeps for 1.5x the commit interval plus a random extra of up to half
    /// the commit interval.
    async fn sleep_for_random_interval(&self) {
        let half_ms = (self.commit_interval.as_millis() as u64 / 2).max(1);
        let extra_ms = thread_rng().gen_range(0..half_ms);
        time::sleep(
            self.commit_interval
                + self.commit_interval / 2
                + Duration::from_millis(extra_ms),
        )
        .await;
    }
}

// MultiPaxos election challenger
impl MultiPaxos {
    /// Election challenger thread function. Idles while I am the leader;
    /// otherwise keeps trying to win a Prepare phase unless some leader is
    /// heard from in the meantime.
    pub(super) async fn prepare_thread(self: Arc<Self>) {
        pf_debug!("prepare thread spawned");

        while self.prepare_running.load(Ordering::SeqCst) {
            loop {
                let notified = self.cv_follower.notified();
                if !self.prepare_running.load(Ordering::SeqCst)
                    || !is_leader(self.ballot(), self.id)
                {
                    break;
                }
                notified.await;
            }

            while self.prepare_running.load(Ordering::SeqCst) {
                self.sleep_for_random_interval().await;
                if self.received_commit() {
                    continue;
                }

                let next_ballot = self.next_ballot();
                if let Some((max_last_index, log)) =
                    self.run_prepare_phase(next_ballot).await
                {
                    self.become_leader(next_ballot, max_last_index);
                    self.replay(next_ballot, log).await;
                    break;
                }
            }
        }

        pf_debug!("prepare thread exitted");
    }

    /// Runs a Prepare phase under `ballot`. On winning a quorum, returns the
    /// largest index heard of and the merged log of the quorum; otherwise
    /// returns `None`.
    pub(crate) async fn run_prepare_phase(
        self: &Arc<Self>,
        ballot: Ballot,
    ) -> Option<(LogIndex, LogMap)> {
        let mut state = PrepareState::default();
        if ballot > self.ballot() {
            state.num_rpcs += 1;
            state.num_oks += 1;
            state.log = self.log.get_log();
            state.max_last_index = self.log.last_index();
        } else {
            return None;
        }
        pf_debug!("running prepare phase bal {}", ballot);

        let mut rx_ballot = self.tx_ballot.subscribe();
        let mut rx_reply = self.fanout(PeerRequest::Prepare {
            ballot,
            sender: self.id,
        });

        while state.num_oks <= self.half() && state.num_rpcs != self.population
        {
            match Self::next_event(&mut rx_reply, &mut rx_ballot).await {
                FanoutEvent::Reply(_, reply) => {
                    state.num_rpcs += 1;
                    if let Ok(PeerReply::Prepare {
                        kind: ResponseType::Ok,
                        instances,
                        ..
                    }) = reply
                    {
                        state.num_oks += 1;
                        for inst in instances {
                            state.max_last_index =
                                cmp::max(state.max_last_index, inst.index);
                            insert(&mut state.log, inst);
                        }
                    }
                }
                FanoutEvent::BallotChanged => {}
                FanoutEvent::Exhausted => break,
            }
        }

        if state.num_oks > self.half() {
            pf_debug!("prepare phase bal {} won with {} oks",
                      ballot, state.num_oks);
            Some((state.max_last_index, state.log))
        } else {
            pf_debug!("prepare phase bal {} lost with {} oks",
                      ballot, state.num_oks);
            None
        }
    }
}
