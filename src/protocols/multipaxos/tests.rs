//! MultiPaxos cluster tests over in-process peers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use super::*;

use crate::server::{Instance, InstanceState, LogIndex, LogMap};

use async_trait::async_trait;

use rand::prelude::*;
use rand::rngs::StdRng;

fn test_config() -> ReplicaConfigMultiPaxos {
    ReplicaConfigMultiPaxos {
        commit_interval_ms: 50,
        rpc_timeout_ms: 100,
        ..Default::default()
    }
}

fn put(key: &str, value: &str) -> Command {
    Command::Put {
        key: key.into(),
        value: value.into(),
    }
}

/// Registry of in-process nodes; nodes marked down never answer.
#[derive(Default)]
struct Switchboard {
    nodes: Mutex<Vec<Weak<MultiPaxos>>>,
    down: Mutex<HashSet<ReplicaId>>,
}

impl Switchboard {
    fn node(&self, id: ReplicaId) -> Option<Arc<MultiPaxos>> {
        self.nodes.lock().unwrap().get(id as usize)?.upgrade()
    }

    fn is_down(&self, id: ReplicaId) -> bool {
        self.down.lock().unwrap().contains(&id)
    }

    fn set_down(&self, id: ReplicaId) {
        self.down.lock().unwrap().insert(id);
    }

    fn set_up(&self, id: ReplicaId) {
        self.down.lock().unwrap().remove(&id);
    }
}

/// Loopback client delivering requests straight into the target's handler.
struct LocalClient {
    target: ReplicaId,
    board: Arc<Switchboard>,
}

#[async_trait]
impl RpcClient<PeerRequest, PeerReply> for LocalClient {
    async fn call(&self, req: PeerRequest) -> Result<PeerReply, ReplicantError> {
        if self.board.is_down(self.target) {
            return std::future::pending().await;
        }
        let node = self
            .board
            .node(self.target)
            .ok_or_else(|| ReplicantError::msg("target node gone"))?;
        Ok(crate::server::RpcHandler::handle(node.as_ref(), req))
    }
}

type Script = dyn Fn(&PeerRequest) -> Option<PeerReply> + Send + Sync;

/// Peer answering with canned replies; `None` from the script is a transport
/// failure. Every request received is recorded.
struct ScriptedClient {
    script: Box<Script>,
    received: Mutex<Vec<PeerRequest>>,
}

impl ScriptedClient {
    fn new(
        script: impl Fn(&PeerRequest) -> Option<PeerReply> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(ScriptedClient {
            script: Box::new(script),
            received: Mutex::new(vec![]),
        })
    }

    fn accepted_indices(&self) -> Vec<(LogIndex, Ballot)> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|req| match req {
                PeerRequest::Accept { instance, .. } => {
                    Some((instance.index, instance.ballot))
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RpcClient<PeerRequest, PeerReply> for ScriptedClient {
    async fn call(&self, req: PeerRequest) -> Result<PeerReply, ReplicantError> {
        self.received.lock().unwrap().push(req.clone());
        (self.script)(&req).ok_or_else(|| ReplicantError::msg("peer down"))
    }
}

/// Positive reply of the matching kind, echoing the request's ballot.
fn ok_reply(req: &PeerRequest, last_executed: LogIndex) -> PeerReply {
    match req {
        PeerRequest::Prepare { ballot, .. } => PeerReply::Prepare {
            kind: ResponseType::Ok,
            ballot: *ballot,
            instances: vec![],
        },
        PeerRequest::Accept { instance, .. } => PeerReply::Accept {
            kind: ResponseType::Ok,
            ballot: instance.ballot,
        },
        PeerRequest::Commit { ballot, .. } => PeerReply::Commit {
            kind: ResponseType::Ok,
            ballot: *ballot,
            last_executed,
        },
    }
}

fn reject_reply(req: &PeerRequest, ballot: Ballot) -> PeerReply {
    match req {
        PeerRequest::Prepare { .. } => PeerReply::Prepare {
            kind: ResponseType::Reject,
            ballot,
            instances: vec![],
        },
        PeerRequest::Accept { .. } => PeerReply::Accept {
            kind: ResponseType::Reject,
            ballot,
        },
        PeerRequest::Commit { .. } => PeerReply::Commit {
            kind: ResponseType::Reject,
            ballot,
            last_executed: 0,
        },
    }
}

/// Node 0 of a cluster whose other nodes are the given scripted clients.
fn scripted_node(
    clients: &[Arc<ScriptedClient>],
) -> Result<Arc<MultiPaxos>, ReplicantError> {
    let peers = clients
        .iter()
        .enumerate()
        .map(|(p, client)| Peer {
            id: p as ReplicaId + 1,
            client: client.clone(),
        })
        .collect();
    Ok(Arc::new(MultiPaxos::with_peers(
        0,
        clients.len() as u8 + 1,
        Arc::new(Log::default()),
        &test_config(),
        peers,
    )?))
}

/// A loopback cluster of `population` nodes.
fn loopback_cluster(
    population: u8,
) -> Result<(Arc<Switchboard>, Vec<Arc<MultiPaxos>>), ReplicantError> {
    let board = Arc::new(Switchboard::default());
    let mut nodes = vec![];
    for id in 0..population {
        let peers = (0..population)
            .filter(|&p| p != id)
            .map(|p| Peer {
                id: p,
                client: Arc::new(LocalClient {
                    target: p,
                    board: board.clone(),
                }),
            })
            .collect();
        nodes.push(Arc::new(MultiPaxos::with_peers(
            id,
            population,
            Arc::new(Log::default()),
            &test_config(),
            peers,
        )?));
    }
    *board.nodes.lock().unwrap() = nodes.iter().map(Arc::downgrade).collect();
    Ok((board, nodes))
}

/// Keeps executing committed instances of `node`'s log until it is stopped.
fn spawn_executor(node: &Arc<MultiPaxos>) {
    let log = node.log().clone();
    tokio::spawn(async move { while log.execute().await.is_some() {} });
}

async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = time::Instant::now() + limit;
    while time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn make_leader(node: &Arc<MultiPaxos>) -> Option<Ballot> {
    let ballot = node.next_ballot();
    let (last_index, log) = node.run_prepare_phase(ballot).await?;
    node.become_leader(ballot, last_index);
    node.replay(ballot, log).await;
    Some(ballot)
}

#[test]
fn become_follower_monotonic() -> Result<(), ReplicantError> {
    let paxos = MultiPaxos::with_peers(
        0,
        3,
        Arc::new(Log::default()),
        &test_config(),
        vec![],
    )?;
    let max_seen = AtomicU64::new(MAX_NUM_PEERS);

    thread::scope(|s| {
        for t in 0..4 {
            let (paxos, max_seen) = (&paxos, &max_seen);
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                for _ in 0..500 {
                    let ballot = rng.gen_range(0..64) * ROUND_INCREMENT
                        + rng.gen_range(0..3);
                    paxos.become_follower(ballot);
                    max_seen.fetch_max(ballot, Ordering::SeqCst);
                }
            });
        }
        s.spawn(|| {
            let mut last = 0;
            for _ in 0..5000 {
                let ballot = paxos.ballot();
                assert!(ballot >= last);
                last = ballot;
            }
        });
    });

    assert_eq!(paxos.ballot(), max_seen.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn next_ballot_properties() -> Result<(), ReplicantError> {
    let mut rng = StdRng::seed_from_u64(77);
    for id in 0..5 {
        let paxos = MultiPaxos::with_peers(
            id,
            5,
            Arc::new(Log::default()),
            &test_config(),
            vec![],
        )?;
        for _ in 0..100 {
            let seen = paxos.ballot();
            let next = paxos.next_ballot();
            assert!(next > seen);
            assert_eq!(extract_leader_id(next), id);
            let heard = (next & !ID_BITS)
                + rng.gen_range(0..3) * ROUND_INCREMENT
                + rng.gen_range(0..5);
            paxos.become_follower(heard);
        }
    }

    let paxos = MultiPaxos::with_peers(
        0,
        3,
        Arc::new(Log::default()),
        &test_config(),
        vec![],
    )?;
    assert_eq!(paxos.next_ballot(), 256);
    let paxos = MultiPaxos::with_peers(
        1,
        3,
        Arc::new(Log::default()),
        &test_config(),
        vec![],
    )?;
    paxos.become_follower(256);
    assert_eq!(paxos.next_ballot(), 513);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_needs_quorum() -> Result<(), ReplicantError> {
    for population in [1u8, 3, 5] {
        for num_ok_peers in 0..population {
            let clients: Vec<_> = (1..population)
                .map(|p| {
                    let ok = p <= num_ok_peers;
                    ScriptedClient::new(move |req| ok.then(|| ok_reply(req, 0)))
                })
                .collect();
            let paxos = scripted_node(&clients)?;
            let ballot = paxos.next_ballot();
            paxos.become_leader(ballot, 0);

            let result = paxos.replicate(put("k", "v"), 7).await;
            let quorum = num_ok_peers + 1 > population / 2;
            let state = paxos.log().at(1).map(|inst| inst.state);
            if quorum {
                assert_eq!(result, MultiPaxosResult::Ok);
                assert_eq!(state, Some(InstanceState::Committed));
            } else {
                assert_eq!(result, MultiPaxosResult::Retry);
                assert_eq!(state, Some(InstanceState::InProgress));
            }
            for client in &clients {
                assert!(wait_until(Duration::from_millis(500), || {
                    client.accepted_indices() == vec![(1, ballot)]
                })
                .await);
            }
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_rejected_by_higher_ballot() -> Result<(), ReplicantError> {
    let clients = vec![
        ScriptedClient::new(|req| Some(reject_reply(req, 4 * ROUND_INCREMENT + 2))),
        ScriptedClient::new(|_| None),
    ];
    let paxos = scripted_node(&clients)?;
    paxos.become_leader(paxos.next_ballot(), 0);

    let result = paxos.replicate(put("k", "v"), 7).await;
    assert_eq!(result, MultiPaxosResult::SomeoneElseLeader(2));
    assert_eq!(paxos.ballot(), 4 * ROUND_INCREMENT + 2);

    // lost leadership: no more accepts go out
    let result = paxos.replicate(put("k", "w"), 7).await;
    assert_eq!(result, MultiPaxosResult::SomeoneElseLeader(2));
    assert_eq!(clients[0].accepted_indices().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_with_stale_ballot() -> Result<(), ReplicantError> {
    let clients = vec![ScriptedClient::new(|req| Some(ok_reply(req, 0)))];
    let paxos = scripted_node(&clients)?;
    let ballot = paxos.next_ballot();
    paxos.become_leader(ballot, 0);
    paxos.become_follower(ballot + ROUND_INCREMENT + 1);

    let result = paxos.run_accept_phase(ballot, 1, put("k", "v"), 7).await;
    assert_eq!(result, MultiPaxosResult::SomeoneElseLeader(1));
    assert!(clients[0].accepted_indices().is_empty());
    assert!(paxos.log().at(1).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_watermark_needs_everyone() -> Result<(), ReplicantError> {
    let (board, nodes) = loopback_cluster(3)?;
    nodes.iter().for_each(spawn_executor);
    let ballot = make_leader(&nodes[0]).await;
    assert_eq!(ballot, Some(256));
    let ballot = 256;

    assert_eq!(
        nodes[0].replicate(put("k", "v"), 7).await,
        MultiPaxosResult::Ok
    );
    assert!(
        wait_until(Duration::from_secs(1), || nodes[0].log().last_executed()
            == 1)
        .await
    );

    // followers learn the commit and execute, but node 2 never answers
    board.set_down(2);
    for _ in 0..3 {
        assert_eq!(nodes[0].run_commit_phase(ballot, 0).await, 0);
    }
    assert_eq!(nodes[0].ballot(), ballot);
    assert!(nodes[0].log().at(1).is_some());

    board.set_up(2);
    let mut gle = 0;
    for _ in 0..20 {
        gle = nodes[0].run_commit_phase(ballot, gle).await;
        if gle == 1 {
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(gle, 1);

    // next round trims everyone up to the watermark
    assert_eq!(nodes[0].run_commit_phase(ballot, gle).await, 1);
    for node in &nodes {
        assert!(node.log().at(1).is_none());
        assert_eq!(node.log().global_last_executed(), 1);
        node.log().stop();
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_thread_rereads_watermark() -> Result<(), ReplicantError> {
    let clients = vec![ScriptedClient::new(|req| Some(ok_reply(req, 1)))];
    let paxos = scripted_node(&clients)?;
    paxos.start_commit_thread();
    time::sleep(Duration::from_millis(20)).await;

    // the watermark moves while the thread idles as a follower
    paxos.log().append(Instance::new(MAX_NUM_PEERS, 1, 7, put("k", "v")));
    paxos.log().commit(1);
    assert!(paxos.log().execute().await.is_some());
    paxos.log().trim_until(1);
    assert_eq!(paxos.log().global_last_executed(), 1);

    paxos.become_leader(ROUND_INCREMENT, 1);
    let first_commit_gle = || {
        clients[0].received.lock().unwrap().iter().find_map(|req| match req {
            PeerRequest::Commit {
                global_last_executed,
                ..
            } => Some(*global_last_executed),
            _ => None,
        })
    };
    assert!(
        wait_until(Duration::from_secs(1), || first_commit_gle().is_some())
            .await
    );
    assert_eq!(first_commit_gle(), Some(1));

    paxos.stop_commit_thread().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replay_in_index_order() -> Result<(), ReplicantError> {
    // with two nodes every accept waits for the peer, so arrival order is
    // the replay order
    let clients = vec![ScriptedClient::new(|req| Some(ok_reply(req, 0)))];
    let paxos = scripted_node(&clients)?;
    paxos.become_follower(ROUND_INCREMENT + 1);

    let mut log = LogMap::new();
    for index in [3, 1, 2] {
        let inst = Instance::new(
            ROUND_INCREMENT + 1,
            index,
            index * 10,
            put(&format!("k{}", index), "v"),
        );
        log.insert(index, inst);
    }
    let ballot = paxos.next_ballot();
    assert_eq!(ballot, 2 * ROUND_INCREMENT);
    paxos.become_leader(ballot, 3);
    paxos.replay(ballot, log).await;

    assert_eq!(
        clients[0].accepted_indices(),
        vec![(1, ballot), (2, ballot), (3, ballot)]
    );
    for index in 1..=3 {
        let inst = paxos.log().at(index);
        assert_eq!(inst.as_ref().map(|i| i.ballot), Some(ballot));
        assert_eq!(inst.as_ref().map(|i| i.client_id), Some(index * 10));
        assert_eq!(
            inst.map(|i| i.state),
            Some(InstanceState::Committed)
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replay_aborts_on_new_leader() -> Result<(), ReplicantError> {
    let higher = 8 * ROUND_INCREMENT + 2;
    let clients: Vec<_> = (0..2)
        .map(|_| {
            ScriptedClient::new(move |req| match req {
                PeerRequest::Accept { instance, .. } if instance.index == 2 => {
                    Some(reject_reply(req, higher))
                }
                _ => Some(ok_reply(req, 0)),
            })
        })
        .collect();
    let paxos = scripted_node(&clients)?;
    paxos.become_follower(ROUND_INCREMENT + 1);

    let mut log = LogMap::new();
    for index in 1..=3 {
        log.insert(
            index,
            Instance::new(ROUND_INCREMENT + 1, index, 7, put("k", "v")),
        );
    }
    let ballot = paxos.next_ballot();
    paxos.become_leader(ballot, 3);
    paxos.replay(ballot, log).await;

    assert_eq!(paxos.ballot(), higher);
    assert_eq!(
        paxos.log().at(1).map(|inst| inst.state),
        Some(InstanceState::Committed)
    );
    assert_eq!(
        paxos.log().at(2).map(|inst| inst.state),
        Some(InstanceState::InProgress)
    );
    assert!(paxos.log().at(3).is_none());
    for client in &clients {
        assert!(client
            .accepted_indices()
            .iter()
            .all(|&(index, _)| index <= 2));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn elect_replicate_commit() -> Result<(), ReplicantError> {
    let clients: Vec<_> = (0..2)
        .map(|_| ScriptedClient::new(|req| Some(ok_reply(req, 1))))
        .collect();
    let paxos = scripted_node(&clients)?;

    let ballot = paxos.next_ballot();
    assert_eq!(ballot, 256);
    let won = paxos.run_prepare_phase(ballot).await;
    assert_eq!(won, Some((0, LogMap::new())));
    paxos.become_leader(ballot, 0);
    assert!(is_leader(paxos.ballot(), 0));

    assert_eq!(paxos.replicate(put("k", "v"), 7).await, MultiPaxosResult::Ok);
    assert_eq!(
        paxos.log().execute().await,
        Some((7, crate::server::CommandResult::Put { old_value: None }))
    );
    assert_eq!(paxos.run_commit_phase(ballot, 0).await, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prepare_rejected_by_higher_ballot() -> Result<(), ReplicantError> {
    let higher = 3 * ROUND_INCREMENT + 1;
    let clients = vec![
        ScriptedClient::new(move |req| Some(reject_reply(req, higher))),
        ScriptedClient::new(move |req| Some(reject_reply(req, higher))),
    ];
    let paxos = scripted_node(&clients)?;
    assert_eq!(paxos.run_prepare_phase(paxos.next_ballot()).await, None);
    assert_eq!(paxos.ballot(), higher);

    // no self-vote for a ballot not above the current one
    assert_eq!(paxos.run_prepare_phase(higher).await, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follower_joins_from_sentinel() -> Result<(), ReplicantError> {
    let (_board, nodes) = loopback_cluster(3)?;
    assert_eq!(nodes[1].ballot(), MAX_NUM_PEERS);
    assert_eq!(make_leader(&nodes[0]).await, Some(256));
    assert_eq!(nodes[1].ballot(), 256);
    assert!(is_someone_else_leader(nodes[1].ballot(), 1));
    assert!(nodes[1].log().get_log().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failover_after_leader_crash() -> Result<(), ReplicantError> {
    let (board, nodes) = loopback_cluster(3)?;
    assert_eq!(make_leader(&nodes[0]).await, Some(256));
    for node in &nodes {
        node.start().await?;
    }

    // heartbeats keep the followers from challenging
    time::sleep(Duration::from_millis(300)).await;
    assert!(nodes.iter().all(|node| node.ballot() == 256));

    board.set_down(0);
    nodes[0].stop().await?;

    let elected = wait_until(Duration::from_secs(5), || {
        let (b1, b2) = (nodes[1].ballot(), nodes[2].ballot());
        b1 == b2
            && b1 & !ID_BITS >= 2 * ROUND_INCREMENT
            && (is_leader(b1, 1) || is_leader(b1, 2))
    })
    .await;
    assert!(elected);
    for node in &nodes[1..] {
        assert!(node.log().get_log().is_empty());
        node.stop().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_most_one_leader_per_ballot() -> Result<(), ReplicantError> {
    let (_board, nodes) = loopback_cluster(5)?;
    for node in &nodes {
        node.start().await?;
    }

    let mut claims: HashMap<Ballot, HashSet<ReplicaId>> = HashMap::new();
    let deadline = time::Instant::now() + Duration::from_millis(1500);
    while time::Instant::now() < deadline {
        for node in &nodes {
            let ballot = node.ballot();
            if is_leader(ballot, node.id()) {
                claims.entry(ballot).or_default().insert(node.id());
            }
        }
        time::sleep(Duration::from_millis(5)).await;
    }

    assert!(!claims.is_empty());
    for (ballot, ids) in &claims {
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&extract_leader_id(*ballot)));
    }
    for node in &nodes {
        node.stop().await?;
    }
    Ok(())
}
