//! Replication protocol: MultiPaxos.
//!
//! Multi-decree Paxos with a stable leader. A node that wins the Prepare
//! phase under its ballot keeps driving Accept rounds for new client
//! commands without re-electing, and periodically broadcasts Commit messages
//! that double as heartbeats and carry the cluster-wide execution watermark.
//! References:
//!   - <https://www.microsoft.com/en-us/research/uploads/prod/2016/12/paxos-simple-Copy.pdf>
//!   - <https://dl.acm.org/doi/pdf/10.1145/1281100.1281103>

mod heartbeat;
mod leadership;
mod messages;
mod request;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::server::{
    Ballot, ClientId, Command, FanoutPool, Log, ReplicaId, RpcClient,
    RpcServer, TcpRpcClient,
};
use crate::utils::ReplicantError;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

pub use messages::{PeerReply, PeerRequest, ResponseType};

/// Mask of the ballot bits holding the proposer's ID.
pub const ID_BITS: Ballot = 0xff;

/// Step between two consecutive ballot rounds.
pub const ROUND_INCREMENT: Ballot = ID_BITS + 1;

/// Max number of nodes in a cluster; also the leader ID slot value meaning
/// "no known leader".
pub const MAX_NUM_PEERS: Ballot = 0xf;

/// How long `stop()` waits for each background thread and for the fan-out
/// pool to wind down.
const STOP_WAIT: Duration = Duration::from_millis(1000);

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaConfigMultiPaxos {
    /// Peer-to-peer addresses of all nodes; index is the node ID.
    pub peers: Vec<String>,

    /// Interval of leader sending Commit heartbeats in millisecs.
    pub commit_interval_ms: u64,

    /// Max number of outbound RPCs in flight.
    pub threadpool_size: usize,

    /// Timeout of a single outbound RPC in millisecs.
    pub rpc_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigMultiPaxos {
    fn default() -> Self {
        ReplicaConfigMultiPaxos {
            peers: vec![],
            commit_interval_ms: 300,
            threadpool_size: 8,
            rpc_timeout_ms: 1000,
        }
    }
}

impl ReplicaConfigMultiPaxos {
    /// Parses the config from a TOML string on top of the defaults.
    pub fn from_toml(
        config_str: Option<&str>,
    ) -> Result<Self, ReplicantError> {
        parsed_config!(config_str => ReplicaConfigMultiPaxos;
                       peers, commit_interval_ms, threadpool_size,
                       rpc_timeout_ms)
    }

    /// Checks the config is usable by node `id`.
    pub fn validate(&self, id: ReplicaId) -> Result<(), ReplicantError> {
        if self.peers.is_empty() || self.peers.len() > MAX_NUM_PEERS as usize
        {
            return logged_err!("invalid number of peers {}", self.peers.len());
        }
        if id as usize >= self.peers.len() {
            return logged_err!("invalid node ID {} for {} peers",
                               id, self.peers.len());
        }
        if self.commit_interval_ms == 0 {
            return logged_err!("invalid commit_interval_ms 0");
        }
        if self.threadpool_size == 0 {
            return logged_err!("invalid threadpool_size 0");
        }
        if self.rpc_timeout_ms == 0 {
            return logged_err!("invalid rpc_timeout_ms 0");
        }
        Ok(())
    }
}

/// Outcome of a leader-facing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiPaxosResult {
    /// Command committed under my leadership.
    Ok,

    /// No decision reached; the caller should resubmit.
    Retry,

    /// Another node (by ID) is the believed leader.
    SomeoneElseLeader(ReplicaId),
}

/// Node ID encoded in the low bits of `ballot`.
#[inline]
pub fn extract_leader_id(ballot: Ballot) -> ReplicaId {
    (ballot & ID_BITS) as ReplicaId
}

/// True if `ballot` names node `id` as leader.
#[inline]
pub fn is_leader(ballot: Ballot, id: ReplicaId) -> bool {
    extract_leader_id(ballot) == id
}

/// True if `ballot` names a valid node other than `id` as leader.
#[inline]
pub fn is_someone_else_leader(ballot: Ballot, id: ReplicaId) -> bool {
    !is_leader(ballot, id)
        && (extract_leader_id(ballot) as Ballot) < MAX_NUM_PEERS
}

/// A remote node together with the client used to reach it.
#[derive(Clone)]
pub struct Peer {
    pub id: ReplicaId,
    pub client: Arc<dyn RpcClient<PeerRequest, PeerReply>>,
}

/// One outcome collected by a phase coordinator from its fan-out.
enum FanoutEvent {
    /// A peer's RPC completed, successfully or not.
    Reply(ReplicaId, Result<PeerReply, ReplicantError>),

    /// My ballot changed; leadership conditions need re-checking.
    BallotChanged,

    /// All fan-out workers are done; no more replies will come.
    Exhausted,
}

/// Join handles of the long-running threads.
#[derive(Default)]
struct Threads {
    rpc_server: Option<RpcServer>,
    prepare_handle: Option<JoinHandle<()>>,
    commit_handle: Option<JoinHandle<()>>,
}

/// MultiPaxos consensus engine of one node.
pub struct MultiPaxos {
    /// My replica ID.
    id: ReplicaId,

    /// Total number of nodes in the cluster.
    population: u8,

    /// Current ballot; also encodes the believed leader.
    ballot: AtomicU64,

    /// The replicated log.
    log: Arc<Log>,

    /// Set by every accepted Commit message, consumed by the challenger.
    commit_received: AtomicBool,

    /// Interval of leader Commit rounds.
    commit_interval: Duration,

    /// Timeout of a single outbound RPC.
    rpc_timeout: Duration,

    /// My peer-to-peer address to listen on, if any.
    p2p_addr: Option<String>,

    /// All other nodes.
    peers: Vec<Peer>,

    /// Bounded pool that outbound RPCs run in.
    pool: FanoutPool,

    /// Node mutex serializing role transitions.
    mu: Mutex<()>,

    /// Signalled when I become leader.
    cv_leader: Notify,

    /// Signalled when I step down to follower.
    cv_follower: Notify,

    /// Publishes every ballot change to waiting phase coordinators.
    tx_ballot: watch::Sender<Ballot>,

    prepare_running: AtomicBool,
    commit_running: AtomicBool,

    threads: Mutex<Threads>,
}

// MultiPaxos construction and lifecycle
impl MultiPaxos {
    /// Creates a new engine whose peers are reached over TCP at the
    /// addresses in `config.peers`.
    pub fn new(
        id: ReplicaId,
        log: Arc<Log>,
        config: &ReplicaConfigMultiPaxos,
    ) -> Result<Self, ReplicantError> {
        config.validate(id)?;
        let peers = config
            .peers
            .iter()
            .enumerate()
            .filter(|&(p, _)| p != id as usize)
            .map(|(p, addr)| Peer {
                id: p as ReplicaId,
                client: Arc::new(TcpRpcClient::<PeerRequest, PeerReply>::new(
                    id, addr,
                )),
            })
            .collect();

        let mut paxos = Self::with_peers(
            id,
            config.peers.len() as u8,
            log,
            config,
            peers,
        )?;
        paxos.p2p_addr = Some(config.peers[id as usize].clone());
        Ok(paxos)
    }

    /// Creates a new engine over the given peer clients. The engine does
    /// not serve RPCs by itself; requests are fed to it through `handle()`.
    pub fn with_peers(
        id: ReplicaId,
        population: u8,
        log: Arc<Log>,
        config: &ReplicaConfigMultiPaxos,
        peers: Vec<Peer>,
    ) -> Result<Self, ReplicantError> {
        if population == 0 || population as Ballot > MAX_NUM_PEERS {
            return logged_err!("invalid population {}", population);
        }
        if id >= population {
            return logged_err!("invalid node ID {} for population {}",
                               id, population);
        }
        if peers.iter().any(|p| p.id == id || p.id >= population) {
            return logged_err!("invalid peer IDs {:?}",
                               peers.iter().map(|p| p.id).collect::<Vec<_>>());
        }

        let (tx_ballot, _) = watch::channel(MAX_NUM_PEERS);
        Ok(MultiPaxos {
            id,
            population,
            ballot: AtomicU64::new(MAX_NUM_PEERS),
            log,
            commit_received: AtomicBool::new(false),
            commit_interval: Duration::from_millis(config.commit_interval_ms),
            rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
            p2p_addr: None,
            peers,
            pool: FanoutPool::new(config.threadpool_size.max(1)),
            mu: Mutex::new(()),
            cv_leader: Notify::new(),
            cv_follower: Notify::new(),
            tx_ballot,
            prepare_running: AtomicBool::new(false),
            commit_running: AtomicBool::new(false),
            threads: Mutex::new(Threads::default()),
        })
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Current ballot number.
    pub fn ballot(&self) -> Ballot {
        self.ballot.load(Ordering::SeqCst)
    }

    /// The replicated log this engine drives.
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    /// Starts the election challenger thread, the heartbeat/commit thread,
    /// and the RPC server (if I have a peer-to-peer address).
    pub async fn start(self: &Arc<Self>) -> Result<(), ReplicantError> {
        self.start_prepare_thread();
        self.start_commit_thread();
        self.start_rpc_server().await
    }

    /// Stops serving RPCs, stops both background threads, then drains the
    /// fan-out pool with a bounded wait.
    pub async fn stop(self: &Arc<Self>) -> Result<(), ReplicantError> {
        self.stop_rpc_server().await?;
        self.stop_prepare_thread().await;
        self.stop_commit_thread().await;
        self.pool.drain(STOP_WAIT).await;
        Ok(())
    }

    async fn start_rpc_server(self: &Arc<Self>) -> Result<(), ReplicantError> {
        let Some(addr) = self.p2p_addr.as_ref() else {
            return Ok(());
        };
        let addr: SocketAddr = addr.parse()?;
        let server = RpcServer::new_and_setup(addr, self.clone())
            .await?;
        pf_info!("rpc server started at {}", server.local_addr());
        self.lock_threads().rpc_server = Some(server);
        Ok(())
    }

    async fn stop_rpc_server(&self) -> Result<(), ReplicantError> {
        let server = self.lock_threads().rpc_server.take();
        if let Some(mut server) = server {
            server.stop().await?;
        }
        Ok(())
    }

    /// Spawns the election challenger thread.
    pub(crate) fn start_prepare_thread(self: &Arc<Self>) {
        pf_debug!("starting prepare thread");
        debug_assert!(!self.prepare_running.load(Ordering::SeqCst));
        self.prepare_running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(self.clone().prepare_thread());
        self.lock_threads().prepare_handle = Some(handle);
    }

    pub(crate) async fn stop_prepare_thread(&self) {
        pf_debug!("stopping prepare thread");
        {
            let _guard = self.lock_role();
            self.prepare_running.store(false, Ordering::SeqCst);
            self.cv_follower.notify_one();
        }
        let handle = self.lock_threads().prepare_handle.take();
        if let Some(handle) = handle {
            self.join_or_abort(handle, "prepare").await;
        }
    }

    /// Spawns the heartbeat/commit thread.
    pub(crate) fn start_commit_thread(self: &Arc<Self>) {
        pf_debug!("starting commit thread");
        debug_assert!(!self.commit_running.load(Ordering::SeqCst));
        self.commit_running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(self.clone().commit_thread());
        self.lock_threads().commit_handle = Some(handle);
    }

    pub(crate) async fn stop_commit_thread(&self) {
        pf_debug!("stopping commit thread");
        {
            let _guard = self.lock_role();
            self.commit_running.store(false, Ordering::SeqCst);
            self.cv_leader.notify_one();
        }
        let handle = self.lock_threads().commit_handle.take();
        if let Some(handle) = handle {
            self.join_or_abort(handle, "commit").await;
        }
    }

    async fn join_or_abort(&self, mut handle: JoinHandle<()>, name: &str) {
        if time::timeout(STOP_WAIT, &mut handle).await.is_err() {
            pf_debug!("{} thread still busy, aborting it", name);
            handle.abort();
        }
    }

    fn lock_role(&self) -> MutexGuard<'_, ()> {
        self.mu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_threads(&self) -> MutexGuard<'_, Threads> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// MultiPaxos fan-out plumbing shared by all phases
impl MultiPaxos {
    /// Majority threshold: a phase has a quorum once its OK count exceeds
    /// this value.
    #[inline]
    fn half(&self) -> u8 {
        self.population / 2
    }

    /// Sends `req` to every other node through the worker pool. Returns the
    /// receiver that each call's outcome is delivered to. A REJECT reply
    /// applies its ballot through `become_follower()` inside the worker,
    /// even if the coordinator has stopped listening by then.
    fn fanout(
        self: &Arc<Self>,
        req: PeerRequest,
    ) -> mpsc::Receiver<(ReplicaId, Result<PeerReply, ReplicantError>)> {
        let (tx_reply, rx_reply) = mpsc::channel(self.population as usize);

        for peer in &self.peers {
            let paxos = self.clone();
            let peer = peer.clone();
            let req = req.clone();
            let tx_reply = tx_reply.clone();

            self.pool.submit(async move {
                let reply =
                    match time::timeout(paxos.rpc_timeout, peer.client.call(req))
                        .await
                    {
                        Ok(reply) => reply,
                        Err(_) => Err(ReplicantError::msg("rpc timed out")),
                    };

                match reply {
                    Ok(ref reply) => {
                        pf_trace!("reply <- {} {:?}", peer.id, reply);
                        if let Some(ballot) = reply.rejected_ballot() {
                            paxos.become_follower(ballot);
                        }
                    }
                    Err(ref e) => {
                        pf_debug!("rpc connection failed to {}: {}",
                                  peer.id, e);
                    }
                }

                // coordinator may have returned already
                let _ = tx_reply.send((peer.id, reply)).await;
            });
        }

        rx_reply
    }

    /// Waits for the next fan-out event.
    async fn next_event(
        rx_reply: &mut mpsc::Receiver<(
            ReplicaId,
            Result<PeerReply, ReplicantError>,
        )>,
        rx_ballot: &mut watch::Receiver<Ballot>,
    ) -> FanoutEvent {
        tokio::select! {
            event = rx_reply.recv() => match event {
                Some((peer, reply)) => FanoutEvent::Reply(peer, reply),
                None => FanoutEvent::Exhausted,
            },
            Ok(()) = rx_ballot.changed() => FanoutEvent::BallotChanged,
        }
    }

    /// Client entry point: replicates `command` if I am the leader.
    pub async fn replicate(
        self: &Arc<Self>,
        command: Command,
        client_id: ClientId,
    ) -> MultiPaxosResult {
        let ballot = self.ballot();
        if is_leader(ballot, self.id) {
            let index = self.log.advance_last_index();
            return self
                .run_accept_phase(ballot, index, command, client_id)
                .await;
        }
        if is_someone_else_leader(ballot, self.id) {
            return MultiPaxosResult::SomeoneElseLeader(extract_leader_id(
                ballot,
            ));
        }
        MultiPaxosResult::Retry
    }
}

#[cfg(test)]
mod ballot_tests {
    use super::*;

    #[test]
    fn ballot_encoding() {
        assert_eq!(extract_leader_id(MAX_NUM_PEERS), 15);
        assert!(!is_leader(MAX_NUM_PEERS, 0));
        assert!(!is_someone_else_leader(MAX_NUM_PEERS, 0));

        let ballot = 2 * ROUND_INCREMENT + 1;
        assert_eq!(extract_leader_id(ballot), 1);
        assert!(is_leader(ballot, 1));
        assert!(is_someone_else_leader(ballot, 0));
        assert!(!is_someone_else_leader(ballot, 1));
    }

    #[test]
    fn config_parse_and_validate() -> Result<(), ReplicantError> {
        let config = ReplicaConfigMultiPaxos::from_toml(Some(
            "peers = ['127.0.0.1:10000', '127.0.0.1:11000', '127.0.0.1:12000']\n\
             commit_interval_ms = 50",
        ))?;
        assert_eq!(config.peers.len(), 3);
        assert_eq!(config.commit_interval_ms, 50);
        assert_eq!(config.threadpool_size, 8);
        config.validate(2)?;
        assert!(config.validate(3).is_err());

        let empty = ReplicaConfigMultiPaxos::from_toml(None)?;
        assert!(empty.validate(0).is_err());
        assert!(ReplicaConfigMultiPaxos::from_toml(Some("bogus = 1")).is_err());
        Ok(())
    }

    #[test]
    fn too_many_peers() -> Result<(), ReplicantError> {
        let config = ReplicaConfigMultiPaxos {
            peers: (0..16).map(|p| format!("127.0.0.1:{}", 20000 + p)).collect(),
            ..Default::default()
        };
        assert!(config.validate(0).is_err());
        Ok(())
    }
}
