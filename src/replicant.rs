//! Replicant server node: the replicated log, the MultiPaxos engine driving
//! it, the executor applying committed commands, and the client-facing API.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::protocols::multipaxos::{MultiPaxos, ReplicaConfigMultiPaxos};
use crate::server::{ExternalApi, KvStore, Log, ReplicaId};
use crate::utils::ReplicantError;

use tokio::task::JoinHandle;

/// Client-facing address of a node: its peer address with the port plus one.
pub fn client_addr_of(peer_addr: &str) -> Result<SocketAddr, ReplicantError> {
    let mut addr: SocketAddr = peer_addr.parse()?;
    let port = addr.port().checked_add(1).ok_or_else(|| {
        ReplicantError::msg(format!("no client port after '{}'", peer_addr))
    })?;
    addr.set_port(port);
    Ok(addr)
}

/// One server node of a Replicant cluster.
pub struct Replicant {
    /// My replica ID.
    id: ReplicaId,

    /// The replicated log, which owns the key-value state machine.
    log: Arc<Log>,

    /// The consensus engine.
    paxos: Arc<MultiPaxos>,

    /// The client-facing API.
    api: Arc<ExternalApi>,

    /// Address clients connect to.
    api_addr: SocketAddr,

    /// Join handle of the executor thread.
    executor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Replicant {
    /// Creates node `id` of the cluster described by `config`.
    pub fn new(
        id: ReplicaId,
        config: &ReplicaConfigMultiPaxos,
    ) -> Result<Self, ReplicantError> {
        config.validate(id)?;
        let api_addr = client_addr_of(&config.peers[id as usize])?;

        let log = Arc::new(Log::new(KvStore::new()));
        let paxos = Arc::new(MultiPaxos::new(id, log.clone(), config)?);
        let api = Arc::new(ExternalApi::new(
            id,
            config.peers.len() as u8,
            paxos.clone(),
        ));

        Ok(Replicant {
            id,
            log,
            paxos,
            api,
            api_addr,
            executor_handle: Mutex::new(None),
        })
    }

    /// The consensus engine of this node.
    pub fn paxos(&self) -> &Arc<MultiPaxos> {
        &self.paxos
    }

    /// Starts the consensus engine, the executor, and the client-facing
    /// API. Returns the address clients can connect to.
    pub async fn start(&self) -> Result<SocketAddr, ReplicantError> {
        pf_info!("starting node {}", self.id);
        self.paxos.start().await?;

        let handle = tokio::spawn(Self::executor_thread(
            self.log.clone(),
            self.api.clone(),
        ));
        *self
            .executor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        self.api.setup(self.api_addr).await
    }

    /// Stops the client-facing API, the consensus engine, and then the
    /// executor.
    pub async fn stop(&self) -> Result<(), ReplicantError> {
        pf_info!("stopping node {}", self.id);
        self.api.stop().await?;
        self.paxos.stop().await?;
        self.log.stop();

        let handle = self
            .executor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }

    /// Executor thread function: applies committed instances in log order
    /// and routes each result to the client waiting on it.
    async fn executor_thread(log: Arc<Log>, api: Arc<ExternalApi>) {
        pf_debug!("executor thread spawned");

        while let Some((client, result)) = log.execute().await {
            pf_trace!("executed for client {}: {:?}", client, result);
            api.deliver(client, result);
        }

        pf_debug!("executor thread exitted");
    }
}
