//! Replicant server external API module implementation.
//!
//! Clients talk a line-oriented text protocol over TCP, one command per line:
//! `get <key>`, `put <key> <value>`, or `del <key>`. Each command is
//! submitted under a fresh client ID unique across the cluster, so a result
//! that shows up after its command gave up finds no one waiting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocols::multipaxos::{MultiPaxos, MultiPaxosResult};
use crate::server::{ClientId, Command, CommandResult, ReplicaId};
use crate::utils::ReplicantError;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Map from client ID -> sender side of the result slot its command is
/// waiting on.
#[derive(Debug, Default)]
struct PendingResults {
    waiting: Mutex<HashMap<ClientId, oneshot::Sender<CommandResult>>>,
}

impl PendingResults {
    fn lock(
        &self,
    ) -> MutexGuard<'_, HashMap<ClientId, oneshot::Sender<CommandResult>>>
    {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The external client-facing API module.
pub struct ExternalApi {
    /// My replica ID.
    me: ReplicaId,

    /// Number of nodes in the cluster, used as the client ID stride.
    population: u8,

    /// Consensus engine that commands are submitted to.
    paxos: Arc<MultiPaxos>,

    /// Connections waiting for their command's execution result.
    pending: Arc<PendingResults>,

    /// Number of client IDs handed out so far.
    num_clients: AtomicU64,

    /// Sender side of the stop signal, watched by all client threads.
    tx_stop: watch::Sender<bool>,

    /// Join handle of the client acceptor thread.
    client_acceptor_handle: Mutex<Option<JoinHandle<()>>>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module.
    pub fn new(me: ReplicaId, population: u8, paxos: Arc<MultiPaxos>) -> Self {
        let (tx_stop, _) = watch::channel(false);
        ExternalApi {
            me,
            population,
            paxos,
            pending: Arc::new(PendingResults::default()),
            num_clients: AtomicU64::new(0),
            tx_stop,
            client_acceptor_handle: Mutex::new(None),
        }
    }

    /// Binds to `api_addr` and spawns the client acceptor thread. Returns
    /// the address actually bound.
    pub async fn setup(
        self: &Arc<Self>,
        api_addr: SocketAddr,
    ) -> Result<SocketAddr, ReplicantError> {
        if self.lock_handle().is_some() {
            return logged_err!("setup already done");
        }

        let client_listener = TcpListener::bind(api_addr).await?;
        let local_addr = client_listener.local_addr()?;
        pf_info!("accepting clients on '{}'", local_addr);

        let handle = tokio::spawn(
            self.clone()
                .client_acceptor_thread(client_listener, self.tx_stop.subscribe()),
        );
        *self.lock_handle() = Some(handle);
        Ok(local_addr)
    }

    /// Hands the execution result of a command to the connection waiting on
    /// `client`, if any. Results nobody waits on are dropped.
    pub fn deliver(&self, client: ClientId, result: CommandResult) {
        let Some(tx_result) = self.pending.lock().remove(&client) else {
            return;
        };
        if tx_result.send(result).is_err() {
            pf_debug!("client {} left before its result", client);
        }
    }

    /// Stops accepting clients and signals all client threads to exit.
    pub async fn stop(&self) -> Result<(), ReplicantError> {
        self.tx_stop.send_replace(true);
        let handle = self.lock_handle().take();
        if let Some(handle) = handle {
            handle.await?;
        }
        self.pending.lock().clear();
        Ok(())
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.client_acceptor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Next cluster-wide unique client ID: my ID plus a multiple of the
    /// cluster size.
    fn next_client_id(&self) -> ClientId {
        let k = self.num_clients.fetch_add(1, Ordering::SeqCst);
        self.me as ClientId + k * self.population as ClientId
    }
}

// ExternalApi client_acceptor thread implementation
impl ExternalApi {
    /// Client acceptor thread function.
    async fn client_acceptor_thread(
        self: Arc<Self>,
        client_listener: TcpListener,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_debug!("client_acceptor thread spawned");

        loop {
            tokio::select! {
                accepted = client_listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!("error accepting client connection: {}", e);
                            continue;
                        }
                    };
                    pf_debug!("accepted new client {}", addr);
                    tokio::spawn(self.clone().client_servant_thread(
                        addr,
                        stream,
                        rx_stop.clone(),
                    ));
                },

                _ = rx_stop.changed() => break,
            }
        }

        pf_debug!("client_acceptor thread exitted");
    }
}

/// Parses one request line into a command.
fn parse_command(line: &str) -> Option<Command> {
    let mut tokens = line.split_whitespace();
    let cmd = match (tokens.next()?, tokens.next(), tokens.next()) {
        ("get", Some(key), None) => Command::Get { key: key.into() },
        ("put", Some(key), Some(value)) => Command::Put {
            key: key.into(),
            value: value.into(),
        },
        ("del", Some(key), None) => Command::Del { key: key.into() },
        _ => return None,
    };
    if tokens.next().is_some() {
        return None;
    }
    Some(cmd)
}

/// Renders an execution result as the reply line.
fn render_result(result: &CommandResult) -> String {
    match result {
        CommandResult::Get { value: Some(value) } => value.clone(),
        CommandResult::Put { .. } => "ok".into(),
        CommandResult::Del { old_value: Some(_) } => "ok".into(),
        CommandResult::Get { value: None }
        | CommandResult::Del { old_value: None } => "key not found".into(),
    }
}

// ExternalApi client_servant thread implementation
impl ExternalApi {
    /// Submits one command and waits for the reply line to send back.
    async fn serve_command(&self, cmd: Command) -> String {
        let id = self.next_client_id();
        let (tx_result, rx_result) = oneshot::channel();
        self.pending.lock().insert(id, tx_result);

        match self.paxos.replicate(cmd, id).await {
            MultiPaxosResult::Ok => match rx_result.await {
                Ok(result) => render_result(&result),
                Err(_) => "retry".into(),
            },
            MultiPaxosResult::Retry => {
                self.pending.lock().remove(&id);
                "retry".into()
            }
            MultiPaxosResult::SomeoneElseLeader(leader) => {
                self.pending.lock().remove(&id);
                format!("leader is {}", leader)
            }
        }
    }

    /// Client request listener and reply sender thread function.
    async fn client_servant_thread(
        self: Arc<Self>,
        addr: SocketAddr,
        mut conn: TcpStream,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_debug!("client_servant thread for {} spawned", addr);

        let (conn_read, mut conn_write) = conn.split();
        let mut lines = BufReader::new(conn_read).lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = rx_stop.changed() => break,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break, // client left
                Err(e) => {
                    pf_warn!("error reading from client {}: {}", addr, e);
                    break;
                }
            };

            let reply = match parse_command(&line) {
                Some(cmd) => {
                    tokio::select! {
                        reply = self.serve_command(cmd) => reply,
                        _ = rx_stop.changed() => break,
                    }
                }
                None => "bad command".into(),
            };
            pf_trace!("replying to {}: {}", addr, reply);

            if let Err(e) =
                conn_write.write_all(format!("{}\n", reply).as_bytes()).await
            {
                pf_warn!("error replying to {}: {}", addr, e);
                break;
            }
        }

        pf_debug!("client_servant thread for {} exitted", addr);
    }
}
