//! Replicant unary request/reply RPC transport over TCP.
//!
//! Every frame on the wire is a big-endian `u64` length followed by the
//! MessagePack encoding of the object. A connection carries a strictly
//! alternating sequence of request -> reply frames.

use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::server::ReplicaId;
use crate::utils::ReplicantError;

use async_trait::async_trait;

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Max number of idle connections kept per peer.
const MAX_IDLE_CONNS: usize = 8;

/// Writes an object as one frame.
pub(crate) async fn write_frame<T, W>(
    obj: &T,
    conn_write: &mut W,
) -> Result<(), ReplicantError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    Ok(())
}

/// Reads one frame and decodes the object in it.
pub(crate) async fn read_frame<T, R>(
    conn_read: &mut R,
) -> Result<T, ReplicantError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let obj_len = conn_read.read_u64().await?; // receive length first
    let mut obj_buf: Vec<u8> = vec![0; obj_len as usize];
    conn_read.read_exact(&mut obj_buf[..]).await?;
    let obj = decode_from_slice(&obj_buf)?;
    Ok(obj)
}

/// Client side of a unary RPC service towards one peer.
#[async_trait]
pub trait RpcClient<Req, Rep>: Send + Sync {
    /// Sends a request and waits for its reply. Any transport failure is
    /// returned as an error.
    async fn call(&self, req: Req) -> Result<Rep, ReplicantError>;
}

/// Server side of a unary RPC service.
pub trait RpcHandler: Send + Sync + 'static {
    type Req: fmt::Debug + DeserializeOwned + Send + 'static;
    type Rep: fmt::Debug + Serialize + Send + Sync + 'static;

    /// Handles one request, producing its reply.
    fn handle(&self, req: Self::Req) -> Self::Rep;
}

/// TCP implementation of `RpcClient`. Connections are made lazily and kept
/// for reuse after each successful call.
pub struct TcpRpcClient<Req, Rep> {
    /// My replica ID.
    me: ReplicaId,

    /// Peer's address string.
    addr: String,

    /// Idle connections ready for the next call.
    idle_conns: Mutex<Vec<TcpStream>>,

    _marker: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep> TcpRpcClient<Req, Rep> {
    /// Creates a new client towards `addr`. Does not connect yet.
    pub fn new(me: ReplicaId, addr: impl ToString) -> Self {
        TcpRpcClient {
            me,
            addr: addr.to_string(),
            idle_conns: Mutex::new(vec![]),
            _marker: PhantomData,
        }
    }

    fn take_idle(&self) -> Option<TcpStream> {
        self.idle_conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn put_idle(&self, conn: TcpStream) {
        let mut idle_conns = self
            .idle_conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if idle_conns.len() < MAX_IDLE_CONNS {
            idle_conns.push(conn);
        }
    }
}

impl<Req, Rep> fmt::Debug for TcpRpcClient<Req, Rep> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TcpRpcClient({} -> {})", self.me, self.addr)
    }
}

#[async_trait]
impl<Req, Rep> RpcClient<Req, Rep> for TcpRpcClient<Req, Rep>
where
    Req: fmt::Debug + Serialize + Send + Sync + 'static,
    Rep: fmt::Debug + DeserializeOwned + Send + Sync + 'static,
{
    async fn call(&self, req: Req) -> Result<Rep, ReplicantError> {
        let mut conn = match self.take_idle() {
            Some(conn) => conn,
            None => {
                let conn = TcpStream::connect(&self.addr).await?;
                conn.set_nodelay(true)?;
                pf_debug!("connected to peer at {}", self.addr);
                conn
            }
        };

        // a connection that failed midway is dropped, not reused
        write_frame(&req, &mut conn).await?;
        let reply: Rep = read_frame(&mut conn).await?;
        pf_trace!("call {} {:?} -> {:?}", self.addr, req, reply);

        self.put_idle(conn);
        Ok(reply)
    }
}

/// TCP RPC server serving one `RpcHandler`.
#[derive(Debug)]
pub struct RpcServer {
    /// Actual bound address.
    local_addr: SocketAddr,

    /// Sender side of the stop signal, watched by all servant threads.
    tx_stop: watch::Sender<bool>,

    /// Join handle of the connection acceptor thread.
    acceptor_handle: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Binds to `addr` and spawns the connection acceptor thread.
    pub async fn new_and_setup<H>(
        addr: SocketAddr,
        handler: Arc<H>,
    ) -> Result<Self, ReplicantError>
    where
        H: RpcHandler,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx_stop, rx_stop) = watch::channel(false);

        let acceptor_handle = tokio::spawn(Self::acceptor_thread(
            listener, handler, rx_stop,
        ));
        pf_debug!("rpc server listening on {}", local_addr);

        Ok(RpcServer {
            local_addr,
            tx_stop,
            acceptor_handle: Some(acceptor_handle),
        })
    }

    /// Address the server actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and signals all servant threads to exit.
    pub async fn stop(&mut self) -> Result<(), ReplicantError> {
        pf_debug!("stopping rpc server at {}", self.local_addr);
        self.tx_stop.send_replace(true);
        if let Some(handle) = self.acceptor_handle.take() {
            handle.await?;
        }
        Ok(())
    }

    /// Connection acceptor thread function.
    async fn acceptor_thread<H>(
        listener: TcpListener,
        handler: Arc<H>,
        mut rx_stop: watch::Receiver<bool>,
    ) where
        H: RpcHandler,
    {
        pf_debug!("rpc acceptor thread spawned");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                pf_warn!("error setting nodelay: {}", e);
                            }
                            tokio::spawn(Self::servant_thread(
                                addr,
                                stream,
                                handler.clone(),
                                rx_stop.clone(),
                            ));
                        }
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                        }
                    }
                },

                _ = rx_stop.changed() => break,
            }
        }

        pf_debug!("rpc acceptor thread exitted");
    }

    /// Per-connection servant thread function.
    async fn servant_thread<H>(
        addr: SocketAddr,
        mut conn: TcpStream,
        handler: Arc<H>,
        mut rx_stop: watch::Receiver<bool>,
    ) where
        H: RpcHandler,
    {
        pf_trace!("rpc servant thread for {} spawned", addr);
        if *rx_stop.borrow() {
            return;
        }

        loop {
            let req: H::Req = tokio::select! {
                req = read_frame(&mut conn) => match req {
                    Ok(req) => req,
                    Err(_) => break, // peer closed the connection
                },
                _ = rx_stop.changed() => break,
            };

            let reply = handler.handle(req);
            if let Err(e) = write_frame(&reply, &mut conn).await {
                pf_debug!("error replying to {}: {}", addr, e);
                break;
            }
        }

        pf_trace!("rpc servant thread for {} exitted", addr);
    }
}
