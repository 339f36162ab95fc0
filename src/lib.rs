//! Replicant: a key-value store replicated with MultiPaxos.

#[macro_use]
mod utils;

mod protocols;
mod replicant;
mod server;

pub use crate::replicant::{client_addr_of, Replicant};

pub use crate::protocols::multipaxos::{
    extract_leader_id, is_leader, is_someone_else_leader, MultiPaxos,
    MultiPaxosResult, Peer, PeerReply, PeerRequest, ReplicaConfigMultiPaxos,
    ResponseType, ID_BITS, MAX_NUM_PEERS, ROUND_INCREMENT,
};

pub use crate::server::{
    Ballot, ClientId, Command, CommandResult, ExternalApi, Instance,
    InstanceState, KvStore, Log, LogIndex, ReplicaId, RpcClient, RpcHandler,
    RpcServer, TcpRpcClient,
};

pub use crate::utils::{logger_init, ReplicantError, ME};
