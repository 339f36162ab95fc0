//! Replicant's server functionality modules.

mod external;
mod log;
mod pool;
mod statemach;
mod transport;

/// Server replica ID type.
pub type ReplicaId = u8;

pub use external::ExternalApi;
pub use self::log::{
    insert, Ballot, ClientId, Instance, InstanceState, Log, LogIndex, LogMap,
};
pub use pool::FanoutPool;
pub use statemach::{Command, CommandResult, KvStore};
pub use transport::{RpcClient, RpcHandler, RpcServer, TcpRpcClient};
