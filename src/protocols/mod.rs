//! Replicant's replication protocols.

pub mod multipaxos;
