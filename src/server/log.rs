//! Replicant replicated instance log implementation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::server::{Command, CommandResult, KvStore};

use serde::{Deserialize, Serialize};

use tokio::sync::Notify;

/// Ballot number type. Low 8 bits hold the proposer's ID.
pub type Ballot = u64;

/// Log slot index type. Index 0 is never used for an instance.
pub type LogIndex = u64;

/// Client ID type.
pub type ClientId = u64;

/// Instance status enum, ordered by how advanced the state is.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize,
)]
pub enum InstanceState {
    InProgress,
    Committed,
    Executed,
}

/// One slot of the replicated log.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub ballot: Ballot,
    pub index: LogIndex,
    pub client_id: ClientId,
    pub state: InstanceState,
    pub command: Command,
}

impl Instance {
    /// Creates a new in-progress instance.
    pub fn new(
        ballot: Ballot,
        index: LogIndex,
        client_id: ClientId,
        command: Command,
    ) -> Self {
        Instance {
            ballot,
            index,
            client_id,
            state: InstanceState::InProgress,
            command,
        }
    }

    #[inline]
    pub fn is_in_progress(&self) -> bool {
        self.state == InstanceState::InProgress
    }

    #[inline]
    pub fn is_committed(&self) -> bool {
        self.state == InstanceState::Committed
    }

    #[inline]
    pub fn is_executed(&self) -> bool {
        self.state == InstanceState::Executed
    }
}

/// Ordered map from slot index -> instance.
pub type LogMap = BTreeMap<LogIndex, Instance>;

/// Merges `instance` into `log`. An existing committed or executed instance
/// always wins; otherwise the instance with the higher ballot wins, and on a
/// ballot tie the more advanced state wins. Returns true only if a new slot
/// got created.
pub fn insert(log: &mut LogMap, instance: Instance) -> bool {
    match log.get_mut(&instance.index) {
        None => {
            log.insert(instance.index, instance);
            true
        }
        Some(existing) => {
            if existing.is_committed() || existing.is_executed() {
                debug_assert_eq!(existing.command, instance.command);
                return false;
            }
            if instance.ballot > existing.ballot
                || (instance.ballot == existing.ballot
                    && instance.state > existing.state)
            {
                *existing = instance;
            }
            false
        }
    }
}

/// Log state protected by the log's mutex.
#[derive(Debug)]
struct LogState {
    /// False once the log is stopped; wakes up the executor for exit.
    running: bool,

    /// State machine that executed instances get applied to.
    kv_store: KvStore,

    /// Map from index -> instance, only holding indices above the global
    /// execution watermark.
    log: LogMap,

    /// Largest index assigned or heard of.
    last_index: LogIndex,

    /// Index of the last executed instance on this node.
    last_executed: LogIndex,

    /// Index below which every node has executed; trimmed from `log`.
    global_last_executed: LogIndex,
}

impl LogState {
    /// Returns true if the instance right after `last_executed` is committed.
    fn is_executable(&self) -> bool {
        self.log
            .get(&(self.last_executed + 1))
            .is_some_and(|inst| inst.is_committed())
    }

    fn execute_next(&mut self) -> Option<(ClientId, CommandResult)> {
        let next = self.last_executed + 1;
        let inst = self.log.get_mut(&next)?;
        if !inst.is_committed() {
            return None;
        }
        let result = self.kv_store.execute(&inst.command);
        inst.state = InstanceState::Executed;
        self.last_executed = next;
        Some((inst.client_id, result))
    }
}

/// The replicated log of instances, safe for concurrent use by the leader
/// path, the follower RPC handlers, and the executor.
#[derive(Debug)]
pub struct Log {
    inner: Mutex<LogState>,

    /// Signalled whenever the next instance may have become executable.
    executable: Notify,
}

impl Default for Log {
    fn default() -> Self {
        Self::new(KvStore::new())
    }
}

// Log public API implementation
impl Log {
    /// Creates a new empty log applying executed commands to `kv_store`.
    pub fn new(kv_store: KvStore) -> Self {
        Log {
            inner: Mutex::new(LogState {
                running: true,
                kv_store,
                log: LogMap::new(),
                last_index: 0,
                last_executed: 0,
                global_last_executed: 0,
            }),
            executable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_executed(&self) -> LogIndex {
        self.lock().last_executed
    }

    pub fn global_last_executed(&self) -> LogIndex {
        self.lock().global_last_executed
    }

    pub fn last_index(&self) -> LogIndex {
        self.lock().last_index
    }

    pub fn set_last_index(&self, last_index: LogIndex) {
        let mut state = self.lock();
        state.last_index = state.last_index.max(last_index);
    }

    /// Assigns and returns the next free index.
    pub fn advance_last_index(&self) -> LogIndex {
        let mut state = self.lock();
        state.last_index += 1;
        state.last_index
    }

    /// Stops the log, waking up any pending `execute()` call.
    pub fn stop(&self) {
        self.lock().running = false;
        self.executable.notify_waiters();
    }

    /// Appends an instance, merging with whatever the slot already holds.
    /// Instances at or below the global execution watermark are ignored.
    pub fn append(&self, instance: Instance) {
        let mut state = self.lock();
        let index = instance.index;
        if index <= state.global_last_executed {
            return;
        }
        if insert(&mut state.log, instance) {
            state.last_index = state.last_index.max(index);
        }
        if state.is_executable() {
            self.executable.notify_waiters();
        }
    }

    /// Marks the instance at `index` as committed.
    pub fn commit(&self, index: LogIndex) {
        debug_assert!(index > 0);
        let mut state = self.lock();
        match state.log.get_mut(&index) {
            Some(inst) => {
                if inst.is_in_progress() {
                    inst.state = InstanceState::Committed;
                }
            }
            None => return,
        }
        if state.is_executable() {
            self.executable.notify_waiters();
        }
    }

    /// Commits every consecutive instance after my last executed one up to
    /// `leader_last_executed` that was accepted under `ballot`.
    pub fn commit_until(&self, leader_last_executed: LogIndex, ballot: Ballot) {
        let mut state = self.lock();
        for i in (state.last_executed + 1)..=leader_last_executed {
            let Some(inst) = state.log.get_mut(&i) else {
                break;
            };
            if inst.ballot == ballot && inst.is_in_progress() {
                inst.state = InstanceState::Committed;
            }
        }
        if state.is_executable() {
            self.executable.notify_waiters();
        }
    }

    /// Discards executed instances up to `leader_global_last_executed`.
    pub fn trim_until(&self, leader_global_last_executed: LogIndex) {
        let mut state = self.lock();
        while state.global_last_executed < leader_global_last_executed {
            let next = state.global_last_executed + 1;
            match state.log.get(&next) {
                Some(inst) if inst.is_executed() => {
                    state.log.remove(&next);
                    state.global_last_executed = next;
                }
                _ => break,
            }
        }
    }

    /// Waits until the next instance is committed, executes it, and returns
    /// its client ID and result. Returns `None` once the log is stopped.
    pub async fn execute(&self) -> Option<(ClientId, CommandResult)> {
        loop {
            let notified = self.executable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if !state.running {
                    return None;
                }
                if let Some(executed) = state.execute_next() {
                    return Some(executed);
                }
            }

            notified.await;
        }
    }

    /// Snapshot of all instances currently held.
    pub fn get_log(&self) -> LogMap {
        self.lock().log.clone()
    }

    /// Instances between the global watermark and the last index, in order.
    pub fn instances(&self) -> Vec<Instance> {
        let state = self.lock();
        if state.last_index <= state.global_last_executed {
            return vec![];
        }
        state
            .log
            .range((state.global_last_executed + 1)..=state.last_index)
            .map(|(_, inst)| inst.clone())
            .collect()
    }

    /// Gets a copy of the instance at `index`, if held.
    pub fn at(&self, index: LogIndex) -> Option<Instance> {
        self.lock().log.get(&index).cloned()
    }
}
