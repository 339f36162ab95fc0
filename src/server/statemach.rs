//! Replicant key-value state machine implementation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Command to the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Get the value of given key.
    Get { key: String },

    /// Put a new value into key.
    Put { key: String, value: String },

    /// Delete the given key.
    Del { key: String },
}

/// Command execution result returned by the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    /// `Some(value)` if key is found in state machine, else `None`.
    Get { value: Option<String> },

    /// `Some(old_value)` if key was in state machine, else `None`.
    Put { old_value: Option<String> },

    /// `Some(old_value)` if key was in state machine, else `None`.
    Del { old_value: Option<String> },
}

/// The local volatile state machine, which is simply an in-memory HashMap
/// from `String` key -> `String` value.
#[derive(Debug, Default)]
pub struct KvStore {
    state: HashMap<String, String>,
}

impl KvStore {
    /// Creates a new empty key-value store.
    pub fn new() -> Self {
        KvStore {
            state: HashMap::new(),
        }
    }

    /// Executes given command on the state machine state.
    pub fn execute(&mut self, cmd: &Command) -> CommandResult {
        match cmd {
            Command::Get { key } => CommandResult::Get {
                value: self.state.get(key).cloned(),
            },
            Command::Put { key, value } => CommandResult::Put {
                old_value: self.state.insert(key.clone(), value.clone()),
            },
            Command::Del { key } => CommandResult::Del {
                old_value: self.state.remove(key),
            },
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}
