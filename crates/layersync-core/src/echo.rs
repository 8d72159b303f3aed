//! Echo guard
//!
//! Every write the adapter sends to one side is eventually reported back by
//! that side's change notifications. The guard remembers those writes so the
//! confirmation is dropped instead of being applied a second time.
//!
//! Records are keyed by the identifier the reporting side will use: the
//! remote id for writes sent to the remote store, the host id for mutations
//! applied to the host. A record that is never matched expires after the
//! TTL; the event is then processed as genuine, which costs at most one
//! redundant round trip.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::models::{LocalId, RemoteId};

/// Default time a pending echo is kept before being considered lost
pub const DEFAULT_ECHO_TTL: Duration = Duration::from_secs(5);

/// Identifier under which the counterpart side reports a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EchoKey {
    Local(LocalId),
    Remote(RemoteId),
}

impl fmt::Display for EchoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EchoKey::Local(id) => write!(f, "local {}", id),
            EchoKey::Remote(id) => write!(f, "remote {}", id),
        }
    }
}

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => write!(f, "insert"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// A pending echo that was never matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredEcho {
    pub key: EchoKey,
    pub operation: Operation,
    pub age: Duration,
}

/// Tracks self-originated operations awaiting their echo
#[derive(Debug)]
pub struct EchoGuard {
    ttl: Duration,
    pending: HashMap<EchoKey, VecDeque<(Operation, Instant)>>,
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_TTL)
    }
}

impl EchoGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: HashMap::new(),
        }
    }

    /// Record that the next `operation` reported under `key` is self-caused
    pub fn expect(&mut self, key: EchoKey, operation: Operation, now: Instant) {
        self.pending
            .entry(key)
            .or_default()
            .push_back((operation, now));
    }

    /// Consume a pending echo
    ///
    /// Returns true if the event is an echo and must be discarded.
    pub fn consume(&mut self, key: EchoKey, operation: Operation, now: Instant) -> bool {
        let Some(ops) = self.pending.get_mut(&key) else {
            return false;
        };

        let ttl = self.ttl;
        ops.retain(|(_, at)| now.duration_since(*at) < ttl);

        let matched = match ops.iter().position(|(op, _)| *op == operation) {
            Some(index) => {
                ops.remove(index);
                true
            }
            None => false,
        };

        if ops.is_empty() {
            self.pending.remove(&key);
        }
        matched
    }

    /// Whether an echo is pending for this key, whatever the operation
    pub fn is_pending(&self, key: &EchoKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Withdraw the oldest pending `operation` for a key
    ///
    /// Used when one outbound request failed: its echo will never come, but
    /// records of later requests for the same key stay in place.
    pub fn cancel(&mut self, key: EchoKey, operation: Operation) -> bool {
        let Some(ops) = self.pending.get_mut(&key) else {
            return false;
        };
        let removed = match ops.iter().position(|(op, _)| *op == operation) {
            Some(index) => ops.remove(index).is_some(),
            None => false,
        };
        if ops.is_empty() {
            self.pending.remove(&key);
        }
        removed
    }

    /// Drop every pending operation for a key
    pub fn forget(&mut self, key: &EchoKey) -> usize {
        self.pending.remove(key).map(|ops| ops.len()).unwrap_or(0)
    }

    /// Remove expired records
    pub fn expire(&mut self, now: Instant) -> Vec<ExpiredEcho> {
        let ttl = self.ttl;
        let mut expired = Vec::new();

        self.pending.retain(|key, ops| {
            ops.retain(|(operation, at)| {
                let age = now.duration_since(*at);
                if age >= ttl {
                    expired.push(ExpiredEcho {
                        key: *key,
                        operation: *operation,
                        age,
                    });
                    false
                } else {
                    true
                }
            });
            !ops.is_empty()
        });

        expired
    }

    /// Number of pending operations across all keys
    pub fn pending(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
