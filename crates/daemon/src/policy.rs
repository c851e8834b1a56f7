//! Bounded registry of negotiation policies.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Mutex, MutexGuard};

use serde::Deserialize;

/// Maximum number of concurrently configured policies.
pub const MAX_POLICIES: usize = 4096;

/// Session timeout applied when a policy does not specify one.
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Retransmission budget applied when a policy does not specify one.
pub const DEFAULT_RETRY_TIMES: u32 = 3;

/// An administratively configured intent to negotiate with one peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub policy_id: u32,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
}

fn default_timeout_ms() -> u32 {
    DEFAULT_TIMEOUT_MS
}

fn default_retry_times() -> u32 {
    DEFAULT_RETRY_TIMES
}

impl PolicyConfig {
    /// The peer this policy negotiates against.
    pub fn peer_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.remote_ip, self.remote_port))
    }
}

/// Thread-safe policy registry keyed by policy id.
///
/// A single mutex is adequate here: the store is touched once per control
/// command and once per maintenance sweep, never on the datagram hot path.
#[derive(Default)]
pub struct PolicyStore {
    policies: Mutex<HashMap<u32, PolicyConfig>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            policies: Mutex::new(HashMap::with_capacity(MAX_POLICIES)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, PolicyConfig>> {
        self.policies.lock().expect("policy store mutex poisoned")
    }

    /// Insert a policy. Returns false on a duplicate id or a full store.
    pub fn add(&self, config: PolicyConfig) -> bool {
        let mut policies = self.lock();
        if policies.len() >= MAX_POLICIES || policies.contains_key(&config.policy_id) {
            return false;
        }
        policies.insert(config.policy_id, config);
        true
    }

    /// Remove a policy. Returns true if an entry was present.
    pub fn remove(&self, policy_id: u32) -> bool {
        self.lock().remove(&policy_id).is_some()
    }

    pub fn contains(&self, policy_id: u32) -> bool {
        self.lock().contains_key(&policy_id)
    }

    /// Value copy of a policy, if configured.
    pub fn get(&self, policy_id: u32) -> Option<PolicyConfig> {
        self.lock().get(&policy_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
