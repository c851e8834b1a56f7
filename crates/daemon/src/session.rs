//! Sharded store of in-flight handshake sessions.
//!
//! Sessions are partitioned across sixteen independently locked shards by
//! `policy_id % 16`, so packets for different policies almost never contend
//! on the same mutex. A session lives in exactly one shard, and a caller
//! holds at most one shard lock at a time; shard locks are never held across
//! a send or any other syscall.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::error::{NegotioError, Result};
use crate::hash::KEY_SIZE;
use crate::packet::{Packet, NONCE_SIZE};

/// Number of independent session shards.
pub const NUM_SHARDS: usize = 16;

/// Progress of one handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    /// Initiator sent R1 and waits for the responder nonce.
    WaitR2,
    /// Responder sent R2 and waits for confirmation.
    WaitConfirm,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

/// In-memory record of one in-flight handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub policy_id: u32,
    pub state: SessionState,
    pub r1: Option<[u8; NONCE_SIZE]>,
    pub r2: Option<[u8; NONCE_SIZE]>,
    pub key: Option<[u8; KEY_SIZE]>,
    pub start_time: Instant,
    /// Peer captured at session creation.
    pub peer: SocketAddr,
    /// Last packet this side emitted, kept for bounded retransmission.
    pub last_sent: Option<Packet>,
    pub retransmits: u32,
}

impl Session {
    pub fn new(policy_id: u32, peer: SocketAddr) -> Self {
        Self {
            policy_id,
            state: SessionState::Init,
            r1: None,
            r2: None,
            key: None,
            start_time: Instant::now(),
            peer,
            last_sent: None,
            retransmits: 0,
        }
    }

    /// Milliseconds elapsed since the session was created.
    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.start_time).as_millis() as u64
    }
}

/// Sharded session map.
pub struct SessionStore {
    shards: [Mutex<HashMap<u32, Session>>; NUM_SHARDS],
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    /// The shard a policy id hashes to.
    pub fn shard_index(policy_id: u32) -> usize {
        policy_id as usize % NUM_SHARDS
    }

    fn shard(&self, policy_id: u32) -> MutexGuard<'_, HashMap<u32, Session>> {
        self.shards[Self::shard_index(policy_id)]
            .lock()
            .expect("session shard mutex poisoned")
    }

    /// Insert or replace a session.
    pub fn insert(&self, session: Session) {
        self.shard(session.policy_id)
            .insert(session.policy_id, session);
    }

    /// Insert only when no session exists for the id yet.
    pub fn insert_if_absent(&self, session: Session) -> bool {
        let mut shard = self.shard(session.policy_id);
        if shard.contains_key(&session.policy_id) {
            return false;
        }
        shard.insert(session.policy_id, session);
        true
    }

    /// Value copy of a session, if present.
    pub fn get_copy(&self, policy_id: u32) -> Option<Session> {
        self.shard(policy_id).get(&policy_id).cloned()
    }

    /// Apply `f` to the session under its shard lock.
    ///
    /// `f` may reject the transition by returning an error; a missing
    /// session reports `InvalidParameter`.
    pub fn update<T>(&self, policy_id: u32, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut shard = self.shard(policy_id);
        let session = shard
            .get_mut(&policy_id)
            .ok_or(NegotioError::InvalidParameter)?;
        f(session)
    }

    /// Remove a session. Returns true if an entry was present.
    pub fn remove(&self, policy_id: u32) -> bool {
        self.shard(policy_id).remove(&policy_id).is_some()
    }

    /// Total live sessions across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("session shard mutex poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live sessions in one shard.
    pub fn shard_len(&self, index: usize) -> usize {
        self.shards[index]
            .lock()
            .expect("session shard mutex poisoned")
            .len()
    }

    /// Value copies of every live session, taken one shard lock at a time.
    /// The maintenance sweep works off this snapshot so it never holds a
    /// shard lock while resolving policies or sending.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().expect("session shard mutex poisoned");
            sessions.extend(guard.values().cloned());
        }
        sessions
    }
}
