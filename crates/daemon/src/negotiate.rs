//! The handshake state machine.
//!
//! A negotiation is three datagrams: the initiator sends R1 (its 32-byte
//! nonce), the responder answers with R2 (its own nonce), and the initiator
//! confirms. Both sides derive the shared key as SHA-256(r1 ‖ r2).
//!
//! The negotiator never touches the transport directly; every emitted packet
//! goes through an injected [`PacketSink`], which keeps the state machine
//! deterministic under test. State mutation happens under a single shard
//! lock; the lock is released before any packet is handed to the sink.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{NegotioError, Result};
use crate::hash;
use crate::hash::KEY_SIZE;
use crate::metrics::Metrics;
use crate::packet::{Packet, PacketType, NONCE_SIZE};
use crate::policy::{PolicyStore, DEFAULT_RETRY_TIMES};
use crate::session::{Session, SessionState, SessionStore};

/// How long a finished session stays visible before the sweep evicts it.
const COMPLETED_LINGER: Duration = Duration::from_secs(3);

/// Consumer of outbound packets; implemented by the datagram endpoint and by
/// test doubles.
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, packet: &Packet, peer: SocketAddr) -> Result<()>;
}

/// Draw a fresh 32-byte nonce from the OS RNG.
///
/// RNG failure maps to `MemoryOrResource`; callers create no session in
/// that case.
pub fn generate_nonce() -> Result<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| NegotioError::MemoryOrResource)?;
    Ok(nonce)
}

/// The shared key: SHA-256 over the 64-byte concatenation r1 ‖ r2.
pub fn derive_key(r1: &[u8; NONCE_SIZE], r2: &[u8; NONCE_SIZE]) -> [u8; KEY_SIZE] {
    let mut concat = [0u8; NONCE_SIZE * 2];
    concat[..NONCE_SIZE].copy_from_slice(r1);
    concat[NONCE_SIZE..].copy_from_slice(r2);
    hash::sha256(&concat)
}

pub struct Negotiator {
    sessions: Arc<SessionStore>,
    metrics: Arc<Metrics>,
    sink: Arc<dyn PacketSink>,
}

/// Outcome of an R2 transition, resolved under the shard lock and acted on
/// after it is released.
enum R2Action {
    Complete { confirm: Packet, elapsed_ms: u64 },
    RepeatConfirm(Packet),
    Fail { elapsed_ms: u64 },
}

impl Negotiator {
    pub fn new(sessions: Arc<SessionStore>, metrics: Arc<Metrics>, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            sessions,
            metrics,
            sink,
        }
    }

    /// Begin a negotiation as initiator: create the session in `WaitR2` and
    /// emit R1 toward `peer`.
    pub fn start(&self, policy_id: u32, peer: SocketAddr) -> Result<()> {
        if policy_id == 0 {
            return Err(NegotioError::InvalidParameter);
        }
        let r1 = generate_nonce()?;

        let mut session = Session::new(policy_id, peer);
        session.state = SessionState::WaitR2;
        session.r1 = Some(r1);
        let packet = Packet::new(PacketType::R1, policy_id, &r1);
        session.last_sent = Some(packet.clone());
        // A fresh start replaces any stale session left by a removed policy.
        self.sessions.insert(session);

        debug!("initiating negotiation for policy {} with {}", policy_id, peer);
        self.sink.send_packet(&packet, peer)
    }

    /// Route one inbound packet through the state machine.
    pub fn handle(&self, packet: &Packet, peer: SocketAddr) -> Result<()> {
        let policy_id = packet.sequence;
        if policy_id == 0 {
            debug!("dropping packet with policy id 0 from {}", peer);
            return Err(NegotioError::InvalidParameter);
        }
        match packet.packet_type {
            PacketType::R1 => self.handle_r1(packet, peer, policy_id),
            PacketType::R2 => self.handle_r2(packet, peer, policy_id),
            PacketType::Confirm => self.handle_confirm(policy_id),
        }
    }

    /// R1 for an unknown policy makes us the responder; R1 for a policy we
    /// already track is a duplicate or a crossed handshake and is dropped.
    fn handle_r1(&self, packet: &Packet, peer: SocketAddr, policy_id: u32) -> Result<()> {
        if self.sessions.get_copy(policy_id).is_some() {
            debug!("duplicate R1 for policy {}, dropped", policy_id);
            return Ok(());
        }
        let Some(r1) = packet.nonce() else {
            return Err(NegotioError::InvalidParameter);
        };
        let r2 = generate_nonce()?;

        let mut session = Session::new(policy_id, peer);
        session.state = SessionState::WaitConfirm;
        session.r1 = Some(r1);
        session.r2 = Some(r2);
        session.key = Some(derive_key(&r1, &r2));
        let response = Packet::new(PacketType::R2, policy_id, &r2);
        session.last_sent = Some(response.clone());

        if !self.sessions.insert_if_absent(session) {
            // Another worker answered the same first R1 ahead of us.
            return Ok(());
        }
        debug!("responding to R1 for policy {} from {}", policy_id, peer);
        self.sink.send_packet(&response, peer)
    }

    fn handle_r2(&self, packet: &Packet, peer: SocketAddr, policy_id: u32) -> Result<()> {
        let nonce = packet.nonce();
        let now = Instant::now();
        let action = self.sessions.update(policy_id, |session| match session.state {
            SessionState::WaitR2 => match nonce {
                Some(r2) => {
                    let Some(r1) = session.r1 else {
                        return Err(NegotioError::NegotiationFailed);
                    };
                    session.r2 = Some(r2);
                    session.key = Some(derive_key(&r1, &r2));
                    session.state = SessionState::Done;
                    Ok(R2Action::Complete {
                        confirm: Packet::new(PacketType::Confirm, policy_id, &[]),
                        elapsed_ms: session.elapsed_ms(now),
                    })
                }
                None => {
                    session.state = SessionState::Failed;
                    Ok(R2Action::Fail {
                        elapsed_ms: session.elapsed_ms(now),
                    })
                }
            },
            // The confirm was lost and the responder retransmitted R2;
            // repeat the confirm without touching counters.
            SessionState::Done => Ok(R2Action::RepeatConfirm(Packet::new(
                PacketType::Confirm,
                policy_id,
                &[],
            ))),
            _ => Err(NegotioError::InvalidParameter),
        })?;

        match action {
            R2Action::Complete {
                confirm,
                elapsed_ms,
            } => {
                self.sink.send_packet(&confirm, peer)?;
                self.metrics.record(elapsed_ms, true);
                debug!(
                    "initiator negotiation complete for policy {} in {} ms",
                    policy_id, elapsed_ms
                );
                Ok(())
            }
            R2Action::RepeatConfirm(confirm) => self.sink.send_packet(&confirm, peer),
            R2Action::Fail { elapsed_ms } => {
                self.metrics.record(elapsed_ms, false);
                warn!("short R2 payload failed negotiation for policy {}", policy_id);
                Err(NegotioError::InvalidParameter)
            }
        }
    }

    fn handle_confirm(&self, policy_id: u32) -> Result<()> {
        let now = Instant::now();
        let elapsed_ms = self.sessions.update(policy_id, |session| match session.state {
            SessionState::WaitConfirm => {
                session.state = SessionState::Done;
                Ok(Some(session.elapsed_ms(now)))
            }
            // Duplicate confirm after completion.
            SessionState::Done => Ok(None),
            _ => Err(NegotioError::InvalidParameter),
        })?;

        if let Some(elapsed_ms) = elapsed_ms {
            self.metrics.record(elapsed_ms, true);
            debug!(
                "responder negotiation complete for policy {} in {} ms",
                policy_id, elapsed_ms
            );
        }
        Ok(())
    }

    /// Periodic maintenance, run once per telemetry tick.
    ///
    /// Works off a snapshot so that no shard lock is held while policies are
    /// resolved or packets are retransmitted. Expires sessions older than
    /// their policy's timeout, retransmits the last packet of a live session
    /// up to the policy's retry budget, and evicts finished sessions after a
    /// grace window.
    pub fn sweep(&self, policies: &PolicyStore, default_timeout: Duration, now: Instant) {
        for session in self.sessions.snapshot() {
            let policy = policies.get(session.policy_id);
            let timeout = policy
                .as_ref()
                .map(|p| Duration::from_millis(u64::from(p.timeout_ms)))
                .unwrap_or(default_timeout);
            let max_retries = policy
                .as_ref()
                .map(|p| p.retry_times)
                .unwrap_or(DEFAULT_RETRY_TIMES);
            let elapsed = now.saturating_duration_since(session.start_time);

            if session.state.is_terminal() {
                if elapsed > timeout + COMPLETED_LINGER {
                    self.sessions.remove(session.policy_id);
                }
                continue;
            }

            if elapsed >= timeout {
                let expired = self.sessions.update(session.policy_id, |s| {
                    // Skip if the session advanced since the snapshot.
                    if s.state.is_terminal() {
                        return Err(NegotioError::InvalidParameter);
                    }
                    s.state = SessionState::Failed;
                    Ok(s.elapsed_ms(now))
                });
                if let Ok(elapsed_ms) = expired {
                    self.metrics.record(elapsed_ms, false);
                    warn!(
                        "negotiation timed out for policy {} after {} ms",
                        session.policy_id, elapsed_ms
                    );
                }
                continue;
            }

            if session.retransmits < max_retries {
                if let Some(last) = session.last_sent {
                    let claimed = self.sessions.update(session.policy_id, |s| {
                        if s.state.is_terminal() || s.retransmits >= max_retries {
                            return Err(NegotioError::InvalidParameter);
                        }
                        s.retransmits += 1;
                        Ok(())
                    });
                    if claimed.is_ok() {
                        debug!("retransmitting for policy {}", session.policy_id);
                        if let Err(e) = self.sink.send_packet(&last, session.peer) {
                            warn!(
                                "retransmit failed for policy {}: {}",
                                session.policy_id, e
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Sink that records every packet it is handed.
    #[derive(Default)]
    struct CollectSink {
        sent: Mutex<Vec<(Packet, SocketAddr)>>,
    }

    impl CollectSink {
        fn take(&self) -> Vec<(Packet, SocketAddr)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl PacketSink for CollectSink {
        fn send_packet(&self, packet: &Packet, peer: SocketAddr) -> Result<()> {
            self.sent.lock().unwrap().push((packet.clone(), peer));
            Ok(())
        }
    }

    struct Harness {
        sessions: Arc<SessionStore>,
        metrics: Arc<Metrics>,
        sink: Arc<CollectSink>,
        negotiator: Negotiator,
    }

    fn harness() -> Harness {
        let sessions = Arc::new(SessionStore::new());
        let metrics = Metrics::new();
        let sink = Arc::new(CollectSink::default());
        let negotiator = Negotiator::new(
            Arc::clone(&sessions),
            Arc::clone(&metrics),
            sink.clone() as Arc<dyn PacketSink>,
        );
        Harness {
            sessions,
            metrics,
            sink,
            negotiator,
        }
    }

    #[test]
    fn key_derivation_is_symmetric_and_matches_sha256() {
        let r1 = [0x11u8; NONCE_SIZE];
        let r2 = [0x22u8; NONCE_SIZE];
        let mut concat = Vec::new();
        concat.extend_from_slice(&r1);
        concat.extend_from_slice(&r2);
        assert_eq!(derive_key(&r1, &r2), hash::sha256(&concat));
        // Both roles hash in the same order, so swapping inputs differs.
        assert_ne!(derive_key(&r1, &r2), derive_key(&r2, &r1));
    }

    #[test]
    fn nonces_are_fresh() {
        let a = generate_nonce().unwrap();
        let b = generate_nonce().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn initiator_happy_path() {
        let h = harness();
        let peer = addr(5000);
        h.negotiator.start(1234, peer).unwrap();

        let sent = h.take_one();
        assert_eq!(sent.0.packet_type, PacketType::R1);
        assert_eq!(sent.0.sequence, 1234);
        assert_eq!(sent.0.payload.len(), 8);
        assert_eq!(sent.1, peer);
        let r1 = sent.0.nonce().unwrap();

        let session = h.sessions.get_copy(1234).unwrap();
        assert_eq!(session.state, SessionState::WaitR2);
        assert_eq!(session.r1, Some(r1));

        let r2 = [0x22u8; NONCE_SIZE];
        let response = Packet::new(PacketType::R2, 1234, &r2);
        h.negotiator.handle(&response, peer).unwrap();

        let confirm = h.take_one();
        assert_eq!(confirm.0.packet_type, PacketType::Confirm);
        assert_eq!(confirm.0.sequence, 1234);
        assert!(confirm.0.payload.is_empty());

        let session = h.sessions.get_copy(1234).unwrap();
        assert_eq!(session.state, SessionState::Done);
        assert_eq!(session.key, Some(derive_key(&r1, &r2)));
        assert_eq!(h.metrics.snapshot().succeeded, 1);
    }

    #[test]
    fn responder_happy_path() {
        let h = harness();
        let peer = addr(40000);
        let r1 = [0x11u8; NONCE_SIZE];
        let inbound = Packet::new(PacketType::R1, 1234, &r1);
        h.negotiator.handle(&inbound, peer).unwrap();

        let sent = h.take_one();
        assert_eq!(sent.0.packet_type, PacketType::R2);
        assert_eq!(sent.0.sequence, 1234);
        assert_eq!(sent.0.payload.len(), 8);
        assert_eq!(sent.1, peer);
        let r2 = sent.0.nonce().unwrap();

        let session = h.sessions.get_copy(1234).unwrap();
        assert_eq!(session.state, SessionState::WaitConfirm);
        assert_eq!(session.key, Some(derive_key(&r1, &r2)));
        assert_eq!(session.peer, peer);

        let confirm = Packet::new(PacketType::Confirm, 1234, &[]);
        h.negotiator.handle(&confirm, peer).unwrap();

        let session = h.sessions.get_copy(1234).unwrap();
        assert_eq!(session.state, SessionState::Done);
        assert_eq!(h.metrics.snapshot().succeeded, 1);
        assert_eq!(h.sink.count(), 0);
    }

    #[test]
    fn short_r1_creates_no_session() {
        let h = harness();
        let short = Packet::new(PacketType::R1, 7, &[0x11u8; 16]);
        let result = h.negotiator.handle(&short, addr(1));
        assert!(matches!(result, Err(NegotioError::InvalidParameter)));
        assert!(h.sessions.get_copy(7).is_none());
        assert_eq!(h.sink.count(), 0);
        assert_eq!(h.metrics.snapshot().total, 0);
    }

    #[test]
    fn duplicate_r1_to_initiator_is_dropped() {
        let h = harness();
        h.negotiator.start(9, addr(5000)).unwrap();
        h.take_one();

        let echo = Packet::new(PacketType::R1, 9, &[0x33u8; NONCE_SIZE]);
        h.negotiator.handle(&echo, addr(5000)).unwrap();

        assert_eq!(
            h.sessions.get_copy(9).map(|s| s.state),
            Some(SessionState::WaitR2)
        );
        assert_eq!(h.sink.count(), 0);
    }

    #[test]
    fn duplicate_r1_to_responder_keeps_r2() {
        let h = harness();
        let peer = addr(40000);
        let r1 = [0x11u8; NONCE_SIZE];
        h.negotiator
            .handle(&Packet::new(PacketType::R1, 5, &r1), peer)
            .unwrap();
        let first_r2 = h.take_one().0.nonce().unwrap();

        h.negotiator
            .handle(&Packet::new(PacketType::R1, 5, &r1), peer)
            .unwrap();
        assert_eq!(h.sink.count(), 0);
        assert_eq!(h.sessions.get_copy(5).unwrap().r2, Some(first_r2));
    }

    #[test]
    fn zero_policy_id_is_rejected_everywhere() {
        let h = harness();
        assert!(matches!(
            h.negotiator.start(0, addr(1)),
            Err(NegotioError::InvalidParameter)
        ));
        let packet = Packet::new(PacketType::R1, 0, &[0x11u8; NONCE_SIZE]);
        assert!(h.negotiator.handle(&packet, addr(1)).is_err());
        assert!(h.sessions.is_empty());
        assert_eq!(h.sink.count(), 0);
    }

    #[test]
    fn r2_without_session_is_invalid() {
        let h = harness();
        let packet = Packet::new(PacketType::R2, 77, &[0x22u8; NONCE_SIZE]);
        assert!(matches!(
            h.negotiator.handle(&packet, addr(1)),
            Err(NegotioError::InvalidParameter)
        ));
    }

    #[test]
    fn short_r2_fails_the_session() {
        let h = harness();
        h.negotiator.start(11, addr(5000)).unwrap();
        h.take_one();

        let short = Packet::new(PacketType::R2, 11, &[0x22u8; 12]);
        assert!(h.negotiator.handle(&short, addr(5000)).is_err());

        assert_eq!(
            h.sessions.get_copy(11).map(|s| s.state),
            Some(SessionState::Failed)
        );
        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.succeeded, 0);
    }

    #[test]
    fn duplicate_r2_after_done_repeats_confirm_only() {
        let h = harness();
        let peer = addr(5000);
        h.negotiator.start(13, peer).unwrap();
        h.take_one();
        let r2 = [0x22u8; NONCE_SIZE];
        h.negotiator
            .handle(&Packet::new(PacketType::R2, 13, &r2), peer)
            .unwrap();
        assert_eq!(h.take_one().0.packet_type, PacketType::Confirm);
        let before = h.metrics.snapshot();

        // Responder retransmits R2 because the confirm was lost.
        h.negotiator
            .handle(&Packet::new(PacketType::R2, 13, &r2), peer)
            .unwrap();
        let repeated = h.take_one();
        assert_eq!(repeated.0.packet_type, PacketType::Confirm);
        assert_eq!(h.metrics.snapshot(), before);
    }

    #[test]
    fn duplicate_confirm_is_dropped() {
        let h = harness();
        let peer = addr(40000);
        h.negotiator
            .handle(
                &Packet::new(PacketType::R1, 21, &[0x11u8; NONCE_SIZE]),
                peer,
            )
            .unwrap();
        h.take_one();
        let confirm = Packet::new(PacketType::Confirm, 21, &[]);
        h.negotiator.handle(&confirm, peer).unwrap();
        let before = h.metrics.snapshot();

        h.negotiator.handle(&confirm, peer).unwrap();
        assert_eq!(h.metrics.snapshot(), before);
    }

    #[test]
    fn sweep_times_out_overdue_sessions() {
        let h = harness();
        let policies = PolicyStore::new();
        policies.add(PolicyConfig {
            policy_id: 31,
            remote_ip: Ipv4Addr::LOCALHOST,
            remote_port: 5000,
            timeout_ms: 50,
            retry_times: 0,
        });
        h.negotiator.start(31, addr(5000)).unwrap();
        h.take_one();

        let later = Instant::now() + Duration::from_millis(200);
        h.negotiator
            .sweep(&policies, Duration::from_millis(1000), later);

        assert_eq!(
            h.sessions.get_copy(31).map(|s| s.state),
            Some(SessionState::Failed)
        );
        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.succeeded, 0);
        assert_eq!(h.sink.count(), 0);
    }

    #[test]
    fn sweep_uses_default_timeout_for_responder_sessions() {
        let h = harness();
        let policies = PolicyStore::new();
        h.negotiator
            .handle(
                &Packet::new(PacketType::R1, 32, &[0x11u8; NONCE_SIZE]),
                addr(40000),
            )
            .unwrap();
        h.take_one();

        let later = Instant::now() + Duration::from_millis(150);
        h.negotiator
            .sweep(&policies, Duration::from_millis(100), later);
        assert_eq!(
            h.sessions.get_copy(32).map(|s| s.state),
            Some(SessionState::Failed)
        );
    }

    #[test]
    fn sweep_retransmits_within_budget() {
        let h = harness();
        let policies = PolicyStore::new();
        policies.add(PolicyConfig {
            policy_id: 41,
            remote_ip: Ipv4Addr::LOCALHOST,
            remote_port: 5000,
            timeout_ms: 60_000,
            retry_times: 2,
        });
        h.negotiator.start(41, addr(5000)).unwrap();
        let original = h.take_one();

        for _ in 0..4 {
            h.negotiator
                .sweep(&policies, Duration::from_secs(60), Instant::now());
        }

        let resent = h.sink.take();
        assert_eq!(resent.len(), 2);
        for (packet, peer) in resent {
            assert_eq!(packet, original.0);
            assert_eq!(peer, original.1);
        }
        assert_eq!(h.sessions.get_copy(41).unwrap().retransmits, 2);
    }

    #[test]
    fn sweep_evicts_finished_sessions_after_linger() {
        let h = harness();
        let policies = PolicyStore::new();
        let peer = addr(5000);
        h.negotiator.start(51, peer).unwrap();
        h.take_one();
        h.negotiator
            .handle(&Packet::new(PacketType::R2, 51, &[0x22u8; NONCE_SIZE]), peer)
            .unwrap();
        h.take_one();
        assert_eq!(
            h.sessions.get_copy(51).map(|s| s.state),
            Some(SessionState::Done)
        );

        let later = Instant::now() + Duration::from_secs(60);
        h.negotiator
            .sweep(&policies, Duration::from_millis(1000), later);
        assert!(h.sessions.get_copy(51).is_none());
    }

    #[test]
    fn states_never_move_backward() {
        let h = harness();
        let peer = addr(5000);
        h.negotiator.start(61, peer).unwrap();
        h.take_one();
        h.negotiator
            .handle(&Packet::new(PacketType::R2, 61, &[0x22u8; NONCE_SIZE]), peer)
            .unwrap();
        h.take_one();

        // Late R1 and confirm must not regress a finished session.
        let _ = h
            .negotiator
            .handle(&Packet::new(PacketType::R1, 61, &[0x33u8; NONCE_SIZE]), peer);
        let _ = h
            .negotiator
            .handle(&Packet::new(PacketType::Confirm, 61, &[]), peer);
        assert_eq!(
            h.sessions.get_copy(61).map(|s| s.state),
            Some(SessionState::Done)
        );
    }

    impl Harness {
        fn take_one(&self) -> (Packet, SocketAddr) {
            let mut sent = self.sink.take();
            assert_eq!(sent.len(), 1, "expected exactly one emitted packet");
            sent.pop().unwrap()
        }
    }

    /// Sink that feeds packets straight into a peer negotiator, so a whole
    /// handshake runs synchronously through both state machines.
    #[derive(Default)]
    struct LoopbackSink {
        peer: Mutex<Option<Arc<Negotiator>>>,
    }

    impl LoopbackSink {
        fn connect(&self, peer: Arc<Negotiator>) {
            *self.peer.lock().unwrap() = Some(peer);
        }
    }

    impl PacketSink for LoopbackSink {
        fn send_packet(&self, packet: &Packet, peer_addr: SocketAddr) -> Result<()> {
            let peer = self.peer.lock().unwrap().clone();
            if let Some(peer) = peer {
                peer.handle(packet, peer_addr)?;
            }
            Ok(())
        }
    }

    #[test]
    fn four_thousand_parallel_policies() {
        let initiator_sessions = Arc::new(SessionStore::new());
        let responder_sessions = Arc::new(SessionStore::new());
        let initiator_metrics = Metrics::new();
        let responder_metrics = Metrics::new();
        let initiator_sink = Arc::new(LoopbackSink::default());
        let responder_sink = Arc::new(LoopbackSink::default());

        let initiator = Arc::new(Negotiator::new(
            Arc::clone(&initiator_sessions),
            Arc::clone(&initiator_metrics),
            initiator_sink.clone() as Arc<dyn PacketSink>,
        ));
        let responder = Arc::new(Negotiator::new(
            Arc::clone(&responder_sessions),
            Arc::clone(&responder_metrics),
            responder_sink.clone() as Arc<dyn PacketSink>,
        ));
        initiator_sink.connect(Arc::clone(&responder));
        responder_sink.connect(Arc::clone(&initiator));

        const POLICIES: u32 = 4096;
        const WORKERS: u32 = 8;
        let threads: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let initiator = Arc::clone(&initiator);
                std::thread::spawn(move || {
                    let per_worker = POLICIES / WORKERS;
                    let base = worker * per_worker;
                    for offset in 0..per_worker {
                        initiator.start(base + offset + 1, addr(5000)).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(initiator_metrics.snapshot().succeeded, u64::from(POLICIES));
        assert_eq!(responder_metrics.snapshot().succeeded, u64::from(POLICIES));

        for idx in 0..crate::session::NUM_SHARDS {
            assert_eq!(
                initiator_sessions.shard_len(idx),
                POLICIES as usize / crate::session::NUM_SHARDS
            );
        }

        for policy_id in 1..=POLICIES {
            let a = initiator_sessions.get_copy(policy_id).unwrap();
            let b = responder_sessions.get_copy(policy_id).unwrap();
            assert_eq!(a.state, SessionState::Done);
            assert_eq!(b.state, SessionState::Done);
            let (r1, r2) = (a.r1.unwrap(), a.r2.unwrap());
            assert_eq!(a.key, Some(derive_key(&r1, &r2)));
            assert_eq!(a.key, b.key);
        }
    }
}
