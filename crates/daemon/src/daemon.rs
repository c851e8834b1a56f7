//! The supervisor: wires every component together and runs the workers.
//!
//! Ownership is strictly one-way. The daemon owns the endpoints and the
//! stores; the negotiator holds only its sender and telemetry handles. All
//! workers watch a single shutdown channel, and `shutdown` is idempotent:
//! it flips the flag once and joins whatever workers remain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info, trace, warn};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::Config;
use crate::control::{CommandHandler, ControlServer};
use crate::error::NegotioError;
use crate::metrics::Metrics;
use crate::negotiate::{Negotiator, PacketSink};
use crate::policy::{PolicyConfig, PolicyStore};
use crate::session::SessionStore;
use crate::udp::UdpEndpoint;

/// Telemetry summary and maintenance cadence.
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Commands accepted on the control channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ControlCommand {
    Add { policy: PolicyConfig },
    Remove { policy_id: u32 },
}

/// A running negotiation daemon.
pub struct Daemon {
    udp: Arc<UdpEndpoint>,
    policies: Arc<PolicyStore>,
    sessions: Arc<SessionStore>,
    metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Bind both endpoints and spawn the workers. Endpoint init failure is
    /// fatal and reported to the caller.
    pub async fn start(config: Config) -> Result<Self> {
        let udp = Arc::new(
            UdpEndpoint::bind(config.network.udp_port)
                .await
                .context("failed to bind UDP endpoint")?,
        );
        let control = ControlServer::bind(&config.network.unix_socket_path)
            .context("failed to bind control socket")?;

        let policies = Arc::new(PolicyStore::new());
        let sessions = Arc::new(SessionStore::new());
        let metrics = Metrics::new();
        let negotiator = Arc::new(Negotiator::new(
            Arc::clone(&sessions),
            Arc::clone(&metrics),
            Arc::clone(&udp) as Arc<dyn PacketSink>,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let default_timeout = Duration::from_millis(u64::from(config.negotiation.timeout_ms));

        let mut workers = Vec::new();
        workers.push(Self::spawn_recv_loop(
            Arc::clone(&udp),
            Arc::clone(&negotiator),
            default_timeout,
            shutdown_rx.clone(),
        ));
        workers.push(tokio::spawn(control.run(
            Self::command_handler(
                Arc::clone(&policies),
                Arc::clone(&sessions),
                Arc::clone(&negotiator),
            ),
            shutdown_rx.clone(),
        )));
        workers.push(metrics.spawn_reporter(TICK_PERIOD, shutdown_rx.clone()));
        workers.push(Self::spawn_maintenance(
            negotiator,
            Arc::clone(&policies),
            default_timeout,
            shutdown_rx,
        ));

        Ok(Self {
            udp,
            policies,
            sessions,
            metrics,
            shutdown_tx,
            workers,
        })
    }

    /// Route inbound datagrams into the state machine until shutdown.
    fn spawn_recv_loop(
        udp: Arc<UdpEndpoint>,
        negotiator: Arc<Negotiator>,
        recv_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = udp.recv(recv_timeout) => match result {
                        Ok((packet, peer)) => {
                            trace!("received {:?} for policy {} from {}",
                                packet.packet_type, packet.sequence, peer);
                            if let Err(e) = negotiator.handle(&packet, peer) {
                                debug!("dropped packet from {}: {}", peer, e);
                            }
                        }
                        // Idle receive; nothing to do.
                        Err(NegotioError::Timeout) => {}
                        Err(NegotioError::InvalidParameter) => {
                            debug!("malformed datagram dropped");
                        }
                        Err(e) => error!("UDP receive error: {}", e),
                    }
                }
            }
        })
    }

    /// Timeout sweep and bounded retransmission, once per tick.
    fn spawn_maintenance(
        negotiator: Arc<Negotiator>,
        policies: Arc<PolicyStore>,
        default_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(TICK_PERIOD);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        negotiator.sweep(&policies, default_timeout, Instant::now());
                    }
                }
            }
        })
    }

    /// Parse control commands and apply them to the stores.
    fn command_handler(
        policies: Arc<PolicyStore>,
        sessions: Arc<SessionStore>,
        negotiator: Arc<Negotiator>,
    ) -> CommandHandler {
        Arc::new(move |line: &str| match serde_json::from_str::<ControlCommand>(line) {
            Ok(ControlCommand::Add { policy }) => {
                let policy_id = policy.policy_id;
                let peer = policy.peer_addr();
                if policies.add(policy) {
                    info!("policy {} added, negotiating with {}", policy_id, peer);
                    if let Err(e) = negotiator.start(policy_id, peer) {
                        warn!("failed to start negotiation for policy {}: {}", policy_id, e);
                    }
                } else {
                    warn!("policy {} rejected: duplicate id or store full", policy_id);
                }
            }
            Ok(ControlCommand::Remove { policy_id }) => {
                let removed = policies.remove(policy_id);
                sessions.remove(policy_id);
                info!(
                    "policy {} {}",
                    policy_id,
                    if removed { "removed" } else { "not found" }
                );
            }
            // Unknown actions are reserved; malformed input is dropped.
            Err(e) => warn!("ignoring control command: {}", e),
        })
    }

    /// Local address of the UDP endpoint.
    pub fn local_addr(&self) -> crate::error::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn policies(&self) -> Arc<PolicyStore> {
        Arc::clone(&self.policies)
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        Arc::clone(&self.sessions)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Signal every worker and join them. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!("worker ended abnormally: {}", e);
            }
        }
        info!("daemon stopped");
    }
}
