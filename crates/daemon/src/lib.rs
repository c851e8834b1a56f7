//! Key negotiation daemon.
//!
//! Performs a three-message key agreement over UDP: the initiator and
//! responder exchange 32-byte nonces per policy and both derive the shared
//! key SHA-256(r1 ‖ r2). Policies arrive over a local Unix-socket control
//! channel; sessions live in a sharded in-memory store sized for 4096
//! concurrent handshakes.

pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod negotiate;
pub mod packet;
pub mod policy;
pub mod session;
pub mod udp;

// Re-export key types for easier access by consumers
pub use config::Config;
pub use daemon::Daemon;
pub use error::{NegotioError, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use negotiate::{derive_key, generate_nonce, Negotiator, PacketSink};
pub use packet::{Packet, PacketType, HEADER_SIZE, MAGIC, NONCE_SIZE};
pub use policy::{PolicyConfig, PolicyStore, MAX_POLICIES};
pub use session::{Session, SessionState, SessionStore, NUM_SHARDS};
pub use udp::UdpEndpoint;
