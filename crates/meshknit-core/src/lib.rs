//! Meshknit Core
//!
//! The peer overlay engine: per-peer connection state machine, NAT
//! traversal, a distance-vector route table keyed by measured round-trip
//! time, encrypted datagram transport, and the direct/relay forwarding
//! decision. One UDP socket carries all overlay traffic; a periodic tick
//! drives retries, liveness checks, and route propagation.

pub mod config;
pub mod engine;
pub mod error;
pub mod peer;
pub mod peers;
pub mod route;

pub use config::OverlayConfig;
pub use engine::{OverlayEngine, PacketSink, PubInfo, Signaling};
pub use error::{CoreError, CoreResult};
pub use peer::{Peer, PeerState};
pub use peers::PeerTable;
pub use route::{RouteEntry, RouteTable, UNREACHABLE};
