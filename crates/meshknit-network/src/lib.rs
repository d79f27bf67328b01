//! Meshknit Network Primitives
//!
//! Building blocks under the overlay engine:
//! - Mesh addresses and CIDR handling (routing keys and identities)
//! - The tagged datagram codec spoken over the single UDP socket
//! - STUN-assisted public endpoint discovery

pub mod addr;
pub mod error;
pub mod message;
pub mod stun;

pub use addr::{Cidr, Ip4};
pub use error::{NetworkError, NetworkResult};
pub use message::{as_v4, Message, MessageKind};
pub use stun::{build_binding_request, is_binding_response, parse_binding_response, resolve_server};
