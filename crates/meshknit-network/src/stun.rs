//! STUN binding support (RFC 5389 subset)
//!
//! The overlay issues binding requests over its own UDP socket and extracts
//! the observed public endpoint from the response. Only MAPPED-ADDRESS and
//! XOR-MAPPED-ADDRESS are interpreted; everything else the server sends is
//! ignored. Responses share the socket with overlay traffic, so
//! [`is_binding_response`] lets the read loop classify them cheaply.

use std::net::SocketAddr;

use rand::RngCore;
use tracing::debug;

use crate::error::{NetworkError, NetworkResult};

/// STUN message types (RFC 5389)
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_BINDING_ERROR: u16 = 0x0111;

/// STUN attributes
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size
const HEADER_SIZE: usize = 20;

/// Default STUN/rendezvous port
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Generate a fresh 96-bit transaction id
pub fn new_transaction_id() -> [u8; 12] {
    let mut txn = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut txn);
    txn
}

/// Resolve a rendezvous server URI to a socket address.
///
/// Accepts `stun://host[:port]` or plain `host[:port]`; the port defaults
/// to 3478. Resolution failure is a configuration error — callers keep the
/// previously resolved server.
pub async fn resolve_server(uri: &str) -> NetworkResult<SocketAddr> {
    let hostport = uri.strip_prefix("stun://").unwrap_or(uri);
    if hostport.is_empty() {
        return Err(NetworkError::ConfigError("empty rendezvous URI".into()));
    }

    let candidate = if hostport.contains(':') {
        hostport.to_string()
    } else {
        format!("{}:{}", hostport, DEFAULT_STUN_PORT)
    };

    if let Ok(addr) = candidate.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let mut addrs = tokio::net::lookup_host(&candidate)
        .await
        .map_err(|e| NetworkError::ConfigError(format!("failed to resolve '{}': {}", uri, e)))?;
    addrs
        .next()
        .ok_or_else(|| NetworkError::ConfigError(format!("no addresses found for '{}'", uri)))
}

/// Build a STUN binding request packet
pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_SIZE);
    packet.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes()); // no attributes
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);
    packet
}

/// Quick classification: does this datagram look like a binding response?
///
/// Used by the transport loop to split STUN traffic from tagged overlay
/// messages before full parsing.
pub fn is_binding_response(data: &[u8]) -> bool {
    if data.len() < HEADER_SIZE {
        return false;
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    (msg_type == STUN_BINDING_RESPONSE || msg_type == STUN_BINDING_ERROR) && magic == MAGIC_COOKIE
}

/// Parse a binding response, returning the mapped (public) endpoint
pub fn parse_binding_response(
    data: &[u8],
    expected_txn_id: &[u8; 12],
) -> NetworkResult<SocketAddr> {
    if data.len() < HEADER_SIZE {
        return Err(NetworkError::Protocol("STUN response too short".into()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let txn_id = &data[8..20];

    if msg_type != STUN_BINDING_RESPONSE && msg_type != STUN_BINDING_ERROR {
        return Err(NetworkError::Protocol(format!(
            "unexpected STUN message type: 0x{:04x}",
            msg_type
        )));
    }
    if magic != MAGIC_COOKIE {
        return Err(NetworkError::Protocol("invalid STUN magic cookie".into()));
    }
    if txn_id != expected_txn_id {
        return Err(NetworkError::Protocol("transaction ID mismatch".into()));
    }
    if msg_type == STUN_BINDING_ERROR {
        return Err(NetworkError::Protocol("STUN binding error response".into()));
    }
    if data.len() < HEADER_SIZE + msg_len {
        return Err(NetworkError::Protocol("STUN message truncated".into()));
    }

    let mut mapped: Option<SocketAddr> = None;
    let mut pos = HEADER_SIZE;
    while pos + 4 <= HEADER_SIZE + msg_len {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if pos + attr_len > data.len() {
            break;
        }
        let attr_data = &data[pos..pos + attr_len];

        match attr_type {
            ATTR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_mapped_address(attr_data, false) {
                    mapped = Some(addr);
                }
            }
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_mapped_address(attr_data, true) {
                    mapped = Some(addr);
                }
            }
            _ => {
                debug!("ignoring STUN attribute 0x{:04x}", attr_type);
            }
        }

        // Attributes are padded to 4-byte alignment
        pos += (attr_len + 3) & !3;
    }

    mapped.ok_or_else(|| NetworkError::Protocol("no mapped address in STUN response".into()))
}

/// Parse MAPPED-ADDRESS or XOR-MAPPED-ADDRESS (IPv4 family only)
fn parse_mapped_address(data: &[u8], xor: bool) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }

    let family = data[1];
    if family != 0x01 {
        return None;
    }

    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    let mut ip = [data[4], data[5], data[6], data[7]];
    if xor {
        port ^= u16::from_be_bytes([cookie[0], cookie[1]]);
        for i in 0..4 {
            ip[i] ^= cookie[i];
        }
    }

    Some(SocketAddr::new(std::net::Ipv4Addr::from(ip).into(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_attr(txn: &[u8; 12], attr_type: u16, attr: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        packet.extend_from_slice(&((attr.len() as u16 + 4).to_be_bytes()));
        packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        packet.extend_from_slice(txn);
        packet.extend_from_slice(&attr_type.to_be_bytes());
        packet.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        packet.extend_from_slice(attr);
        packet
    }

    #[test]
    fn test_request_layout() {
        let txn = [7u8; 12];
        let request = build_binding_request(&txn);
        assert_eq!(request.len(), HEADER_SIZE);
        assert_eq!(request[0..2], [0x00, 0x01]);
        assert_eq!(request[4..8], MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], &txn);
    }

    #[test]
    fn test_parse_mapped_address_attribute() {
        let txn = [1u8; 12];
        // family 1, port 4242, ip 198.51.100.4
        let attr = [0, 1, 0x10, 0x92, 198, 51, 100, 4];
        let packet = response_with_attr(&txn, ATTR_MAPPED_ADDRESS, &attr);

        assert!(is_binding_response(&packet));
        let addr = parse_binding_response(&packet, &txn).unwrap();
        assert_eq!(addr, "198.51.100.4:4242".parse().unwrap());
    }

    #[test]
    fn test_parse_xor_mapped_address_attribute() {
        let txn = [2u8; 12];
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let port: u16 = 4242;
        let ip = [198u8, 51, 100, 4];

        let xport = port ^ u16::from_be_bytes([cookie[0], cookie[1]]);
        let mut xip = ip;
        for i in 0..4 {
            xip[i] ^= cookie[i];
        }

        let mut attr = vec![0u8, 1];
        attr.extend_from_slice(&xport.to_be_bytes());
        attr.extend_from_slice(&xip);
        let packet = response_with_attr(&txn, ATTR_XOR_MAPPED_ADDRESS, &attr);

        let addr = parse_binding_response(&packet, &txn).unwrap();
        assert_eq!(addr, "198.51.100.4:4242".parse().unwrap());
    }

    #[test]
    fn test_rejects_transaction_mismatch() {
        let txn = [3u8; 12];
        let attr = [0, 1, 0x10, 0x92, 198, 51, 100, 4];
        let packet = response_with_attr(&txn, ATTR_MAPPED_ADDRESS, &attr);
        assert!(parse_binding_response(&packet, &[9u8; 12]).is_err());
    }

    #[test]
    fn test_rejects_truncated_response() {
        let txn = [4u8; 12];
        let attr = [0, 1, 0x10, 0x92, 198, 51, 100, 4];
        let packet = response_with_attr(&txn, ATTR_MAPPED_ADDRESS, &attr);
        for len in 0..packet.len() {
            assert!(parse_binding_response(&packet[..len], &txn).is_err());
        }
    }

    #[test]
    fn test_overlay_messages_not_classified_as_stun() {
        assert!(!is_binding_response(&[0x02, 0, 0, 0, 0, 0]));
        assert!(!is_binding_response(&[]));
    }

    #[tokio::test]
    async fn test_resolve_server_forms() {
        let addr = resolve_server("127.0.0.1:9000").await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());

        let addr = resolve_server("stun://127.0.0.1:9000").await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());

        let addr = resolve_server("127.0.0.1").await.unwrap();
        assert_eq!(addr.port(), DEFAULT_STUN_PORT);

        // Hostname form goes through DNS resolution rather than parsing.
        let addr = resolve_server("localhost:9000").await.unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.ip().is_loopback());

        assert!(resolve_server("").await.is_err());
    }
}
