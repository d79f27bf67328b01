//! Shared peer table
//!
//! Async map from mesh address to peer machine. Peers are created lazily:
//! any message from or payload toward an unknown address inserts an `Init`
//! entry with its channel key derived on the spot. Mutation happens inside
//! short synchronous closures under the write lock; the engine performs
//! all I/O after the guard drops.

use std::collections::HashMap;
use std::net::SocketAddrV4;

use tokio::sync::RwLock;

use meshknit_crypto::derive_key;
use meshknit_network::Ip4;

use crate::peer::{Peer, PeerEvent, PeerState, TickContext};

pub struct PeerTable {
    secret: String,
    inner: RwLock<HashMap<Ip4, Peer>>,
}

impl PeerTable {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Run `f` on the peer at `addr`, inserting a fresh `Init` entry first
    /// if none exists
    pub async fn upsert_with<R>(&self, addr: Ip4, f: impl FnOnce(&mut Peer) -> R) -> R {
        let mut peers = self.inner.write().await;
        let peer = peers
            .entry(addr)
            .or_insert_with(|| Peer::new(addr, derive_key(&self.secret, addr.raw())));
        f(peer)
    }

    /// Run `f` on the peer at `addr` if it exists
    pub async fn with_mut<R>(&self, addr: Ip4, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        let mut peers = self.inner.write().await;
        peers.get_mut(&addr).map(f)
    }

    /// Advance every peer machine by one tick, collecting the I/O each
    /// one requested
    pub async fn tick_all(&self, ctx: &TickContext) -> Vec<(Ip4, Vec<PeerEvent>)> {
        let mut peers = self.inner.write().await;
        peers
            .iter_mut()
            .map(|(addr, peer)| (*addr, peer.tick(ctx)))
            .filter(|(_, events)| !events.is_empty())
            .collect()
    }

    /// Addresses and endpoints of all directly connected peers
    pub async fn connected_endpoints(&self) -> Vec<(Ip4, SocketAddrV4)> {
        let peers = self.inner.read().await;
        peers
            .values()
            .filter(|p| p.state() == PeerState::Connected)
            .filter_map(|p| p.endpoint().map(|ep| (p.addr(), ep)))
            .collect()
    }

    pub async fn state_of(&self, addr: Ip4) -> Option<PeerState> {
        let peers = self.inner.read().await;
        peers.get(&addr).map(|p| p.state())
    }

    /// Direct endpoint of `addr` when the peer is Connected
    pub async fn endpoint_if_connected(&self, addr: Ip4) -> Option<SocketAddrV4> {
        let peers = self.inner.read().await;
        peers
            .get(&addr)
            .filter(|p| p.state() == PeerState::Connected)
            .and_then(|p| p.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Ip4 {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_creates_init_peer() {
        let table = PeerTable::new("knit".into());
        let a = addr("10.4.0.2");
        let state = table.upsert_with(a, |p| p.state()).await;
        assert_eq!(state, PeerState::Init);
        assert_eq!(table.state_of(a).await, Some(PeerState::Init));
    }

    #[tokio::test]
    async fn test_with_mut_missing_peer() {
        let table = PeerTable::new("knit".into());
        assert!(table.with_mut(addr("10.4.0.2"), |_| ()).await.is_none());
    }

    #[tokio::test]
    async fn test_inserted_peer_gets_derived_key() {
        let table = PeerTable::new("knit".into());
        let a = addr("10.4.0.2");
        let inserted = table.upsert_with(a, |p| p.key().clone()).await;
        assert_eq!(inserted.as_bytes(), derive_key("knit", a.raw()).as_bytes());
    }

    #[tokio::test]
    async fn test_connected_endpoints_filters() {
        let table = PeerTable::new("knit".into());
        let a = addr("10.4.0.2");
        let b = addr("10.4.0.3");
        let ep: SocketAddrV4 = "203.0.113.9:4000".parse().unwrap();

        table
            .upsert_with(a, |p| {
                p.on_endpoint(ep, true);
                p.on_heartbeat(ep, 1);
            })
            .await;
        table.upsert_with(b, |_| ()).await;

        let connected = table.connected_endpoints().await;
        assert_eq!(connected, vec![(a, ep)]);
        assert_eq!(table.endpoint_if_connected(a).await, Some(ep));
        assert_eq!(table.endpoint_if_connected(b).await, None);
    }
}
