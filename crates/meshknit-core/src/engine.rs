//! Overlay engine
//!
//! One UDP socket carries all overlay traffic: STUN exchanges with the
//! rendezvous server, heartbeats, delay probes, route announcements, and
//! sealed Forward datagrams. A periodic tick drives every peer machine;
//! inbound datagrams are classified (STUN first, then the overlay tag) and
//! dispatched to small handlers. Payloads leave the overlay through the
//! `PacketSink` collaborator and enter it through `send_packet` or the
//! outbound queue.
//!
//! Forwarding order for a payload toward `dst`: direct if the destination
//! peer is Connected, else direct to the next hop of a usable route, else
//! through the relay. Send failures are logged and never poison peer or
//! route state.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use meshknit_crypto::{derive_key, open, seal, ChannelKey};
use meshknit_network::stun::{
    build_binding_request, is_binding_response, new_transaction_id, parse_binding_response,
    resolve_server,
};
use meshknit_network::{as_v4, Ip4, Message};

use crate::config::OverlayConfig;
use crate::error::CoreResult;
use crate::peer::{HeartbeatOutcome, PeerEvent, PeerState, TickContext};
use crate::peers::PeerTable;
use crate::route::{RouteEntry, RouteTable, UNREACHABLE};

/// Ticks between delay probes to connected peers
const DELAY_PROBE_TICKS: u64 = 8;

/// Ticks between full route announcements
const ROUTE_ANNOUNCE_TICKS: u64 = 4;

/// Ticks between unsolicited public-endpoint refreshes; NAT bindings
/// expire, so the mapped address is re-resolved even with no peer asking
const STUN_REFRESH_TICKS: u64 = 64;

/// A node's published public endpoint, carried over the signaling path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubInfo {
    /// Publisher's mesh address
    pub addr: Ip4,
    /// Mesh address the publisher wants to reach
    pub peer: Ip4,
    /// Publisher's resolved public endpoint
    pub endpoint: SocketAddrV4,
}

/// Where decrypted payloads addressed to this node go (interface driver)
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn deliver(&self, packet: Bytes) -> CoreResult<()>;
}

/// Out-of-band endpoint exchange with peers
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn publish(&self, info: PubInfo) -> CoreResult<()>;
}

/// NAT traversal state for the rendezvous server
struct StunState {
    server: Option<SocketAddr>,
    txn: Option<[u8; 12]>,
    mapped: Option<SocketAddrV4>,
}

pub struct OverlayEngine {
    config: OverlayConfig,
    local: Ip4,
    /// Our own channel key; peers seal payloads for us under it
    key: ChannelKey,
    socket: Arc<UdpSocket>,
    local_sock: SocketAddr,
    peers: PeerTable,
    routes: RouteTable,
    stun: RwLock<StunState>,
    signaling: Arc<dyn Signaling>,
    sink: Arc<dyn PacketSink>,
    outbound_tx: mpsc::Sender<(Ip4, Bytes)>,
    outbound_rx: Mutex<Option<mpsc::Receiver<(Ip4, Bytes)>>>,
    tick_no: AtomicU64,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl OverlayEngine {
    /// Validate the configuration, bind the overlay socket, and resolve the
    /// rendezvous server. All failures here are fatal; after construction
    /// the engine only logs and retries.
    pub async fn new(
        config: OverlayConfig,
        signaling: Arc<dyn Signaling>,
        sink: Arc<dyn PacketSink>,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;
        let local = config.cidr()?.addr();

        let socket = UdpSocket::bind((config.bind_addr.as_str(), config.listen_port)).await?;
        let local_sock = socket.local_addr()?;
        info!("overlay socket bound on {}", local_sock);

        let server = match &config.rendezvous {
            Some(uri) => Some(resolve_server(uri).await?),
            None => None,
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(1024);
        let key = derive_key(&config.secret, local.raw());
        let peers = PeerTable::new(config.secret.clone());

        Ok(Arc::new(Self {
            config,
            local,
            key,
            socket: Arc::new(socket),
            local_sock,
            peers,
            routes: RouteTable::new(),
            stun: RwLock::new(StunState {
                server,
                txn: None,
                mapped: None,
            }),
            signaling,
            sink,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            // Random phase so probe and announce bursts are not synchronized
            // across nodes started together.
            tick_no: AtomicU64::new(rand::random()),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }))
    }

    /// Spawn the receive, tick, and outbound-drain tasks
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.recv_loop().await });

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.tick_loop().await });

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.outbound_loop().await });
    }

    /// Signal all tasks to exit
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// This node's mesh address
    pub fn local_addr(&self) -> Ip4 {
        self.local
    }

    /// Bound address of the overlay socket
    pub fn socket_addr(&self) -> SocketAddr {
        self.local_sock
    }

    /// Queue handle for payloads from the interface driver
    pub fn outbound_sender(&self) -> mpsc::Sender<(Ip4, Bytes)> {
        self.outbound_tx.clone()
    }

    /// Connection state of a peer, if tracked
    pub async fn peer_state(&self, addr: Ip4) -> Option<PeerState> {
        self.peers.state_of(addr).await
    }

    /// Usable route toward `dst`, if any
    pub async fn route_to(&self, dst: Ip4) -> Option<RouteEntry> {
        self.routes
            .snapshot()
            .await
            .into_iter()
            .find(|entry| entry.dest == dst)
    }

    /// Replace the rendezvous server. On resolution failure the previous
    /// server stays in effect.
    pub async fn set_rendezvous(&self, uri: &str) -> CoreResult<()> {
        match resolve_server(uri).await {
            Ok(server) => {
                let mut stun = self.stun.write().await;
                stun.server = Some(server);
                stun.mapped = None;
                info!("rendezvous server set to {}", server);
                Ok(())
            }
            Err(e) => {
                warn!("rendezvous update rejected, keeping previous: {}", e);
                Err(e.into())
            }
        }
    }

    /// Accept a payload for `dst` from the interface driver.
    ///
    /// The destination peer is created lazily, which arms the next tick to
    /// start a direct-connection attempt.
    pub async fn send_packet(&self, dst: Ip4, payload: &[u8]) -> CoreResult<()> {
        if payload.len() > self.config.mtu as usize {
            debug!("oversized payload for {} dropped: {} bytes", dst, payload.len());
            return Ok(());
        }

        let key = self.peers.upsert_with(dst, |p| p.key().clone()).await;
        let ciphertext = Bytes::from(seal(&key, payload)?);
        let wire = Message::Forward { dst, ciphertext }.encode();

        if let Some(endpoint) = self.peers.endpoint_if_connected(dst).await {
            self.send_to(&wire, SocketAddr::V4(endpoint)).await;
            return Ok(());
        }

        if let Some(hop) = self.routes.next_hop(dst).await {
            if let Some(endpoint) = self.peers.endpoint_if_connected(hop).await {
                self.send_to(&wire, SocketAddr::V4(endpoint)).await;
                return Ok(());
            }
        }

        let relay = self.stun.read().await.server;
        match relay {
            Some(server) => self.send_to(&wire, server).await,
            None => debug!("no path to {}, payload dropped", dst),
        }
        Ok(())
    }

    /// Accept a peer's published endpoint from the signaling path
    pub async fn handle_pub_info(&self, info: PubInfo) {
        if info.peer != self.local || info.addr == self.local {
            return;
        }
        self.record_peer_endpoint(info.addr, info.endpoint).await;
    }

    async fn recv_loop(&self) {
        let mut buf = vec![0u8; 65535];
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    Err(e) => warn!("overlay socket receive error: {}", e),
                },
                _ = self.shutdown_notify.notified() => break,
            }
        }
        debug!("receive loop stopped");
    }

    async fn tick_loop(&self) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = self.shutdown_notify.notified() => break,
            }
        }
        debug!("tick loop stopped");
    }

    async fn outbound_loop(&self) {
        let mut rx = match self.outbound_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some((dst, payload)) => {
                        if let Err(e) = self.send_packet(dst, &payload).await {
                            debug!("outbound payload for {} failed: {}", dst, e);
                        }
                    }
                    None => break,
                },
                _ = self.shutdown_notify.notified() => break,
            }
        }
        debug!("outbound loop stopped");
    }

    /// One discovery tick: advance every peer machine, then perform the
    /// I/O the machines requested after the table lock is released.
    async fn tick(&self) {
        let tick_no = self.tick_no.fetch_add(1, Ordering::Relaxed);
        let local_endpoint = self.local_endpoint().await;
        let ctx = TickContext {
            p2p_enabled: !self.config.p2p_disabled,
            local_endpoint,
        };

        let mut stun_requested = false;
        for (addr, events) in self.peers.tick_all(&ctx).await {
            for event in events {
                match event {
                    PeerEvent::NeedStun => {
                        if !stun_requested {
                            stun_requested = true;
                            self.send_stun_request().await;
                        }
                    }
                    PeerEvent::PublishEndpoint => {
                        if let Some(endpoint) = local_endpoint {
                            let info = PubInfo {
                                addr: self.local,
                                peer: addr,
                                endpoint,
                            };
                            if let Err(e) = self.signaling.publish(info).await {
                                warn!("endpoint publication to {} failed: {}", addr, e);
                            }
                        }
                    }
                    PeerEvent::SendHeartbeat { endpoint, ack } => {
                        let wire = Message::Heartbeat {
                            sender: self.local,
                            ack,
                        }
                        .encode();
                        self.send_to(&wire, SocketAddr::V4(endpoint)).await;
                    }
                    PeerEvent::LinkDown => {
                        info!("direct link to {} lost", addr);
                        let withdrawn = self.routes.withdraw_via(addr).await;
                        for entry in withdrawn {
                            self.announce_route(entry).await;
                        }
                    }
                }
            }
        }

        if tick_no % STUN_REFRESH_TICKS == 0 && !stun_requested {
            self.send_stun_request().await;
        }
        if tick_no % DELAY_PROBE_TICKS == 0 {
            self.probe_connected_peers().await;
        }
        if tick_no % ROUTE_ANNOUNCE_TICKS == 0 {
            for entry in self.routes.snapshot().await {
                self.announce_route(entry).await;
            }
        }
    }

    /// Our public endpoint for direct-connection attempts. Resolved via
    /// STUN when a rendezvous server is configured; without one the bound
    /// socket address is used, which is enough on a flat LAN.
    async fn local_endpoint(&self) -> Option<SocketAddrV4> {
        let stun = self.stun.read().await;
        if let Some(mapped) = stun.mapped {
            return Some(mapped);
        }
        if stun.server.is_some() {
            return None;
        }
        as_v4(self.local_sock).filter(|ep| !ep.ip().is_unspecified())
    }

    async fn send_stun_request(&self) {
        let mut stun = self.stun.write().await;
        let server = match stun.server {
            Some(server) => server,
            None => return,
        };
        let txn = new_transaction_id();
        stun.txn = Some(txn);
        drop(stun);
        self.send_to(&build_binding_request(&txn), server).await;
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        if is_binding_response(data) {
            self.handle_stun(data).await;
            return;
        }
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("datagram from {} dropped: {}", from, e);
                return;
            }
        };
        match msg {
            Message::Heartbeat { sender, ack } => {
                if let Some(from) = as_v4(from) {
                    self.handle_heartbeat(sender, ack, from).await;
                }
            }
            Message::Forward { dst, ciphertext } => {
                self.handle_forward(dst, &ciphertext).await;
            }
            Message::DelayProbe {
                sender,
                timestamp_ms,
            } => {
                self.handle_delay_probe(sender, timestamp_ms, from).await;
            }
            Message::DelayResponse { timestamp_ms, .. } => {
                if let Some(from) = as_v4(from) {
                    self.handle_delay_response(timestamp_ms, from).await;
                }
            }
            Message::RouteUpdate { sender, dest, cost } => {
                self.handle_route_update(sender, dest, cost).await;
            }
            Message::PeerEndpoint { addr, endpoint } => {
                if addr != self.local {
                    self.record_peer_endpoint(addr, endpoint).await;
                }
            }
        }
    }

    async fn handle_stun(&self, data: &[u8]) {
        let txn = match self.stun.read().await.txn {
            Some(txn) => txn,
            None => return,
        };
        match parse_binding_response(data, &txn) {
            Ok(mapped) => {
                let mapped = match as_v4(mapped) {
                    Some(v4) => v4,
                    None => return,
                };
                let mut stun = self.stun.write().await;
                stun.txn = None;
                if stun.mapped != Some(mapped) {
                    info!("public endpoint resolved: {}", mapped);
                    stun.mapped = Some(mapped);
                }
            }
            Err(e) => debug!("binding response dropped: {}", e),
        }
    }

    async fn handle_heartbeat(&self, sender: Ip4, ack: u8, from: SocketAddrV4) {
        if sender == self.local {
            return;
        }
        let outcome = self
            .peers
            .upsert_with(sender, |p| p.on_heartbeat(from, ack))
            .await;
        if outcome == HeartbeatOutcome::Promoted {
            info!("direct connection to {} established via {}", sender, from);
            // Measure the new link right away instead of waiting for the
            // next probe window.
            let wire = Message::DelayProbe {
                sender: self.local,
                timestamp_ms: now_ms(),
            }
            .encode();
            self.send_to(&wire, SocketAddr::V4(from)).await;
        }
    }

    /// Echo a delay probe. No peer state is touched: a probe is not proof
    /// of a working return path.
    async fn handle_delay_probe(&self, sender: Ip4, timestamp_ms: u64, from: SocketAddr) {
        if sender == self.local {
            return;
        }
        let wire = Message::DelayResponse {
            sender: self.local,
            timestamp_ms,
        }
        .encode();
        self.send_to(&wire, from).await;
    }

    async fn handle_delay_response(&self, timestamp_ms: u64, from: SocketAddrV4) {
        let rtt = now_ms().saturating_sub(timestamp_ms).min(UNREACHABLE as u64) as u32;

        // The response endpoint identifies the peer only if it matches a
        // connected one; anything else is ignored.
        let mut direct = None;
        for (addr, endpoint) in self.peers.connected_endpoints().await {
            if endpoint == from {
                direct = Some(addr);
                break;
            }
        }
        let peer = match direct {
            Some(addr) => addr,
            None => return,
        };

        self.peers.with_mut(peer, |p| p.on_delay(rtt)).await;
        let cost = rtt.saturating_add(self.config.route_cost);
        self.update_route(RouteEntry {
            dest: peer,
            next: peer,
            cost,
        })
        .await;
    }

    async fn handle_route_update(&self, sender: Ip4, dest: Ip4, cost: u32) {
        if dest == self.local || sender == self.local {
            return;
        }
        // Cost through `sender` is its announced cost plus our own direct
        // cost to it; without a direct route to the sender the announcement
        // is unusable.
        let direct = match self.route_to(sender).await {
            Some(entry) if entry.next == sender => entry.cost,
            _ => return,
        };
        self.update_route(RouteEntry {
            dest,
            next: sender,
            cost: cost.saturating_add(direct),
        })
        .await;
    }

    async fn handle_forward(&self, dst: Ip4, ciphertext: &[u8]) {
        if dst == self.local {
            match open(&self.key, ciphertext) {
                Ok(payload) => {
                    if let Err(e) = self.sink.deliver(Bytes::from(payload)).await {
                        warn!("payload delivery failed: {}", e);
                    }
                }
                Err(e) => debug!("forward payload dropped: {}", e),
            }
            return;
        }
        // Relay duty: one hop, direct connections only. Anything further
        // is the sender's problem to route.
        match self.peers.endpoint_if_connected(dst).await {
            Some(endpoint) => {
                let wire = Message::Forward {
                    dst,
                    ciphertext: Bytes::copy_from_slice(ciphertext),
                }
                .encode();
                self.send_to(&wire, SocketAddr::V4(endpoint)).await;
            }
            None => debug!("relay payload for {} dropped: no direct path", dst),
        }
    }

    async fn record_peer_endpoint(&self, addr: Ip4, endpoint: SocketAddrV4) {
        let local_known = self.local_endpoint().await.is_some();
        self.peers
            .upsert_with(addr, |p| p.on_endpoint(endpoint, local_known))
            .await;
    }

    async fn probe_connected_peers(&self) {
        let wire = Message::DelayProbe {
            sender: self.local,
            timestamp_ms: now_ms(),
        }
        .encode();
        for (_, endpoint) in self.peers.connected_endpoints().await {
            self.send_to(&wire, SocketAddr::V4(endpoint)).await;
        }
    }

    /// Apply a candidate route; on change, announce the stored entry
    pub async fn update_route(&self, candidate: RouteEntry) {
        if let Some(stored) = self.routes.apply(candidate).await {
            self.announce_route(stored).await;
        }
    }

    async fn announce_route(&self, entry: RouteEntry) {
        let wire = Message::RouteUpdate {
            sender: self.local,
            dest: entry.dest,
            cost: entry.cost,
        }
        .encode();
        for (addr, endpoint) in self.peers.connected_endpoints().await {
            if addr == entry.dest {
                continue;
            }
            self.send_to(&wire, SocketAddr::V4(endpoint)).await;
        }
    }

    async fn send_to(&self, data: &[u8], dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(data, dest).await {
            debug!("send to {} failed: {}", dest, e);
        }
    }
}

/// Milliseconds since the Unix epoch
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
