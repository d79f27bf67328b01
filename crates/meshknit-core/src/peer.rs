//! Per-peer connection state machine
//!
//! Each remote mesh participant is tracked by one `Peer`. The machine walks
//! `Init → Preparing → Synchronizing → Connecting → Connected`, falling back
//! to `Waiting` (backoff) or `Failed` (relay mandatory) on timeouts, and is
//! retried indefinitely while the overlay runs.
//!
//! `tick` is a pure state step: it mutates the peer and returns the I/O
//! actions the engine should perform, so the machine can be driven and
//! tested without sockets. Timers are counted in ticks of the engine's
//! discovery interval.

use std::net::SocketAddrV4;

use tracing::debug;

use meshknit_crypto::ChannelKey;
use meshknit_network::Ip4;

use crate::route::UNREACHABLE;

/// Floor of the retry delay, in ticks
pub const RETRY_MIN: u32 = 2;

/// Ceiling of the retry delay, in ticks
pub const RETRY_MAX: u32 = 64;

/// Ticks a handshake phase (Preparing/Synchronizing/Connecting) may take
/// before the attempt counts as failed
pub const HANDSHAKE_TICKS: u32 = 8;

/// Ticks without an inbound heartbeat before a Connected peer is demoted
pub const LIVENESS_TICKS: u32 = 4;

/// Consecutive failed attempts before the peer is marked Failed
pub const FAILURE_LIMIT: u32 = 4;

/// Connection state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No attempt made yet
    Init,
    /// Resolving the local public endpoint
    Preparing,
    /// Local endpoint published, waiting for the remote endpoint
    Synchronizing,
    /// Both endpoints known, probing direct reachability
    Connecting,
    /// Direct heartbeat acknowledged; direct sends preferred
    Connected,
    /// Backoff before the next attempt
    Waiting,
    /// Attempts exhausted; relay mandatory until the next retry cycle
    Failed,
}

/// What the peer machine heard in an inbound heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Heartbeat with the ack flag promoted the peer to Connected
    Promoted,
    /// Liveness refreshed
    Alive,
    /// Not in a state where heartbeats are meaningful; dropped
    Ignored,
}

/// I/O the engine should perform after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Local public endpoint unknown: issue a STUN binding request
    NeedStun,
    /// Publish our endpoint to this peer through the signaling path
    PublishEndpoint,
    /// Send a heartbeat to the peer's endpoint
    SendHeartbeat { endpoint: SocketAddrV4, ack: u8 },
    /// The direct link to a Connected peer was lost; withdraw its routes
    LinkDown,
}

/// Tick-time inputs from the engine
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// Peer-to-peer attempts enabled (config)
    pub p2p_enabled: bool,
    /// Our resolved public endpoint, if known
    pub local_endpoint: Option<SocketAddrV4>,
}

/// One remote mesh participant
pub struct Peer {
    addr: Ip4,
    key: ChannelKey,
    state: PeerState,
    endpoint: Option<SocketAddrV4>,
    ack: u8,
    ticks: u32,
    retry: u32,
    failures: u32,
    delay_ms: u32,
}

impl Peer {
    /// Create a peer in `Init` with its derived channel key
    pub fn new(addr: Ip4, key: ChannelKey) -> Self {
        Self {
            addr,
            key,
            state: PeerState::Init,
            endpoint: None,
            ack: 0,
            ticks: 0,
            retry: RETRY_MIN,
            failures: 0,
            delay_ms: UNREACHABLE,
        }
    }

    pub fn addr(&self) -> Ip4 {
        self.addr
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn endpoint(&self) -> Option<SocketAddrV4> {
        self.endpoint
    }

    /// Measured round-trip time to this peer, `UNREACHABLE` when unknown
    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    pub fn retry_delay(&self) -> u32 {
        self.retry
    }

    pub fn ack(&self) -> u8 {
        self.ack
    }

    /// Transition to a new state.
    ///
    /// Entering Init/Waiting/Failed clears endpoint and ack and resets the
    /// retry delay and delay estimate to their floors: a peer never carries
    /// stale connectivity state across a reset. Entering Connected clears
    /// the failure counter and retry delay.
    pub fn set_state(&mut self, next: PeerState) {
        self.ticks = 0;
        if self.state == next {
            return;
        }
        debug!("conn state: {} {:?} => {:?}", self.addr, self.state, next);
        match next {
            PeerState::Init | PeerState::Waiting | PeerState::Failed => {
                self.endpoint = None;
                self.ack = 0;
                self.retry = RETRY_MIN;
                self.delay_ms = UNREACHABLE;
            }
            PeerState::Connected => {
                self.failures = 0;
                self.retry = RETRY_MIN;
            }
            _ => {}
        }
        self.state = next;
    }

    /// Advance the machine by one tick
    pub fn tick(&mut self, ctx: &TickContext) -> Vec<PeerEvent> {
        match self.state {
            PeerState::Init => {
                if !ctx.p2p_enabled {
                    return Vec::new();
                }
                self.set_state(PeerState::Preparing);
                if ctx.local_endpoint.is_none() {
                    vec![PeerEvent::NeedStun]
                } else {
                    Vec::new()
                }
            }
            PeerState::Preparing => {
                if ctx.local_endpoint.is_some() {
                    // Remote endpoint may already be recorded if the peer
                    // announced itself first.
                    let next = if self.endpoint.is_some() {
                        PeerState::Connecting
                    } else {
                        PeerState::Synchronizing
                    };
                    self.set_state(next);
                    vec![PeerEvent::PublishEndpoint]
                } else {
                    self.ticks += 1;
                    if self.ticks > HANDSHAKE_TICKS {
                        self.fail_step()
                    } else {
                        vec![PeerEvent::NeedStun]
                    }
                }
            }
            PeerState::Synchronizing => {
                self.ticks += 1;
                if self.ticks > HANDSHAKE_TICKS {
                    self.fail_step()
                } else {
                    Vec::new()
                }
            }
            PeerState::Connecting => match self.endpoint {
                None => self.fail_step(),
                Some(endpoint) => {
                    self.ticks += 1;
                    if self.ticks > HANDSHAKE_TICKS {
                        self.fail_step()
                    } else {
                        vec![PeerEvent::SendHeartbeat {
                            endpoint,
                            ack: self.ack,
                        }]
                    }
                }
            },
            PeerState::Connected => match self.endpoint {
                None => self.fail_step(),
                Some(endpoint) => {
                    self.ticks += 1;
                    if self.ticks > LIVENESS_TICKS {
                        let mut events = self.fail_step();
                        events.push(PeerEvent::LinkDown);
                        events
                    } else {
                        vec![PeerEvent::SendHeartbeat {
                            endpoint,
                            ack: self.ack,
                        }]
                    }
                }
            },
            PeerState::Waiting => {
                if self.ticks == 0 {
                    // Dwell time grows with the consecutive-failure count;
                    // the stored delay sits at its floor until the first
                    // tick after the reset.
                    self.retry = backoff_delay(self.failures);
                }
                self.ticks += 1;
                if self.ticks >= self.retry {
                    self.set_state(PeerState::Init);
                }
                Vec::new()
            }
            PeerState::Failed => {
                self.ticks += 1;
                if self.ticks >= RETRY_MAX {
                    self.set_state(PeerState::Init);
                }
                Vec::new()
            }
        }
    }

    /// Record an inbound heartbeat observed at `from`
    pub fn on_heartbeat(&mut self, from: SocketAddrV4, ack: u8) -> HeartbeatOutcome {
        match self.state {
            PeerState::Connecting => {
                self.endpoint = Some(from);
                self.ack = 1;
                self.ticks = 0;
                if ack != 0 {
                    self.set_state(PeerState::Connected);
                    HeartbeatOutcome::Promoted
                } else {
                    HeartbeatOutcome::Alive
                }
            }
            PeerState::Connected => {
                self.endpoint = Some(from);
                self.ack = 1;
                self.ticks = 0;
                HeartbeatOutcome::Alive
            }
            PeerState::Synchronizing => {
                // The remote already learned our endpoint and started
                // probing; skip straight to the probe exchange.
                self.endpoint = Some(from);
                self.ack = 1;
                self.set_state(PeerState::Connecting);
                HeartbeatOutcome::Alive
            }
            _ => HeartbeatOutcome::Ignored,
        }
    }

    /// Record the peer's published public endpoint.
    ///
    /// `local_known` tells the machine whether our own public endpoint has
    /// been resolved; with both sides known the probe exchange can start.
    pub fn on_endpoint(&mut self, endpoint: SocketAddrV4, local_known: bool) {
        self.endpoint = Some(endpoint);
        match self.state {
            PeerState::Connecting | PeerState::Connected => {}
            _ => {
                if local_known {
                    self.set_state(PeerState::Connecting);
                } else {
                    self.set_state(PeerState::Preparing);
                }
            }
        }
    }

    /// Record a measured round-trip time
    pub fn on_delay(&mut self, rtt_ms: u32) {
        self.delay_ms = rtt_ms.min(UNREACHABLE);
    }

    /// One failed attempt: back off, or give up into Failed
    fn fail_step(&mut self) -> Vec<PeerEvent> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= FAILURE_LIMIT {
            self.set_state(PeerState::Failed);
        } else {
            self.set_state(PeerState::Waiting);
        }
        Vec::new()
    }
}

/// Waiting dwell time for a given consecutive-failure count
fn backoff_delay(failures: u32) -> u32 {
    RETRY_MIN
        .checked_shl(failures)
        .unwrap_or(RETRY_MAX)
        .clamp(RETRY_MIN, RETRY_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshknit_crypto::derive_key;

    fn peer() -> Peer {
        let addr: Ip4 = "10.4.0.9".parse().unwrap();
        Peer::new(addr, derive_key("secret", addr.raw()))
    }

    fn ep(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn ctx(local: Option<&str>) -> TickContext {
        TickContext {
            p2p_enabled: true,
            local_endpoint: local.map(|s| s.parse().unwrap()),
        }
    }

    #[test]
    fn test_reset_clears_connectivity_state() {
        for reset in [PeerState::Init, PeerState::Waiting, PeerState::Failed] {
            let mut p = peer();
            p.on_endpoint(ep("203.0.113.9:4000"), true);
            p.on_heartbeat(ep("203.0.113.9:4000"), 1);
            assert_eq!(p.state(), PeerState::Connected);
            p.on_delay(17);

            p.set_state(reset);
            assert_eq!(p.endpoint(), None);
            assert_eq!(p.ack(), 0);
            assert_eq!(p.retry_delay(), RETRY_MIN);
            assert_eq!(p.delay_ms(), UNREACHABLE);
        }
    }

    #[test]
    fn test_happy_path_to_connected() {
        let mut p = peer();
        let c = ctx(Some("198.51.100.1:5000"));

        // Init -> Preparing
        assert!(p.tick(&c).is_empty());
        assert_eq!(p.state(), PeerState::Preparing);

        // Preparing with local endpoint known -> publish, Synchronizing
        let events = p.tick(&c);
        assert_eq!(events, vec![PeerEvent::PublishEndpoint]);
        assert_eq!(p.state(), PeerState::Synchronizing);

        // Remote endpoint arrives -> Connecting
        p.on_endpoint(ep("203.0.113.9:4000"), true);
        assert_eq!(p.state(), PeerState::Connecting);

        // Connecting emits heartbeats with ack 0
        let events = p.tick(&c);
        assert_eq!(
            events,
            vec![PeerEvent::SendHeartbeat {
                endpoint: ep("203.0.113.9:4000"),
                ack: 0
            }]
        );

        // Peer heard us: acked heartbeat promotes to Connected
        assert_eq!(
            p.on_heartbeat(ep("203.0.113.9:4000"), 1),
            HeartbeatOutcome::Promoted
        );
        assert_eq!(p.state(), PeerState::Connected);

        // Connected heartbeats carry our ack flag
        let events = p.tick(&c);
        assert_eq!(
            events,
            vec![PeerEvent::SendHeartbeat {
                endpoint: ep("203.0.113.9:4000"),
                ack: 1
            }]
        );
    }

    #[test]
    fn test_unacked_heartbeat_does_not_promote() {
        let mut p = peer();
        p.on_endpoint(ep("203.0.113.9:4000"), true);
        assert_eq!(p.state(), PeerState::Connecting);
        assert_eq!(
            p.on_heartbeat(ep("203.0.113.9:4000"), 0),
            HeartbeatOutcome::Alive
        );
        assert_eq!(p.state(), PeerState::Connecting);
        assert_eq!(p.ack(), 1);
    }

    #[test]
    fn test_stun_requested_until_local_endpoint_known() {
        let mut p = peer();
        let no_local = ctx(None);
        assert_eq!(p.tick(&no_local), vec![PeerEvent::NeedStun]);
        assert_eq!(p.state(), PeerState::Preparing);
        assert_eq!(p.tick(&no_local), vec![PeerEvent::NeedStun]);
    }

    #[test]
    fn test_p2p_disabled_stays_init() {
        let mut p = peer();
        let c = TickContext {
            p2p_enabled: false,
            local_endpoint: None,
        };
        for _ in 0..20 {
            assert!(p.tick(&c).is_empty());
        }
        assert_eq!(p.state(), PeerState::Init);
    }

    #[test]
    fn test_liveness_timeout_demotes_and_withdraws() {
        let mut p = peer();
        p.on_endpoint(ep("203.0.113.9:4000"), true);
        p.on_heartbeat(ep("203.0.113.9:4000"), 1);
        assert_eq!(p.state(), PeerState::Connected);

        let c = ctx(Some("198.51.100.1:5000"));
        let mut saw_link_down = false;
        for _ in 0..=LIVENESS_TICKS + 1 {
            if p.tick(&c).contains(&PeerEvent::LinkDown) {
                saw_link_down = true;
                break;
            }
        }
        assert!(saw_link_down);
        assert_eq!(p.state(), PeerState::Waiting);
        assert_eq!(p.endpoint(), None);
    }

    #[test]
    fn test_backoff_monotonic_until_ceiling() {
        let mut p = peer();
        let c = ctx(Some("198.51.100.1:5000"));
        let mut dwells: Vec<u32> = Vec::new();

        // Drive repeated failed connect attempts and record each Waiting
        // dwell. on_endpoint restarts the attempt after every backoff.
        for _ in 0..FAILURE_LIMIT - 1 {
            p.on_endpoint(ep("203.0.113.9:4000"), true);
            assert_eq!(p.state(), PeerState::Connecting);
            while p.state() == PeerState::Connecting {
                p.tick(&c);
            }
            assert_eq!(p.state(), PeerState::Waiting);
            assert_eq!(p.retry_delay(), RETRY_MIN); // floor right after reset
            let mut dwell = 0;
            while p.state() == PeerState::Waiting {
                p.tick(&c);
                dwell += 1;
            }
            dwells.push(dwell);
        }

        assert!(dwells.windows(2).all(|w| w[0] <= w[1]), "{:?}", dwells);
        assert!(dwells.iter().all(|&d| d <= RETRY_MAX));
    }

    #[test]
    fn test_failure_limit_reaches_failed_then_retries() {
        let mut p = peer();
        let c = ctx(Some("198.51.100.1:5000"));

        for _ in 0..FAILURE_LIMIT {
            p.on_endpoint(ep("203.0.113.9:4000"), true);
            while matches!(p.state(), PeerState::Connecting | PeerState::Waiting) {
                p.tick(&c);
            }
        }
        assert_eq!(p.state(), PeerState::Failed);

        // Failed is still retried after its dwell.
        for _ in 0..=RETRY_MAX {
            p.tick(&c);
        }
        assert_ne!(p.state(), PeerState::Failed);
    }

    #[test]
    fn test_connected_resets_failures() {
        let mut p = peer();
        let c = ctx(Some("198.51.100.1:5000"));

        // One failed attempt...
        p.on_endpoint(ep("203.0.113.9:4000"), true);
        while p.state() == PeerState::Connecting {
            p.tick(&c);
        }
        assert_eq!(p.state(), PeerState::Waiting);

        // ...then a successful one.
        p.on_endpoint(ep("203.0.113.9:4000"), true);
        p.on_heartbeat(ep("203.0.113.9:4000"), 1);
        assert_eq!(p.state(), PeerState::Connected);
        assert_eq!(p.retry_delay(), RETRY_MIN);

        // The next failure backs off from the floor again.
        let mut q = peer();
        q.on_endpoint(ep("203.0.113.9:4000"), true);
        while q.state() == PeerState::Connecting {
            q.tick(&c);
        }
        let mut first_dwell = 0;
        while q.state() == PeerState::Waiting {
            q.tick(&c);
            first_dwell += 1;
        }

        while p.state() == PeerState::Connected {
            p.tick(&c);
        }
        let mut dwell_after_success = 0;
        while p.state() == PeerState::Waiting {
            p.tick(&c);
            dwell_after_success += 1;
        }
        assert_eq!(dwell_after_success, first_dwell);
    }

    #[test]
    fn test_endpoint_update_while_connected() {
        let mut p = peer();
        p.on_endpoint(ep("203.0.113.9:4000"), true);
        p.on_heartbeat(ep("203.0.113.9:4000"), 1);

        // NAT rebinding moved the peer; heartbeat refreshes the endpoint.
        p.on_heartbeat(ep("203.0.113.9:4001"), 1);
        assert_eq!(p.state(), PeerState::Connected);
        assert_eq!(p.endpoint(), Some(ep("203.0.113.9:4001")));
    }

    #[test]
    fn test_heartbeat_ignored_in_idle_states() {
        let mut p = peer();
        assert_eq!(
            p.on_heartbeat(ep("203.0.113.9:4000"), 1),
            HeartbeatOutcome::Ignored
        );
        assert_eq!(p.state(), PeerState::Init);
        assert_eq!(p.endpoint(), None);
    }
}
