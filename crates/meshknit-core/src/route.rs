//! Distance-vector route table
//!
//! One entry per reachable destination: the next hop to send through and a
//! cost in milliseconds of measured round-trip time. An entry is replaced
//! when the candidate is strictly cheaper, or unconditionally when it comes
//! from the entry's current next hop, so a degraded or withdrawn path
//! propagates instead of being shadowed by its own stale advertisement.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::info;

use meshknit_network::Ip4;

/// Cost ceiling in milliseconds. Entries at the ceiling stay resident so a
/// withdrawal can be announced, but lookups skip them.
pub const UNREACHABLE: u32 = 30_000;

/// One routing decision: reach `dest` by sending to `next` at `cost`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub dest: Ip4,
    pub next: Ip4,
    pub cost: u32,
}

pub struct RouteTable {
    inner: RwLock<HashMap<Ip4, RouteEntry>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Offer a candidate route. Returns the stored entry if the table
    /// changed, `None` if the candidate was ignored.
    pub async fn apply(&self, candidate: RouteEntry) -> Option<RouteEntry> {
        let candidate = RouteEntry {
            cost: candidate.cost.min(UNREACHABLE),
            ..candidate
        };
        let mut routes = self.inner.write().await;
        match routes.get(&candidate.dest) {
            Some(current) if current == &candidate => None,
            Some(current) if candidate.cost < current.cost || current.next == candidate.next => {
                info!(
                    "route update: {} via {} cost {} (was via {} cost {})",
                    candidate.dest, candidate.next, candidate.cost, current.next, current.cost
                );
                routes.insert(candidate.dest, candidate);
                Some(candidate)
            }
            Some(_) => None,
            None => {
                if candidate.cost >= UNREACHABLE {
                    return None;
                }
                info!(
                    "route learned: {} via {} cost {}",
                    candidate.dest, candidate.next, candidate.cost
                );
                routes.insert(candidate.dest, candidate);
                Some(candidate)
            }
        }
    }

    /// Next hop toward `dest`, if a usable route exists
    pub async fn next_hop(&self, dest: Ip4) -> Option<Ip4> {
        let routes = self.inner.read().await;
        routes
            .get(&dest)
            .filter(|entry| entry.cost < UNREACHABLE)
            .map(|entry| entry.next)
    }

    /// Mark every route through `next` unreachable. Returns the entries
    /// that changed so they can be re-announced.
    pub async fn withdraw_via(&self, next: Ip4) -> Vec<RouteEntry> {
        let mut routes = self.inner.write().await;
        let mut changed = Vec::new();
        for entry in routes.values_mut() {
            if entry.next == next && entry.cost < UNREACHABLE {
                entry.cost = UNREACHABLE;
                info!("route withdrawn: {} via {}", entry.dest, entry.next);
                changed.push(*entry);
            }
        }
        changed
    }

    /// All usable entries, for periodic announcement
    pub async fn snapshot(&self) -> Vec<RouteEntry> {
        let routes = self.inner.read().await;
        routes
            .values()
            .filter(|entry| entry.cost < UNREACHABLE)
            .copied()
            .collect()
    }
}
