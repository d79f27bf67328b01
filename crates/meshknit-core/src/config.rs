//! Overlay configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshknit_network::Cidr;

use crate::error::{CoreError, CoreResult};

/// Overlay engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Mesh-wide shared secret; per-peer keys are derived from it
    pub secret: String,

    /// This node's mesh address with prefix, e.g. "10.4.0.5/24"
    pub address: String,

    /// Rendezvous server URI (`stun://host[:port]` or `host[:port]`).
    /// The same host answers STUN binding requests and relays Forward
    /// datagrams. Optional: without it, only LAN-direct paths work.
    pub rendezvous: Option<String>,

    /// Local bind address for the overlay socket
    pub bind_addr: String,

    /// Listen port (0 = ephemeral)
    pub listen_port: u16,

    /// Interval of the discovery/retry tick
    pub tick_interval: Duration,

    /// Base cost added to the measured direct round-trip time.
    /// Biases route selection toward fewer hops.
    pub route_cost: u32,

    /// Disable peer-to-peer attempts; all traffic goes through the relay
    pub p2p_disabled: bool,

    /// Maximum payload size accepted from the interface driver
    pub mtu: u16,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            address: "10.4.0.1/24".to_string(),
            rendezvous: None,
            bind_addr: "0.0.0.0".to_string(),
            listen_port: 0,
            tick_interval: Duration::from_secs(1),
            route_cost: 5,
            p2p_disabled: false,
            mtu: 1400,
        }
    }
}

impl OverlayConfig {
    /// Validate the configuration; called once at engine construction
    pub fn validate(&self) -> CoreResult<()> {
        if self.secret.is_empty() {
            return Err(CoreError::Config("shared secret must not be empty".into()));
        }
        self.address
            .parse::<Cidr>()
            .map_err(|e| CoreError::Config(format!("bad mesh address: {}", e)))?;
        if self.tick_interval.is_zero() {
            return Err(CoreError::Config("tick interval must be non-zero".into()));
        }
        if self.mtu == 0 {
            return Err(CoreError::Config("mtu must be non-zero".into()));
        }
        Ok(())
    }

    /// Parsed mesh address
    pub fn cidr(&self) -> CoreResult<Cidr> {
        self.address
            .parse::<Cidr>()
            .map_err(|e| CoreError::Config(format!("bad mesh address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> OverlayConfig {
        OverlayConfig {
            secret: "knit".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_needs_secret() {
        assert!(OverlayConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_address() {
        let cfg = OverlayConfig {
            address: "10.4.0.1".into(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let cfg = OverlayConfig {
            tick_interval: Duration::ZERO,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }
}
