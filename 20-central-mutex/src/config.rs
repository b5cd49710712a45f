//! Timing and placement settings. The protocol never hard-codes a duration;
//! everything here is injected by the host.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::directory::Endpoint;
use crate::election::Handoff;
use crate::message::NodeId;

/// Shortest period a repeating timer is allowed to run at.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// `configured`, raised to [`MIN_PERIOD`] when it is shorter. A zero period
/// is not a valid tick rate.
pub fn tick_period(configured: Duration) -> Duration {
    configured.max(MIN_PERIOD)
}

/// Settings every node needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// How long a node keeps the resource once granted.
    pub usage: Duration,
    /// How often a node that is not using the resource (re)sends a request.
    /// Clamped to [`MIN_PERIOD`].
    pub retry_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            usage: Duration::from_secs(10),
            retry_interval: Duration::from_secs(20),
        }
    }
}

/// Settings for the periodic driver that grows the cluster and rotates the
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    pub protocol: ProtocolConfig,
    /// Time between node creations. Clamped to [`MIN_PERIOD`].
    pub spawn_interval: Duration,
    /// Time between rotations. Clamped to [`MIN_PERIOD`].
    pub rotation_interval: Duration,
    /// Stop creating nodes once this many are alive. `None` means unbounded.
    pub max_nodes: Option<usize>,
    pub host: IpAddr,
    /// Port of node 1; node `n` binds `base_port + n - 1`. Zero binds every
    /// node to an ephemeral port.
    pub base_port: u16,
    pub handoff: Handoff,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            spawn_interval: Duration::from_secs(40),
            rotation_interval: Duration::from_secs(40),
            max_nodes: None,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: 8080,
            handoff: Handoff::default(),
        }
    }
}

impl SimulationConfig {
    /// Endpoint node `id` should bind. Falls back to an ephemeral port when
    /// the computed port would overflow.
    pub fn endpoint_for(&self, id: NodeId) -> Endpoint {
        let port = if self.base_port == 0 {
            0
        } else {
            id.as_u64()
                .checked_sub(1)
                .and_then(|offset| u16::try_from(offset).ok())
                .and_then(|offset| self.base_port.checked_add(offset))
                .unwrap_or(0)
        };
        SocketAddr::new(self.host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_periods_are_clamped() {
        assert_eq!(tick_period(Duration::ZERO), MIN_PERIOD);
        assert_eq!(tick_period(Duration::from_secs(20)), Duration::from_secs(20));
    }

    #[test]
    fn endpoints_follow_base_port() {
        let config = SimulationConfig::default();
        assert_eq!(config.endpoint_for(NodeId::new(1)).port(), 8080);
        assert_eq!(config.endpoint_for(NodeId::new(4)).port(), 8083);
        assert_eq!(config.endpoint_for(NodeId::new(70_000)).port(), 0);

        let ephemeral = SimulationConfig {
            base_port: 0,
            ..SimulationConfig::default()
        };
        assert_eq!(ephemeral.endpoint_for(NodeId::new(3)).port(), 0);
    }
}
