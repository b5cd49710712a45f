//! The periodic driver, end to end, with short timings.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::Result;
use central_mutex::config::{ProtocolConfig, SimulationConfig};
use central_mutex::election::{Handoff, LowestIdSuccessor, RandomSuccessor};
use central_mutex::message::NodeId;
use central_mutex::simulation::Simulation;
use tokio::time::sleep;

fn fast(handoff: Handoff) -> SimulationConfig {
    SimulationConfig {
        protocol: ProtocolConfig {
            usage: Duration::from_millis(20),
            retry_interval: Duration::from_millis(15),
        },
        spawn_interval: Duration::from_millis(30),
        rotation_interval: Duration::from_millis(100),
        max_nodes: Some(4),
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        base_port: 0,
        handoff,
    }
}

#[tokio::test]
async fn first_node_coordinates() -> Result<()> {
    let simulation = Simulation::start(fast(Handoff::Destructive), Box::new(LowestIdSuccessor)).await?;
    assert_eq!(simulation.cluster().coordinator(), Some(NodeId::new(1)));
    assert_eq!(simulation.cluster().len(), 1);

    let cluster = simulation.run_until(async {}).await;
    assert!(cluster.is_empty());
    assert_eq!(cluster.directory().lookup_endpoint(NodeId::new(1)), None);
    assert_eq!(cluster.directory().coordinator(), None);
    Ok(())
}

#[tokio::test]
async fn schedule_grows_and_rotates_without_overlap() -> Result<()> {
    for handoff in [Handoff::Destructive, Handoff::Preserve] {
        let simulation = Simulation::start(fast(handoff), Box::new(RandomSuccessor::seeded(3))).await?;
        let cluster = simulation
            .run_until(sleep(Duration::from_millis(600)))
            .await;

        assert!(cluster.is_empty());
        assert!(
            cluster.next_id().as_u64() > 4,
            "expected nodes to keep joining, next id {}",
            cluster.next_id()
        );
        assert!(cluster.resource().uses() > 0);
        assert_eq!(cluster.resource().violations(), 0);
        assert_eq!(cluster.resource().holder(), None);
    }
    Ok(())
}
