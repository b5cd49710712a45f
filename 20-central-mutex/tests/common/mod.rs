//! Shared harness for the integration tests: a cluster on loopback with
//! ephemeral ports, plus polling helpers.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::{Context, Result, bail};
use central_mutex::cluster::Cluster;
use central_mutex::config::ProtocolConfig;
use central_mutex::directory::Endpoint;
use central_mutex::election::{Handoff, LowestIdSuccessor};
use central_mutex::message::NodeId;
use central_mutex::node::{NodeHandle, NodeStatus};
use tokio::time::{Instant, sleep};

pub const WAIT: Duration = Duration::from_secs(3);

/// Timings long enough that nothing happens unless a test asks for it.
pub fn manual() -> ProtocolConfig {
    ProtocolConfig {
        usage: Duration::from_secs(3600),
        retry_interval: Duration::from_secs(3600),
    }
}

pub fn loopback() -> Endpoint {
    Endpoint::from(([127, 0, 0, 1], 0))
}

pub fn id(raw: u64) -> NodeId {
    NodeId::new(raw)
}

/// Starts nodes `1..=n` on ephemeral ports and makes node 1 the coordinator.
pub async fn cluster(n: u64, config: ProtocolConfig, handoff: Handoff) -> Result<Cluster> {
    let mut cluster = Cluster::new(config, handoff, LowestIdSuccessor);
    for _ in 0..n {
        cluster.spawn_node(loopback()).await?;
    }
    cluster.promote_to_coordinator(id(1)).await?;
    Ok(cluster)
}

pub fn node(cluster: &Cluster, raw: u64) -> Result<&NodeHandle> {
    cluster
        .node(id(raw))
        .with_context(|| format!("node {raw} is not running"))
}

/// Polls `handle` until `check` holds or [`WAIT`] passes.
pub async fn wait_until<F>(handle: &NodeHandle, what: &str, mut check: F) -> Result<NodeStatus>
where
    F: FnMut(&NodeStatus) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let status = handle.status().await?;
        if check(&status) {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            bail!("node {} never reached: {what}; last status {status:?}", handle.id());
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Gives in-flight datagrams a chance to land before asserting that nothing
/// changed.
pub async fn settle() {
    sleep(Duration::from_millis(100)).await;
}
