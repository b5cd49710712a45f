//! Periodic driver: adds a node every spawn interval and rotates the
//! coordinator every rotation interval.
//!
//! The driver only calls the cluster's lifecycle hooks; it never reaches into
//! protocol state.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::select;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterError};
use crate::config::{tick_period, SimulationConfig};
use crate::election::SuccessorStrategy;
use crate::message::NodeId;

/// A cluster plus the schedule that grows it and rotates its coordinator.
pub struct Simulation {
    cluster: Cluster,
    config: SimulationConfig,
}

impl Simulation {
    /// Creates node 1 and makes it the first coordinator.
    pub async fn start(
        config: SimulationConfig,
        strategy: Box<dyn SuccessorStrategy>,
    ) -> Result<Self> {
        let mut cluster = Cluster::with_strategy(config.protocol, config.handoff, strategy);
        let first = cluster.next_id();
        cluster
            .create_node(first, config.endpoint_for(first))
            .await
            .context("failed to start the first node")?;
        cluster
            .promote_to_coordinator(first)
            .await
            .context("failed to promote the first coordinator")?;

        Ok(Self { cluster, config })
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Drives the schedule until `shutdown` completes, then stops every node.
    /// Returns the cluster so callers can inspect what is left of it.
    pub async fn run_until<F>(mut self, shutdown: F) -> Cluster
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut spawns = ticker(self.config.spawn_interval);
        let mut rotations = ticker(self.config.rotation_interval);

        loop {
            select! {
                _ = &mut shutdown => break,
                _ = spawns.tick() => self.spawn_next().await,
                _ = rotations.tick() => self.rotate().await,
            }
        }

        info!(nodes = ?self.cluster.ids(), "simulation stopping");
        self.cluster.shutdown_all().await;
        self.cluster
    }

    /// [`Simulation::run_until`] with ctrl-c as the shutdown signal.
    pub async fn run_until_ctrl_c(self) -> Cluster {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    async fn spawn_next(&mut self) {
        if let Some(max) = self.config.max_nodes {
            if self.cluster.len() >= max {
                return;
            }
        }
        let id: NodeId = self.cluster.next_id();
        let endpoint = self.config.endpoint_for(id);
        match self.cluster.create_node(id, endpoint).await {
            Ok(node) => info!(node = %id, endpoint = %node.endpoint(), "node joined"),
            Err(err) => warn!(node = %id, error = %err, "failed to create node"),
        }
    }

    async fn rotate(&mut self) {
        match self.cluster.rotate_coordinator().await {
            Ok(id) => {
                info!(
                    coordinator = %id,
                    handoff = ?self.cluster.handoff(),
                    "rotation complete"
                );
                for status in self.cluster.statuses().await {
                    debug!(
                        node = %status.id,
                        state = ?status.state,
                        coordinator = status.is_coordinator,
                        queue = ?status.queue,
                        "node status"
                    );
                }
            }
            Err(ClusterError::NoSuccessor(id)) => {
                info!(coordinator = %id, "only one node alive; rotation skipped");
            }
            Err(err) => warn!(error = %err, "rotation failed"),
        }
    }
}

fn ticker(period: Duration) -> time::Interval {
    let period = tick_period(period);
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
