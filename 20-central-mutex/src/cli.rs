use std::net::IpAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::{ProtocolConfig, SimulationConfig};
use crate::election::{Handoff, LowestIdSuccessor, RandomSuccessor, SuccessorStrategy};

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulate centralized mutual exclusion with a rotating coordinator", long_about = None)]
pub struct Cli {
    /// How long a granted node keeps the resource, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub usage_ms: u64,

    /// How often an idle or waiting node (re)sends its request, in milliseconds.
    #[arg(long, default_value_t = 20_000, value_parser = clap::value_parser!(u64).range(1..))]
    pub retry_ms: u64,

    /// How often a new node joins, in milliseconds.
    #[arg(long, default_value_t = 40_000, value_parser = clap::value_parser!(u64).range(1..))]
    pub spawn_ms: u64,

    /// How often the coordinator is replaced, in milliseconds.
    #[arg(long, default_value_t = 40_000, value_parser = clap::value_parser!(u64).range(1..))]
    pub rotate_ms: u64,

    /// Stop adding nodes once this many are alive.
    #[arg(long)]
    pub max_nodes: Option<usize>,

    /// Address every node binds on.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port of node 1; later nodes take the following ports. Use 0 for ephemeral ports.
    #[arg(long, default_value_t = 8080)]
    pub base_port: u16,

    /// What happens to the lock and queue on rotation.
    #[arg(long, value_enum, default_value_t = Handoff::Destructive)]
    pub handoff: Handoff,

    /// How the next coordinator is picked.
    #[arg(long, value_enum, default_value_t = Successor::Random)]
    pub successor: Successor,

    /// Seed for random successor selection.
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Successor {
    Random,
    Lowest,
}

impl Cli {
    /// Converts the parsed flags into driver settings.
    pub fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            protocol: ProtocolConfig {
                usage: Duration::from_millis(self.usage_ms),
                retry_interval: Duration::from_millis(self.retry_ms),
            },
            spawn_interval: Duration::from_millis(self.spawn_ms),
            rotation_interval: Duration::from_millis(self.rotate_ms),
            max_nodes: self.max_nodes,
            host: self.host,
            base_port: self.base_port,
            handoff: self.handoff,
        }
    }

    /// Successor strategy named by `--successor`. A random strategy uses
    /// `--seed` when given and fresh entropy otherwise.
    pub fn strategy(&self) -> Box<dyn SuccessorStrategy> {
        match (self.successor, self.seed) {
            (Successor::Lowest, _) => Box::new(LowestIdSuccessor),
            (Successor::Random, Some(seed)) => Box::new(RandomSuccessor::seeded(seed)),
            (Successor::Random, None) => Box::new(RandomSuccessor::new()),
        }
    }
}
