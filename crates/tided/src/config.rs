//! TOML configuration for the Tidepool daemon.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity and hosted pools.
    pub node: NodeSection,
    /// Placement group layout.
    pub pipeline: PipelineSection,
    /// Recovery backend tuning.
    pub recovery: RecoverySection,
    /// Workload generated by `tided simulate`.
    pub simulate: SimulateSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node id; decides which placement groups this node is primary for.
    pub node_id: u64,
    /// Number of pools hosted.
    pub pools: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: 0,
            pools: 1,
        }
    }
}

/// `[pipeline]` section.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Placement groups per pool.
    pub pgs_per_pool: Option<u32>,
    /// Replication factor: the node is primary for one in `replicas` groups
    /// and a non-primary replica for the rest.
    pub replicas: Option<u32>,
}

/// `[recovery]` section.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// Simulated time to recover one object, in milliseconds.
    pub simulated_delay_ms: Option<u64>,
    /// Fraction of recoveries that fail.
    pub fail_ratio: Option<f64>,
}

/// `[simulate]` section.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulateSection {
    /// Concurrent client connections.
    pub connections: u64,
    /// Ops sent on each connection.
    pub ops_per_connection: u64,
    /// Distinct object names per placement group.
    pub objects: u32,
    /// Fraction of ops that write.
    pub write_ratio: f64,
    /// Fraction of objects marked degraded before the run.
    pub degraded_ratio: f64,
    /// Whether reads carry the balance-reads flag.
    pub balance_reads: bool,
    /// Start new intervals on random placement groups during the run.
    pub churn: bool,
    /// RNG seed for the workload and the recovery backend.
    pub seed: u64,
}

impl Default for SimulateSection {
    fn default() -> Self {
        Self {
            connections: 4,
            ops_per_connection: 250,
            objects: 64,
            write_ratio: 0.5,
            degraded_ratio: 0.05,
            balance_reads: true,
            churn: false,
            seed: 42,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let config: CliConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, ratio) in [
            ("recovery.fail_ratio", self.recovery_fail_ratio()),
            ("simulate.write_ratio", self.simulate.write_ratio),
            ("simulate.degraded_ratio", self.simulate.degraded_ratio),
        ] {
            anyhow::ensure!(
                (0.0..=1.0).contains(&ratio),
                "{name} must be between 0 and 1, got {ratio}"
            );
        }
        anyhow::ensure!(self.node.pools > 0, "node.pools must be positive");
        anyhow::ensure!(self.pgs_per_pool() > 0, "pipeline.pgs_per_pool must be positive");
        anyhow::ensure!(self.replicas() > 0, "pipeline.replicas must be positive");
        Ok(())
    }

    /// Effective placement groups per pool (defaults to 8).
    pub fn pgs_per_pool(&self) -> u32 {
        self.pipeline.pgs_per_pool.unwrap_or(8)
    }

    /// Effective replication factor (defaults to 3).
    pub fn replicas(&self) -> u32 {
        self.pipeline.replicas.unwrap_or(3)
    }

    /// Effective simulated recovery delay in milliseconds (defaults to 5).
    pub fn recovery_delay_ms(&self) -> u64 {
        self.recovery.simulated_delay_ms.unwrap_or(5)
    }

    /// Effective recovery failure ratio (defaults to 0).
    pub fn recovery_fail_ratio(&self) -> f64 {
        self.recovery.fail_ratio.unwrap_or(0.0)
    }
}
