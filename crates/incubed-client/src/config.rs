//! TOML configuration for an Incubed client.
//!
//! Loaded from a path; a missing file yields the defaults. `INCUBED_LOG`
//! overrides the configured log level.

use alloy_primitives::U256;
use incubed_registry::{ConvictionConfig, WatcherConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const LOG_ENV: &str = "INCUBED_LOG";
/// Smallest accepted weight unit, one szabo.
pub const MIN_WEIGHT_UNIT_WEI: u64 = 1_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub watcher: WatcherSection,
    #[serde(default)]
    pub conviction: ConvictionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// How much of a response is checked before it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProofMode {
    /// Accept answers without a proof.
    None,
    #[default]
    Standard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Nodes asked in parallel for each request.
    pub request_count: usize,
    /// Extra nodes asked to sign the proven block hash.
    pub signature_count: usize,
    pub timeout_ms: u64,
    /// Nodes tried in total before a request fails.
    pub max_attempts: usize,
    pub proof: ProofMode,
    /// Seed for node selection; random when absent.
    pub seed: Option<u64>,
    /// Seconds after which one health strike is forgiven.
    pub health_decay_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            request_count: 1,
            signature_count: 0,
            timeout_ms: 10_000,
            max_attempts: 7,
            proof: ProofMode::Standard,
            seed: None,
            health_decay_secs: 300,
        }
    }
}

impl ClientSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn health_decay(&self) -> Duration {
        Duration::from_secs(self.health_decay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    pub deploy_block: u64,
    pub reorg_depth: usize,
    pub poll_interval_ms: u64,
    /// Deposit (in wei) that counts as one unit of selection weight.
    pub weight_unit_wei: u64,
    /// Where committed syncs are persisted; in memory when absent.
    pub checkpoint_path: Option<String>,
}

impl Default for WatcherSection {
    fn default() -> Self {
        let defaults = WatcherConfig::default();
        Self {
            deploy_block: defaults.deploy_block,
            reorg_depth: defaults.reorg_depth,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            weight_unit_wei: 1_000_000_000_000_000,
            checkpoint_path: None,
        }
    }
}

impl From<&WatcherSection> for WatcherConfig {
    fn from(section: &WatcherSection) -> Self {
        Self {
            deploy_block: section.deploy_block,
            reorg_depth: section.reorg_depth,
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            weight_unit_wei: U256::from(section.weight_unit_wei),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvictionSection {
    pub reveal_window_blocks: u64,
    pub direct_lookup_blocks: u64,
    pub poll_interval_ms: u64,
    pub max_voters: usize,
    pub epoch_secs: u64,
}

impl Default for ConvictionSection {
    fn default() -> Self {
        let defaults = ConvictionConfig::default();
        Self {
            reveal_window_blocks: defaults.reveal_window_blocks,
            direct_lookup_blocks: defaults.direct_lookup_blocks,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            max_voters: defaults.max_voters,
            epoch_secs: defaults.epoch_secs,
        }
    }
}

impl From<&ConvictionSection> for ConvictionConfig {
    fn from(section: &ConvictionSection) -> Self {
        Self {
            reveal_window_blocks: section.reveal_window_blocks,
            direct_lookup_blocks: section.direct_lookup_blocks,
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            max_voters: section.max_voters,
            epoch_secs: section.epoch_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// trace | debug | info | warn | error, or a full filter directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            let s = std::fs::read_to_string(path)?;
            Self::parse(&s)?
        } else {
            Self::default()
        };
        if let Ok(level) = std::env::var(LOG_ENV) {
            cfg.logging.level = level;
        }
        Ok(cfg)
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let cfg: ClientConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.client.request_count == 0 {
            anyhow::bail!("client.request_count must be at least 1");
        }
        if self.client.max_attempts < self.client.request_count {
            anyhow::bail!(
                "client.max_attempts ({}) is below client.request_count ({})",
                self.client.max_attempts,
                self.client.request_count
            );
        }
        if self.watcher.weight_unit_wei < MIN_WEIGHT_UNIT_WEI {
            anyhow::bail!(
                "watcher.weight_unit_wei ({}) is below {MIN_WEIGHT_UNIT_WEI}",
                self.watcher.weight_unit_wei
            );
        }
        if self.conviction.reveal_window_blocks == 0 {
            anyhow::bail!("conviction.reveal_window_blocks must be at least 1");
        }
        Ok(())
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        (&self.watcher).into()
    }

    pub fn conviction_config(&self) -> ConvictionConfig {
        (&self.conviction).into()
    }

    pub fn example_toml() -> &'static str {
        r#"# Incubed client configuration
# All values shown are defaults.

[client]
request_count     = 1       # nodes asked in parallel
signature_count   = 0       # extra nodes asked to sign the block hash
timeout_ms        = 10000   # per node
max_attempts      = 7       # nodes tried before giving up
proof             = "standard"  # none | standard
# seed            = 42      # fixed node selection
health_decay_secs = 300

[watcher]
deploy_block     = 0
reorg_depth      = 16
poll_interval_ms = 5000
weight_unit_wei  = 1000000000000000  # 1 finney per unit of weight
# checkpoint_path = "./data/nodelist.json"

[conviction]
reveal_window_blocks = 128
direct_lookup_blocks = 256
poll_interval_ms     = 1000
max_voters           = 24
epoch_secs           = 3600

[logging]
level = "info"  # RUST_LOG takes precedence
"#
    }
}
