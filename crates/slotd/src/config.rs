//! slotd.toml configuration parser.
//!
//! Every field is optional; unset values fall back to the component
//! defaults. Durations are strings like `"500ms"`, `"10s"`, or `"2m"`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use slotgrid_hero::ResurrectorConfig;
use slotgrid_node::{FaultPolicy, Hesitation, NeverFail, NodeConfig, RandomFailure};
use slotgrid_starter::StarterConfig;

/// Topic start requests are published on unless configured otherwise.
pub const DEFAULT_TOPIC: &str = "app.start";

const MAX_HESITATION_EXPONENT: f64 = 4.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotdConfig {
    pub node: NodeSection,
    pub starter: StarterSection,
    pub hero: HeroSection,
    pub chaos: ChaosSection,
    pub bus: BusSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub heartbeat_interval: Option<String>,
    pub hesitation_base: Option<String>,
    pub hesitation_exponent: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StarterSection {
    pub idle_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeroSection {
    pub prefix: Option<String>,
    pub retry_backoff: Option<String>,
    pub from_cursor: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosSection {
    pub probability: Option<f64>,
    pub min_delay: Option<String>,
    pub max_delay: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub topic: Option<String>,
}

impl SlotdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let defaults = NodeConfig::default();
        let hesitation_defaults = Hesitation::default();

        let exponent = self
            .node
            .hesitation_exponent
            .unwrap_or(hesitation_defaults.exponent);
        if !(0.0..=MAX_HESITATION_EXPONENT).contains(&exponent) {
            bail!(
                "node.hesitation_exponent must be within [0, {MAX_HESITATION_EXPONENT}], got {exponent}"
            );
        }

        Ok(NodeConfig {
            heartbeat_interval: duration_or(
                &self.node.heartbeat_interval,
                "node.heartbeat_interval",
                defaults.heartbeat_interval,
            )?,
            hesitation: Hesitation {
                base: duration_or(
                    &self.node.hesitation_base,
                    "node.hesitation_base",
                    hesitation_defaults.base,
                )?,
                exponent,
            },
        })
    }

    pub fn starter_config(&self) -> anyhow::Result<StarterConfig> {
        Ok(StarterConfig {
            idle_timeout: duration_or(
                &self.starter.idle_timeout,
                "starter.idle_timeout",
                StarterConfig::default().idle_timeout,
            )?,
        })
    }

    pub fn resurrector_config(&self) -> anyhow::Result<ResurrectorConfig> {
        let defaults = ResurrectorConfig::default();
        Ok(ResurrectorConfig {
            prefix: self.hero.prefix.clone().unwrap_or(defaults.prefix),
            retry_backoff: duration_or(
                &self.hero.retry_backoff,
                "hero.retry_backoff",
                defaults.retry_backoff,
            )?,
            from_cursor: self.hero.from_cursor,
        })
    }

    /// The fault policy to install on every node; `NeverFail` unless a
    /// positive probability is configured.
    pub fn fault_policy(&self) -> anyhow::Result<Arc<dyn FaultPolicy>> {
        let probability = self.chaos.probability.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&probability) {
            bail!("chaos.probability must be within [0, 1], got {probability}");
        }
        if probability == 0.0 {
            return Ok(Arc::new(NeverFail));
        }

        let defaults = RandomFailure::default();
        Ok(Arc::new(RandomFailure {
            probability,
            min_delay: duration_or(&self.chaos.min_delay, "chaos.min_delay", defaults.min_delay)?,
            max_delay: duration_or(&self.chaos.max_delay, "chaos.max_delay", defaults.max_delay)?,
        }))
    }

    pub fn topic(&self) -> String {
        self.bus
            .topic
            .clone()
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string())
    }
}

fn duration_or(value: &Option<String>, field: &str, default: Duration) -> anyhow::Result<Duration> {
    match value {
        Some(s) => parse_duration(s)
            .with_context(|| format!("{field}: invalid duration {s:?}")),
        None => Ok(default),
    }
}

/// Parse `"500ms"`, `"10s"`, `"2m"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = SlotdConfig::from_toml_str("").unwrap();
        let node = config.node_config().unwrap();
        assert_eq!(node.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(node.hesitation, Hesitation::default());
        assert_eq!(config.starter_config().unwrap().idle_timeout, Duration::from_secs(10));
        assert_eq!(config.resurrector_config().unwrap().prefix, "/apps");
        assert_eq!(config.topic(), "app.start");
        assert!(config.fault_policy().unwrap().doom(&slotgrid_node::Instance::new("a", 0)).is_none());
    }

    #[test]
    fn parse_full_config() {
        let config = SlotdConfig::from_toml_str(
            r#"
[node]
heartbeat_interval = "1s"
hesitation_base = "5ms"
hesitation_exponent = 0.5

[starter]
idle_timeout = "2m"

[hero]
retry_backoff = "250ms"
from_cursor = 42

[chaos]
probability = 1.0
min_delay = "1s"
max_delay = "1s"

[bus]
topic = "starts"
"#,
        )
        .unwrap();

        let node = config.node_config().unwrap();
        assert_eq!(node.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(node.hesitation.base, Duration::from_millis(5));
        assert_eq!(node.hesitation.exponent, 0.5);
        assert_eq!(config.starter_config().unwrap().idle_timeout, Duration::from_secs(120));

        let hero = config.resurrector_config().unwrap();
        assert_eq!(hero.retry_backoff, Duration::from_millis(250));
        assert_eq!(hero.from_cursor, Some(42));

        let policy = config.fault_policy().unwrap();
        assert_eq!(
            policy.doom(&slotgrid_node::Instance::new("a", 0)),
            Some(Duration::from_secs(1))
        );
        assert_eq!(config.topic(), "starts");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = SlotdConfig::from_toml_str("[node]\nheartbeat_interval = \"soon\"").unwrap();
        assert!(config.node_config().is_err());

        let config = SlotdConfig::from_toml_str("[chaos]\nprobability = 1.5").unwrap();
        assert!(config.fault_policy().is_err());

        let config = SlotdConfig::from_toml_str("[node]\nhesitation_exponent = -1.0").unwrap();
        assert!(config.node_config().is_err());

        let config = SlotdConfig::from_toml_str("[node]\nhesitation_exponent = 20.0").unwrap();
        assert!(config.node_config().is_err());

        let config = SlotdConfig::from_toml_str("[node]\nhesitation_exponent = nan").unwrap();
        assert!(config.node_config().is_err());
    }

    #[test]
    fn example_config_parses() {
        let config = SlotdConfig::from_toml_str(include_str!("../slotd.example.toml")).unwrap();
        assert_eq!(config.node_config().unwrap().heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.resurrector_config().unwrap().retry_backoff, Duration::from_secs(1));
        assert!(config.fault_policy().is_ok());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
    }
}
