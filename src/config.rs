//! Typed configuration surface.
//!
//! Layered defaults → `nebula.toml` → environment → explicit overrides,
//! without a full CLI-discovery/phase-override surface — this crate only
//! recognizes the nebula-wide and per-phase values it actually consumes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::gater::GateMode;

/// Nebula-wide configuration. Per-phase overrides (`allow_scope_overlap`,
/// `speculative`, `gate`) live on `PhaseSpec` itself, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NebulaConfig {
    pub max_workers: usize,
    pub max_review_cycles: u32,
    pub max_budget_usd: f64,
    pub max_filter_fixes: u32,
    pub cache_optimization: bool,
    #[serde(with = "humantime_secs")]
    pub hail_timeout: Duration,
    #[serde(with = "humantime_secs")]
    pub stale_claim: Duration,
    #[serde(with = "humantime_secs")]
    pub stale_epoch: Duration,
    pub speculative: bool,
    pub gate: GateMode,
    /// Command used to invoke the reference LLM invoker's CLI subprocess.
    pub claude_cmd: String,
}

impl Default for NebulaConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            max_review_cycles: 5,
            max_budget_usd: 0.0,
            max_filter_fixes: 3,
            cache_optimization: true,
            hail_timeout: Duration::from_secs(5 * 60),
            stale_claim: Duration::from_secs(30 * 60),
            stale_epoch: Duration::from_secs(60 * 60),
            speculative: false,
            gate: GateMode::Trust,
            claude_cmd: "claude".to_string(),
        }
    }
}

impl NebulaConfig {
    /// Load layered configuration: defaults, then `path` (if it exists),
    /// then environment overrides named `NEBULA_<FIELD_UPPER>`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NEBULA_MAX_WORKERS")
            && let Ok(v) = v.parse()
        {
            self.max_workers = v;
        }
        if let Ok(v) = std::env::var("NEBULA_MAX_BUDGET_USD")
            && let Ok(v) = v.parse()
        {
            self.max_budget_usd = v;
        }
        if let Ok(v) = std::env::var("NEBULA_SPECULATIVE") {
            self.speculative = v != "false" && v != "0";
        }
        if let Ok(v) = std::env::var("NEBULA_CLAUDE_CMD") {
            self.claude_cmd = v;
        }
    }

    /// Whether speculative dispatch requires at least 2 worker slots:
    /// `max_workers=1` rules it out regardless of the `speculative` flag.
    pub fn speculative_possible(&self) -> bool {
        self.speculative && self.max_workers >= 2
    }
}

/// Serializes a `Duration` as whole seconds; `toml` has no native duration
/// type and the corpus's config layer uses plain scalar fields for this
/// reason.
mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_spec() {
        let config = NebulaConfig::default();
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.max_review_cycles, 5);
        assert_eq!(config.max_filter_fixes, 3);
        assert!(config.cache_optimization);
        assert_eq!(config.hail_timeout, Duration::from_secs(300));
        assert_eq!(config.stale_claim, Duration::from_secs(1800));
        assert_eq!(config.stale_epoch, Duration::from_secs(3600));
        assert!(!config.speculative);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let config = NebulaConfig::load(Path::new("/nonexistent/nebula.toml")).unwrap();
        assert_eq!(config.max_workers, 1);
    }

    #[test]
    fn load_parses_toml_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_workers = 4\nspeculative = true").unwrap();
        let config = NebulaConfig::load(file.path()).unwrap();
        assert_eq!(config.max_workers, 4);
        assert!(config.speculative);
    }

    #[test]
    fn speculative_possible_requires_two_workers() {
        let mut config = NebulaConfig::default();
        config.speculative = true;
        config.max_workers = 1;
        assert!(!config.speculative_possible());
        config.max_workers = 2;
        assert!(config.speculative_possible());
    }

    #[test]
    fn max_budget_zero_disables_budget_check_by_convention() {
        let config = NebulaConfig::default();
        assert_eq!(config.max_budget_usd, 0.0);
    }
}
