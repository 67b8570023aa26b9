//! Manifest configuration
//!
//! All tunables live in a single `manifest.toml` inside the data
//! directory; every field also accepts a `MANIFEST_*` environment
//! override. Validation runs at load so a bad distribution or weight set
//! fails before the pipeline starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::store::types::Strategy;

/// Name of the configuration file inside the data directory
pub const CONFIG_FILE: &str = "manifest.toml";

/// Per-strategy attempt counts for one generation batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyDistribution {
    pub vanilla: u32,
    pub minimal: u32,
    pub defensive: u32,
    pub patterned: u32,
    pub mutation: u32,
    pub adversarial: u32,
}

impl Default for StrategyDistribution {
    fn default() -> Self {
        Self {
            vanilla: 2,
            minimal: 1,
            defensive: 1,
            patterned: 1,
            mutation: 0,
            adversarial: 0,
        }
    }
}

impl StrategyDistribution {
    /// Total attempts across all strategies
    pub fn total(&self) -> u32 {
        self.vanilla + self.minimal + self.defensive + self.patterned + self.mutation
            + self.adversarial
    }

    /// Count for one strategy
    pub fn count_for(&self, strategy: Strategy) -> u32 {
        match strategy {
            Strategy::Vanilla => self.vanilla,
            Strategy::Minimal => self.minimal,
            Strategy::Defensive => self.defensive,
            Strategy::Patterned => self.patterned,
            Strategy::Mutation => self.mutation,
            Strategy::Adversarial => self.adversarial,
        }
    }
}

/// Generation swarm tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Attempts per batch when the distribution is not set explicitly
    pub default_count: u32,
    /// Hard upper bound on attempts per batch
    pub max_count: u32,
    /// Per-strategy counts; sums to the batch size
    pub distribution: StrategyDistribution,
    /// Dollar ceiling for the whole run
    pub cost_ceiling_usd: f64,
    /// Deadline for one AI call, seconds
    pub ai_call_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_count: 5,
            max_count: 20,
            distribution: StrategyDistribution::default(),
            cost_ceiling_usd: 5.0,
            ai_call_timeout_secs: 120,
        }
    }
}

/// AI backend tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Chat-completions base URL
    pub base_url: String,
    /// Model name sent with each request
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Retry budget for transient errors
    pub max_retries: u32,
    /// Global ceiling on outstanding AI calls
    pub ai_concurrency: usize,
    /// Cost reserved per call before it is submitted, dollars
    pub estimated_call_cost_usd: f64,
    /// Dollars per 1000 completion tokens, for actual-cost accounting
    pub cost_per_1k_tokens_usd: f64,
    /// Cooldown window after a rate-limit signal, seconds
    pub rate_limit_cooldown_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8317/v1".into(),
            model: "manifest-default".into(),
            api_key_env: "MANIFEST_API_KEY".into(),
            max_retries: 3,
            ai_concurrency: 8,
            estimated_call_cost_usd: 0.05,
            cost_per_1k_tokens_usd: 0.015,
            rate_limit_cooldown_secs: 30,
        }
    }
}

/// Verification harness tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Typecheck command line
    pub typecheck_cmd: String,
    /// Lint command line
    pub lint_cmd: String,
    /// Unit test command line (must not pick up the spec-test path)
    pub unit_test_cmd: String,
    /// Spec test command line (receives the reserved suite path as its last arg)
    pub spec_test_cmd: String,
    /// Per-stage deadlines, seconds, keyed by stage name
    pub stage_timeout_secs: BTreeMap<String, u64>,
    /// Re-runs allowed for flaky unit and spec tests
    pub flaky_retries: u32,
    /// Concurrent verifications (independent of AI concurrency)
    pub harness_concurrency: usize,
    /// Reserved project-relative path for the written spec suite
    pub spec_suite_path: String,
    /// Install project dependencies inside the workspace before stages run
    pub auto_install_dependencies: bool,
    /// Command used when auto-install is enabled
    pub dependency_install_cmd: String,
    /// Allow network access during test stages
    pub allow_network_in_tests: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        let mut stage_timeout_secs = BTreeMap::new();
        stage_timeout_secs.insert("typecheck".into(), 120);
        stage_timeout_secs.insert("lint".into(), 120);
        stage_timeout_secs.insert("unit_tests".into(), 300);
        stage_timeout_secs.insert("spec_tests".into(), 300);
        Self {
            typecheck_cmd: "cargo check".into(),
            lint_cmd: "cargo clippy -- -D warnings".into(),
            unit_test_cmd: "cargo test".into(),
            spec_test_cmd: "cargo test --test manifest_spec_suite".into(),
            stage_timeout_secs,
            flaky_retries: 2,
            harness_concurrency: 2,
            spec_suite_path: "tests/manifest_spec_suite.rs".into(),
            auto_install_dependencies: false,
            dependency_install_cmd: "cargo fetch".into(),
            allow_network_in_tests: false,
        }
    }
}

impl VerificationConfig {
    /// Deadline for one stage, defaulting to 300s when unset
    pub fn stage_timeout(&self, stage: &str) -> u64 {
        self.stage_timeout_secs.get(stage).copied().unwrap_or(300)
    }
}

/// Workspace isolation tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Workspace root; defaults to `<data_dir>/workspaces`
    pub root: Option<PathBuf>,
    /// Cap on total workspace bytes on disk
    pub disk_cap_bytes: u64,
    /// Remove workspaces on release (disable to debug a failed attempt)
    pub cleanup_workspaces: bool,
    /// Directory names excluded from the project copy
    pub copy_excludes: Vec<String>,
    /// Files larger than this are excluded from copies and analysis
    pub max_file_bytes: u64,
    /// Deadline for acquiring a workspace slot, seconds
    pub acquire_timeout_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            disk_cap_bytes: 2 * 1024 * 1024 * 1024,
            cleanup_workspaces: true,
            copy_excludes: vec![
                ".git".into(),
                "target".into(),
                "node_modules".into(),
                ".manifest".into(),
                "workspaces".into(),
            ],
            max_file_bytes: 1024 * 1024,
            acquire_timeout_secs: 120,
        }
    }
}

/// Ranking axis weights; must sum to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub assertions: f64,
    pub simplicity: f64,
    pub readability: f64,
    pub performance: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            assertions: 0.4,
            simplicity: 0.3,
            readability: 0.2,
            performance: 0.1,
        }
    }
}

impl ScoreWeights {
    /// Sum across all axes
    pub fn sum(&self) -> f64 {
        self.assertions + self.simplicity + self.readability + self.performance
    }
}

/// Ranking engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Survivors presented to the human
    pub top_k: usize,
    /// Axis weights
    pub weights: ScoreWeights,
    /// Ask the AI for a readability score (falls back to neutral on failure)
    pub ai_readability: bool,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            weights: ScoreWeights::default(),
            ai_readability: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub generation: GenerationConfig,
    pub gateway: GatewayConfig,
    pub verification: VerificationConfig,
    pub workspace: WorkspaceConfig,
    pub ranking: RankingConfig,
    /// Warn (without blocking) after this many refine judgments
    pub refinement_warn_after: u32,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            gateway: GatewayConfig::default(),
            verification: VerificationConfig::default(),
            workspace: WorkspaceConfig::default(),
            ranking: RankingConfig::default(),
            refinement_warn_after: 3,
        }
    }
}

impl ManifestConfig {
    /// Load from `<data_dir>/manifest.toml`, falling back to defaults when
    /// the file is absent, then apply environment overrides and validate.
    pub fn load(data_dir: &Path) -> Result<Self, PipelineError> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| PipelineError::Config(format!("read {}: {e}", path.display())))?;
            toml::from_str(&text)
                .map_err(|e| PipelineError::Config(format!("parse {}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `MANIFEST_*` environment overrides for the commonly tuned knobs
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u32>("MANIFEST_GENERATION_COUNT") {
            self.generation.default_count = v;
        }
        if let Some(v) = env_parse::<f64>("MANIFEST_COST_CEILING_USD") {
            self.generation.cost_ceiling_usd = v;
        }
        if let Some(v) = env_parse::<u64>("MANIFEST_AI_CALL_TIMEOUT_SECS") {
            self.generation.ai_call_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("MANIFEST_GATEWAY_URL") {
            if !v.is_empty() {
                self.gateway.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("MANIFEST_MODEL") {
            if !v.is_empty() {
                self.gateway.model = v;
            }
        }
        if let Some(v) = env_parse::<usize>("MANIFEST_AI_CONCURRENCY") {
            self.gateway.ai_concurrency = v;
        }
        if let Some(v) = env_parse::<usize>("MANIFEST_HARNESS_CONCURRENCY") {
            self.verification.harness_concurrency = v;
        }
        if let Some(v) = env_parse::<u32>("MANIFEST_FLAKY_RETRIES") {
            self.verification.flaky_retries = v;
        }
        if let Some(v) = env_parse::<u64>("MANIFEST_WORKSPACE_DISK_CAP") {
            self.workspace.disk_cap_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("MANIFEST_TOP_K") {
            self.ranking.top_k = v;
        }
        if let Some(v) = env_bool("MANIFEST_CLEANUP_WORKSPACES") {
            self.workspace.cleanup_workspaces = v;
        }
        if let Some(v) = env_bool("MANIFEST_ALLOW_NETWORK_IN_TESTS") {
            self.verification.allow_network_in_tests = v;
        }
    }

    /// Reject configurations the pipeline cannot honor
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.generation.default_count == 0 {
            return Err(PipelineError::Config("generation count must be positive".into()));
        }
        if self.generation.default_count > self.generation.max_count {
            return Err(PipelineError::Config(format!(
                "generation count {} exceeds maximum {}",
                self.generation.default_count, self.generation.max_count
            )));
        }
        let dist_total = self.generation.distribution.total();
        if dist_total > self.generation.max_count {
            return Err(PipelineError::Config(format!(
                "strategy distribution totals {dist_total}, above maximum {}",
                self.generation.max_count
            )));
        }
        let weight_sum = self.ranking.weights.sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(PipelineError::Config(format!(
                "ranking weights must sum to 1.0, got {weight_sum}"
            )));
        }
        if self.ranking.top_k == 0 {
            return Err(PipelineError::Config("top_k must be positive".into()));
        }
        if self.gateway.ai_concurrency == 0 || self.verification.harness_concurrency == 0 {
            return Err(PipelineError::Config("concurrency limits must be positive".into()));
        }
        if self.generation.cost_ceiling_usd <= 0.0 {
            return Err(PipelineError::Config("cost ceiling must be positive".into()));
        }
        Ok(())
    }

    /// Workspace root under the data directory unless overridden
    pub fn workspace_root(&self, data_dir: &Path) -> PathBuf {
        self.workspace
            .root
            .clone()
            .unwrap_or_else(|| data_dir.join("workspaces"))
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn env_bool(var: &str) -> Option<bool> {
    std::env::var(var).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = ManifestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.generation.distribution.total(), 5);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = ManifestConfig::load(dir.path()).unwrap();
        assert_eq!(config.ranking.top_k, 3);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[ranking]\ntop_k = 5\n\n[generation]\ndefault_count = 4\n",
        )
        .unwrap();
        let config = ManifestConfig::load(dir.path()).unwrap();
        assert_eq!(config.ranking.top_k, 5);
        assert_eq!(config.generation.default_count, 4);
        // Untouched sections keep defaults
        assert_eq!(config.verification.flaky_retries, 2);
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = ManifestConfig::default();
        config.ranking.weights.assertions = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_validate_rejects_oversized_distribution() {
        let mut config = ManifestConfig::default();
        config.generation.distribution.vanilla = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = ManifestConfig::default();
        config.gateway.ai_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage_timeout_lookup() {
        let config = VerificationConfig::default();
        assert_eq!(config.stage_timeout("typecheck"), 120);
        assert_eq!(config.stage_timeout("unknown"), 300);
    }

    #[test]
    fn test_workspace_root_defaults_under_data_dir() {
        let config = ManifestConfig::default();
        let root = config.workspace_root(Path::new("/data"));
        assert_eq!(root, PathBuf::from("/data/workspaces"));
    }
}
