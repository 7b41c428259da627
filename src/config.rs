//! Static configuration, loaded once at startup.
//!
//! Every field has a default so an empty (or missing) file yields a usable
//! configuration. The file is TOML:
//!
//! ```toml
//! [scoring]
//! decay_factor = 0.2
//!
//! [memory]
//! capacity = 1024
//!
//! [patterns.lateral]
//! memory_budget_mb = 41
//! expected_accuracy = 0.78
//!
//! [performance]
//! baseline_medium = 3.0
//! ceiling = 8.31
//!
//! [pipeline.quality_gates]
//! architecture = 0.9
//! ```

use crate::orchestration::Phase;
use crate::types::{CognitivePattern, Complexity, OrchestratorError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable that points at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "SPARC_ORCHESTRATOR_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default = "default_patterns")]
    pub patterns: BTreeMap<CognitivePattern, PatternProfile>,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            memory: MemoryConfig::default(),
            classifier: ClassifierConfig::default(),
            patterns: default_patterns(),
            performance: PerformanceConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    /// Weight of the newest outcome in the moving average
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            decay_factor: default_decay_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    /// Maximum number of fragments retained before eviction kicks in
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    #[serde(default = "default_compression_ratio")]
    pub default_compression_ratio: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_memory_capacity(),
            eviction_interval_secs: default_eviction_interval_secs(),
            default_compression_ratio: default_compression_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierConfig {
    /// Confidence reported when a keyword rule matched
    #[serde(default = "default_classifier_confidence")]
    pub confidence: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence: default_classifier_confidence(),
        }
    }
}

/// Static metadata for one cognitive pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PatternProfile {
    pub memory_budget_mb: u32,
    pub expected_accuracy: f64,
    #[serde(default)]
    pub simd_optimized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceConfig {
    #[serde(default = "default_baseline_low")]
    pub baseline_low: f64,
    #[serde(default = "default_baseline_medium")]
    pub baseline_medium: f64,
    #[serde(default = "default_baseline_high")]
    pub baseline_high: f64,
    /// Lower bound applied to measured execution time (seconds)
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Empirical maximum improvement factor
    #[serde(default = "default_ceiling")]
    pub ceiling: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            baseline_low: default_baseline_low(),
            baseline_medium: default_baseline_medium(),
            baseline_high: default_baseline_high(),
            epsilon: default_epsilon(),
            ceiling: default_ceiling(),
        }
    }
}

impl PerformanceConfig {
    pub fn baseline(&self, complexity: Complexity) -> f64 {
        match complexity {
            Complexity::Low => self.baseline_low,
            Complexity::Medium => self.baseline_medium,
            Complexity::High => self.baseline_high,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Per-phase timeout; no timeout when absent
    #[serde(default)]
    pub phase_timeout_secs: Option<u64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_priority")]
    pub default_priority: i64,
    /// Minimum quality per phase, in [0, 1]. Misses are reported, not fatal.
    #[serde(default)]
    pub quality_gates: BTreeMap<Phase, f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            phase_timeout_secs: None,
            workers: default_workers(),
            default_priority: default_priority(),
            quality_gates: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// DuckDB file; an in-memory database is used when unset
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_decay_factor() -> f64 {
    0.2
}

fn default_memory_capacity() -> usize {
    1024
}

fn default_eviction_interval_secs() -> u64 {
    30
}

fn default_compression_ratio() -> f64 {
    1.0
}

fn default_classifier_confidence() -> f64 {
    0.89
}

fn default_baseline_low() -> f64 {
    1.0
}

fn default_baseline_medium() -> f64 {
    3.0
}

fn default_baseline_high() -> f64 {
    8.0
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_ceiling() -> f64 {
    8.31
}

fn default_workers() -> usize {
    4
}

fn default_priority() -> i64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "sparc", "sparc-orchestrator")
}

pub fn default_patterns() -> BTreeMap<CognitivePattern, PatternProfile> {
    let profile = |memory_budget_mb, expected_accuracy, simd_optimized| PatternProfile {
        memory_budget_mb,
        expected_accuracy,
        simd_optimized,
    };
    BTreeMap::from([
        (CognitivePattern::Convergent, profile(23, 0.92, true)),
        (CognitivePattern::Divergent, profile(31, 0.87, true)),
        (CognitivePattern::Systems, profile(38, 0.91, true)),
        (CognitivePattern::Critical, profile(29, 0.89, true)),
        (CognitivePattern::Lateral, profile(41, 0.78, false)),
    ])
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: OrchestratorConfig = toml::from_str(content)
            .map_err(|e| OrchestratorError::Config(format!("invalid TOML: {}", e)))?;
        // Partial pattern tables keep the defaults for the patterns they omit
        for (pattern, profile) in default_patterns() {
            config.patterns.entry(pattern).or_insert(profile);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolve the config file from the environment or the platform config
    /// directory, falling back to defaults when neither exists.
    pub fn load_default() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<platform config dir>/sparc-orchestrator/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// `<platform data dir>/sparc-orchestrator/orchestrator.duckdb`, used by
    /// the CLI when no database is configured.
    pub fn default_database_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().join("orchestrator.duckdb"))
    }

    pub fn pattern_profile(&self, pattern: CognitivePattern) -> PatternProfile {
        self.patterns
            .get(&pattern)
            .copied()
            .or_else(|| default_patterns().get(&pattern).copied())
            .unwrap_or(PatternProfile {
                memory_budget_mb: 30,
                expected_accuracy: 0.85,
                simd_optimized: false,
            })
    }

    pub fn validate(&self) -> Result<()> {
        let decay = self.scoring.decay_factor;
        if !(decay > 0.0 && decay <= 1.0) {
            return Err(OrchestratorError::Config(format!(
                "scoring.decay_factor must be in (0, 1], got {}",
                decay
            )));
        }
        if self.memory.capacity == 0 {
            return Err(OrchestratorError::Config(
                "memory.capacity must be at least 1".to_string(),
            ));
        }
        if self.memory.default_compression_ratio < 0.0 {
            return Err(OrchestratorError::Config(
                "memory.default_compression_ratio must be non-negative".to_string(),
            ));
        }
        let perf = &self.performance;
        for (name, value) in [
            ("baseline_low", perf.baseline_low),
            ("baseline_medium", perf.baseline_medium),
            ("baseline_high", perf.baseline_high),
            ("epsilon", perf.epsilon),
            ("ceiling", perf.ceiling),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(OrchestratorError::Config(format!(
                    "performance.{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        for (pattern, profile) in &self.patterns {
            if !(0.0..=1.0).contains(&profile.expected_accuracy) {
                return Err(OrchestratorError::Config(format!(
                    "patterns.{}.expected_accuracy must be in [0, 1]",
                    pattern
                )));
            }
        }
        if self.pipeline.workers == 0 {
            return Err(OrchestratorError::Config(
                "pipeline.workers must be at least 1".to_string(),
            ));
        }
        for (phase, minimum) in &self.pipeline.quality_gates {
            if !(0.0..=1.0).contains(minimum) {
                return Err(OrchestratorError::Config(format!(
                    "pipeline.quality_gates.{} must be in [0, 1], got {}",
                    phase, minimum
                )));
            }
        }
        Ok(())
    }
}
