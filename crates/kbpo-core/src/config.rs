//! KBPO Configuration Management
//!
//! Handles configuration from environment variables and config files,
//! with defaults suitable for local development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::DistributionKind;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Database connection
    pub database: DatabaseConfig,

    /// Submission sampling
    pub sampling: SamplingConfig,

    /// Crowd collaborator
    pub crowd: CrowdConfig,

    /// Estimators and intervals
    pub scoring: ScoringConfig,

    /// Stage worker pool
    pub worker: WorkerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Server
        if let Ok(host) = std::env::var("API_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("API_PORT") {
            config.server.port = parse_env("API_PORT", port)?;
        }
        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            config.server.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // PostgreSQL
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.postgres_url = Some(url);
        }

        // Sampling
        if let Ok(dist) = std::env::var("KBPO_DISTRIBUTION") {
            config.sampling.distribution =
                dist.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "KBPO_DISTRIBUTION".to_string(),
                    value: dist,
                })?;
        }
        if let Ok(n) = std::env::var("KBPO_NUM_SAMPLES") {
            config.sampling.num_samples = parse_env("KBPO_NUM_SAMPLES", n)?;
        }
        if let Ok(seed) = std::env::var("KBPO_SEED") {
            let seed: u64 = parse_env("KBPO_SEED", seed)?;
            config.sampling.seed = Some(seed);
            config.scoring.seed = Some(seed);
        }

        // Crowd
        if let Ok(endpoint) = std::env::var("CROWD_ENDPOINT") {
            config.crowd.endpoint = endpoint;
        }
        if let Ok(key) = std::env::var("CROWD_API_KEY") {
            config.crowd.api_key = Some(key);
        }
        if let Ok(k) = std::env::var("CROWD_MAX_ASSIGNMENTS") {
            config.crowd.max_assignments = parse_env("CROWD_MAX_ASSIGNMENTS", k)?;
        }

        // Scoring
        if let Ok(mode) = std::env::var("KBPO_SCORING_MODE") {
            config.scoring.mode = mode.parse()?;
        }
        if let Ok(method) = std::env::var("KBPO_WEIGHT_METHOD") {
            config.scoring.weight_method = method.parse()?;
        }

        // Workers
        if let Ok(n) = std::env::var("KBPO_WORKERS") {
            config.worker.concurrency = parse_env("KBPO_WORKERS", n)?;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        let env_config = Self::from_env()?;
        let defaults = Self::default();

        if env_config.server.host != defaults.server.host {
            self.server.host = env_config.server.host;
        }
        if env_config.server.port != defaults.server.port {
            self.server.port = env_config.server.port;
        }
        if env_config.sampling.seed.is_some() {
            self.sampling.seed = env_config.sampling.seed;
            self.scoring.seed = env_config.scoring.seed;
        }
        if env_config.worker.concurrency != defaults.worker.concurrency {
            self.worker.concurrency = env_config.worker.concurrency;
        }

        // Always use env for connection strings and secrets
        if env_config.database.postgres_url.is_some() {
            self.database.postgres_url = env_config.database.postgres_url;
        }
        if env_config.crowd.api_key.is_some() {
            self.crowd.api_key = env_config.crowd.api_key;
        }

        Ok(self)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling.num_samples == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sampling.num_samples".to_string(),
                value: "0".to_string(),
            });
        }
        if self.crowd.max_assignments == 0 {
            return Err(ConfigError::InvalidValue {
                key: "crowd.max_assignments".to_string(),
                value: "0".to_string(),
            });
        }
        if !(0.0 < self.scoring.confidence && self.scoring.confidence < 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "scoring.confidence".to_string(),
                value: self.scoring.confidence.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Maximum upload size in bytes
    pub max_body_size: usize,

    /// Allowed origins for CORS
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 300,
            max_body_size: 64 * 1024 * 1024,
            cors_origins: vec![],
        }
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; taken from `DATABASE_URL`.
    /// When absent the in-memory store is used.
    pub postgres_url: Option<String>,

    /// PostgreSQL connection pool size
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: None,
            pool_size: 10,
        }
    }
}

/// Submission sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Distribution used for submission samples
    pub distribution: DistributionKind,

    /// Number of instances drawn per batch
    pub num_samples: usize,

    /// Draw with replacement
    pub with_replacement: bool,

    /// Fixed seed; a fresh one is drawn per batch when unset
    pub seed: Option<u64>,

    /// Documents drawn per exhaustive annotation batch
    pub num_documents: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            distribution: DistributionKind::EntityRelation,
            num_samples: 1000,
            with_replacement: false,
            seed: None,
            num_documents: 50,
        }
    }
}

/// Crowd collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrowdConfig {
    /// Base URL of the crowd marketplace bridge
    pub endpoint: String,

    /// API key for the bridge
    pub api_key: Option<String>,

    /// Redundant judgments requested per question (K)
    pub max_assignments: u32,

    /// Lifetime of an outstanding assignment in seconds
    pub assignment_lifetime_secs: u64,

    /// Reward per assignment in cents
    pub reward_cents: u32,

    /// Retries for transient crowd failures
    pub retry_attempts: u32,

    /// Initial backoff between retries, doubled each attempt
    pub backoff_ms: u64,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9090".to_string(),
            api_key: None,
            max_assignments: 3,
            assignment_lifetime_secs: 3 * 24 * 3600,
            reward_cents: 10,
            retry_attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Estimator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Joint (pooled) or per-system estimators
    pub mode: ScoringMode,

    /// Bootstrap replicates
    pub bootstrap_samples: usize,

    /// Interval coverage, e.g. 0.95
    pub confidence: f64,

    /// Pooling weights for the joint estimator
    pub weight_method: WeightMethod,

    /// Bootstrap seed
    pub seed: Option<u64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            mode: ScoringMode::Joint,
            bootstrap_samples: 5000,
            confidence: 0.95,
            weight_method: WeightMethod::Heuristic,
            seed: None,
        }
    }
}

/// Estimator family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringMode {
    #[default]
    Joint,
    Simple,
}

impl std::str::FromStr for ScoringMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "joint" => Ok(Self::Joint),
            "simple" => Ok(Self::Simple),
            _ => Err(ConfigError::InvalidValue {
                key: "scoring.mode".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ScoringMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Joint => write!(f, "joint"),
            Self::Simple => write!(f, "simple"),
        }
    }
}

/// How the joint estimator weighs each system's sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightMethod {
    Uniform,
    #[default]
    Heuristic,
    Size,
}

impl std::str::FromStr for WeightMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uniform" => Ok(Self::Uniform),
            "heuristic" => Ok(Self::Heuristic),
            "size" => Ok(Self::Size),
            _ => Err(ConfigError::InvalidValue {
                key: "scoring.weight_method".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for WeightMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uniform => write!(f, "uniform"),
            Self::Heuristic => write!(f, "heuristic"),
            Self::Size => write!(f, "size"),
        }
    }
}

/// Stage worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Parallel worker tasks
    pub concurrency: usize,

    /// Bounded task queue length
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.sampling.num_samples, 1000);
        assert_eq!(config.sampling.distribution, DistributionKind::EntityRelation);
        assert!(!config.sampling.with_replacement);
        assert_eq!(config.crowd.max_assignments, 3);
        assert_eq!(config.scoring.bootstrap_samples, 5000);
        assert!((config.scoring.confidence - 0.95).abs() < 1e-12);
        assert!(config.database.postgres_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("JOINT".parse::<ScoringMode>().unwrap(), ScoringMode::Joint);
        assert_eq!("simple".parse::<ScoringMode>().unwrap(), ScoringMode::Simple);
        assert!("pooled".parse::<ScoringMode>().is_err());
        assert_eq!("Size".parse::<WeightMethod>().unwrap(), WeightMethod::Size);
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [sampling]
            distribution = "relation"
            num_samples = 250

            [scoring]
            mode = "simple"
            "#,
        )
        .unwrap();
        assert_eq!(config.sampling.distribution, DistributionKind::Relation);
        assert_eq!(config.sampling.num_samples, 250);
        assert_eq!(config.scoring.mode, ScoringMode::Simple);
        assert_eq!(config.scoring.bootstrap_samples, 5000);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_validate_rejects_bad_confidence() {
        let mut config = AppConfig::default();
        config.scoring.confidence = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let err = AppConfig::from_file("/nonexistent/kbpo.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileReadError { .. }));
    }
}
