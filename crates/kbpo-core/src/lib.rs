//! KBPO Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the KBPO
//! evaluation system:
//! - Provenance spans and the mention / link / relation model
//! - The relation vocabulary (aliases, inverses, argument types)
//! - Lifecycle states for submissions, questions, HITs and assignments
//! - The `KbStore` query surface and its row types
//! - Common error types
//! - Configuration management

pub mod config;
pub mod defs;
pub mod judgment;
pub mod model;
pub mod span;
pub mod store;

pub use config::{
    AppConfig, ConfigError, CrowdConfig, DatabaseConfig, SamplingConfig, ScoringConfig,
    ScoringMode, WeightMethod, WorkerConfig,
};
pub use defs::{MentionType, RelationLabel};
pub use judgment::{ResponseSet, VerdictSet};
pub use model::{KnowledgeBase, Link, Mention, RelationInstance, SymmetrizeReport};
pub use span::Provenance;
pub use store::{KbStore, ScoreRecord, Submission};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for KBPO operations
#[derive(Error, Debug)]
pub enum KbpoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state for {entity}: expected {expected}, found {found}")]
    InvalidState {
        entity: String,
        expected: String,
        found: String,
    },

    #[error("Sampling error: {0}")]
    Sampling(String),

    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Scoring error: {0}")]
    Scoring(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Crowd error: {0}")]
    Crowd(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ConfigError> for KbpoError {
    fn from(e: ConfigError) -> Self {
        KbpoError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KbpoError>;

/// Implements `Display` and case-insensitive `FromStr` over the serde names
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = KbpoError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_lowercase().replace('_', "-").as_str() {
                    $(t if t == $text.replace('_', "-") => Ok(Self::$variant),)+
                    _ => Err(KbpoError::Validation(format!(
                        "unknown {}: {s}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

// ============================================================================
// Lifecycle States
// ============================================================================

/// Submission lifecycle
///
/// `Error` and `Revoked` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmissionState {
    PendingUpload,
    PendingValidation,
    PendingSampling,
    PendingTurking,
    PendingAggregation,
    PendingScoring,
    Done,
    Error,
    Revoked,
}

string_enum!(SubmissionState {
    PendingUpload => "pending-upload",
    PendingValidation => "pending-validation",
    PendingSampling => "pending-sampling",
    PendingTurking => "pending-turking",
    PendingAggregation => "pending-aggregation",
    PendingScoring => "pending-scoring",
    Done => "done",
    Error => "error",
    Revoked => "revoked",
});

impl SubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Revoked)
    }
}

/// Question lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionState {
    PendingTurking,
    PendingAnnotation,
    PendingAggregation,
    Done,
    Revoked,
    Error,
}

string_enum!(QuestionState {
    PendingTurking => "pending-turking",
    PendingAnnotation => "pending-annotation",
    PendingAggregation => "pending-aggregation",
    Done => "done",
    Revoked => "revoked",
    Error => "error",
});

/// State of a task posted to the crowd collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HitState {
    PendingAnnotation,
    PendingAggregation,
    Done,
    Expired,
    Revoked,
    Error,
}

string_enum!(HitState {
    PendingAnnotation => "pending-annotation",
    PendingAggregation => "pending-aggregation",
    Done => "done",
    Expired => "expired",
    Revoked => "revoked",
    Error => "error",
});

/// State of one worker's assignment on a HIT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentState {
    Submitted,
    Aggregated,
    Error,
}

string_enum!(AssignmentState {
    Submitted => "submitted",
    Aggregated => "aggregated",
    Error => "error",
});

// ============================================================================
// Batch, Distribution and Score Kinds
// ============================================================================

/// Kind of annotation unit a question batch carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    ExhaustiveEntities,
    ExhaustiveRelations,
    SelectiveRelations,
}

string_enum!(BatchType {
    ExhaustiveEntities => "exhaustive_entities",
    ExhaustiveRelations => "exhaustive_relations",
    SelectiveRelations => "selective_relations",
});

/// Per-submission sampling distribution over relation instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    Instance,
    Relation,
    Entity,
    #[default]
    EntityRelation,
}

string_enum!(DistributionKind {
    Instance => "instance",
    Relation => "relation",
    Entity => "entity",
    EntityRelation => "entity_relation",
});

impl DistributionKind {
    pub const ALL: [DistributionKind; 4] = [
        DistributionKind::Instance,
        DistributionKind::Relation,
        DistributionKind::Entity,
        DistributionKind::EntityRelation,
    ];
}

/// Distribution over corpus documents for exhaustive annotation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentDistribution {
    #[default]
    Uniform,
    Entity,
}

string_enum!(DocumentDistribution {
    Uniform => "uniform",
    Entity => "entity",
});

/// Score families reported per submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreType {
    /// Scored on the entity-balanced sample
    Entity,
    /// Scored on the relation-balanced sample
    Relation,
}

string_enum!(ScoreType {
    Entity => "entity",
    Relation => "relation",
});

impl ScoreType {
    /// Sampling distribution whose batches feed this score
    pub fn distribution(&self) -> DistributionKind {
        match self {
            Self::Entity => DistributionKind::Entity,
            Self::Relation => DistributionKind::Relation,
        }
    }
}

// ============================================================================
// Scores
// ============================================================================

/// Precision, recall and F1 of one system
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Score {
    /// Build a score, deriving F1 from precision and recall
    pub fn new(precision: f64, recall: f64) -> Self {
        Self {
            precision,
            recall,
            f1: f1_score(precision, recall),
        }
    }

    /// Build a score whose F1 was estimated separately
    pub fn with_f1(precision: f64, recall: f64, f1: f64) -> Self {
        Self {
            precision,
            recall,
            f1,
        }
    }
}

/// Harmonic mean of precision and recall; 0 when both are 0
pub fn f1_score(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

// ============================================================================
// Tests
// ============================================================================
