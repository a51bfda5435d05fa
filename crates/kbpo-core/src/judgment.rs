//! Crowd responses and merged verdicts
//!
//! Responses are append-only and keyed by assignment. Verdicts are a
//! per-question materialization rebuilt from responses on every
//! aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Link, Mention, RelationInstance};

/// Parsed rows of one assignment's response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSet {
    pub assignment_id: String,
    pub question_id: String,
    /// Judgments requested for the question when the assignment was posted
    pub max_assignments: u32,
    pub mentions: Vec<Mention>,
    pub links: Vec<Link>,
    pub relations: Vec<RelationInstance>,
}

impl ResponseSet {
    pub fn new(
        assignment_id: impl Into<String>,
        question_id: impl Into<String>,
        max_assignments: u32,
    ) -> Self {
        Self {
            assignment_id: assignment_id.into(),
            question_id: question_id.into(),
            max_assignments,
            mentions: Vec::new(),
            links: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mentions.is_empty() && self.links.is_empty() && self.relations.is_empty()
    }
}

/// Merged verdicts for one question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictSet {
    pub question_id: String,
    pub mentions: Vec<Mention>,
    pub links: Vec<Link>,
    pub relations: Vec<RelationInstance>,
    pub updated_at: DateTime<Utc>,
}

impl VerdictSet {
    pub fn new(question_id: impl Into<String>) -> Self {
        Self {
            question_id: question_id.into(),
            mentions: Vec::new(),
            links: Vec::new(),
            relations: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Verdict contents without the timestamp, for comparing re-aggregations
    pub fn same_contents(&self, other: &VerdictSet) -> bool {
        self.question_id == other.question_id
            && self.mentions == other.mentions
            && self.links == other.links
            && self.relations == other.relations
    }
}
