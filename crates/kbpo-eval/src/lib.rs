//! KBPO Eval - Statistical machinery for evaluating knowledge bases
//!
//! This crate provides:
//! - Sampling distributions over a submission's relations and over documents
//! - A seeded sampler for draws with and without replacement
//! - Simple and importance-weighted (joint) precision and recall estimators
//! - Bootstrap confidence intervals
//! - Official-style pooled scoring with leave-one-out and leave-team-out pools

pub mod bootstrap;
pub mod distribution;
pub mod estimators;
pub mod pooling;
pub mod sampler;

pub use bootstrap::{Bootstrap, Interval, ScoreInterval};
pub use distribution::{
    document_entity, document_uniform, submission_distribution, Distribution, Flat, InstanceKey,
    Mass,
};
pub use estimators::{compute_weights, Estimator, Labeled, TruthItem};
pub use pooling::{
    entity_counts, entity_intervals, pooling_bias, AveragedScore, EntityCount, GoldEntry,
    OutputEntry, PoolingBias, PoolingMode, QueryMap,
};
pub use sampler::Sampler;
