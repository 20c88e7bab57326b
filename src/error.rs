//! Error types for the gravity core.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GravityError {
    /// Lost or duplicated work across the distributed walk. Forces computed
    /// after this are unreliable.
    #[error(
        "{label}: particle count mismatch at step {step}: \
         expected {expected} processed, got {processed}"
    )]
    ParticleCountMismatch {
        label: &'static str,
        step: u64,
        expected: u64,
        processed: u64,
    },

    #[error(
        "{label}: export buffer of {capacity} records cannot hold the exports of a single particle"
    )]
    ExportBufferTooSmall { label: &'static str, capacity: usize },

    #[error("particle {id} lies in a top-level leaf not owned by rank {rank}")]
    ParticleOutsideDomain { id: u64, rank: usize },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

pub type Result<T> = std::result::Result<T, GravityError>;
