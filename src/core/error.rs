//! Core capability errors (parsing, validation, domain invariants).
//!
//! These are bounded and stable: core errors represent domain/refusal states,
//! not library implementation details.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid ID or reference.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("raffle id `{raw}` is invalid: {reason}")]
    Raffle { raw: String, reason: String },
    #[error("user id `{raw}` is invalid: {reason}")]
    User { raw: String, reason: String },
    #[error("transaction ref `{raw}` is invalid: {reason}")]
    TxRef { raw: String, reason: String },
}

/// Invalid raffle parameters at creation.
#[derive(Debug, Error, Clone)]
#[error("raffle spec invalid: {reason}")]
pub struct InvalidRaffleSpec {
    pub reason: String,
}

/// Canonical error enum for core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    InvalidRaffleSpec(#[from] InvalidRaffleSpec),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure domain/input failures.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
