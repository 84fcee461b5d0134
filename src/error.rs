//! Construction-time errors.
//!
//! Everything else the distilled algorithms call a precondition violation
//! (duplicate `pid`, `pid >= participants`, operating after destruction)
//! stays an `assert!`-enforced caller bug rather than a recoverable error,
//! matching the source this crate is modeled on.

use thiserror::Error;

use crate::config::QueueConfig;

/// Hard ceiling on participants, taken from the source algorithms' fixed
/// `MAX_THREADS` arrays.
pub const MAX_PARTICIPANTS: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue requires at least one participant")]
    NoParticipants,
    #[error("participant count {0} exceeds the maximum of {MAX_PARTICIPANTS}")]
    TooManyParticipants(usize),
    #[error("epoch_frequency and empty_frequency must be nonzero")]
    InvalidFrequency,
}

pub(crate) fn validate_participants(participants: usize) -> Result<(), QueueError> {
    if participants == 0 {
        return Err(QueueError::NoParticipants);
    }
    if participants > MAX_PARTICIPANTS {
        return Err(QueueError::TooManyParticipants(participants));
    }
    Ok(())
}

pub(crate) fn validate_config(config: &QueueConfig) -> Result<(), QueueError> {
    if config.epoch_frequency == 0 || config.empty_frequency == 0 {
        return Err(QueueError::InvalidFrequency);
    }
    Ok(())
}
