//! Error types for the GI core

use core::fmt;

use serde::{Deserialize, Serialize};

/// Errors reported by the GI core
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GiError {
    /// A caller-supplied value was rejected (bad configuration, mismatched
    /// buffer size, unknown identifier)
    InvalidArgument(String),
    /// A fixed-capacity structure is full (instance slots, probe budget)
    CapacityExceeded(String),
}

impl fmt::Display for GiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GiError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            GiError::CapacityExceeded(msg) => write!(f, "capacity exceeded: {}", msg),
        }
    }
}

impl std::error::Error for GiError {}

pub type GiResult<T> = Result<T, GiError>;
