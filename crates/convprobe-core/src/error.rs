use std::collections::TryReserveError;

use thiserror::Error;

/// Errors raised while describing, compiling or running a graph.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid shape {shape:?}: {reason}")]
    InvalidShape { shape: Vec<usize>, reason: String },

    #[error("tensor {node} belongs to another graph")]
    ForeignTensor { node: usize },

    #[error("failed to allocate {len} bytes")]
    Allocation {
        len: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("compilation failed: {0}")]
    Compilation(String),

    #[error("executable contract violated: {0}")]
    ContractViolation(String),

    #[error("no general-purpose compute device available")]
    DeviceUnavailable,
}

impl Error {
    pub(crate) fn invalid_shape(shape: &[usize], reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            shape: shape.to_vec(),
            reason: reason.into(),
        }
    }

    pub fn compilation(reason: impl Into<String>) -> Self {
        Self::Compilation(reason.into())
    }

    pub fn contract(reason: impl Into<String>) -> Self {
        Self::ContractViolation(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
