//! Error types and result alias for the crate.
//!
//! This module defines [`enum@crate::error::Error`] and the crate-wide [Result] alias. Variants cover
//! invalid configuration, malformed graphs, expected resource failures (stack exhaustion) and
//! upstream logic errors (scheduler stalls, unresolved links).
use thiserror::Error;

use crate::graph::{NodeId, ShaderType};

pub type Result<T> = std::result::Result<T, Error>;

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid shader graph: {0}")]
    Graph(String),

    #[error("node {node} has no socket named '{socket}'")]
    UnknownSocket { node: NodeId, socket: String },

    #[error("shader '{shader}' has no output node")]
    MissingOutput { shader: String },

    #[error("out of SVM stack space in the {variant} program of shader '{shader}' (capacity {capacity})")]
    StackOverflow {
        shader: String,
        variant: ShaderType,
        capacity: usize,
    },

    #[error("scheduler stalled with {remaining} node(s) left in the {variant} program of shader '{shader}'")]
    SchedulerStalled {
        shader: String,
        variant: ShaderType,
        remaining: usize,
    },

    #[error("input '{socket}' of node {node} was read before its producer was emitted")]
    UnresolvedLink { node: NodeId, socket: String },

    #[error("input '{socket}' of node {node} reads stack slot {offset} after it was released")]
    ReleasedSlot {
        node: NodeId,
        socket: String,
        offset: u32,
    },

    #[error("scene compile cancelled after {compiled} shader(s)")]
    Cancelled { compiled: usize },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures that indicate a malformed graph handed over by an upstream stage,
    /// as opposed to expected resource limits such as stack exhaustion.
    pub fn is_logic_error(&self) -> bool {
        matches!(
            self,
            Error::MissingOutput { .. }
                | Error::SchedulerStalled { .. }
                | Error::UnresolvedLink { .. }
                | Error::ReleasedSlot { .. }
                | Error::UnknownSocket { .. }
        )
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Other(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Other(value.to_owned())
    }
}
