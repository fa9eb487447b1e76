//! Structured error types for the sylva workspace.

use thiserror::Error;

/// Unified error type for all sylva operations.
///
/// Recoverable MCMC outcomes (a proposal that could not be built, a
/// likelihood of zero) are ordinary return values and never appear here.
/// Variants in this enum are either caller mistakes or defects.
#[derive(Debug, Error)]
pub enum SylvaError {
    /// Parse error (malformed Newick input)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, out-of-range values, mismatched taxa)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A tree edit left the tree in a structurally invalid shape.
    #[error("invalid tree: {0}")]
    InvalidTree(String),

    /// NaN, infinity or a non-stochastic row where a finite probability was required.
    #[error("numerical defect{}: {detail}", .node.map(|n| format!(" at node {n}")).unwrap_or_default())]
    Numerical { node: Option<usize>, detail: String },

    /// An operator corrupted the tree (e.g. lost tips).
    #[error("structural defect in {operator}: {detail}")]
    StructuralDefect { operator: String, detail: String },

    /// A fatal error raised inside a chain step, with diagnostic context.
    #[error("chain halted at step {step} ({operator}): {source}; tree = {tree}")]
    Chain {
        step: u64,
        operator: String,
        tree: String,
        #[source]
        source: Box<SylvaError>,
    },

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

impl SylvaError {
    /// Shorthand for a [`SylvaError::Numerical`] tied to a node.
    pub fn numerical(node: impl Into<Option<usize>>, detail: impl Into<String>) -> Self {
        Self::Numerical {
            node: node.into(),
            detail: detail.into(),
        }
    }

    /// True for errors that indicate a bug or numerical corruption rather
    /// than bad input: the caller should halt instead of retrying.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Numerical { .. } | Self::StructuralDefect { .. } | Self::Chain { .. } => true,
            Self::Parse(_) | Self::InvalidInput(_) | Self::InvalidTree(_) | Self::Other(_) => false,
        }
    }
}

/// Convenience alias used throughout the sylva workspace.
pub type Result<T> = std::result::Result<T, SylvaError>;
