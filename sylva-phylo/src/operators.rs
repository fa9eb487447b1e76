//! MCMC proposal operators on time trees.
//!
//! An operator mutates the tree in place and reports the log Hastings ratio
//! of its move. When it cannot build a valid move it returns
//! [`ProposalOutcome::Failed`], which the driver treats as a rejected step;
//! only defects that leave the tree corrupted surface as errors.

use rand::{Rng, RngCore};
use sylva_core::{Identifiable, Result};
use thiserror::Error;
use tracing::debug;

use crate::tree::{NodeId, TimeTree};

/// Why an operator could not produce a move.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProposalFailure {
    #[error("{operator}: no valid move after {tries} tries")]
    NoValidMove { operator: String, tries: usize },

    #[error("{operator}: edit rejected: {reason}")]
    InvalidTree { operator: String, reason: String },
}

/// Result of one proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalOutcome {
    /// The tree was changed.
    Proposed {
        log_hastings_ratio: f64,
        /// Nodes the move touched.
        nodes: Vec<NodeId>,
    },
    /// Nothing was changed; the step counts as rejected.
    Failed(ProposalFailure),
}

impl ProposalOutcome {
    pub fn is_proposed(&self) -> bool {
        matches!(self, ProposalOutcome::Proposed { .. })
    }
}

/// Per-operator acceptance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperatorStats {
    pub accepted: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl OperatorStats {
    /// Number of proposals attempted.
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected + self.failed
    }

    /// Fraction of attempted proposals that were accepted.
    pub fn acceptance_probability(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.accepted as f64 / n as f64,
        }
    }
}

/// A tree proposal operator.
pub trait TreeOperator: Identifiable {
    /// Relative selection weight.
    fn weight(&self) -> f64;

    /// Propose a move on `tree`.
    ///
    /// Must leave the tree unchanged when returning
    /// [`ProposalOutcome::Failed`].
    fn propose(&mut self, tree: &mut TimeTree, rng: &mut dyn RngCore) -> Result<ProposalOutcome>;

    fn stats(&self) -> &OperatorStats;

    fn stats_mut(&mut self) -> &mut OperatorStats;

    /// The proposal was accepted.
    fn accept(&mut self) {
        self.stats_mut().accepted += 1;
    }

    /// The proposal was rejected by the Metropolis-Hastings test.
    fn reject(&mut self) {
        self.stats_mut().rejected += 1;
    }

    /// No move could be built.
    fn record_failure(&mut self) {
        self.stats_mut().failed += 1;
    }
}

/// Redraws one internal node height uniformly between its oldest child
/// and its parent. The root is never moved.
#[derive(Debug, Clone)]
pub struct UniformHeightOperator {
    id: String,
    weight: f64,
    stats: OperatorStats,
}

impl UniformHeightOperator {
    pub fn new(weight: f64) -> Self {
        Self {
            id: "uniform-height".into(),
            weight,
            stats: OperatorStats::default(),
        }
    }
}

impl Identifiable for UniformHeightOperator {
    fn id(&self) -> &str {
        &self.id
    }
}

impl TreeOperator for UniformHeightOperator {
    fn weight(&self) -> f64 {
        self.weight
    }

    fn propose(&mut self, tree: &mut TimeTree, rng: &mut dyn RngCore) -> Result<ProposalOutcome> {
        let candidates: Vec<NodeId> = (tree.tip_count()..tree.node_count())
            .filter(|&n| !tree.is_root(n))
            .collect();
        if candidates.is_empty() {
            return Ok(ProposalOutcome::Failed(ProposalFailure::NoValidMove {
                operator: self.id.clone(),
                tries: 0,
            }));
        }
        let node = candidates[rng.random_range(0..candidates.len())];
        let lower = tree
            .children(node)
            .iter()
            .map(|&c| tree.height(c))
            .fold(f64::NEG_INFINITY, f64::max);
        let upper = tree.parent(node).map_or(f64::INFINITY, |p| tree.height(p));
        if lower >= upper {
            debug!(operator = %self.id, node, lower, upper, "empty height interval");
            return Ok(ProposalOutcome::Failed(ProposalFailure::InvalidTree {
                operator: self.id.clone(),
                reason: format!(
                    "node {} has no room between {} and {}",
                    node, lower, upper
                ),
            }));
        }
        let u: f64 = rng.random();
        tree.set_height(node, lower + u * (upper - lower))?;
        Ok(ProposalOutcome::Proposed {
            log_hastings_ratio: 0.0,
            nodes: vec![node],
        })
    }

    fn stats(&self) -> &OperatorStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut OperatorStats {
        &mut self.stats
    }
}
