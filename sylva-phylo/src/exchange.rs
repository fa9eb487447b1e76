//! Narrow and wide subtree exchange.
//!
//! Both moves pick two nodes `i` and `j` with parents `iP` and `jP` and swap
//! the subtrees: `i` moves under `jP`, `j` under `iP`. Node heights are
//! untouched, so a swap is only allowed when both new branches stay
//! positive: `height(j) < height(iP)` and `height(i) < height(jP)`.
//!
//! - Narrow: `i` is any node whose parent is not the root, `jP` is the
//!   grandparent of `i`, and `j` is the sibling of `iP`.
//! - Wide: `i` and `j` are any two distinct non-root nodes that do not
//!   share a parent and are not parent and child.
//!
//! Candidates are drawn with replacement until one is valid or the retry
//! bound is exhausted, so the bound is probabilistic: a tree with a single
//! valid move among many candidates can still exhaust it.

use rand::{Rng, RngCore};
use sylva_core::{Identifiable, Result, SylvaError};
use tracing::debug;

use crate::operators::{OperatorStats, ProposalFailure, ProposalOutcome, TreeOperator};
use crate::tree::{NodeId, TimeTree};

/// Default retry bound.
pub const MAX_TRIES: usize = 10_000;

/// Which exchange move to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExchangeKind {
    Narrow,
    Wide,
}

/// Subtree exchange operator.
#[derive(Debug, Clone)]
pub struct ExchangeOperator {
    id: String,
    kind: ExchangeKind,
    weight: f64,
    max_tries: usize,
    stats: OperatorStats,
}

impl ExchangeOperator {
    /// Swap a node with its parent's sibling.
    pub fn narrow(weight: f64) -> Self {
        Self::new(ExchangeKind::Narrow, "narrow-exchange", weight)
    }

    /// Swap two arbitrary unrelated nodes.
    pub fn wide(weight: f64) -> Self {
        Self::new(ExchangeKind::Wide, "wide-exchange", weight)
    }

    fn new(kind: ExchangeKind, id: &str, weight: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            weight,
            max_tries: MAX_TRIES,
            stats: OperatorStats::default(),
        }
    }

    /// Override the retry bound.
    pub fn with_max_tries(mut self, max_tries: usize) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn max_tries(&self) -> usize {
        self.max_tries
    }

    /// Swap `i` and `j` and check that no tip was lost.
    fn apply(&self, tree: &mut TimeTree, i: NodeId, j: NodeId) -> Result<ProposalOutcome> {
        let tips_before = tree.reachable_tip_count();
        let (ip, jp) = match exchange(tree, i, j) {
            Ok(parents) => parents,
            Err(SylvaError::InvalidTree(reason)) => {
                debug!(operator = %self.id, i, j, %reason, "exchange rolled back");
                return Ok(ProposalOutcome::Failed(ProposalFailure::InvalidTree {
                    operator: self.id.clone(),
                    reason,
                }));
            }
            Err(e) => return Err(e),
        };
        let tips_after = tree.reachable_tip_count();
        if tips_after != tips_before {
            return Err(SylvaError::StructuralDefect {
                operator: self.id.clone(),
                detail: format!(
                    "tip count changed from {} to {} after exchanging {} (parent {}) and {} (parent {})",
                    tips_before, tips_after, i, ip, j, jp
                ),
            });
        }

        Ok(ProposalOutcome::Proposed {
            log_hastings_ratio: 0.0,
            nodes: vec![i, j, ip, jp],
        })
    }

    /// Draw a valid `(i, j)` pair, or `Err(tries)` if none was found.
    fn select(
        &self,
        tree: &TimeTree,
        rng: &mut dyn RngCore,
    ) -> std::result::Result<(NodeId, NodeId), usize> {
        match self.kind {
            ExchangeKind::Narrow => {
                let eligible: Vec<NodeId> = (0..tree.node_count())
                    .filter(|&n| tree.parent(n).is_some_and(|p| !tree.is_root(p)))
                    .collect();
                if eligible.is_empty() {
                    return Err(0);
                }
                for _ in 0..self.max_tries {
                    let i = eligible[rng.random_range(0..eligible.len())];
                    let Some((ip, jp)) = tree
                        .parent(i)
                        .and_then(|ip| tree.parent(ip).map(|jp| (ip, jp)))
                    else {
                        continue;
                    };
                    let Some(j) = tree.children(jp).iter().copied().find(|&c| c != ip) else {
                        continue;
                    };
                    if tree.height(j) < tree.height(ip) && tree.height(i) < tree.height(jp) {
                        return Ok((i, j));
                    }
                }
                Err(self.max_tries)
            }
            ExchangeKind::Wide => {
                let eligible: Vec<NodeId> =
                    (0..tree.node_count()).filter(|&n| !tree.is_root(n)).collect();
                if eligible.len() < 2 {
                    return Err(0);
                }
                for _ in 0..self.max_tries {
                    let a = rng.random_range(0..eligible.len());
                    let mut b = rng.random_range(0..eligible.len() - 1);
                    if b >= a {
                        b += 1;
                    }
                    let (i, j) = (eligible[a], eligible[b]);
                    let (Some(ip), Some(jp)) = (tree.parent(i), tree.parent(j)) else {
                        continue;
                    };
                    if ip != jp
                        && i != jp
                        && j != ip
                        && tree.height(j) < tree.height(ip)
                        && tree.height(i) < tree.height(jp)
                    {
                        return Ok((i, j));
                    }
                }
                Err(self.max_tries)
            }
        }
    }
}

/// Swap the subtrees under `i` and `j` in one edit transaction.
fn exchange(tree: &mut TimeTree, i: NodeId, j: NodeId) -> Result<(NodeId, NodeId)> {
    let (ip, jp) = match (tree.parent(i), tree.parent(j)) {
        (Some(ip), Some(jp)) => (ip, jp),
        _ => {
            return Err(SylvaError::InvalidTree(format!(
                "cannot exchange root node ({} or {})",
                i, j
            )))
        }
    };
    let mut edit = tree.begin_edit();
    edit.remove_child(ip, i)?;
    edit.remove_child(jp, j)?;
    edit.add_child(jp, i)?;
    edit.add_child(ip, j)?;
    edit.commit()?;
    Ok((ip, jp))
}

impl Identifiable for ExchangeOperator {
    fn id(&self) -> &str {
        &self.id
    }
}

impl TreeOperator for ExchangeOperator {
    fn weight(&self) -> f64 {
        self.weight
    }

    fn propose(&mut self, tree: &mut TimeTree, rng: &mut dyn RngCore) -> Result<ProposalOutcome> {
        let (i, j) = match self.select(tree, rng) {
            Ok(pair) => pair,
            Err(tries) => {
                debug!(operator = %self.id, tries, "no valid exchange");
                return Ok(ProposalOutcome::Failed(ProposalFailure::NoValidMove {
                    operator: self.id.clone(),
                    tries,
                }));
            }
        };

        self.apply(tree, i, j)
    }

    fn stats(&self) -> &OperatorStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut OperatorStats {
        &mut self.stats
    }
}
