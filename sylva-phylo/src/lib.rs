//! Phylogenetic likelihood and tree-topology MCMC for the sylva workspace.
//!
//! Computes the likelihood of aligned sequence data on a rooted time tree
//! under a continuous-time Markov substitution process (Felsenstein
//! pruning), caching per-node partial likelihoods and transition matrices so
//! that a local tree change only recomputes the affected path to the root.
//! Every cache can be stored, restored and accepted in constant time, which
//! is what a Metropolis-Hastings step needs after a rejected proposal.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use sylva_phylo::{
//!     Alphabet, Jc69Model, LikelihoodConfig, SiteModel, SitePatterns, TimeTree,
//!     TreeLikelihood,
//! };
//!
//! let mut tree = TimeTree::from_newick("((A:0.1,B:0.1):0.2,C:0.3);").unwrap();
//! let rows = [
//!     ("A", b"ACGT".as_slice()),
//!     ("B", b"ACGA".as_slice()),
//!     ("C", b"ACTA".as_slice()),
//! ];
//! let patterns = SitePatterns::from_alignment(Alphabet::Nucleotide, &rows).unwrap();
//! let mut likelihood = TreeLikelihood::new(
//!     &mut tree,
//!     patterns,
//!     Arc::new(Jc69Model::new()),
//!     SiteModel::homogeneous(),
//!     LikelihoodConfig::default(),
//! )
//! .unwrap();
//! let ll = likelihood.log_likelihood(&mut tree).unwrap();
//! assert!(ll < 0.0);
//! ```

pub mod exchange;
pub mod likelihood;
pub mod mcmc;
pub mod newick;
pub mod operators;
pub mod partials;
pub mod patterns;
pub mod simulation;
pub mod site_model;
pub mod subst_model;
pub mod tree;

pub use exchange::{ExchangeKind, ExchangeOperator, MAX_TRIES};
pub use likelihood::{LikelihoodConfig, ScalingPolicy, TreeLikelihood};
pub use mcmc::{Chain, ChainSample, ChainTrace, McmcConfig, StepOutcome};
pub use operators::{
    OperatorStats, ProposalFailure, ProposalOutcome, TreeOperator, UniformHeightOperator,
};
pub use patterns::{Alphabet, SitePatterns, StateSet};
pub use simulation::{random_coalescent_tree, simulate_alignment, SimulatedAlignment};
pub use site_model::SiteModel;
pub use subst_model::{Jc69Model, ReversibleModel, SubstitutionModel};
pub use tree::{Join, NodeId, TimeTree, TreeEdit, TreeEvent};
