//! Metropolis-Hastings sampling over time trees.
//!
//! A [`Chain`] owns the tree, its [`TreeLikelihood`] and a weighted set of
//! [`TreeOperator`]s. Every step stores the tree and the likelihood cache,
//! lets one operator propose a move, evaluates the new likelihood
//! incrementally and then either accepts the move or restores both. The
//! tree prior is flat, so the acceptance ratio is the likelihood ratio times
//! the operator's Hastings ratio.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sylva_core::{Identifiable, Result, Storable, SylvaError};
use tracing::{debug, info, info_span};

use crate::likelihood::TreeLikelihood;
use crate::operators::{OperatorStats, ProposalOutcome, TreeOperator};
use crate::tree::TimeTree;

/// Chain length, thinning and seed.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct McmcConfig {
    pub n_steps: u64,
    pub sample_every: u64,
    /// Steps before the first sample is recorded.
    pub burnin: u64,
    pub seed: u64,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            n_steps: 10_000,
            sample_every: 100,
            burnin: 1_000,
            seed: 42,
        }
    }
}

/// State recorded every `sample_every` steps after burn-in.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChainSample {
    pub step: u64,
    pub log_likelihood: f64,
    pub newick: String,
}

/// Samples and per-operator statistics of a finished run.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChainTrace {
    pub samples: Vec<ChainSample>,
    pub operator_stats: Vec<(String, OperatorStats)>,
}

impl ChainTrace {
    /// Fraction of all proposals that were accepted.
    pub fn acceptance_probability(&self) -> f64 {
        let (accepted, total) = self
            .operator_stats
            .iter()
            .fold((0, 0), |(a, t), (_, s)| (a + s.accepted, t + s.total()));
        if total == 0 {
            0.0
        } else {
            accepted as f64 / total as f64
        }
    }
}

/// What happened in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Accepted,
    Rejected,
    /// The operator could not build a move; counted as a rejection.
    Failed,
}

/// A single Metropolis-Hastings chain.
pub struct Chain {
    tree: TimeTree,
    likelihood: TreeLikelihood,
    operators: Vec<Box<dyn TreeOperator>>,
    total_weight: f64,
    config: McmcConfig,
    rng: StdRng,
    current: f64,
    step: u64,
}

impl Chain {
    /// Set up a chain and evaluate the starting likelihood.
    ///
    /// `likelihood` must have been created against `tree`.
    pub fn new(
        mut tree: TimeTree,
        mut likelihood: TreeLikelihood,
        operators: Vec<Box<dyn TreeOperator>>,
        config: McmcConfig,
    ) -> Result<Self> {
        if operators.is_empty() {
            return Err(SylvaError::InvalidInput("chain needs at least one operator".into()));
        }
        if let Some(op) = operators
            .iter()
            .find(|op| !(op.weight().is_finite() && op.weight() >= 0.0))
        {
            return Err(SylvaError::InvalidInput(format!(
                "operator {} has invalid weight {}",
                op.id(),
                op.weight()
            )));
        }
        let total_weight: f64 = operators.iter().map(|op| op.weight()).sum();
        if total_weight <= 0.0 {
            return Err(SylvaError::InvalidInput("operator weights sum to zero".into()));
        }
        if config.sample_every == 0 {
            return Err(SylvaError::InvalidInput("sample_every must be > 0".into()));
        }

        let current = likelihood.log_likelihood(&mut tree)?;
        tree.accept_state();
        likelihood.accept_state();
        debug!(
            operators = operators.len(),
            log_likelihood = current,
            "chain initialised"
        );

        Ok(Self {
            tree,
            likelihood,
            operators,
            total_weight,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            current,
            step: 0,
        })
    }

    pub fn tree(&self) -> &TimeTree {
        &self.tree
    }

    pub fn likelihood(&self) -> &TreeLikelihood {
        &self.likelihood
    }

    pub fn operators(&self) -> &[Box<dyn TreeOperator>] {
        &self.operators
    }

    /// Log-likelihood of the current state.
    pub fn log_likelihood(&self) -> f64 {
        self.current
    }

    /// Number of steps taken so far.
    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Hand back the tree and the likelihood.
    pub fn into_parts(self) -> (TimeTree, TreeLikelihood) {
        (self.tree, self.likelihood)
    }

    fn select_operator(&mut self) -> usize {
        let mut u = self.rng.random::<f64>() * self.total_weight;
        for (i, op) in self.operators.iter().enumerate() {
            if u < op.weight() {
                return i;
            }
            u -= op.weight();
        }
        // Rounding can leave u just above the last weight.
        self.operators
            .iter()
            .rposition(|op| op.weight() > 0.0)
            .unwrap_or(0)
    }

    fn restore(&mut self) {
        self.tree.restore_state();
        self.likelihood.restore_state();
    }

    /// Wrap a fatal error with the step, operator and tree it happened on,
    /// then put the chain back in its last accepted state.
    fn fatal(&mut self, step: u64, operator: usize, source: SylvaError) -> SylvaError {
        let err = SylvaError::Chain {
            step,
            operator: self.operators[operator].id().to_string(),
            tree: self.tree.to_newick(),
            source: Box::new(source),
        };
        self.restore();
        err
    }

    /// Propose, evaluate and accept or reject one move.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let step = self.step;
        self.step += 1;
        let index = self.select_operator();

        self.tree.store_state();
        self.likelihood.store_state();

        let outcome = match self.operators[index].propose(&mut self.tree, &mut self.rng) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fatal(step, index, e)),
        };
        let log_hastings_ratio = match outcome {
            ProposalOutcome::Proposed {
                log_hastings_ratio, ..
            } => log_hastings_ratio,
            ProposalOutcome::Failed(failure) => {
                debug!(step, %failure, "proposal failed");
                self.restore();
                self.operators[index].record_failure();
                return Ok(StepOutcome::Failed);
            }
        };

        let proposed = match self.likelihood.log_likelihood(&mut self.tree) {
            Ok(ll) => ll,
            Err(e) => return Err(self.fatal(step, index, e)),
        };
        let log_alpha = proposed - self.current + log_hastings_ratio;
        let accept = if log_alpha >= 0.0 {
            true
        } else {
            self.rng.random::<f64>() < log_alpha.exp()
        };

        if accept {
            self.tree.accept_state();
            self.likelihood.accept_state();
            self.current = proposed;
            self.operators[index].accept();
            Ok(StepOutcome::Accepted)
        } else {
            self.restore();
            self.operators[index].reject();
            Ok(StepOutcome::Rejected)
        }
    }

    /// Run `n_steps` steps, sampling after burn-in.
    pub fn run(&mut self) -> Result<ChainTrace> {
        let span = info_span!("chain", n_steps = self.config.n_steps, seed = self.config.seed);
        let _guard = span.enter();

        let mut samples = Vec::new();
        for _ in 0..self.config.n_steps {
            let step = self.step;
            self.step()?;
            let due = step >= self.config.burnin
                && (step - self.config.burnin) % self.config.sample_every == 0;
            if due {
                samples.push(ChainSample {
                    step,
                    log_likelihood: self.current,
                    newick: self.tree.to_newick(),
                });
            }
        }

        let operator_stats: Vec<(String, OperatorStats)> = self
            .operators
            .iter()
            .map(|op| (op.id().to_string(), *op.stats()))
            .collect();
        for (id, stats) in &operator_stats {
            info!(
                operator = %id,
                accepted = stats.accepted,
                rejected = stats.rejected,
                failed = stats.failed,
                acceptance = stats.acceptance_probability(),
                "operator summary"
            );
        }
        let trace = ChainTrace {
            samples,
            operator_stats,
        };
        info!(
            steps = self.step,
            samples = trace.samples.len(),
            log_likelihood = self.current,
            acceptance = trace.acceptance_probability(),
            "chain finished"
        );
        Ok(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeOperator;
    use crate::likelihood::LikelihoodConfig;
    use crate::operators::UniformHeightOperator;
    use crate::patterns::{Alphabet, SitePatterns};
    use crate::simulation::{random_coalescent_tree, simulate_alignment};
    use crate::site_model::SiteModel;
    use crate::subst_model::{Jc69Model, ReversibleModel};
    use rand::RngCore;
    use std::sync::Arc;

    fn simulated_chain(seed: u64, n_taxa: usize, config: McmcConfig) -> Chain {
        let mut rng = StdRng::seed_from_u64(seed);
        let taxa: Vec<String> = (0..n_taxa).map(|i| format!("t{}", i)).collect();
        let truth = random_coalescent_tree(&taxa, 0.1, &mut rng).unwrap();
        let model = ReversibleModel::hky85(2.0, [0.3, 0.2, 0.2, 0.3]).unwrap();
        let site_model = SiteModel::gamma(0.5, 4).unwrap();
        let aln = simulate_alignment(&truth, &model, &site_model, 200, &mut rng).unwrap();
        let patterns = SitePatterns::from_alignment(Alphabet::Nucleotide, &aln.rows()).unwrap();

        let mut start = random_coalescent_tree(&taxa, 0.1, &mut rng).unwrap();
        let likelihood = TreeLikelihood::new(
            &mut start,
            patterns,
            Arc::new(model),
            site_model,
            LikelihoodConfig::default(),
        )
        .unwrap();
        let operators: Vec<Box<dyn TreeOperator>> = vec![
            Box::new(ExchangeOperator::narrow(3.0)),
            Box::new(ExchangeOperator::wide(1.0)),
            Box::new(UniformHeightOperator::new(3.0)),
        ];
        Chain::new(start, likelihood, operators, config).unwrap()
    }

    #[test]
    fn run_records_samples_after_burnin() {
        let config = McmcConfig {
            n_steps: 200,
            sample_every: 25,
            burnin: 50,
            seed: 1,
        };
        let mut chain = simulated_chain(3, 6, config);
        let trace = chain.run().unwrap();
        let steps: Vec<u64> = trace.samples.iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![50, 75, 100, 125, 150, 175]);
        assert_eq!(chain.steps(), 200);

        let total: u64 = trace.operator_stats.iter().map(|(_, s)| s.total()).sum();
        assert_eq!(total, 200);
        let p = trace.acceptance_probability();
        assert!((0.0..=1.0).contains(&p), "acceptance {} out of range", p);
    }

    #[test]
    fn cached_likelihood_matches_full_recomputation() {
        let config = McmcConfig {
            n_steps: 300,
            sample_every: 50,
            burnin: 0,
            seed: 8,
        };
        let mut chain = simulated_chain(5, 8, config);
        chain.run().unwrap();
        let current = chain.log_likelihood();
        assert!(chain.tree().validate().is_ok());
        assert!(chain.tree().is_height_ordered());

        let (mut tree, mut likelihood) = chain.into_parts();
        likelihood.make_dirty();
        let full = likelihood.log_likelihood(&mut tree).unwrap();
        assert!(
            (full - current).abs() < 1e-8,
            "incremental {} vs full {}",
            current,
            full
        );
    }

    #[test]
    fn same_seed_same_chain() {
        let config = McmcConfig {
            n_steps: 100,
            sample_every: 10,
            burnin: 0,
            seed: 99,
        };
        let a = simulated_chain(4, 5, config.clone()).run().unwrap();
        let b = simulated_chain(4, 5, config).run().unwrap();
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn failed_proposals_leave_state_untouched() {
        let mut tree = TimeTree::from_newick("(A:0.1,B:0.1);").unwrap();
        let patterns = SitePatterns::from_alignment(
            Alphabet::Nucleotide,
            &[("A", b"ACGT".as_slice()), ("B", b"ACGA".as_slice())],
        )
        .unwrap();
        let likelihood = TreeLikelihood::new(
            &mut tree,
            patterns,
            Arc::new(Jc69Model::new()),
            SiteModel::homogeneous(),
            LikelihoodConfig::default(),
        )
        .unwrap();
        let config = McmcConfig {
            n_steps: 20,
            sample_every: 1,
            burnin: 0,
            seed: 2,
        };
        let mut chain = Chain::new(
            tree,
            likelihood,
            vec![Box::new(ExchangeOperator::narrow(1.0))],
            config,
        )
        .unwrap();
        let start = chain.log_likelihood();
        assert_eq!(chain.step().unwrap(), StepOutcome::Failed);

        let trace = chain.run().unwrap();
        assert_eq!(trace.operator_stats[0].1.failed, 21);
        assert_eq!(trace.operator_stats[0].1.accepted, 0);
        assert!(trace.samples.iter().all(|s| s.log_likelihood == start));
        assert!(trace.samples.iter().all(|s| s.newick == "(A:0.1,B:0.1);"));
    }

    #[derive(Debug, Default)]
    struct BrokenOperator {
        stats: OperatorStats,
    }

    impl Identifiable for BrokenOperator {
        fn id(&self) -> &str {
            "broken"
        }
    }

    impl TreeOperator for BrokenOperator {
        fn weight(&self) -> f64 {
            1.0
        }

        fn propose(&mut self, _: &mut TimeTree, _: &mut dyn RngCore) -> Result<ProposalOutcome> {
            Err(SylvaError::StructuralDefect {
                operator: "broken".into(),
                detail: "lost a tip".into(),
            })
        }

        fn stats(&self) -> &OperatorStats {
            &self.stats
        }

        fn stats_mut(&mut self) -> &mut OperatorStats {
            &mut self.stats
        }
    }

    #[test]
    fn fatal_errors_carry_context() {
        let mut tree = TimeTree::from_newick("(A:0.1,B:0.1);").unwrap();
        let patterns = SitePatterns::from_alignment(
            Alphabet::Nucleotide,
            &[("A", b"AC".as_slice()), ("B", b"AC".as_slice())],
        )
        .unwrap();
        let likelihood = TreeLikelihood::new(
            &mut tree,
            patterns,
            Arc::new(Jc69Model::new()),
            SiteModel::homogeneous(),
            LikelihoodConfig::default(),
        )
        .unwrap();
        let mut chain = Chain::new(
            tree,
            likelihood,
            vec![Box::new(BrokenOperator::default())],
            McmcConfig::default(),
        )
        .unwrap();

        let err = chain.step().unwrap_err();
        assert!(err.is_fatal());
        match err {
            SylvaError::Chain {
                step,
                operator,
                tree,
                source,
            } => {
                assert_eq!(step, 0);
                assert_eq!(operator, "broken");
                assert_eq!(tree, "(A:0.1,B:0.1);");
                assert!(matches!(*source, SylvaError::StructuralDefect { .. }));
            }
            other => panic!("expected a chain error, got {:?}", other),
        }
        assert_eq!(chain.tree().to_newick(), "(A:0.1,B:0.1);");
    }

    #[test]
    fn rejects_bad_operator_sets() {
        let build = |ops: Vec<Box<dyn TreeOperator>>, config: McmcConfig| {
            let mut tree = TimeTree::from_newick("(A:0.1,B:0.1);").unwrap();
            let patterns = SitePatterns::from_alignment(
                Alphabet::Nucleotide,
                &[("A", b"A".as_slice()), ("B", b"A".as_slice())],
            )
            .unwrap();
            let likelihood = TreeLikelihood::new(
                &mut tree,
                patterns,
                Arc::new(Jc69Model::new()),
                SiteModel::homogeneous(),
                LikelihoodConfig::default(),
            )
            .unwrap();
            Chain::new(tree, likelihood, ops, config)
        };
        assert!(build(Vec::new(), McmcConfig::default()).is_err());
        assert!(build(
            vec![Box::new(ExchangeOperator::narrow(0.0))],
            McmcConfig::default()
        )
        .is_err());
        assert!(build(
            vec![Box::new(ExchangeOperator::narrow(-1.0))],
            McmcConfig::default()
        )
        .is_err());
        let config = McmcConfig {
            sample_every: 0,
            ..Default::default()
        };
        assert!(build(vec![Box::new(ExchangeOperator::narrow(1.0))], config).is_err());
    }
}
