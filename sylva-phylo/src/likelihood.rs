//! Felsenstein pruning with cached, restorable partial likelihoods.
//!
//! [`TreeLikelihood`] subscribes to a [`TimeTree`] and turns its change
//! events into dirty flags. Each evaluation walks the tree in post-order
//! and recomputes only dirty transition matrices and partials:
//!
//! ```text
//! partials[node] = (M_left . partials[left]) * (M_right . partials[right])
//! ```
//!
//! per rate category and pattern. At the root, pattern `k` has likelihood
//! `L_k = sum_c p_c sum_s pi_s partials[root][c][k][s]`, and the total is
//! `sum_k w_k (ln L_k + sum of log scale factors)`.

use std::sync::Arc;

use sylva_core::{
    Listenable, Result, Storable, SubscriptionId, Summarizable, SylvaError, Versioned,
};
use tracing::{debug, trace, warn};

use crate::partials::{DirtyFlags, PartialsCache, PartialsLayout, TransitionMatrixCache};
use crate::patterns::SitePatterns;
use crate::site_model::SiteModel;
use crate::subst_model::SubstitutionModel;
use crate::tree::{NodeId, TimeTree, TreeEvent};

/// When partial likelihoods are rescaled to avoid underflow.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScalingPolicy {
    /// Never rescale.
    Never,
    /// Rescale every pattern at every internal node.
    Always,
    /// Rescale a pattern at a node when its largest partial drops below
    /// the threshold.
    Threshold(f64),
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        ScalingPolicy::Threshold(1e-100)
    }
}

/// Likelihood engine settings.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LikelihoodConfig {
    pub scaling: ScalingPolicy,
    /// Reject NaN or infinite partials as [`SylvaError::Numerical`].
    pub check_numerics: bool,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            scaling: ScalingPolicy::default(),
            check_numerics: true,
        }
    }
}

/// Log-likelihood of site patterns on a time tree.
#[derive(Debug)]
pub struct TreeLikelihood {
    patterns: SitePatterns,
    model: Versioned<Arc<dyn SubstitutionModel>>,
    site_model: Versioned<SiteModel>,
    config: LikelihoodConfig,
    subscription: SubscriptionId,
    tree_instance: u64,
    partials: PartialsCache,
    matrices: TransitionMatrixCache,
    dirty: DirtyFlags,
    pattern_log_likelihoods: Versioned<Vec<f64>>,
    cached: Versioned<Option<f64>>,
}

impl TreeLikelihood {
    /// Bind patterns to `tree` and subscribe to its change events.
    ///
    /// Every tip must carry a taxon present in `patterns` and vice versa.
    /// All nodes start dirty; the first evaluation computes everything.
    /// The engine only accepts this tree afterwards; release the
    /// subscription with [`detach`](Self::detach).
    pub fn new(
        tree: &mut TimeTree,
        patterns: SitePatterns,
        model: Arc<dyn SubstitutionModel>,
        site_model: SiteModel,
        config: LikelihoodConfig,
    ) -> Result<Self> {
        if model.state_count() != patterns.state_count() {
            return Err(SylvaError::InvalidInput(format!(
                "model {} has {} states but patterns use {}",
                model.name(),
                model.state_count(),
                patterns.state_count()
            )));
        }
        if tree.tip_count() != patterns.taxon_count() {
            return Err(SylvaError::InvalidInput(format!(
                "tree has {} tips but patterns cover {} taxa",
                tree.tip_count(),
                patterns.taxon_count()
            )));
        }
        if let ScalingPolicy::Threshold(t) = config.scaling {
            if !(t.is_finite() && t > 0.0) {
                return Err(SylvaError::InvalidInput(format!(
                    "scaling threshold must be positive, got {}",
                    t
                )));
            }
        }
        let tip_columns = (0..tree.tip_count())
            .map(|tip| {
                let name = tree.taxon_name(tip).unwrap_or_default();
                patterns.taxon_index(name).ok_or_else(|| {
                    SylvaError::InvalidInput(format!("taxon '{}' has no sequence data", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let layout = PartialsLayout {
            categories: site_model.category_count(),
            patterns: patterns.pattern_count(),
            states: patterns.state_count(),
        };
        let node_count = tree.node_count();
        let partials = PartialsCache::new(layout, node_count, &patterns, &tip_columns);
        let matrices = TransitionMatrixCache::new(node_count, layout.categories, layout.states);
        let dirty = DirtyFlags::new(node_count, tree.tip_count());
        let subscription = tree.subscribe();
        debug!(
            taxa = tree.tip_count(),
            patterns = layout.patterns,
            categories = layout.categories,
            model = model.name(),
            "tree likelihood created"
        );

        Ok(Self {
            pattern_log_likelihoods: Versioned::new(vec![0.0; layout.patterns]),
            patterns,
            model: Versioned::new(model),
            site_model: Versioned::new(site_model),
            config,
            subscription,
            tree_instance: tree.instance_id(),
            partials,
            matrices,
            dirty,
            cached: Versioned::new(None),
        })
    }

    /// The total log-likelihood of the current tree.
    ///
    /// Returns `Ok(f64::NEG_INFINITY)` when some pattern is impossible or
    /// the tree has a negative branch length. Non-finite partials or
    /// transition probabilities are a [`SylvaError::Numerical`].
    pub fn log_likelihood(&mut self, tree: &mut TimeTree) -> Result<f64> {
        self.sync(tree)?;
        if let Some(value) = *self.cached.get() {
            return Ok(value);
        }
        if !tree.is_valid_state() {
            debug!(tree = %tree.to_newick(), "negative branch length, likelihood is zero");
            return Ok(f64::NEG_INFINITY);
        }

        let model = Arc::clone(self.model.get());
        let mut matrix_updates = 0usize;
        let mut partial_updates = 0usize;
        let mut rescaled = 0usize;
        for node in tree.postorder() {
            if self.dirty.matrix(node) {
                if let Some(length) = tree.branch_length(node) {
                    self.matrices
                        .update(node, length, model.as_ref(), self.site_model.get())?;
                    matrix_updates += 1;
                }
                self.dirty.clear_matrix(node);
            }
            if self.dirty.partials(node) {
                if let [left, right] = *tree.children(node) {
                    rescaled += self.partials.update(
                        node,
                        [
                            (left, self.matrices.get(left)),
                            (right, self.matrices.get(right)),
                        ],
                        self.config.scaling,
                        self.config.check_numerics,
                    )?;
                    partial_updates += 1;
                }
                self.dirty.clear_partials(node);
            }
        }

        let total = self.integrate_root(tree.root(), model.as_ref())?;
        trace!(
            matrix_updates,
            partial_updates,
            rescaled,
            log_likelihood = total,
            "likelihood evaluated"
        );
        self.cached.set(Some(total));
        Ok(total)
    }

    fn integrate_root(&mut self, root: NodeId, model: &dyn SubstitutionModel) -> Result<f64> {
        let layout = self.partials.layout();
        let freqs = model.frequencies();
        let site_model = self.site_model.get();
        let root_partials = self.partials.partials(root);

        let out = self.pattern_log_likelihoods.overwrite();
        self.partials.accumulated_log_scales(out);
        let mut total = 0.0;
        let mut impossible = 0usize;
        for (k, ln_l) in out.iter_mut().enumerate() {
            let mut l = 0.0;
            for (c, p) in site_model.proportions().iter().enumerate() {
                let start = layout.index(c, k, 0);
                let cat: f64 = root_partials[start..start + layout.states]
                    .iter()
                    .zip(freqs)
                    .map(|(x, f)| x * f)
                    .sum();
                l += p * cat;
            }
            if l.is_nan() {
                return Err(SylvaError::numerical(
                    root,
                    format!("pattern {} has NaN likelihood", k),
                ));
            }
            if l == 0.0 {
                impossible += 1;
            }
            *ln_l += l.ln();
            let w = self.patterns.weights()[k];
            if w > 0.0 {
                total += w * *ln_l;
            }
        }
        if impossible > 0 {
            if self.config.scaling == ScalingPolicy::Never {
                warn!(
                    patterns = impossible,
                    "zero pattern likelihood without rescaling; possible underflow"
                );
            } else {
                debug!(patterns = impossible, "impossible site patterns");
            }
        }
        Ok(total)
    }

    fn check_tree(&self, tree: &TimeTree) -> Result<()> {
        if tree.instance_id() != self.tree_instance {
            return Err(SylvaError::InvalidInput(format!(
                "likelihood is bound to tree #{}, got tree #{}",
                self.tree_instance,
                tree.instance_id()
            )));
        }
        Ok(())
    }

    /// Drain pending tree events into dirty flags without computing.
    ///
    /// Fails with [`SylvaError::InvalidInput`] for a tree other than the one
    /// the engine was created on.
    pub fn sync(&mut self, tree: &mut TimeTree) -> Result<()> {
        self.check_tree(tree)?;
        let events = tree.drain_events(self.subscription);
        if events.is_empty() {
            return Ok(());
        }
        for event in events {
            match event {
                TreeEvent::Height(node) => {
                    if !tree.is_root(node) {
                        self.dirty.mark_matrix(node);
                    }
                    for &child in tree.children(node) {
                        self.dirty.mark_matrix(child);
                    }
                    self.mark_partials_upward(tree, node);
                }
                TreeEvent::Topology(node) => {
                    for &child in tree.children(node) {
                        self.dirty.mark_matrix(child);
                    }
                    self.mark_partials_upward(tree, node);
                }
            }
        }
        self.invalidate();
        Ok(())
    }

    /// Unsubscribe from `tree` and drop the engine.
    pub fn detach(self, tree: &mut TimeTree) -> Result<()> {
        self.check_tree(tree)?;
        tree.unsubscribe(self.subscription);
        debug!(tree = self.tree_instance, "tree likelihood detached");
        Ok(())
    }

    fn mark_partials_upward(&mut self, tree: &TimeTree, node: NodeId) {
        self.dirty.mark_partials(node);
        for ancestor in tree.ancestors(node) {
            self.dirty.mark_partials(ancestor);
        }
    }

    fn invalidate(&mut self) {
        if self.cached.get().is_some() {
            self.cached.set(None);
        }
    }

    /// True if `node`'s partials will be recomputed by the next evaluation.
    pub fn is_partials_dirty(&self, node: NodeId) -> bool {
        self.dirty.partials(node)
    }

    /// True if the matrix of the branch above `node` is stale.
    pub fn is_matrix_dirty(&self, node: NodeId) -> bool {
        self.dirty.matrix(node)
    }

    /// Force a full recomputation.
    pub fn make_dirty(&mut self) {
        self.dirty.mark_all();
        self.invalidate();
    }

    /// Per-pattern log-likelihoods (scale factors included) from the last
    /// evaluation.
    pub fn pattern_log_likelihoods(&self) -> &[f64] {
        self.pattern_log_likelihoods.get()
    }

    pub fn patterns(&self) -> &SitePatterns {
        &self.patterns
    }

    pub fn substitution_model(&self) -> &dyn SubstitutionModel {
        self.model.get().as_ref()
    }

    pub fn site_model(&self) -> &SiteModel {
        self.site_model.get()
    }

    pub fn config(&self) -> LikelihoodConfig {
        self.config
    }

    /// Replace the substitution model. Restorable.
    pub fn set_substitution_model(&mut self, model: Arc<dyn SubstitutionModel>) -> Result<()> {
        if model.state_count() != self.patterns.state_count() {
            return Err(SylvaError::InvalidInput(format!(
                "model {} has {} states but patterns use {}",
                model.name(),
                model.state_count(),
                self.patterns.state_count()
            )));
        }
        self.model.set(model);
        self.make_dirty();
        Ok(())
    }

    /// Replace the site model. Restorable.
    ///
    /// The number of rate categories is fixed by the buffers allocated at
    /// construction.
    pub fn set_site_model(&mut self, site_model: SiteModel) -> Result<()> {
        let expected = self.partials.layout().categories;
        if site_model.category_count() != expected {
            return Err(SylvaError::InvalidInput(format!(
                "site model has {} categories, engine was built for {}",
                site_model.category_count(),
                expected
            )));
        }
        self.site_model.set(site_model);
        self.make_dirty();
        Ok(())
    }
}

impl Storable for TreeLikelihood {
    fn store_state(&mut self) {
        self.partials.store_state();
        self.matrices.store_state();
        self.dirty.store_state();
        self.model.store();
        self.site_model.store();
        self.pattern_log_likelihoods.store();
        self.cached.store();
    }

    fn restore_state(&mut self) {
        self.partials.restore_state();
        self.matrices.restore_state();
        self.dirty.restore_state();
        self.model.restore();
        self.site_model.restore();
        self.pattern_log_likelihoods.restore();
        self.cached.restore();
    }

    fn accept_state(&mut self) {
        self.partials.accept_state();
        self.matrices.accept_state();
        self.dirty.accept_state();
        self.model.accept();
        self.site_model.accept();
        self.pattern_log_likelihoods.accept();
        self.cached.accept();
    }
}

impl Summarizable for TreeLikelihood {
    fn summary(&self) -> String {
        format!(
            "TreeLikelihood: {} taxa, {} patterns, {} rate categories, {}",
            self.patterns.taxon_count(),
            self.patterns.pattern_count(),
            self.site_model.get().category_count(),
            self.model.get().name()
        )
    }
}
