//! Per-node buffers behind the likelihood engine.
//!
//! Three stores, all indexed by [`NodeId`] and all built from
//! [`Versioned`] slots so `store`/`restore`/`accept` are index flips:
//!
//! - [`PartialsCache`]: conditional likelihoods laid out as
//!   (category, pattern, state), plus one log scale factor per pattern.
//! - [`TransitionMatrixCache`]: the `categories x n x n` transition
//!   matrices of the branch above each node.
//! - [`DirtyFlags`]: which of the above must be recomputed.

use sylva_core::{Result, Storable, SylvaError, Versioned};

use crate::likelihood::ScalingPolicy;
use crate::patterns::SitePatterns;
use crate::site_model::SiteModel;
use crate::subst_model::SubstitutionModel;
use crate::tree::NodeId;

/// Shape of one node's partials buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialsLayout {
    pub categories: usize,
    pub patterns: usize,
    pub states: usize,
}

impl PartialsLayout {
    /// Total number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.categories * self.patterns * self.states
    }

    /// True if the buffer would be empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries per rate category.
    #[inline]
    pub fn category_block(&self) -> usize {
        self.patterns * self.states
    }

    /// Flat offset of `(category, pattern, state)`.
    #[inline]
    pub fn index(&self, category: usize, pattern: usize, state: usize) -> usize {
        (category * self.patterns + pattern) * self.states + state
    }
}

/// Conditional likelihood vectors and log scale factors for every node.
#[derive(Debug, Clone)]
pub struct PartialsCache {
    layout: PartialsLayout,
    tip_count: usize,
    partials: Vec<Versioned<Vec<f64>>>,
    log_scales: Vec<Versioned<Vec<f64>>>,
}

impl PartialsCache {
    /// Allocate buffers and fill tip observations.
    ///
    /// `tip_columns[t]` is the pattern column observed at tip `t`.
    pub fn new(
        layout: PartialsLayout,
        node_count: usize,
        patterns: &SitePatterns,
        tip_columns: &[usize],
    ) -> Self {
        let tip_count = tip_columns.len();
        let mut partials = Vec::with_capacity(node_count);
        for &column in tip_columns {
            let mut buf = vec![0.0; layout.len()];
            for c in 0..layout.categories {
                for k in 0..layout.patterns {
                    let set = patterns.state(k, column);
                    for s in 0..layout.states {
                        if set.contains(s) {
                            buf[layout.index(c, k, s)] = 1.0;
                        }
                    }
                }
            }
            // Tip observations are never rewritten, so no spare slot.
            partials.push(Versioned::with_spare(buf, Vec::new()));
        }
        for _ in tip_count..node_count {
            partials.push(Versioned::with_spare(
                vec![0.0; layout.len()],
                vec![0.0; layout.len()],
            ));
        }
        let log_scales = (0..node_count)
            .map(|_| Versioned::new(vec![0.0; layout.patterns]))
            .collect();
        Self {
            layout,
            tip_count,
            partials,
            log_scales,
        }
    }

    pub fn layout(&self) -> PartialsLayout {
        self.layout
    }

    /// Current partials of `node`.
    #[inline]
    pub fn partials(&self, node: NodeId) -> &[f64] {
        self.partials[node].get()
    }

    /// Current log scale factors of `node`, one per pattern.
    #[inline]
    pub fn log_scales(&self, node: NodeId) -> &[f64] {
        self.log_scales[node].get()
    }

    /// Recompute `node` from its two children and their branch matrices.
    ///
    /// Per category and pattern, `partials[node][s] = (M_L . L)[s] * (M_R . R)[s]`.
    /// Returns the number of patterns that were rescaled.
    pub fn update(
        &mut self,
        node: NodeId,
        children: [(NodeId, &[f64]); 2],
        scaling: ScalingPolicy,
        check_numerics: bool,
    ) -> Result<usize> {
        debug_assert!(node >= self.tip_count, "tip partials are fixed");
        let layout = self.layout;
        let [(left, m_left), (right, m_right)] = children;

        let mut out = std::mem::take(self.partials[node].overwrite());
        {
            let lp = self.partials[left].get().as_slice();
            let rp = self.partials[right].get().as_slice();
            let n = layout.states;
            let kernel = |c: usize, block: &mut [f64]| {
                let ml = &m_left[c * n * n..(c + 1) * n * n];
                let mr = &m_right[c * n * n..(c + 1) * n * n];
                let offset = c * layout.category_block();
                for (k, dest) in block.chunks_exact_mut(n).enumerate() {
                    let base = offset + k * n;
                    let l = &lp[base..base + n];
                    let r = &rp[base..base + n];
                    for (s, d) in dest.iter_mut().enumerate() {
                        let row_l = &ml[s * n..(s + 1) * n];
                        let row_r = &mr[s * n..(s + 1) * n];
                        let sum_l: f64 = row_l.iter().zip(l).map(|(p, x)| p * x).sum();
                        let sum_r: f64 = row_r.iter().zip(r).map(|(p, x)| p * x).sum();
                        *d = sum_l * sum_r;
                    }
                }
            };

            #[cfg(feature = "parallel")]
            {
                use rayon::prelude::*;
                out.par_chunks_mut(layout.category_block())
                    .enumerate()
                    .for_each(|(c, block)| kernel(c, block));
            }
            #[cfg(not(feature = "parallel"))]
            out.chunks_mut(layout.category_block())
                .enumerate()
                .for_each(|(c, block)| kernel(c, block));
        }

        if check_numerics {
            if let Some(pos) = out.iter().position(|x| !x.is_finite()) {
                let value = out[pos];
                *self.partials[node].overwrite() = out;
                return Err(SylvaError::numerical(
                    node,
                    format!("partial likelihood {} at offset {}", value, pos),
                ));
            }
        }

        let rescaled = self.rescale(node, &mut out, scaling);
        *self.partials[node].overwrite() = out;
        Ok(rescaled)
    }

    fn rescale(&mut self, node: NodeId, buf: &mut [f64], scaling: ScalingPolicy) -> usize {
        let layout = self.layout;
        let scales = self.log_scales[node].overwrite();
        let mut rescaled = 0;
        for k in 0..layout.patterns {
            scales[k] = 0.0;
            let threshold = match scaling {
                ScalingPolicy::Never => continue,
                ScalingPolicy::Always => f64::INFINITY,
                ScalingPolicy::Threshold(t) => t,
            };
            let mut max = 0.0f64;
            for c in 0..layout.categories {
                let start = layout.index(c, k, 0);
                max = buf[start..start + layout.states]
                    .iter()
                    .fold(max, |m, &x| m.max(x));
            }
            if max > 0.0 && max < threshold {
                for c in 0..layout.categories {
                    let start = layout.index(c, k, 0);
                    buf[start..start + layout.states]
                        .iter_mut()
                        .for_each(|x| *x /= max);
                }
                scales[k] = max.ln();
                rescaled += 1;
            }
        }
        rescaled
    }

    /// Sum of log scale factors of all internal nodes, per pattern.
    pub fn accumulated_log_scales(&self, out: &mut [f64]) {
        out.iter_mut().for_each(|x| *x = 0.0);
        for scales in &self.log_scales[self.tip_count..] {
            for (acc, s) in out.iter_mut().zip(scales.get()) {
                *acc += s;
            }
        }
    }
}

impl Storable for PartialsCache {
    fn store_state(&mut self) {
        for slot in self.partials.iter_mut().chain(self.log_scales.iter_mut()) {
            slot.store();
        }
    }

    fn restore_state(&mut self) {
        for slot in self.partials.iter_mut().chain(self.log_scales.iter_mut()) {
            slot.restore();
        }
    }

    fn accept_state(&mut self) {
        for slot in self.partials.iter_mut().chain(self.log_scales.iter_mut()) {
            slot.accept();
        }
    }
}

/// Transition matrices for the branch above each node.
#[derive(Debug, Clone)]
pub struct TransitionMatrixCache {
    categories: usize,
    states: usize,
    matrices: Vec<Versioned<Vec<f64>>>,
}

impl TransitionMatrixCache {
    pub fn new(node_count: usize, categories: usize, states: usize) -> Self {
        let len = categories * states * states;
        let matrices = (0..node_count)
            .map(|_| Versioned::with_spare(vec![0.0; len], vec![0.0; len]))
            .collect();
        Self {
            categories,
            states,
            matrices,
        }
    }

    /// All category matrices of `node`, concatenated.
    #[inline]
    pub fn get(&self, node: NodeId) -> &[f64] {
        self.matrices[node].get()
    }

    /// Matrix of `node` for one category.
    pub fn category(&self, node: NodeId, category: usize) -> &[f64] {
        let size = self.states * self.states;
        &self.matrices[node].get()[category * size..(category + 1) * size]
    }

    /// Recompute every category matrix for a branch of `length`.
    pub fn update(
        &mut self,
        node: NodeId,
        length: f64,
        model: &dyn SubstitutionModel,
        site_model: &SiteModel,
    ) -> Result<()> {
        let size = self.states * self.states;
        let slot = self.matrices[node].overwrite();
        for (c, block) in slot.chunks_exact_mut(size).enumerate().take(self.categories) {
            model
                .transition_probabilities(site_model.distance(length, c), block)
                .map_err(|e| match e {
                    SylvaError::Numerical { detail, .. } => SylvaError::numerical(
                        node,
                        format!("{} (category {}, branch {})", detail, c, length),
                    ),
                    other => other,
                })?;
        }
        Ok(())
    }
}

impl Storable for TransitionMatrixCache {
    fn store_state(&mut self) {
        self.matrices.iter_mut().for_each(Versioned::store);
    }

    fn restore_state(&mut self) {
        self.matrices.iter_mut().for_each(Versioned::restore);
    }

    fn accept_state(&mut self) {
        self.matrices.iter_mut().for_each(Versioned::accept);
    }
}

/// Recompute flags of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    pub partials: bool,
    pub matrix: bool,
}

/// Dirty flags for every node, restored together with the buffers.
#[derive(Debug, Clone)]
pub struct DirtyFlags {
    tip_count: usize,
    flags: Vec<Versioned<NodeFlags>>,
}

impl DirtyFlags {
    /// Every node starts dirty.
    pub fn new(node_count: usize, tip_count: usize) -> Self {
        let mut dirty = Self {
            tip_count,
            flags: vec![Versioned::default(); node_count],
        };
        dirty.mark_all();
        dirty
    }

    pub fn mark_all(&mut self) {
        for node in 0..self.flags.len() {
            self.mark_matrix(node);
            self.mark_partials(node);
        }
    }

    /// Mark the partials of `node` dirty. Tips are ignored.
    pub fn mark_partials(&mut self, node: NodeId) {
        if node >= self.tip_count && !self.flags[node].get().partials {
            self.flags[node].modify(|f| f.partials = true);
        }
    }

    pub fn mark_matrix(&mut self, node: NodeId) {
        if !self.flags[node].get().matrix {
            self.flags[node].modify(|f| f.matrix = true);
        }
    }

    pub fn clear_partials(&mut self, node: NodeId) {
        if self.flags[node].get().partials {
            self.flags[node].modify(|f| f.partials = false);
        }
    }

    pub fn clear_matrix(&mut self, node: NodeId) {
        if self.flags[node].get().matrix {
            self.flags[node].modify(|f| f.matrix = false);
        }
    }

    #[inline]
    pub fn partials(&self, node: NodeId) -> bool {
        self.flags[node].get().partials
    }

    #[inline]
    pub fn matrix(&self, node: NodeId) -> bool {
        self.flags[node].get().matrix
    }

    /// True if any node needs recomputation.
    pub fn any(&self) -> bool {
        self.flags.iter().any(|f| f.get().partials || f.get().matrix)
    }
}

impl Storable for DirtyFlags {
    fn store_state(&mut self) {
        self.flags.iter_mut().for_each(Versioned::store);
    }

    fn restore_state(&mut self) {
        self.flags.iter_mut().for_each(Versioned::restore);
    }

    fn accept_state(&mut self) {
        self.flags.iter_mut().for_each(Versioned::accept);
    }
}
