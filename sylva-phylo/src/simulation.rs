//! Random starting trees and sequence simulation.
//!
//! [`random_coalescent_tree`] draws a Kingman coalescent genealogy for a
//! taxon list, the usual algorithmic starting point of a chain.
//! [`simulate_alignment`] evolves sequences down a tree under a
//! substitution and site model, which gives tests and benchmarks data with
//! a known generating tree.

use rand::{Rng, RngCore};
use sylva_core::{Result, SylvaError};

use crate::site_model::SiteModel;
use crate::subst_model::SubstitutionModel;
use crate::tree::{Join, TimeTree};

/// Symbols for 4-state (nucleotide) and 2-state (binary) output.
const NUCLEOTIDES: [u8; 4] = [b'A', b'C', b'G', b'T'];
const BINARY: [u8; 2] = [b'0', b'1'];

/// Simulated tip sequences.
#[derive(Debug, Clone)]
pub struct SimulatedAlignment {
    /// Tip names in tree order.
    pub names: Vec<String>,
    /// One sequence per tip, same order as `names`.
    pub sequences: Vec<Vec<u8>>,
    /// Number of branch-site pairs where the state changed.
    pub substitutions: usize,
}

impl SimulatedAlignment {
    /// `(name, sequence)` rows for [`SitePatterns::from_alignment`].
    ///
    /// [`SitePatterns::from_alignment`]: crate::patterns::SitePatterns::from_alignment
    pub fn rows(&self) -> Vec<(&str, &[u8])> {
        self.names
            .iter()
            .zip(&self.sequences)
            .map(|(n, s)| (n.as_str(), s.as_slice()))
            .collect()
    }
}

/// Draw a constant-size Kingman coalescent tree with contemporaneous tips.
///
/// With `k` lineages the waiting time to the next coalescence is
/// exponential with rate `k(k-1) / (4 * pop_size)`.
pub fn random_coalescent_tree(
    taxa: &[String],
    pop_size: f64,
    rng: &mut dyn RngCore,
) -> Result<TimeTree> {
    if taxa.len() < 2 {
        return Err(SylvaError::InvalidInput(format!(
            "need at least 2 taxa, got {}",
            taxa.len()
        )));
    }
    if !pop_size.is_finite() || pop_size <= 0.0 {
        return Err(SylvaError::InvalidInput(format!(
            "population size must be positive, got {}",
            pop_size
        )));
    }

    let n = taxa.len();
    let mut lineages: Vec<usize> = (0..n).collect();
    let mut joins = Vec::with_capacity(n - 1);
    let mut time = 0.0;
    while lineages.len() > 1 {
        let k = lineages.len() as f64;
        let rate = k * (k - 1.0) / (4.0 * pop_size);
        // 1 - u lies in (0, 1], so the log is finite.
        let u: f64 = rng.random();
        time += -(1.0 - u).ln() / rate;

        let a = rng.random_range(0..lineages.len());
        let left = lineages.swap_remove(a);
        let b = rng.random_range(0..lineages.len());
        let right = lineages.swap_remove(b);
        lineages.push(n + joins.len());
        joins.push(Join {
            left,
            right,
            height: time,
        });
    }
    TimeTree::new(taxa.to_vec(), vec![0.0; n], &joins)
}

fn sample_state(row: &[f64], u: f64) -> usize {
    let mut acc = 0.0;
    for (i, &p) in row.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }
    row.len() - 1
}

/// Evolve `n_sites` independent sites from the root down every branch.
///
/// Root states follow the model's equilibrium frequencies; each site draws
/// its rate category from the site model's proportions.
pub fn simulate_alignment(
    tree: &TimeTree,
    model: &dyn SubstitutionModel,
    site_model: &SiteModel,
    n_sites: usize,
    rng: &mut dyn RngCore,
) -> Result<SimulatedAlignment> {
    if n_sites == 0 {
        return Err(SylvaError::InvalidInput("n_sites must be > 0".into()));
    }
    let n = model.state_count();
    let symbols: &[u8] = match n {
        4 => &NUCLEOTIDES,
        2 => &BINARY,
        _ => {
            return Err(SylvaError::InvalidInput(format!(
                "cannot encode {}-state sequences",
                n
            )))
        }
    };

    let categories: Vec<usize> = (0..n_sites)
        .map(|_| sample_state(site_model.proportions(), rng.random()))
        .collect();
    let mut states: Vec<Vec<usize>> = vec![Vec::new(); tree.node_count()];
    states[tree.root()] = (0..n_sites)
        .map(|_| sample_state(model.frequencies(), rng.random()))
        .collect();

    let mut substitutions = 0;
    let mut matrices = vec![0.0; site_model.category_count() * n * n];
    for node in tree.preorder() {
        let (Some(parent), Some(length)) = (tree.parent(node), tree.branch_length(node)) else {
            continue;
        };
        for (c, block) in matrices.chunks_exact_mut(n * n).enumerate() {
            model.transition_probabilities(site_model.distance(length.max(0.0), c), block)?;
        }
        let child: Vec<usize> = states[parent]
            .iter()
            .zip(&categories)
            .map(|(&from, &c)| {
                let row = &matrices[c * n * n + from * n..c * n * n + (from + 1) * n];
                let to = sample_state(row, rng.random());
                if to != from {
                    substitutions += 1;
                }
                to
            })
            .collect();
        states[node] = child;
    }

    let names = (0..tree.tip_count())
        .map(|tip| tree.taxon_name(tip).unwrap_or_default().to_string())
        .collect();
    let sequences = states[..tree.tip_count()]
        .iter()
        .map(|seq| seq.iter().map(|&s| symbols[s]).collect())
        .collect();
    Ok(SimulatedAlignment {
        names,
        sequences,
        substitutions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{Alphabet, SitePatterns};
    use crate::subst_model::Jc69Model;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn taxa(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{}", i)).collect()
    }

    #[test]
    fn coalescent_tree_is_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        let tree = random_coalescent_tree(&taxa(10), 1.0, &mut rng).unwrap();
        assert_eq!(tree.tip_count(), 10);
        assert_eq!(tree.node_count(), 19);
        assert!(tree.validate().is_ok());
        assert!(tree.is_height_ordered());
        assert!((0..10).all(|t| tree.height(t) == 0.0));
    }

    #[test]
    fn coalescent_tree_is_reproducible() {
        let a = random_coalescent_tree(&taxa(6), 2.0, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = random_coalescent_tree(&taxa(6), 2.0, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a.to_newick(), b.to_newick());
    }

    #[test]
    fn coalescent_rejects_bad_input() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(random_coalescent_tree(&taxa(1), 1.0, &mut rng).is_err());
        assert!(random_coalescent_tree(&taxa(4), 0.0, &mut rng).is_err());
    }

    #[test]
    fn simulated_alignment_shapes() {
        let mut rng = StdRng::seed_from_u64(11);
        let tree = TimeTree::from_newick("((A:0.1,B:0.2):0.3,C:0.4);").unwrap();
        let aln =
            simulate_alignment(&tree, &Jc69Model::new(), &SiteModel::homogeneous(), 100, &mut rng)
                .unwrap();
        assert_eq!(aln.names, vec!["A", "B", "C"]);
        assert!(aln.sequences.iter().all(|s| s.len() == 100));
        let patterns = SitePatterns::from_alignment(Alphabet::Nucleotide, &aln.rows()).unwrap();
        assert_eq!(patterns.site_count(), 100.0);
    }

    #[test]
    fn zero_length_tree_copies_root() {
        let mut rng = StdRng::seed_from_u64(5);
        let tree = TimeTree::from_newick("(A:0,B:0);").unwrap();
        let aln =
            simulate_alignment(&tree, &Jc69Model::new(), &SiteModel::homogeneous(), 50, &mut rng)
                .unwrap();
        assert_eq!(aln.sequences[0], aln.sequences[1]);
        assert_eq!(aln.substitutions, 0);
    }

    #[test]
    fn simulation_rejects_unencodable_models() {
        let mut rng = StdRng::seed_from_u64(5);
        let tree = TimeTree::from_newick("(A:1,B:1);").unwrap();
        let m = Jc69Model::with_states(3).unwrap();
        assert!(simulate_alignment(&tree, &m, &SiteModel::homogeneous(), 5, &mut rng).is_err());
        assert!(
            simulate_alignment(&tree, &Jc69Model::new(), &SiteModel::homogeneous(), 0, &mut rng)
                .is_err()
        );
    }
}
