//! Substitution models for N-state reversible Markov processes.
//!
//! Every model exposes its rate matrix Q (row-major, normalized to one
//! expected substitution per unit distance) and fills transition matrices
//! P(d) = exp(Qd). JC69 uses the closed form; HKY85, GTR and general
//! reversible models share one eigendecomposition computed at
//! construction.

use std::fmt;

use sylva_core::{Result, SylvaError};

use crate::patterns::MAX_STATES;

/// Allowed deviation of a transition matrix entry from [0, 1] and of a row
/// sum from 1 before the matrix is rejected.
pub const STOCHASTIC_TOLERANCE: f64 = 1e-8;

/// An N-state continuous-time substitution process.
pub trait SubstitutionModel: Send + Sync + fmt::Debug {
    /// Short model name, e.g. `"HKY85"`.
    fn name(&self) -> &str;

    /// Number of character states.
    fn state_count(&self) -> usize;

    /// Equilibrium frequencies, one per state.
    fn frequencies(&self) -> &[f64];

    /// Instantaneous rate matrix Q, row-major `n x n`.
    fn rate_matrix(&self) -> &[f64];

    /// Fill `out` (row-major `n x n`) with P(distance) = exp(Q * distance).
    ///
    /// `distance` is branch length times rate multiplier and must be finite
    /// and non-negative. The result is checked for row-stochasticity.
    fn transition_probabilities(&self, distance: f64, out: &mut [f64]) -> Result<()>;

    /// Number of free parameters (branch lengths excluded).
    fn free_parameter_count(&self) -> usize;
}

fn check_distance(distance: f64, out: &[f64], n: usize) -> Result<()> {
    if !distance.is_finite() || distance < 0.0 {
        return Err(SylvaError::InvalidInput(format!(
            "distance must be finite and non-negative, got {}",
            distance
        )));
    }
    if out.len() != n * n {
        return Err(SylvaError::InvalidInput(format!(
            "transition matrix buffer has {} entries, expected {}",
            out.len(),
            n * n
        )));
    }
    Ok(())
}

/// Clamp round-off and verify `p` is row-stochastic.
///
/// Entries within [`STOCHASTIC_TOLERANCE`] of the unit interval are clamped
/// and each row renormalized; anything further off is a numerical defect.
pub fn check_transition_matrix(p: &mut [f64], n: usize) -> Result<()> {
    for (i, row) in p.chunks_exact_mut(n).enumerate() {
        for (j, x) in row.iter_mut().enumerate() {
            if !x.is_finite() || *x < -STOCHASTIC_TOLERANCE || *x > 1.0 + STOCHASTIC_TOLERANCE {
                return Err(SylvaError::numerical(
                    None,
                    format!("transition probability P[{}][{}] = {}", i, j, x),
                ));
            }
            *x = x.clamp(0.0, 1.0);
        }
        let sum: f64 = row.iter().sum();
        if (sum - 1.0).abs() > STOCHASTIC_TOLERANCE {
            return Err(SylvaError::numerical(
                None,
                format!("transition matrix row {} sums to {}", i, sum),
            ));
        }
        row.iter_mut().for_each(|x| *x /= sum);
    }
    Ok(())
}

/// Jukes-Cantor model on `n` states: equal frequencies, equal rates.
#[derive(Debug, Clone)]
pub struct Jc69Model {
    n: usize,
    freqs: Vec<f64>,
    q: Vec<f64>,
}

impl Jc69Model {
    /// The 4-state nucleotide model.
    pub fn new() -> Self {
        Self::build(4)
    }

    /// Jukes-Cantor on an alphabet of `n` states, `2 <= n <= MAX_STATES`.
    pub fn with_states(n: usize) -> Result<Self> {
        if !(2..=MAX_STATES).contains(&n) {
            return Err(SylvaError::InvalidInput(format!(
                "Jukes-Cantor needs 2 to {} states, got {}",
                MAX_STATES, n
            )));
        }
        Ok(Self::build(n))
    }

    fn build(n: usize) -> Self {
        let off = 1.0 / (n as f64 - 1.0);
        let mut q = vec![off; n * n];
        for i in 0..n {
            q[i * n + i] = -1.0;
        }
        Self {
            n,
            freqs: vec![1.0 / n as f64; n],
            q,
        }
    }
}

impl Default for Jc69Model {
    fn default() -> Self {
        Self::new()
    }
}

impl SubstitutionModel for Jc69Model {
    fn name(&self) -> &str {
        "JC69"
    }

    fn state_count(&self) -> usize {
        self.n
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn rate_matrix(&self) -> &[f64] {
        &self.q
    }

    fn transition_probabilities(&self, distance: f64, out: &mut [f64]) -> Result<()> {
        let n = self.n;
        check_distance(distance, out, n)?;
        let nf = n as f64;
        // P(same) = 1/n + (n-1)/n e^{-nd/(n-1)}, P(diff) = 1/n - 1/n e^{-nd/(n-1)}
        let e = (-nf * distance / (nf - 1.0)).exp();
        let p_same = 1.0 / nf + (nf - 1.0) / nf * e;
        let p_diff = (1.0 - e) / nf;
        for i in 0..n {
            for j in 0..n {
                out[i * n + j] = if i == j { p_same } else { p_diff };
            }
        }
        check_transition_matrix(out, n)
    }

    fn free_parameter_count(&self) -> usize {
        0
    }
}

/// Eigendecomposition of the symmetrized rate matrix
/// B = diag(sqrt(pi)) Q diag(1/sqrt(pi)).
#[derive(Debug, Clone)]
struct EigenSystem {
    values: Vec<f64>,
    /// Orthonormal eigenvectors of B, column `k` for `values[k]`.
    vectors: Vec<f64>,
    sqrt_pi: Vec<f64>,
    inv_sqrt_pi: Vec<f64>,
}

impl EigenSystem {
    fn new(q: &[f64], freqs: &[f64]) -> Result<Self> {
        let n = freqs.len();
        let sqrt_pi: Vec<f64> = freqs.iter().map(|f| f.sqrt()).collect();
        let inv_sqrt_pi: Vec<f64> = sqrt_pi.iter().map(|s| 1.0 / s).collect();
        let mut b = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                b[i * n + j] = sqrt_pi[i] * q[i * n + j] * inv_sqrt_pi[j];
            }
        }
        // Remove the asymmetry left by rounding.
        for i in 0..n {
            for j in (i + 1)..n {
                let avg = 0.5 * (b[i * n + j] + b[j * n + i]);
                b[i * n + j] = avg;
                b[j * n + i] = avg;
            }
        }
        let (values, vectors) = jacobi_eigen(b, n)?;
        Ok(Self {
            values,
            vectors,
            sqrt_pi,
            inv_sqrt_pi,
        })
    }

    /// P(d)[i][j] = pi_i^{-1/2} sum_k U_ik e^{lambda_k d} U_jk pi_j^{1/2}
    fn exponentiate(&self, distance: f64, out: &mut [f64]) {
        let n = self.values.len();
        let decay: Vec<f64> = self.values.iter().map(|l| (l * distance).exp()).collect();
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for (k, d) in decay.iter().enumerate() {
                    sum += self.vectors[i * n + k] * d * self.vectors[j * n + k];
                }
                out[i * n + j] = self.inv_sqrt_pi[i] * sum * self.sqrt_pi[j];
            }
        }
    }
}

/// Cyclic Jacobi eigenvalue iteration for a real symmetric `n x n` matrix.
///
/// Returns eigenvalues and the row-major matrix whose columns are the
/// corresponding orthonormal eigenvectors.
fn jacobi_eigen(mut a: Vec<f64>, n: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    const MAX_SWEEPS: usize = 100;

    let mut v = vec![0.0; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }
    let scale: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt().max(f64::MIN_POSITIVE);

    for _ in 0..MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
            .map(|(p, q)| a[p * n + q] * a[p * n + q])
            .sum::<f64>()
            .sqrt();
        if off <= 1e-15 * scale {
            let values = (0..n).map(|i| a[i * n + i]).collect();
            return Ok((values, v));
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p * n + q];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[q * n + q] - a[p * n + p]) / (2.0 * apq);
                let sign = if theta >= 0.0 { 1.0 } else { -1.0 };
                let t = sign / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                a[p * n + p] -= t * apq;
                a[q * n + q] += t * apq;
                a[p * n + q] = 0.0;
                a[q * n + p] = 0.0;
                for r in 0..n {
                    if r != p && r != q {
                        let arp = a[r * n + p];
                        let arq = a[r * n + q];
                        a[r * n + p] = c * arp - s * arq;
                        a[p * n + r] = a[r * n + p];
                        a[r * n + q] = s * arp + c * arq;
                        a[q * n + r] = a[r * n + q];
                    }
                }
                for r in 0..n {
                    let vrp = v[r * n + p];
                    let vrq = v[r * n + q];
                    v[r * n + p] = c * vrp - s * vrq;
                    v[r * n + q] = s * vrp + c * vrq;
                }
            }
        }
    }
    Err(SylvaError::numerical(
        None,
        format!("Jacobi eigendecomposition did not converge in {} sweeps", MAX_SWEEPS),
    ))
}

/// Build Q from symmetric exchangeabilities (upper triangle, row by row)
/// and frequencies, normalized to mean rate 1.
fn build_rate_matrix(exchangeabilities: &[f64], freqs: &[f64]) -> Vec<f64> {
    let n = freqs.len();
    let mut q = vec![0.0; n * n];
    let mut k = 0;
    for i in 0..n {
        for j in (i + 1)..n {
            q[i * n + j] = exchangeabilities[k] * freqs[j];
            q[j * n + i] = exchangeabilities[k] * freqs[i];
            k += 1;
        }
    }
    for i in 0..n {
        let off: f64 = (0..n).filter(|&j| j != i).map(|j| q[i * n + j]).sum();
        q[i * n + i] = -off;
    }
    let mu: f64 = (0..n).map(|i| -freqs[i] * q[i * n + i]).sum();
    q.iter_mut().for_each(|x| *x /= mu);
    q
}

fn normalized_frequencies(freqs: &[f64]) -> Result<Vec<f64>> {
    if let Some(f) = freqs.iter().find(|f| !f.is_finite() || **f <= 0.0) {
        return Err(SylvaError::InvalidInput(format!(
            "state frequencies must be positive, got {}",
            f
        )));
    }
    let sum: f64 = freqs.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        return Err(SylvaError::InvalidInput(format!(
            "state frequencies sum to {}, expected 1",
            sum
        )));
    }
    Ok(freqs.iter().map(|f| f / sum).collect())
}

/// A time-reversible model defined by exchangeabilities and frequencies.
#[derive(Clone)]
pub struct ReversibleModel {
    name: String,
    freqs: Vec<f64>,
    q: Vec<f64>,
    free_params: usize,
    eigen: EigenSystem,
}

impl fmt::Debug for ReversibleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReversibleModel")
            .field("name", &self.name)
            .field("freqs", &self.freqs)
            .finish_non_exhaustive()
    }
}

impl ReversibleModel {
    /// General reversible model on `freqs.len()` states.
    ///
    /// `exchangeabilities` lists the upper triangle of the symmetric rate
    /// matrix row by row: (0,1), (0,2), ..., (1,2), ...
    pub fn from_exchangeabilities(
        name: impl Into<String>,
        exchangeabilities: &[f64],
        freqs: &[f64],
    ) -> Result<Self> {
        let n = freqs.len();
        if n < 2 {
            return Err(SylvaError::InvalidInput(format!(
                "a substitution model needs at least 2 states, got {}",
                n
            )));
        }
        let expected = n * (n - 1) / 2;
        if exchangeabilities.len() != expected {
            return Err(SylvaError::InvalidInput(format!(
                "expected {} exchangeabilities for {} states, got {}",
                expected,
                n,
                exchangeabilities.len()
            )));
        }
        if let Some(r) = exchangeabilities.iter().find(|r| !r.is_finite() || **r < 0.0) {
            return Err(SylvaError::InvalidInput(format!(
                "exchangeabilities must be finite and non-negative, got {}",
                r
            )));
        }
        if exchangeabilities.iter().all(|&r| r == 0.0) {
            return Err(SylvaError::InvalidInput(
                "at least one exchangeability must be positive".into(),
            ));
        }
        let freqs = normalized_frequencies(freqs)?;
        let q = build_rate_matrix(exchangeabilities, &freqs);
        let eigen = EigenSystem::new(&q, &freqs)?;
        Ok(Self {
            name: name.into(),
            free_params: expected - 1 + n - 1,
            freqs,
            q,
            eigen,
        })
    }

    /// HKY85: transition/transversion ratio `kappa` with unequal frequencies.
    pub fn hky85(kappa: f64, freqs: [f64; 4]) -> Result<Self> {
        if !kappa.is_finite() || kappa <= 0.0 {
            return Err(SylvaError::InvalidInput(format!(
                "kappa must be positive, got {}",
                kappa
            )));
        }
        // A-G and C-T are transitions.
        let mut model =
            Self::from_exchangeabilities("HKY85", &[1.0, kappa, 1.0, 1.0, kappa, 1.0], &freqs)?;
        model.free_params = 4;
        Ok(model)
    }

    /// GTR with rates in AC, AG, AT, CG, CT, GT order.
    pub fn gtr(rates: [f64; 6], freqs: [f64; 4]) -> Result<Self> {
        Self::from_exchangeabilities("GTR", &rates, &freqs)
    }
}

impl SubstitutionModel for ReversibleModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_count(&self) -> usize {
        self.freqs.len()
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn rate_matrix(&self) -> &[f64] {
        &self.q
    }

    fn transition_probabilities(&self, distance: f64, out: &mut [f64]) -> Result<()> {
        let n = self.freqs.len();
        check_distance(distance, out, n)?;
        self.eigen.exponentiate(distance, out);
        check_transition_matrix(out, n)
    }

    fn free_parameter_count(&self) -> usize {
        self.free_params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQS: [f64; 4] = [0.3, 0.2, 0.2, 0.3];

    fn probs(model: &dyn SubstitutionModel, d: f64) -> Vec<f64> {
        let n = model.state_count();
        let mut p = vec![0.0; n * n];
        model.transition_probabilities(d, &mut p).unwrap();
        p
    }

    fn assert_stochastic(p: &[f64], n: usize, label: &str) {
        for (i, row) in p.chunks(n).enumerate() {
            let sum: f64 = row.iter().sum();
            assert!(
                (sum - 1.0).abs() < 1e-9,
                "{}: row {} sums to {}",
                label, i, sum
            );
            for &x in row {
                assert!((0.0..=1.0).contains(&x), "{}: entry {} out of range", label, x);
            }
        }
    }

    #[test]
    fn jc69_closed_form() {
        let m = Jc69Model::new();
        let p = probs(&m, 0.3);
        let e = (-4.0 * 0.3 / 3.0f64).exp();
        assert!((p[0] - (0.25 + 0.75 * e)).abs() < 1e-15);
        assert!((p[1] - (0.25 - 0.25 * e)).abs() < 1e-15);
        assert_stochastic(&p, 4, "JC69");
    }

    #[test]
    fn jc69_matches_equal_rate_reversible_model() {
        let jc = Jc69Model::new();
        let eq = ReversibleModel::gtr([1.0; 6], [0.25; 4]).unwrap();
        for &d in &[0.0, 0.05, 0.5, 2.0] {
            let a = probs(&jc, d);
            let b = probs(&eq, d);
            for (x, y) in a.iter().zip(&b) {
                assert!((x - y).abs() < 1e-10, "d={}: {} vs {}", d, x, y);
            }
        }
    }

    #[test]
    fn hky_equals_gtr_with_kappa_rates() {
        let hky = ReversibleModel::hky85(4.0, FREQS).unwrap();
        let gtr = ReversibleModel::gtr([1.0, 4.0, 1.0, 1.0, 4.0, 1.0], FREQS).unwrap();
        let a = probs(&hky, 0.7);
        let b = probs(&gtr, 0.7);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-12);
        }
        assert_eq!(hky.free_parameter_count(), 4);
        assert_eq!(gtr.free_parameter_count(), 8);
    }

    #[test]
    fn p_zero_is_identity() {
        let models: Vec<Box<dyn SubstitutionModel>> = vec![
            Box::new(Jc69Model::new()),
            Box::new(ReversibleModel::hky85(2.0, FREQS).unwrap()),
        ];
        for m in &models {
            let p = probs(m.as_ref(), 0.0);
            for i in 0..4 {
                for j in 0..4 {
                    let expected = if i == j { 1.0 } else { 0.0 };
                    assert!(
                        (p[i * 4 + j] - expected).abs() < 1e-8,
                        "{} P(0)[{}][{}] = {}",
                        m.name(), i, j, p[i * 4 + j]
                    );
                }
            }
        }
    }

    #[test]
    fn long_branch_reaches_equilibrium() {
        let m = ReversibleModel::hky85(3.0, FREQS).unwrap();
        let p = probs(&m, 100.0);
        for i in 0..4 {
            for j in 0..4 {
                assert!((p[i * 4 + j] - FREQS[j]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn rate_matrix_is_normalized() {
        let m = ReversibleModel::hky85(2.5, FREQS).unwrap();
        let q = m.rate_matrix();
        let mean: f64 = (0..4).map(|i| -FREQS[i] * q[i * 4 + i]).sum();
        assert!((mean - 1.0).abs() < 1e-12);
        for row in q.chunks(4) {
            assert!(row.iter().sum::<f64>().abs() < 1e-12);
        }
    }

    #[test]
    fn detailed_balance_holds() {
        let m = ReversibleModel::gtr([1.0, 2.0, 0.5, 0.8, 3.0, 1.0], FREQS).unwrap();
        let p = probs(&m, 0.4);
        for i in 0..4 {
            for j in 0..4 {
                let lhs = FREQS[i] * p[i * 4 + j];
                let rhs = FREQS[j] * p[j * 4 + i];
                assert!((lhs - rhs).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn general_model_on_binary_states() {
        let m = ReversibleModel::from_exchangeabilities("binary", &[1.0], &[0.4, 0.6]).unwrap();
        let p = probs(&m, 0.5);
        assert_stochastic(&p, 2, "binary");
        let jc2 = Jc69Model::with_states(2).unwrap();
        assert_stochastic(&probs(&jc2, 0.5), 2, "JC2");
    }

    #[test]
    fn jc_state_count_bounds() {
        assert!(matches!(Jc69Model::with_states(0), Err(SylvaError::InvalidInput(_))));
        assert!(Jc69Model::with_states(1).is_err());
        assert!(Jc69Model::with_states(MAX_STATES + 1).is_err());
        let wide = Jc69Model::with_states(MAX_STATES).unwrap();
        assert_eq!(wide.state_count(), MAX_STATES);
    }

    #[test]
    fn jc_rows_stay_stochastic() {
        for &n in &[2, 4, 20, MAX_STATES] {
            let m = Jc69Model::with_states(n).unwrap();
            for &d in &[0.0, 1e-9, 0.3, 50.0, 1e6] {
                let p = probs(&m, d);
                assert_stochastic(&p, n, "JC");
                let sum: f64 = p[..n].iter().sum();
                assert!((sum - 1.0).abs() < 1e-12, "n={} d={} sum={}", n, d, sum);
            }
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(ReversibleModel::hky85(0.0, FREQS).is_err());
        assert!(ReversibleModel::gtr([1.0; 6], [0.5, 0.5, 0.5, 0.5]).is_err());
        assert!(ReversibleModel::gtr([1.0; 6], [1.0, 0.0, 0.0, 0.0]).is_err());
        assert!(ReversibleModel::gtr([0.0; 6], [0.25; 4]).is_err());
        assert!(ReversibleModel::from_exchangeabilities("x", &[1.0, 1.0], &[0.5, 0.5]).is_err());
    }

    #[test]
    fn rejects_negative_distance_and_bad_buffer() {
        let m = Jc69Model::new();
        let mut p = vec![0.0; 16];
        assert!(m.transition_probabilities(-0.1, &mut p).is_err());
        assert!(m.transition_probabilities(f64::NAN, &mut p).is_err());
        let mut short = vec![0.0; 4];
        assert!(m.transition_probabilities(0.1, &mut short).is_err());
    }

    #[test]
    fn check_transition_matrix_flags_defects() {
        let mut ok = vec![1.0 + 1e-12, -1e-12, 0.5, 0.5];
        check_transition_matrix(&mut ok, 2).unwrap();
        assert!(ok.iter().all(|x| (0.0..=1.0).contains(x)));

        let mut bad_sum = vec![0.9, 0.0, 0.5, 0.5];
        assert!(matches!(
            check_transition_matrix(&mut bad_sum, 2),
            Err(SylvaError::Numerical { .. })
        ));
        let mut nan = vec![f64::NAN, 1.0, 0.5, 0.5];
        assert!(check_transition_matrix(&mut nan, 2).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn gtr_rows_are_stochastic(
            rates in prop::array::uniform6(0.05f64..10.0),
            raw in prop::array::uniform4(0.05f64..1.0),
            d in 0.0f64..20.0,
        ) {
            let total: f64 = raw.iter().sum();
            let freqs = raw.map(|f| f / total);
            let m = ReversibleModel::gtr(rates, freqs).unwrap();
            let mut p = vec![0.0; 16];
            m.transition_probabilities(d, &mut p).unwrap();
            for row in p.chunks(4) {
                let sum: f64 = row.iter().sum();
                prop_assert!((sum - 1.0).abs() < 1e-9);
                prop_assert!(row.iter().all(|x| (0.0..=1.0).contains(x)));
            }
        }
    }
}
