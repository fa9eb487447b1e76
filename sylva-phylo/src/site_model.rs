//! Among-site rate heterogeneity.
//!
//! A [`SiteModel`] is a finite mixture of rate categories. Each category
//! multiplies branch lengths by its rate and contributes to a pattern's
//! likelihood in proportion to its mixing weight. The weighted mean rate is
//! always 1, so branch lengths stay in expected substitutions per site
//! (times the overall mutation rate).

use std::f64::consts::PI;

use sylva_core::{Result, SylvaError};

/// Rate categories and their mixing proportions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SiteModel {
    rates: Vec<f64>,
    proportions: Vec<f64>,
    mutation_rate: f64,
    gamma_shape: Option<f64>,
    invariant: f64,
}

impl SiteModel {
    /// One category with rate 1.
    pub fn homogeneous() -> Self {
        Self {
            rates: vec![1.0],
            proportions: vec![1.0],
            mutation_rate: 1.0,
            gamma_shape: None,
            invariant: 0.0,
        }
    }

    /// Discrete gamma with `categories` equiprobable classes.
    ///
    /// Each class rate is the median of its quantile slice of a
    /// Gamma(`shape`, `shape`) distribution, rescaled so the mean is 1.
    pub fn gamma(shape: f64, categories: usize) -> Result<Self> {
        if !shape.is_finite() || shape <= 0.0 {
            return Err(SylvaError::InvalidInput(format!(
                "gamma shape must be positive, got {}",
                shape
            )));
        }
        if categories == 0 {
            return Err(SylvaError::InvalidInput(
                "gamma model needs at least one category".into(),
            ));
        }
        let k = categories as f64;
        let mut rates = (0..categories)
            .map(|i| gamma_quantile(shape, (2.0 * i as f64 + 1.0) / (2.0 * k)))
            .collect::<Result<Vec<_>>>()?;
        let mean = rates.iter().sum::<f64>() / k;
        rates.iter_mut().for_each(|r| *r /= mean);
        Ok(Self {
            rates,
            proportions: vec![1.0 / k; categories],
            mutation_rate: 1.0,
            gamma_shape: Some(shape),
            invariant: 0.0,
        })
    }

    /// Add a class of invariant sites with proportion `p_inv`.
    ///
    /// The invariant class has rate 0; the variable classes are scaled up
    /// by `1 / (1 - p_inv)` to keep the mean rate at 1.
    pub fn with_invariant(mut self, p_inv: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p_inv) {
            return Err(SylvaError::InvalidInput(format!(
                "proportion of invariant sites must be in [0, 1), got {}",
                p_inv
            )));
        }
        if self.invariant > 0.0 {
            return Err(SylvaError::InvalidInput(
                "site model already has an invariant class".into(),
            ));
        }
        if p_inv == 0.0 {
            return Ok(self);
        }
        let scale = 1.0 - p_inv;
        self.rates.iter_mut().for_each(|r| *r /= scale);
        self.proportions.iter_mut().for_each(|p| *p *= scale);
        self.rates.insert(0, 0.0);
        self.proportions.insert(0, p_inv);
        self.invariant = p_inv;
        Ok(self)
    }

    /// Scale every rate by `mu`.
    pub fn with_mutation_rate(mut self, mu: f64) -> Result<Self> {
        if !mu.is_finite() || mu <= 0.0 {
            return Err(SylvaError::InvalidInput(format!(
                "mutation rate must be positive, got {}",
                mu
            )));
        }
        self.mutation_rate = mu;
        Ok(self)
    }

    /// Number of rate categories (invariant class included).
    pub fn category_count(&self) -> usize {
        self.rates.len()
    }

    /// Relative rate of each category (mean 1 under the proportions).
    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    /// Mixing proportion of each category.
    pub fn proportions(&self) -> &[f64] {
        &self.proportions
    }

    /// Overall rate multiplier.
    pub fn mutation_rate(&self) -> f64 {
        self.mutation_rate
    }

    /// Substitutions per site along a branch of `length` in `category`.
    #[inline]
    pub fn distance(&self, length: f64, category: usize) -> f64 {
        length * self.mutation_rate * self.rates[category]
    }

    /// Gamma shape, if rates are gamma distributed.
    pub fn gamma_shape(&self) -> Option<f64> {
        self.gamma_shape
    }

    /// Proportion of invariant sites.
    pub fn invariant_proportion(&self) -> f64 {
        self.invariant
    }
}

impl Default for SiteModel {
    fn default() -> Self {
        Self::homogeneous()
    }
}

/// Natural log of the gamma function (Lanczos, g = 7).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Reflection: Γ(x) = π / (sin(πx) Γ(1-x))
        (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.99999999999980993_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

/// Regularized lower incomplete gamma P(a, x).
fn gamma_p(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let ln_prefix = a * x.ln() - x - ln_gamma(a);
    if x < a + 1.0 {
        // Series
        let mut term = 1.0 / a;
        let mut sum = term;
        for n in 1..=500 {
            term *= x / (a + n as f64);
            sum += term;
            if term.abs() < sum.abs() * 1e-15 {
                break;
            }
        }
        (sum * ln_prefix.exp()).min(1.0)
    } else {
        // Continued fraction for Q(a, x), modified Lentz
        const TINY: f64 = 1e-300;
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / TINY;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..=500 {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < TINY {
                d = TINY;
            }
            c = b + an / c;
            if c.abs() < TINY {
                c = TINY;
            }
            d = 1.0 / d;
            let delta = d * c;
            h *= delta;
            if (delta - 1.0).abs() < 1e-15 {
                break;
            }
        }
        (1.0 - h * ln_prefix.exp()).max(0.0)
    }
}

/// Quantile of Gamma(shape, rate = shape) at probability `p`, by bisection.
fn gamma_quantile(shape: f64, p: f64) -> Result<f64> {
    let cdf = |x: f64| gamma_p(shape, shape * x);
    let mut lo = 0.0;
    let mut hi = 1.0;
    while cdf(hi) < p {
        lo = hi;
        hi *= 2.0;
        if hi > 1e12 {
            return Err(SylvaError::numerical(
                None,
                format!("gamma quantile for shape {} at p = {} is unbounded", shape, p),
            ));
        }
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if cdf(mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-14 * hi.max(f64::MIN_POSITIVE) {
            break;
        }
    }
    Ok(0.5 * (lo + hi))
}
