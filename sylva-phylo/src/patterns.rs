//! Character alphabets and compressed site patterns.
//!
//! A site pattern is one alignment column: the observed state set of every
//! taxon. Identical columns are merged and carry a weight (their
//! multiplicity), so the likelihood engine evaluates each distinct column
//! once.

use std::collections::HashMap;

use sylva_core::{Result, SylvaError};

/// Largest alphabet a [`StateSet`] can represent.
pub const MAX_STATES: usize = 64;

/// A set of character states compatible with an observation.
///
/// Unambiguous observations hold one state; ambiguity codes and gaps hold
/// several. An empty set is an impossible observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StateSet(u64);

impl StateSet {
    /// The set containing only `state`, or `None` past the last bit.
    pub fn single(state: usize) -> Option<Self> {
        (state < MAX_STATES).then(|| Self(1u64 << state))
    }

    /// Every state of an alphabet of size `n` (missing data).
    pub fn all(n: usize) -> Self {
        if n >= MAX_STATES {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from the raw bitmask.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The raw bitmask.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// True if `state` is in the set.
    #[inline]
    pub fn contains(self, state: usize) -> bool {
        state < MAX_STATES && self.0 & (1u64 << state) != 0
    }

    /// Number of states in the set.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// True for an impossible observation.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Highest state index in the set plus one.
    fn span(self) -> usize {
        (u64::BITS - self.0.leading_zeros()) as usize
    }
}

/// Character alphabet used to decode sequence bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Alphabet {
    /// A, C, G, T/U with IUPAC ambiguity codes; `-`, `?`, `N` are missing.
    Nucleotide,
    /// `0`/`1`, with `-` and `?` missing.
    Binary,
}

impl Alphabet {
    /// Number of states.
    pub fn state_count(self) -> usize {
        match self {
            Alphabet::Nucleotide => 4,
            Alphabet::Binary => 2,
        }
    }

    /// Decode one sequence byte into its compatible states.
    pub fn decode(self, byte: u8) -> Result<StateSet> {
        let bits = match self {
            Alphabet::Nucleotide => match byte.to_ascii_uppercase() {
                b'A' => 0b0001,
                b'C' => 0b0010,
                b'G' => 0b0100,
                b'T' | b'U' => 0b1000,
                b'R' => 0b0101,
                b'Y' => 0b1010,
                b'S' => 0b0110,
                b'W' => 0b1001,
                b'K' => 0b1100,
                b'M' => 0b0011,
                b'B' => 0b1110,
                b'D' => 0b1101,
                b'H' => 0b1011,
                b'V' => 0b0111,
                b'N' | b'X' | b'-' | b'?' | b'.' => 0b1111,
                _ => return Err(invalid_symbol(self, byte)),
            },
            Alphabet::Binary => match byte {
                b'0' => 0b01,
                b'1' => 0b10,
                b'-' | b'?' => 0b11,
                _ => return Err(invalid_symbol(self, byte)),
            },
        };
        Ok(StateSet(bits))
    }
}

fn invalid_symbol(alphabet: Alphabet, byte: u8) -> SylvaError {
    SylvaError::InvalidInput(format!(
        "symbol '{}' is not valid for {:?} data",
        byte.escape_ascii(),
        alphabet
    ))
}

/// Weighted, de-duplicated alignment columns.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SitePatterns {
    taxa: Vec<String>,
    state_count: usize,
    /// `patterns[k][t]` is the state set of taxon `t` in pattern `k`.
    patterns: Vec<Vec<StateSet>>,
    weights: Vec<f64>,
}

impl SitePatterns {
    /// Build from explicit patterns and weights.
    pub fn new(
        taxa: Vec<String>,
        state_count: usize,
        patterns: Vec<Vec<StateSet>>,
        weights: Vec<f64>,
    ) -> Result<Self> {
        if taxa.is_empty() {
            return Err(SylvaError::InvalidInput("no taxa provided".into()));
        }
        if state_count < 2 || state_count > MAX_STATES {
            return Err(SylvaError::InvalidInput(format!(
                "state count {} outside 2..={}",
                state_count, MAX_STATES
            )));
        }
        if patterns.len() != weights.len() {
            return Err(SylvaError::InvalidInput(format!(
                "{} patterns but {} weights",
                patterns.len(),
                weights.len()
            )));
        }
        if patterns.is_empty() {
            return Err(SylvaError::InvalidInput("no site patterns provided".into()));
        }
        for (k, pattern) in patterns.iter().enumerate() {
            if pattern.len() != taxa.len() {
                return Err(SylvaError::InvalidInput(format!(
                    "pattern {} has {} states, expected {}",
                    k,
                    pattern.len(),
                    taxa.len()
                )));
            }
            if let Some(bad) = pattern.iter().find(|s| s.span() > state_count) {
                return Err(SylvaError::InvalidInput(format!(
                    "pattern {} uses state {} beyond alphabet size {}",
                    k,
                    bad.span() - 1,
                    state_count
                )));
            }
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(SylvaError::InvalidInput(format!(
                "pattern weight {} must be finite and non-negative",
                w
            )));
        }
        Ok(Self {
            taxa,
            state_count,
            patterns,
            weights,
        })
    }

    /// Compress aligned sequences into unique patterns.
    ///
    /// Patterns keep the order of their first occurrence; weights count how
    /// many columns each pattern stands for.
    pub fn from_alignment(alphabet: Alphabet, sequences: &[(&str, &[u8])]) -> Result<Self> {
        let Some((_, first)) = sequences.first() else {
            return Err(SylvaError::InvalidInput("no sequences provided".into()));
        };
        let n_sites = first.len();
        if n_sites == 0 {
            return Err(SylvaError::InvalidInput("empty sequences".into()));
        }
        for (name, seq) in sequences {
            if seq.len() != n_sites {
                return Err(SylvaError::InvalidInput(format!(
                    "sequence '{}' has length {}, expected {}",
                    name,
                    seq.len(),
                    n_sites
                )));
            }
        }

        let mut index: HashMap<Vec<StateSet>, usize> = HashMap::new();
        let mut patterns: Vec<Vec<StateSet>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for site in 0..n_sites {
            let column = sequences
                .iter()
                .map(|(_, seq)| alphabet.decode(seq[site]))
                .collect::<Result<Vec<_>>>()?;
            match index.get(&column) {
                Some(&k) => weights[k] += 1.0,
                None => {
                    index.insert(column.clone(), patterns.len());
                    patterns.push(column);
                    weights.push(1.0);
                }
            }
        }

        let taxa = sequences.iter().map(|(name, _)| name.to_string()).collect();
        Self::new(taxa, alphabet.state_count(), patterns, weights)
    }

    /// Taxon names in column order.
    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    /// Column index of `name`.
    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        self.taxa.iter().position(|t| t == name)
    }

    /// Number of taxa.
    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    /// Number of distinct patterns.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Alphabet size.
    pub fn state_count(&self) -> usize {
        self.state_count
    }

    /// Pattern weights.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Sum of weights (number of alignment columns).
    pub fn site_count(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Observed states of `taxon` in pattern `pattern`.
    pub fn state(&self, pattern: usize, taxon: usize) -> StateSet {
        self.patterns[pattern][taxon]
    }
}
