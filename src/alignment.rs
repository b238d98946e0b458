use crate::error::{Error, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use twox_hash::XxHash64;

/// Number of nucleotide states supported by the pattern alignment.
pub const NUCLEOTIDE_STATES: usize = 4;

/// An in-memory site-pattern alignment over nucleotide sequences.
///
/// Columns of the input sequences are compressed into unique patterns with
/// integer weights. Each character is stored as a 4-bit state-set mask
/// (bit 0 = A, bit 1 = C, bit 2 = G, bit 3 = T), so IUPAC ambiguity codes
/// and gaps keep their full meaning until the likelihood engine decides how
/// to feed them to the backend.
#[derive(Clone, Debug)]
pub struct Alignment {
    taxa: Vec<String>,
    /// One mask per taxon, per unique site pattern.
    patterns: Vec<Vec<u8>>,
    weights: Vec<f64>,
    /// Pattern indices excluded by an ascertainment scheme, if any.
    excluded_patterns: Vec<usize>,
}

/// State-set mask for a nucleotide character. Unknown characters are treated
/// as fully ambiguous.
fn encode(c: char) -> u8 {
    match c.to_ascii_uppercase() {
        'A' => 0b0001,
        'C' => 0b0010,
        'G' => 0b0100,
        'T' | 'U' => 0b1000,
        'R' => 0b0101,
        'Y' => 0b1010,
        'S' => 0b0110,
        'W' => 0b1001,
        'K' => 0b1100,
        'M' => 0b0011,
        'B' => 0b1110,
        'D' => 0b1101,
        'H' => 0b1011,
        'V' => 0b0111,
        _ => 0b1111,
    }
}

impl Alignment {
    /// Compress the given sequences into site patterns. All sequences must
    /// have equal length; taxon names must be unique.
    ///
    /// # Panics
    /// Panics if the sequences differ in length (programming defect in the
    /// caller, not a data error).
    pub fn from_sequences<S: AsRef<str>>(entries: Vec<(String, S)>) -> Self {
        let taxa: Vec<String> = entries.iter().map(|(name, _)| name.clone()).collect();
        let sequences: Vec<Vec<u8>> = entries
            .iter()
            .map(|(_, seq)| seq.as_ref().chars().map(encode).collect())
            .collect();
        let len = sequences.first().map(|s| s.len()).unwrap_or(0);
        assert!(
            sequences.iter().all(|s| s.len() == len),
            "sequences must have equal length"
        );

        let mut patterns: Vec<Vec<u8>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut seen: HashMap<Vec<u8>, usize, BuildHasherDefault<XxHash64>> = Default::default();
        for site in 0..len {
            let column: Vec<u8> = sequences.iter().map(|s| s[site]).collect();
            if let Some(&idx) = seen.get(&column) {
                weights[idx] += 1.0;
            } else {
                seen.insert(column.clone(), patterns.len());
                patterns.push(column);
                weights.push(1.0);
            }
        }

        Self {
            taxa,
            patterns,
            weights,
            excluded_patterns: Vec::new(),
        }
    }

    /// Mark the alignment as ascertained, excluding the given pattern
    /// indices from the observable data.
    pub fn set_ascertained(&mut self, excluded_patterns: Vec<usize>) {
        self.excluded_patterns = excluded_patterns;
    }

    pub fn is_ascertained(&self) -> bool {
        !self.excluded_patterns.is_empty()
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn state_count(&self) -> usize {
        NUCLEOTIDE_STATES
    }

    pub fn pattern_weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    /// Look up the row index of a taxon by name.
    pub fn taxon_index(&self, name: &str) -> Result<usize> {
        self.taxa
            .iter()
            .position(|t| t == name)
            .ok_or_else(|| Error::MissingAlignment(name.to_string()))
    }

    /// The state-set mask of `taxon` at pattern `pattern`.
    pub fn mask(&self, taxon: usize, pattern: usize) -> u8 {
        self.patterns[pattern][taxon]
    }

    /// The single state encoded by a mask, or `None` for ambiguity codes.
    pub fn single_state(mask: u8) -> Option<usize> {
        match mask {
            0b0001 => Some(0),
            0b0010 => Some(1),
            0b0100 => Some(2),
            0b1000 => Some(3),
            _ => None,
        }
    }

    /// Expand a mask into per-state membership flags.
    pub fn state_set(mask: u8) -> [bool; NUCLEOTIDE_STATES] {
        [
            mask & 0b0001 != 0,
            mask & 0b0010 != 0,
            mask & 0b0100 != 0,
            mask & 0b1000 != 0,
        ]
    }

    /// Weighted count of sites at which the two sequences carry different
    /// characters. Ambiguity codes compare by mask, so two sequences are at
    /// distance zero exactly when they are character-identical.
    pub fn pairwise_distance(&self, a: usize, b: usize) -> f64 {
        self.patterns
            .iter()
            .zip(self.weights.iter())
            .filter(|(column, _)| column[a] != column[b])
            .map(|(_, w)| w)
            .sum()
    }

    /// Full symmetric distance matrix over all taxa.
    pub fn distance_matrix(&self) -> Vec<Vec<f64>> {
        let n = self.taxon_count();
        (0..n)
            .into_par_iter()
            .map(|i| (0..n).map(|j| self.pairwise_distance(i, j)).collect())
            .collect()
    }

    /// All (pattern, state) pairs for which the pattern is compatible with
    /// being constant at that state, i.e. every taxon's state set contains
    /// the state. A fully ambiguous pattern contributes one pair per state.
    pub fn constant_patterns(&self) -> Vec<(usize, usize)> {
        let mut result = Vec::new();
        for (p, column) in self.patterns.iter().enumerate() {
            let common = column.iter().fold(0b1111u8, |acc, &mask| acc & mask);
            for state in 0..NUCLEOTIDE_STATES {
                if common & (1 << state) != 0 {
                    result.push((p, state));
                }
            }
        }
        result
    }

    /// Correction term subtracted from every pattern log-likelihood when the
    /// alignment is ascertained: the log-probability of observing any
    /// non-excluded pattern, `ln(1 - Σ exp(pll))` over the excluded set.
    pub fn ascertainment_correction(&self, pattern_log_likelihoods: &[f64]) -> f64 {
        let excluded: f64 = self
            .excluded_patterns
            .iter()
            .map(|&p| pattern_log_likelihoods[p].exp())
            .sum();
        (1.0 - excluded).ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_compression() {
        let alignment = Alignment::from_sequences(vec![
            ("a".to_string(), "ACCA"),
            ("b".to_string(), "ACCT"),
        ]);
        // columns 2 and 3 repeat column 1 resp. are unique
        assert_eq!(alignment.pattern_count(), 3);
        assert_eq!(alignment.pattern_weights(), &[1.0, 2.0, 1.0]);
    }

    #[test]
    fn distances_count_differing_sites() {
        let alignment = Alignment::from_sequences(vec![
            ("a".to_string(), "ACGT"),
            ("b".to_string(), "ACGA"),
            ("c".to_string(), "ACGT"),
        ]);
        assert_eq!(alignment.pairwise_distance(0, 1), 1.0);
        assert_eq!(alignment.pairwise_distance(0, 2), 0.0);
        let matrix = alignment.distance_matrix();
        assert_eq!(matrix[1][0], 1.0);
        assert_eq!(matrix[2][0], 0.0);
    }

    #[test]
    fn constant_pattern_detection() {
        let alignment = Alignment::from_sequences(vec![
            ("a".to_string(), "AANC"),
            ("b".to_string(), "ATNC"),
        ]);
        let constant = alignment.constant_patterns();
        // pattern 0 (A/A) constant at A, pattern 1 (A/T) never constant,
        // pattern 2 (N/N) compatible with all four states, pattern 3 (C/C)
        // constant at C
        assert!(constant.contains(&(0, 0)));
        assert!(!constant.iter().any(|&(p, _)| p == 1));
        assert_eq!(constant.iter().filter(|&&(p, _)| p == 2).count(), 4);
        assert!(constant.contains(&(3, 1)));
    }
}
