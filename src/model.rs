/// A time-reversible substitution model over a fixed number of states.
///
/// The likelihood engine only consumes finite-time transition probability
/// matrices and the diagonal of the instantaneous rate matrix (used for the
/// aggregate no-change probability of duplicate lineages), so the trait stays
/// deliberately narrow.
pub trait SubstitutionModel {
    fn state_count(&self) -> usize;

    /// Stationary state frequencies.
    fn frequencies(&self) -> &[f64];

    /// Fill `out` (row-major, `state_count²` entries) with the transition
    /// probability matrix for evolving from height `start` down to height
    /// `end` under the given rate multiplier.
    fn transition_probabilities(&self, start: f64, end: f64, rate: f64, out: &mut [f64]);

    /// Fill `out` with the diagonal entries of the rate matrix (negative
    /// values: the total rate of leaving each state, negated).
    fn no_change_rates(&self, out: &mut [f64]);
}

/// The Jukes-Cantor model: equal frequencies and equal exchange rates,
/// normalized to one expected substitution per unit time.
#[derive(Clone, Debug)]
pub struct JukesCantor {
    states: usize,
    frequencies: Vec<f64>,
}

impl JukesCantor {
    pub fn new(states: usize) -> Self {
        assert!(states > 1);
        Self {
            states,
            frequencies: vec![1.0 / states as f64; states],
        }
    }
}

impl SubstitutionModel for JukesCantor {
    fn state_count(&self) -> usize {
        self.states
    }

    fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn transition_probabilities(&self, start: f64, end: f64, rate: f64, out: &mut [f64]) {
        let s = self.states as f64;
        let time = (start - end) * rate;
        let decay = (-time * s / (s - 1.0)).exp();
        let p_same = 1.0 / s + (1.0 - 1.0 / s) * decay;
        let p_diff = 1.0 / s - decay / s;
        for i in 0..self.states {
            for j in 0..self.states {
                out[i * self.states + j] = if i == j { p_same } else { p_diff };
            }
        }
    }

    fn no_change_rates(&self, out: &mut [f64]) {
        // normalized so the expected substitution rate is one
        out[..self.states].fill(-1.0);
    }
}

/// Rate heterogeneity across sites: a discrete set of rate categories with
/// proportions, plus an optional invariant-site category encoded as a zero
/// rate entry.
#[derive(Clone, Debug)]
pub struct SiteModel {
    category_rates: Vec<f64>,
    category_proportions: Vec<f64>,
    proportion_invariant: f64,
}

impl SiteModel {
    /// Single category, rate one.
    pub fn uniform() -> Self {
        Self {
            category_rates: vec![1.0],
            category_proportions: vec![1.0],
            proportion_invariant: 0.0,
        }
    }

    /// Explicit rate categories.
    ///
    /// # Panics
    /// Panics if the rates and proportions differ in length or the
    /// proportions do not sum to one (within 1e-9).
    pub fn new(category_rates: Vec<f64>, category_proportions: Vec<f64>) -> Self {
        assert_eq!(category_rates.len(), category_proportions.len());
        let total: f64 = category_proportions.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "category proportions must sum to 1");
        Self {
            category_rates,
            category_proportions,
            proportion_invariant: 0.0,
        }
    }

    /// Add an invariant-site category carrying the given proportion of
    /// sites. The category is encoded with rate zero; the remaining
    /// proportions are rescaled accordingly.
    pub fn with_invariant_sites(mut self, proportion: f64) -> Self {
        assert!((0.0..1.0).contains(&proportion));
        for p in &mut self.category_proportions {
            *p *= 1.0 - proportion;
        }
        self.category_rates.push(0.0);
        self.category_proportions.push(proportion);
        self.proportion_invariant = proportion;
        self
    }

    pub fn category_count(&self) -> usize {
        self.category_rates.len()
    }

    pub fn category_rates(&self) -> &[f64] {
        &self.category_rates
    }

    pub fn category_proportions(&self) -> &[f64] {
        &self.category_proportions
    }

    pub fn proportion_invariant(&self) -> f64 {
        self.proportion_invariant
    }

    /// Index of the zero-rate category, if the model carries one.
    pub fn invariant_category(&self) -> Option<usize> {
        self.category_rates.iter().position(|&r| r == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jukes_cantor_rows_are_stochastic() {
        let jc = JukesCantor::new(4);
        let mut p = vec![0.0; 16];
        jc.transition_probabilities(1.5, 0.3, 0.8, &mut p);
        for row in p.chunks(4) {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
        // zero elapsed time is the identity
        jc.transition_probabilities(0.7, 0.7, 1.0, &mut p);
        assert!((p[0] - 1.0).abs() < 1e-12);
        assert!(p[1].abs() < 1e-12);
    }

    #[test]
    fn invariant_category_is_detected() {
        let model = SiteModel::new(vec![0.5, 1.5], vec![0.5, 0.5]).with_invariant_sites(0.2);
        assert_eq!(model.category_count(), 3);
        assert_eq!(model.invariant_category(), Some(2));
        let total: f64 = model.category_proportions().iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }
}
