use quasitree::likelihood::{AllocationRequest, LikelihoodBackend, PartialsOperation};
use quasitree::model::{JukesCantor, SiteModel};
use quasitree::tree::collapse::Backbone;
use quasitree::{
    Alignment, EngineConfig, QuasiSpeciesLikelihood, QuasiSpeciesTree, ReferenceBackend,
};

/// Three samples of which two ("a" sampled at heights 0 and 1) carry the
/// identical sequence: collapses to a two-haplotype tree with one duplicate
/// attachment.
#[allow(dead_code)]
pub fn duplicate_backbone() -> (Backbone, Alignment) {
    let alignment = Alignment::from_sequences(vec![
        ("a".to_string(), "A"),
        ("b".to_string(), "A"),
        ("c".to_string(), "C"),
    ]);
    let mut backbone = Backbone::new();
    let a = backbone.leaf("a", 0.0);
    let b = backbone.leaf("b", 1.0);
    let ab = backbone.join(a, b, 2.0);
    let c = backbone.leaf("c", 0.0);
    backbone.join(ab, c, 3.0);
    (backbone, alignment)
}

#[allow(dead_code)]
pub fn collapsed_duplicate_tree() -> (QuasiSpeciesTree, Alignment) {
    let (backbone, alignment) = duplicate_backbone();
    let tree = QuasiSpeciesTree::collapse_backbone(&backbone, &alignment, None, 10.0).unwrap();
    (tree, alignment)
}

#[allow(dead_code)]
pub fn jukes_cantor_engine(
    tree: QuasiSpeciesTree,
    alignment: Alignment,
    config: EngineConfig,
) -> QuasiSpeciesLikelihood<ReferenceBackend, JukesCantor> {
    QuasiSpeciesLikelihood::new(
        tree,
        alignment,
        JukesCantor::new(4),
        SiteModel::uniform(),
        config,
        ReferenceBackend::new(),
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn jc_p_same(time: f64) -> f64 {
    0.25 + 0.75 * (-time * 4.0 / 3.0).exp()
}

#[allow(dead_code)]
pub fn jc_p_diff(time: f64) -> f64 {
    0.25 - 0.25 * (-time * 4.0 / 3.0).exp()
}

/// Backend wrapper that reports a non-finite root likelihood a fixed number
/// of times before delegating, to drive the engine's underflow handling.
pub struct UnderflowingBackend {
    inner: ReferenceBackend,
    failures_remaining: usize,
}

#[allow(dead_code)]
impl UnderflowingBackend {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: ReferenceBackend::new(),
            failures_remaining: failures,
        }
    }

    pub fn inner(&self) -> &ReferenceBackend {
        &self.inner
    }
}

impl LikelihoodBackend for UnderflowingBackend {
    fn allocate(&mut self, request: &AllocationRequest) -> quasitree::Result<()> {
        self.inner.allocate(request)
    }

    fn set_tip_states(&mut self, index: usize, states: &[usize]) {
        self.inner.set_tip_states(index, states);
    }

    fn set_tip_partials(&mut self, index: usize, partials: &[f64]) {
        self.inner.set_tip_partials(index, partials);
    }

    fn set_pattern_weights(&mut self, weights: &[f64]) {
        self.inner.set_pattern_weights(weights);
    }

    fn set_category_rates(&mut self, rates: &[f64]) {
        self.inner.set_category_rates(rates);
    }

    fn set_category_weights(&mut self, index: usize, weights: &[f64]) {
        self.inner.set_category_weights(index, weights);
    }

    fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) {
        self.inner.set_state_frequencies(index, frequencies);
    }

    fn set_transition_matrix(&mut self, index: usize, matrix: &[f64]) {
        self.inner.set_transition_matrix(index, matrix);
    }

    fn update_partials(&mut self, operations: &[PartialsOperation]) {
        self.inner.update_partials(operations);
    }

    fn reset_scale_factors(&mut self, index: usize) {
        self.inner.reset_scale_factors(index);
    }

    fn accumulate_scale_factors(&mut self, indices: &[usize], destination: usize) {
        self.inner.accumulate_scale_factors(indices, destination);
    }

    fn root_log_likelihood(
        &mut self,
        partials: usize,
        weights: usize,
        frequencies: usize,
        scale: Option<usize>,
    ) -> f64 {
        let value = self
            .inner
            .root_log_likelihood(partials, weights, frequencies, scale);
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return f64::NEG_INFINITY;
        }
        value
    }

    fn site_log_likelihoods(&self, out: &mut [f64]) {
        self.inner.site_log_likelihoods(out);
    }
}
