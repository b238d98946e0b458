//! The operation-batch protocol between the likelihood engine and the bulk
//! math backend. The engine computes transition matrices and queues batched
//! partial-likelihood updates; the backend owns all numeric buffers and may
//! parallelize internally. A pure Rust implementation lives in
//! [`reference`](crate::likelihood::reference); hardware-accelerated
//! implementations plug in behind the same trait.

use crate::error::Result;

/// Resource constraints and buffer dimensions requested at backend
/// allocation. Allocation either satisfies the request or fails fast; there
/// is no silent fallback.
#[derive(Clone, Debug)]
pub struct AllocationRequest {
    /// Number of tip partials slots (twice the haplotype count: each tip
    /// occupies a primary and a mirrored slot).
    pub tip_count: usize,
    /// Total partials buffers, including the double-buffered working slots.
    pub partials_buffers: usize,
    /// How many of the tip slots carry compact state codes instead of full
    /// partials vectors (zero when ambiguity expansion is on).
    pub compact_buffers: usize,
    pub state_count: usize,
    pub pattern_count: usize,
    pub eigen_buffers: usize,
    pub matrix_buffers: usize,
    pub category_count: usize,
    pub scale_buffers: usize,
    /// Preferred resource order, backend specific (empty = default).
    pub resources: Vec<usize>,
}

/// One queued partials update: combine two source buffers through their
/// transition matrices into a destination buffer, optionally writing fresh
/// per-pattern scale factors or reading previously cached ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartialsOperation {
    pub destination: usize,
    pub write_scale: Option<usize>,
    pub read_scale: Option<usize>,
    pub source1: usize,
    pub matrix1: usize,
    pub source2: usize,
    pub matrix2: usize,
}

/// Capability interface of the vectorized phylogenetic math backend.
///
/// All buffer arguments are physical slot indices as produced by the
/// engine's [`BufferIndexAllocator`](crate::likelihood::BufferIndexAllocator)s.
pub trait LikelihoodBackend {
    /// Allocate an instance with the given dimensions, or fail with
    /// [`Error::BackendUnavailable`](crate::error::Error::BackendUnavailable).
    fn allocate(&mut self, request: &AllocationRequest) -> Result<()>;

    /// Set compact per-pattern state codes for a tip slot. Codes equal to
    /// the state count mark a fully ambiguous character.
    fn set_tip_states(&mut self, index: usize, states: &[usize]);

    /// Set full per-pattern, per-state, per-category partials for a tip
    /// slot (pattern-major within each category).
    fn set_tip_partials(&mut self, index: usize, partials: &[f64]);

    fn set_pattern_weights(&mut self, weights: &[f64]);

    fn set_category_rates(&mut self, rates: &[f64]);

    fn set_category_weights(&mut self, index: usize, weights: &[f64]);

    fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]);

    /// Set a transition matrix buffer: `state_count²` entries per category.
    fn set_transition_matrix(&mut self, index: usize, matrix: &[f64]);

    /// Execute a batch of queued partials updates in order.
    fn update_partials(&mut self, operations: &[PartialsOperation]);

    /// Zero a cumulative scale buffer.
    fn reset_scale_factors(&mut self, index: usize);

    /// Add the per-pattern log scale factors of the given buffers into the
    /// destination buffer.
    fn accumulate_scale_factors(&mut self, indices: &[usize], destination: usize);

    /// Integrate root partials over categories and states into the total
    /// log-likelihood, adding accumulated scale factors if a buffer is
    /// supplied. Also refreshes the per-pattern log-likelihoods.
    fn root_log_likelihood(
        &mut self,
        partials: usize,
        weights: usize,
        frequencies: usize,
        scale: Option<usize>,
    ) -> f64;

    /// Per-pattern log-likelihoods of the most recent root evaluation.
    fn site_log_likelihoods(&self, out: &mut [f64]);

    /// Whether the backend performs its own automatic rescaling; the engine
    /// falls back from AUTO to DYNAMIC when it does not.
    fn supports_auto_rescaling(&self) -> bool {
        false
    }
}
