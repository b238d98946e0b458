//! The phylogenetic likelihood of a quasi-species tree.
//!
//! The engine in [`engine`] owns the tree and translates its state into
//! batched buffer operations against a [`LikelihoodBackend`]; numeric buffer
//! double-buffering lives in [`buffers`], and [`reference`] provides the
//! pure Rust backend.

pub mod backend;
pub mod buffers;
pub mod engine;
pub mod reference;

pub use backend::{AllocationRequest, LikelihoodBackend, PartialsOperation};
pub use buffers::BufferIndexAllocator;
pub use engine::QuasiSpeciesLikelihood;
pub use reference::ReferenceBackend;

/// When to renormalize partials buffers to guard against numerical
/// underflow on long or duplicate-heavy trees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RescalingScheme {
    /// Never rescale; evaluations that underflow return negative infinity.
    None,
    /// Recompute scale factors on every evaluation.
    Always,
    /// After the first underflow, rescale on a bounded number of
    /// evaluations and then coast on cached factors until the counter
    /// window elapses.
    #[default]
    Dynamic,
    /// After the first underflow, recompute scale factors on every
    /// subsequent evaluation.
    Delayed,
    /// Let the backend rescale internally; falls back to [`Dynamic`]
    /// (with a warning) when the backend cannot.
    ///
    /// [`Dynamic`]: RescalingScheme::Dynamic
    Auto,
}

/// Tunables of the likelihood engine.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rescaling: RescalingScheme,
    /// Evaluations between dynamic-rescaling bursts.
    pub rescale_frequency: usize,
    /// Evaluations per dynamic-rescaling burst.
    pub rescale_times: usize,
    /// Feed full partials vectors for ambiguity codes instead of collapsing
    /// them to unknowns.
    pub use_ambiguities: bool,
    /// Feed every tip as a partials vector, bypassing compact state codes
    /// entirely.
    pub use_tip_likelihoods: bool,
    /// Global molecular clock rate applied to all branch times.
    pub clock_rate: f64,
    /// Preferred backend resources, passed through to allocation.
    pub resources: Vec<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rescaling: RescalingScheme::default(),
            rescale_frequency: 10_000,
            rescale_times: 1,
            use_ambiguities: false,
            use_tip_likelihoods: false,
            clock_rate: 1.0,
            resources: Vec::new(),
        }
    }
}
