//! Phylogenetic likelihood for quasi-species trees.
//!
//! A quasi-species tree keeps one tip per unique haplotype; duplicate
//! samples of the same sequence are folded into a per-tip attachment
//! ledger instead of inflating the topology. The [`tree`] module builds
//! such trees by collapsing a full input tree (or a clustering of the raw
//! alignment), and the [`likelihood`] module computes their phylogenetic
//! likelihood through a narrow batched backend protocol with adaptive
//! numerical rescaling.

pub mod alignment;
pub mod error;
pub mod likelihood;
pub mod model;
pub mod tree;

pub use alignment::Alignment;
pub use error::{Error, Result};
pub use likelihood::{EngineConfig, QuasiSpeciesLikelihood, ReferenceBackend, RescalingScheme};
pub use tree::{AttachmentLedger, HaploId, NodeId, QuasiSpeciesTree};
