use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised during tree construction and likelihood engine setup.
/// All construction errors are fatal: they abort the build and are never
/// retried. Numerical underflow during evaluation is *not* an error, it is
/// surfaced as a transient negative-infinity log-likelihood and handled by
/// the engine's one-shot rescale retry.
#[derive(Error, Debug)]
pub enum Error {
    /// A haplotype's duplicate set does not form a single uninterrupted
    /// lineage in the backbone tree.
    #[error("backbone is not recursively monophyletic: haplotypes {haplotypes:?} meet again at node height {height}")]
    NonMonophyletic { haplotypes: Vec<u32>, height: f64 },

    /// Two identical sequences carry the same sampling height although the
    /// model requires duplicates to be collapsed into counts.
    #[error("taxa {first:?} and {second:?} have identical sequences and identical sampling height {height}; remove duplicates and annotate counts instead")]
    DuplicateAtIdenticalHeight {
        first: String,
        second: String,
        height: f64,
    },

    /// A tip in the flattened serialized form carries metadata that cannot
    /// be interpreted as attachment-height / tip-time / tip-count lists.
    #[error("unrecognised serialized metadata at tip {taxon:?}: {detail}")]
    UnrecognizedSerializedMetadata { taxon: String, detail: String },

    /// A taxon referenced by the backbone tree has no sequence in the
    /// alignment.
    #[error("no alignment entry for taxon {0:?}")]
    MissingAlignment(String),

    /// The external math backend could not be instantiated under the
    /// requested resource constraints. There is no silent fallback.
    #[error("likelihood backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The origin time must lie strictly above the root of the tree.
    #[error("origin {origin} does not exceed root height {root_height}")]
    OriginBelowRoot { origin: f64, root_height: f64 },

    /// Malformed flattened tree string.
    #[error("cannot parse flattened tree: {0}")]
    FlatParse(String),
}
