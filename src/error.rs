//! Error types for the counting model.
//!
//! Layer code works with `candle_core::Result`; the model boundary
//! (configuration, backbone adapter, `forward`) reports the shape and
//! configuration failures below so callers can match on them.

/// Errors surfaced by model construction and the forward pass.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The patch-token sequence cannot be laid out as a square grid.
    #[error("patch token count {num_patches} is not a perfect square")]
    NonSquarePatchGrid { num_patches: usize },

    /// Attention head count does not evenly divide the embedding width.
    #[error("{num_heads} attention heads do not divide embedding width {dim}")]
    HeadCount { dim: usize, num_heads: usize },

    /// Two tensors or components disagree on their embedding width.
    #[error("{what}: expected width {expected}, got {got}")]
    EmbedDimMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// The exemplar sequence length disagrees with the requested shot count.
    #[error("expected {expected} shots per image, labels carry {got}")]
    ShotCountMismatch { expected: usize, got: usize },

    /// Images and labels (or encoder outputs) disagree on batch size.
    #[error("{what}: expected batch size {expected}, got {got}")]
    BatchMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// A tensor does not have the rank the contract requires.
    #[error("{what}: unexpected shape {shape:?}")]
    UnexpectedShape {
        what: &'static str,
        shape: Vec<usize>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
