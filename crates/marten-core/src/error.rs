use crate::shape::Shape;

/// All errors that can occur within marten.
///
/// This enum captures every failure mode: shape-contract violations caught by
/// the checking handler, layer construction failures, network wiring and
/// resolution failures, and I/O errors from persistence. Using a single error
/// type across the workspace simplifies error propagation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation was invoked with incompatible operand/output shapes.
    /// Only ever produced by the validating handler wrapper; the production
    /// backends assume pre-validated shapes.
    #[error("shape mismatch in {op}: expected {expected}, got {got}")]
    ShapeMismatch {
        op: &'static str,
        expected: Shape,
        got: Shape,
    },

    /// An operation requires a specific rank (number of dimensions).
    #[error("rank mismatch in {op}: expected rank {expected}, got {got}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// A layer was constructed with bad kwargs, an unmatched input shape, or
    /// a dangling wiring reference. Raised once at construction, never during
    /// passes.
    #[error("{layer}: {reason}")]
    LayerValidation { layer: String, reason: String },

    /// Ambiguous or missing initializer/modifier resolution, malformed
    /// output-name lookup, or an invalid architecture description.
    #[error("network validation failed: {0}")]
    NetworkValidation(String),

    /// Precondition failure signalled by an external data iterator.
    #[error("iterator validation failed: {0}")]
    IteratorValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn layer(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::LayerValidation {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    pub fn network(s: impl Into<String>) -> Self {
        Error::NetworkValidation(s.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
