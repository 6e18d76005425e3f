use thiserror::Error;

/// Errors surfaced by the engine's public API.
///
/// Filter failures never unwind across the filter boundary; they are latched
/// onto the frame context that observed them and delivered here, at the edge,
/// as [`Error::Filter`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A video or audio format descriptor failed validation.
    #[error("invalid format: {0}")]
    Format(String),
    /// An argument map or schema entry was rejected.
    #[error("invalid argument: {0}")]
    Argument(String),
    /// Plugin configuration, registration, or loading failed.
    #[error("plugin error: {0}")]
    Plugin(String),
    /// A filter reported an error while producing a frame.
    #[error("{0}")]
    Filter(String),
    /// A frame number outside the declared range was requested.
    #[error("requested frame {n} outside the valid range 0..{num_frames}")]
    FrameNumber { n: i32, num_frames: i32 },
    /// A node or output index was used in a context where it is not valid.
    #[error("invalid node: {0}")]
    Node(String),
}

pub type Result<T> = std::result::Result<T, Error>;
