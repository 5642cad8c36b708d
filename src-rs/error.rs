//! Error types shared by the session, inference and report code.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// The API key given to `save` was empty or whitespace-only.
    #[error("please enter a valid API key")]
    Validation,

    #[error("no API key saved: run `groundcover key save <KEY>` before analyzing")]
    MissingCredential,

    /// The selected file could not be read or decoded as an image.
    #[error("failed to decode image {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    /// Transport, authentication or API-level failure of the inference call.
    #[error("analysis request failed: {0}")]
    Request(String),

    /// The model answered with text that is not a coverage list.
    #[error("model response is not a valid coverage list: {0}")]
    ResponseFormat(String),

    #[error("no image loaded: open a diagram first")]
    NoImage,

    #[error("no analysis result to work with: run analyze first")]
    NoReport,

    #[error("an analysis is already in progress")]
    Busy,

    #[error("row {index} does not exist (table has {len} rows)")]
    RowOutOfRange { index: usize, len: usize },

    #[error("credential store error: {0}")]
    Store(String),

    #[error("failed to load font {}: {reason}", path.display())]
    Font { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
