pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid schedule parameters, step counts or batch sizes. Always raised
    /// before any model call; never repaired by substituting defaults.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The denoising model could not be loaded or invoked. Fatal to the
    /// current sampling call; retry policy belongs to the caller.
    #[error("denoising model unavailable: {0}")]
    ModelUnavailable(#[source] BoxedError),

    /// The caller aborted sampling between steps. The partial latent is
    /// discarded, an incomplete trajectory is not a meaningful image.
    #[error("sampling cancelled")]
    Cancelled,

    /// Malformed input at the codec/export boundary.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn model(err: impl Into<BoxedError>) -> Self {
        Self::ModelUnavailable(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
