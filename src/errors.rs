use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Output parsing error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Request cancelled")]
    Cancelled,
}

impl LocatorError {
    /// Image-fatal errors abort the request without retrying.
    pub fn is_image_fatal(&self) -> bool {
        matches!(self, LocatorError::Image(_))
    }
}

impl From<image::ImageError> for LocatorError {
    fn from(e: image::ImageError) -> Self {
        LocatorError::Image(e.to_string())
    }
}

impl serde::Serialize for LocatorError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type LocatorResult<T> = Result<T, LocatorError>;
