use thiserror::Error;

/// Errors that can occur while preparing data, building the model, or training.
#[derive(Debug, Error)]
pub enum KbfuseError {
    /// A configuration file could not be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A dataset file is missing a tensor or its shape is inconsistent.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Candle ML framework error.
    #[error("ML error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Checkpoint could not be written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for kbfuse operations.
pub type Result<T> = std::result::Result<T, KbfuseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = KbfuseError::Dataset("tokens tensor missing".into());
        assert_eq!(err.to_string(), "dataset error: tokens tensor missing");

        let err = KbfuseError::Config("bad lr".into());
        assert!(err.to_string().contains("bad lr"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KbfuseError>();
    }
}
