//! Error types for the export pipeline

use thiserror::Error;

/// Result type alias for export operations
pub type Result<T> = std::result::Result<T, Error>;

/// Export pipeline error types
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// SafeTensors errors
    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// Invalid combination of export options, detected before any step runs
    #[error("Invalid config: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// A named transformation step failed; remaining steps were not run
    #[error("Transformation step `{step}` failed: {source:#}")]
    Transformation {
        /// Name of the failing step
        step: String,
        /// Underlying diagnostic reported by the step
        #[source]
        source: anyhow::Error,
    },

    /// The assembler received inconsistent inputs
    #[error("Malformed export: {message}")]
    MalformedExport {
        /// Error message
        message: String,
    },

    /// Checkpoint read/write errors
    #[error("Checkpoint error: {message}")]
    Checkpoint {
        /// Error message
        message: String,
    },
}

impl Error {
    /// Create an InvalidConfig error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a Transformation error for the named step
    pub fn transformation(step: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Transformation {
            step: step.into(),
            source,
        }
    }

    /// Create a MalformedExport error
    pub fn malformed_export(message: impl Into<String>) -> Self {
        Self::MalformedExport {
            message: message.into(),
        }
    }

    /// Create a Checkpoint error
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
        }
    }

    /// Name of the failed step, if this is a transformation error
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::Transformation { step, .. } => Some(step),
            _ => None,
        }
    }

    /// True for configuration errors
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }

    /// True for assembler errors
    pub fn is_malformed_export(&self) -> bool {
        matches!(self, Self::MalformedExport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transformation_error_display_includes_step_and_cause() {
        let err = Error::transformation("lower_to_executor", anyhow::anyhow!("cycle in `main`"));
        assert_eq!(err.failed_step(), Some("lower_to_executor"));
        let text = err.to_string();
        assert!(text.contains("lower_to_executor"));
        assert!(text.contains("cycle in `main`"));
    }

    #[test]
    fn test_error_kind_predicates() {
        assert!(Error::invalid_config("missing dir").is_config_error());
        assert!(Error::malformed_export("empty graph").is_malformed_export());
        assert!(!Error::checkpoint("bad index").is_config_error());
        assert_eq!(Error::checkpoint("bad index").failed_step(), None);
    }
}
