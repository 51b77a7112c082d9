use thiserror::Error;

/// Boxed failure from a caller-supplied chain operation.
pub type OperationError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum E2eError {
    #[error("invalid private key for {role}: {reason}")]
    InvalidPrivateKey { role: String, reason: String },

    #[error("unknown network '{0}': expected datil, datil-test or datil-dev")]
    InvalidNetwork(String),

    #[error("{operation} failed: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: OperationError,
    },

    #[error("parameter shape mismatch: {0}")]
    ParameterShape(String),

    #[error("invalid {ty} parameter value '{value}': {reason}")]
    InvalidParameter {
        ty: String,
        value: String,
        reason: String,
    },

    #[error("unknown parameter type id: {0}")]
    UnknownParameterType(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl E2eError {
    pub(crate) fn operation(operation: &'static str, source: impl Into<OperationError>) -> Self {
        E2eError::Operation {
            operation,
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, E2eError>;
