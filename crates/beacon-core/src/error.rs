use thiserror::Error;

#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Database error: {0}")]
    Database(String),

    /// Malformed ciphertext or a cipher failure in the secret codec.
    #[error("Secret codec error: {0}")]
    Codec(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BeaconError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        BeaconError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BeaconError::NotFound { .. })
    }

    /// Short error code string for logs and API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            BeaconError::Config(_) => "CONFIG_ERROR",
            BeaconError::NotFound { .. } => "NOT_FOUND",
            BeaconError::Database(_) => "DATABASE_ERROR",
            BeaconError::Codec(_) => "CODEC_ERROR",
            BeaconError::InvalidInput(_) => "INVALID_INPUT",
            BeaconError::Serialization(_) => "SERIALIZATION_ERROR",
            BeaconError::Io(_) => "IO_ERROR",
            BeaconError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, BeaconError>;
