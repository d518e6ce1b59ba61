use thiserror::Error;

/// Error taxonomy for the campaign orchestrator.
///
/// The five variants mirror the five error kinds of the error-handling
/// design: transient transport failures are recoverable at the record
/// level, protocol errors carry a device-reported code, configuration
/// errors abort startup, invariant violations abort the affected
/// subsystem, and critical failures abort the whole campaign.
#[derive(Error, Debug)]
pub enum EssError {
    #[error("transient transport failure on {transport}: {message}")]
    Transient { transport: String, message: String },

    #[error("protocol error on {transport}, code {code}: {message}")]
    Protocol {
        transport: String,
        code: u8,
        message: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("critical failure: {0}")]
    Critical(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EssError>;
