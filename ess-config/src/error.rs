use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
