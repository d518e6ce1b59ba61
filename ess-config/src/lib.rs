//! Campaign configuration types and a minimal JSON loader.
//!
//! The JSON config format itself is an external collaborator (validated by
//! a caller-supplied UI outside this crate, per the campaign's Non-goals);
//! this crate only provides the typed shape and a `serde_json`-based
//! loader, mirroring how `ferrex-config` composes layered sources into a
//! single typed `Config`.

pub mod error;
pub mod model;

pub use error::ConfigLoadError;
pub use model::*;

use std::io::Read;
use std::path::Path;

impl Config {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigLoadError> {
        serde_json::from_reader(reader).map_err(ConfigLoadError::Parse)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&contents).map_err(ConfigLoadError::Parse)?;
        config.validate()?;
        Ok(config)
    }
}
