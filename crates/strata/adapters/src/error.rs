use std::path::PathBuf;
use strata_core::{Amount, AssetType, VaultError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed feed file {path}: {message}")]
    MalformedFeed { path: PathBuf, message: String },

    #[error("no {asset} reading available")]
    MissingReading { asset: AssetType },

    #[error("venue '{venue}' capacity exceeded: requested {requested}, room {room}")]
    CapacityExceeded {
        venue: String,
        requested: Amount,
        room: Amount,
    },

    #[error("venue '{venue}' holds {deployed}, cannot release {requested}")]
    InsufficientDeployed {
        venue: String,
        requested: Amount,
        deployed: Amount,
    },

    #[error("{0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AdapterError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Surface as a per-source oracle failure so the aggregator drops only this reading.
    pub fn into_oracle(self, source_id: &str) -> VaultError {
        VaultError::OracleSource {
            source_id: source_id.to_string(),
            message: self.to_string(),
        }
    }
}

impl From<AdapterError> for VaultError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Io { .. }
            | AdapterError::MalformedFeed { .. }
            | AdapterError::Serialization(_) => VaultError::Serialization(err.to_string()),
            other => VaultError::InvalidParameter(other.to_string()),
        }
    }
}
