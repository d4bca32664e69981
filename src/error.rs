use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::normalizer::NormalizeError;
use std::io;
use thiserror::Error;

/// Unified error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("normalization error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error ends a whole load run rather than a single file.
    ///
    /// Bad configuration, a failed connection and lifecycle misuse are fatal.
    /// Malformed files, schema conflicts and insert failures are reported
    /// per file.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Database(e) => matches!(
                e,
                DatabaseError::Configuration(_)
                    | DatabaseError::Connection(_)
                    | DatabaseError::InvalidState(_)
            ),
            Error::Config(_) | Error::Io(_) => true,
            Error::Normalize(_) => false,
        }
    }
}
