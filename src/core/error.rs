//! DC-000: Error taxonomy shared by loading, connecting and execution.
//!
//! Load-time variants (`Config`, `UnknownRecipe`, `Override`, `Datasource`)
//! abort a whole load. Everything else surfaces from a single step's
//! lifecycle and is contained by the scheduler.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for dbchef.
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem errors, with the path that failed
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or incomplete configuration file
    #[error("config error in {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    /// A recipe name that has no folder under the config root
    #[error("unknown recipe '{0}'")]
    UnknownRecipe(String),

    /// Rejected post-load override set
    #[error("invalid override: {0}")]
    Override(String),

    /// Datasource misuse (wrong kind for a step, released registry, ...)
    #[error("datasource '{name}': {message}")]
    Datasource { name: String, message: String },

    /// Template rendering failure
    #[error("template error: {0}")]
    Template(String),

    /// Driver-level database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Connection could not be established within the fixed attempt budget
    #[error("cannot connect to '{name}' after {attempts} attempt(s): {message}")]
    Connect {
        name: String,
        attempts: u32,
        message: String,
    },

    /// Shell command failure
    #[error("command failed: {0}")]
    Command(String),

    /// Record encoding/decoding failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Migration discovery or bookkeeping failure
    #[error("migration error: {0}")]
    Migration(String),
}

/// Result type alias for dbchef operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn config(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    pub fn datasource(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Datasource {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// True for errors raised while loading, before anything executes.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::UnknownRecipe(_) | Self::Override(_) | Self::Datasource { .. }
        )
    }
}
