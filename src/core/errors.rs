//! CAD-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, CadenceError>;

/// Top-level error type for the cadence controller.
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("[CAD-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CAD-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CAD-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CAD-2001] invalid measurement field {field}: {details}")]
    Validation {
        field: &'static str,
        details: String,
    },

    #[error("[CAD-2002] forecast snapshot unusable: {details}")]
    ForecastData { details: String },

    #[error("[CAD-2003] stored control state for node {node_id} is corrupt: {details}")]
    CorruptState { node_id: String, details: String },

    #[error("[CAD-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CAD-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[CAD-2103] control state for node {node_id} changed since it was read")]
    StateConflict { node_id: String },

    #[error("[CAD-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CAD-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[CAD-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl CadenceError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CAD-1001",
            Self::MissingConfig { .. } => "CAD-1002",
            Self::ConfigParse { .. } => "CAD-1003",
            Self::Validation { .. } => "CAD-2001",
            Self::ForecastData { .. } => "CAD-2002",
            Self::CorruptState { .. } => "CAD-2003",
            Self::Serialization { .. } => "CAD-2101",
            Self::Sql { .. } => "CAD-2102",
            Self::StateConflict { .. } => "CAD-2103",
            Self::Io { .. } => "CAD-3002",
            Self::ChannelClosed { .. } => "CAD-3003",
            Self::Runtime { .. } => "CAD-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// The core never retries on its own; this is advice for the ingestion layer.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Sql { .. }
                | Self::StateConflict { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for measurement validation failures.
    #[must_use]
    pub fn validation(field: &'static str, details: impl Into<String>) -> Self {
        Self::Validation {
            field,
            details: details.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for CadenceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for CadenceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for CadenceError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
