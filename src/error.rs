// src/error.rs

//! Unified error handling for the sync application.

use std::fmt;

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failed
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// ZIP archive could not be written
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// The external data provider failed for one entity
    #[error("Provider error for {entity}: {message}")]
    Provider { entity: String, message: String },

    /// The external data provider did not answer in time
    #[error("Fetch for {entity} timed out after {secs:.1}s")]
    Timeout { entity: String, secs: f64 },

    /// The messaging collaborator rejected a message
    #[error("Messaging error for {target}: {message}")]
    Messaging { target: String, message: String },

    /// Archive build failed
    #[error("Archive error for {category}: {message}")]
    Archive { category: String, message: String },

    /// Persistence is gone as a whole (not a single bad record)
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a provider error with the entity it concerns.
    pub fn provider(entity: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Provider {
            entity: entity.into(),
            message: message.to_string(),
        }
    }

    /// Create a messaging error for a delivery target.
    pub fn messaging(target: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Messaging {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Create an archive error for a category.
    pub fn archive(category: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Archive {
            category: category.into(),
            message: message.to_string(),
        }
    }

    /// Create a structural storage error.
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable(message.into())
    }

    /// Whether this error means the whole loop must restart rather than skip one item.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}
