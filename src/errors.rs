//! Defines the custom error types used throughout the `signage_board` engine.
//!
//! This module centralizes error handling, providing specific error enums for
//! different categories of issues (configuration, item provider, media resources,
//! diagnostic storage), and a top-level `AppError` to wrap them. Each error type
//! implements `Debug`, `Display`, and `std::error::Error`, and provides `From`
//! implementations for common underlying error types.

use std::error::Error as StdError;
use std::fmt;

// --- ConfigError ---
/// Errors related to configuration loading and parsing.
#[must_use = "a configuration error should be handled or propagated"]
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O error occurred while trying to read the configuration file.
    Io(std::io::Error),
    /// An error occurred while parsing the configuration file content.
    Parse(String),
    /// A required configuration key was missing from the file.
    MissingKey(String),
    /// A key was present but its value could not be interpreted.
    InvalidValue { key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Configuration I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Configuration parse error: {}", e),
            ConfigError::MissingKey(key) => write!(f, "Missing configuration key: '{}'", key),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value '{}' for configuration key '{}'", value, key)
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

// --- ProviderError ---
/// Errors raised while loading the item list. Any of these means the provider is
/// unavailable for this attempt.
#[must_use = "a provider error should be handled or propagated"]
#[derive(Debug)]
pub enum ProviderError {
    /// An error occurred during an HTTP request made by `reqwest`.
    Reqwest(reqwest::Error),
    /// An error occurred during JSON serialization or deserialization.
    SerdeJson(serde_json::Error),
    /// The board document does not exist.
    NotFound(String),
    /// An HTTP error occurred that was not a simple "Not Found" (e.g., 401, 500).
    HttpError { status: reqwest::StatusCode, message: String },
    /// A generic provider error not covered by other variants.
    Generic(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Reqwest(e) => write!(f, "Provider request error: {}", e),
            ProviderError::SerdeJson(e) => {
                write!(f, "Provider JSON (de)serialization error: {}", e)
            }
            ProviderError::NotFound(id) => write!(f, "Provider resource not found: {}", id),
            ProviderError::HttpError { status, message } => {
                write!(f, "Provider HTTP error {}: {}", status, message)
            }
            ProviderError::Generic(s) => write!(f, "Provider error: {}", s),
        }
    }
}

impl StdError for ProviderError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ProviderError::Reqwest(e) => Some(e),
            ProviderError::SerdeJson(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Reqwest(err)
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::SerdeJson(err)
    }
}

// --- MediaError ---
/// Errors related to playable resources (image references, video players).
#[must_use = "a media error should be handled or propagated"]
#[derive(Debug)]
pub enum MediaError {
    /// An I/O error occurred, usually while writing a prefetched file.
    Io(std::io::Error),
    /// An error occurred during the download of media content.
    Download(reqwest::Error),
    /// A video never reported playback within the readiness window.
    ReadinessTimeout { item_id: String, waited_ms: u64 },
    /// The backend reported that playback failed outright.
    PlaybackFailed { item_id: String, reason: String },
    /// The media reference cannot be handled by the backend.
    UnsupportedKind(String),
    /// A generic media-related error.
    Generic(String),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::Io(e) => write!(f, "Media I/O error: {}", e),
            MediaError::Download(e) => write!(f, "Media download error: {}", e),
            MediaError::ReadinessTimeout { item_id, waited_ms } => {
                write!(f, "Media '{}' did not start playing within {}ms", item_id, waited_ms)
            }
            MediaError::PlaybackFailed { item_id, reason } => {
                write!(f, "Playback of '{}' failed: {}", item_id, reason)
            }
            MediaError::UnsupportedKind(s) => write!(f, "Unsupported media: {}", s),
            MediaError::Generic(s) => write!(f, "Media error: {}", s),
        }
    }
}

impl StdError for MediaError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            MediaError::Io(e) => Some(e),
            MediaError::Download(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MediaError {
    fn from(err: std::io::Error) -> Self { MediaError::Io(err) }
}
impl From<reqwest::Error> for MediaError {
    fn from(err: reqwest::Error) -> Self { MediaError::Download(err) }
}

// --- StorageError ---
/// Errors raised while persisting the diagnostic log.
#[must_use = "a storage error should be handled or propagated"]
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Persist(tempfile::PersistError),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "Diagnostic storage I/O error: {}", e),
            StorageError::Json(e) => write!(f, "Diagnostic storage JSON error: {}", e),
            StorageError::Persist(e) => write!(f, "Diagnostic storage persist error: {}", e),
        }
    }
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Json(e) => Some(e),
            StorageError::Persist(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self { StorageError::Io(err) }
}
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self { StorageError::Json(err) }
}
impl From<tempfile::PersistError> for StorageError {
    fn from(err: tempfile::PersistError) -> Self { StorageError::Persist(err) }
}

// --- AppError (Top-level error enum) ---
/// A top-level error type that can encompass any error within the application.
#[must_use = "an application error should be handled or propagated"]
#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Provider(ProviderError),
    Media(MediaError),
    Storage(StorageError),
    /// No slide transition happened for longer than the recovery threshold.
    StallDetected { stalled_for_ms: u64 },
    Generic(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "Application Configuration Error: {}", e),
            AppError::Provider(e) => write!(f, "Application Provider Error: {}", e),
            AppError::Media(e) => write!(f, "Application Media Error: {}", e),
            AppError::Storage(e) => write!(f, "Application Storage Error: {}", e),
            AppError::StallDetected { stalled_for_ms } => {
                write!(f, "Playback stalled: no slide transition for {}ms", stalled_for_ms)
            }
            AppError::Generic(s) => write!(f, "Application Error: {}", s),
        }
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            AppError::Config(e) => Some(e),
            AppError::Provider(e) => Some(e),
            AppError::Media(e) => Some(e),
            AppError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self { AppError::Config(err) }
}
impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self { AppError::Provider(err) }
}
impl From<MediaError> for AppError {
    fn from(err: MediaError) -> Self { AppError::Media(err) }
}
impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self { AppError::Storage(err) }
}
