// src/error.rs

//! Crate-wide error type
//!
//! One flat enum; callers match on variants rather than downcasting.
//! Io and codec errors convert implicitly via `#[from]`, everything else
//! is constructed at the failure site with enough context to act on.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed bundle file or table (bad magic, lying lengths, dangling
    /// references)
    #[error("format error: {0}")]
    Format(String),

    /// Content failed hash verification
    #[error("integrity failure in {context}: expected {expected}, got {actual}")]
    Integrity {
        context: String,
        expected: String,
        actual: String,
    },

    /// Bundle version outside the reader's supported range
    #[error("bundle version {found} unsupported (supported {supported_min}..={supported_max})")]
    VersionMismatch {
        found: u16,
        supported_min: u16,
        supported_max: u16,
    },

    /// No registered migration chain covers this upgrade
    #[error("no migration path from version {from} to {to}")]
    NoMigrationPath { from: u16, to: u16 },

    /// An edge insertion would make the asset graph cyclic
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// Source-level dependency records contain a cycle
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    /// A chunk or node id is not in the bundle
    #[error("not found: {0}")]
    NotFound(String),

    /// An asset path does not resolve through the graph
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// Stored chunk bytes could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// A dictionary-coded chunk was read without its dictionary
    #[error("missing compression dictionary: {0}")]
    MissingDictionary(String),

    /// An operation exceeded its configured deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation's cancellation token was triggered
    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cbor encode error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor decode error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error indicates corrupt or unusable data, as opposed to
    /// a transient or caller-recoverable condition
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Format(_)
            | Self::Integrity { .. }
            | Self::Decode(_)
            | Self::CborEncode(_)
            | Self::CborDecode(_) => true,
            Self::VersionMismatch { .. }
            | Self::NoMigrationPath { .. }
            | Self::CycleDetected(_)
            | Self::DependencyCycle(_)
            | Self::NotFound(_)
            | Self::PathNotFound(_)
            | Self::MissingDictionary(_)
            | Self::Timeout(_)
            | Self::Cancelled
            | Self::Io(_)
            | Self::Json(_) => false,
        }
    }
}
