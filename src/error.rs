//! Error types for the RaidVault virtual file system

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the virtual file system
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // Not Found
    // =========================================================================
    /// Bucket does not exist or is not accessible
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Object does not exist or is not accessible
    #[error("Object not found: b:{bucket} o:{object}")]
    ObjectNotFound { bucket: String, object: String },

    /// Object version does not exist (never written or purged)
    #[error("Object version not found: b:{bucket} o:{object} v:{version}")]
    VersionNotFound {
        bucket: String,
        object: String,
        version: u32,
    },

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    /// Invalid argument supplied by the caller
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// Operation is not valid in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Drive count does not match the configured redundancy level
    #[error("Invalid RAID configuration: {0}")]
    InvalidRaidConfig(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Iterator consumed past its end
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    // =========================================================================
    // Internal / Critical
    // =========================================================================
    /// Internal critical error carrying the failing context and the cause
    #[error("Internal error [{context}]: {source}")]
    Internal {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Encryption or key unwrap failure
    #[error("Encryption error: {0}")]
    Crypto(String),

    /// Startup could not complete; the server must not accept traffic
    #[error("Fatal startup error: {0}")]
    Fatal(String),

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// EC encoding failed
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    /// EC reconstruction failed
    #[error("EC reconstruction failed for chunk {chunk}: {reason}")]
    EcReconstructionFailed { chunk: u32, reason: String },

    /// Insufficient shards for reconstruction
    #[error("Insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),
}

impl Error {
    /// Wrap an error as internal-critical with a diagnostic context tag
    pub fn internal(context: impl Into<String>, source: Error) -> Self {
        Error::Internal {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True for the typed not-found conditions, looking through `Internal`
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::BucketNotFound(_)
            | Error::ObjectNotFound { .. }
            | Error::VersionNotFound { .. } => true,
            Error::Internal { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Builds the `b:/o:/v:/d:` tag attached to internal errors
pub fn context_tag(
    bucket: Option<&str>,
    object: Option<&str>,
    version: Option<u32>,
    drive: Option<&str>,
) -> String {
    let mut parts = Vec::with_capacity(4);
    if let Some(b) = bucket {
        parts.push(format!("b:{}", b));
    }
    if let Some(o) = object {
        parts.push(format!("o:{}", o));
    }
    if let Some(v) = version {
        parts.push(format!("v:{}", v));
    }
    if let Some(d) = drive {
        parts.push(format!("d:{}", d));
    }
    parts.join(" ")
}

/// Extension for attaching context to fallible calls
pub trait ResultExt<T> {
    /// Wrap any error as `Error::Internal` with the lazily built context
    fn context_with<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context_with<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| match e {
            // typed and already-wrapped errors pass through untouched
            Error::Internal { .. }
            | Error::BucketNotFound(_)
            | Error::ObjectNotFound { .. }
            | Error::VersionNotFound { .. }
            | Error::IllegalArgument(_)
            | Error::IllegalState(_) => e,
            other => Error::internal(f(), other),
        })
    }
}
