//! Error types for the term-export library.
//!
//! All fallible operations return [`ExportError`]. The first group of variants
//! is the pipeline taxonomy: each one maps to a phase of an export run and is
//! fatal once raised. The remaining variants wrap the infrastructure crates
//! (DataFusion, Arrow, object_store, I/O) the collaborators are built on.

use thiserror::Error;

/// The main error type for the term-export library.
#[derive(Error, Debug)]
pub enum ExportError {
    /// The source table, staging location, or output location is unreachable.
    #[error("Access error on '{target}': {message}")]
    Access {
        /// What could not be reached (table or location)
        target: String,
        /// Detailed error message
        message: String,
    },

    /// No columns were found for the requested table.
    #[error("Schema not found for '{table}': {message}")]
    Schema {
        /// Fully qualified table name
        table: String,
        /// Detailed error message
        message: String,
    },

    /// A recipient key could not be read, parsed, or imported.
    #[error("Key import failed for '{key}': {message}")]
    KeyImport {
        /// Key location or fingerprint
        key: String,
        /// Detailed error message
        message: String,
    },

    /// The requested output format is not supported.
    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),

    /// Bulk extraction of a shard failed.
    #[error("Extraction failed for shard {shard}: {message}")]
    Extraction {
        /// Shard being extracted
        shard: u32,
        /// Detailed error message
        message: String,
        /// Underlying cause
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Downloading a staged file failed.
    #[error("Download of '{path}' failed: {message}")]
    Download {
        /// Remote path
        path: String,
        /// Detailed error message
        message: String,
    },

    /// The encryption engine reported a failure.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Uploading a file to a remote location failed.
    #[error("Upload of '{path}' failed: {message}")]
    Upload {
        /// Remote path
        path: String,
        /// Detailed error message
        message: String,
    },

    /// The manifest could not be built or emitted.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Error from DataFusion operations.
    #[error("DataFusion error: {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),

    /// Error from Arrow operations.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Error from Parquet writing.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Error from the object store backing stage and output locations.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Error from I/O operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error related to configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Security-related error (rejected identifiers, bad literals).
    #[error("Security error: {0}")]
    SecurityError(String),

    /// Error from serialization/deserialization operations.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A notification could not be delivered.
    #[error("Notification error: {0}")]
    Notification(String),

    /// Error when an operation is not supported.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Generic internal error for unexpected conditions.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, ExportError>`.
pub type Result<T> = std::result::Result<T, ExportError>;

impl ExportError {
    /// Creates an access error.
    pub fn access(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Access {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Creates a schema error.
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a key import error.
    pub fn key_import(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::KeyImport {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates an extraction error without an underlying cause.
    pub fn extraction(shard: u32, message: impl Into<String>) -> Self {
        Self::Extraction {
            shard,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an extraction error wrapping the underlying cause.
    pub fn extraction_with_source(
        shard: u32,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Extraction {
            shard,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a download error.
    pub fn download(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Download {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an upload error.
    pub fn upload(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upload {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns the taxonomy name used in failure summaries and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Access { .. } | Self::ObjectStore(_) => "AccessError",
            Self::Schema { .. } => "SchemaError",
            Self::KeyImport { .. } => "KeyImportError",
            Self::UnsupportedFormat(_) => "UnsupportedFormatError",
            Self::Extraction { .. } => "ExtractionError",
            Self::Download { .. } => "DownloadError",
            Self::Encryption(_) => "EncryptionError",
            Self::Upload { .. } => "UploadError",
            Self::Manifest(_) => "ManifestError",
            Self::Configuration(_) | Self::SecurityError(_) => "ConfigurationError",
            Self::DataFusion(_) | Self::Arrow(_) | Self::Parquet(_) => "QueryError",
            Self::Io(_) => "IoError",
            Self::Serialization(_) => "SerializationError",
            Self::Notification(_) => "NotificationError",
            Self::NotSupported(_) | Self::Internal(_) => "InternalError",
        }
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, msg: &str) -> Result<T>;

    /// Adds context with a lazy message.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<ExportError>,
{
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| ExportError::Internal(format!("{msg}: {}", e.into())))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ExportError::Internal(format!("{}: {}", f(), e.into())))
    }
}
