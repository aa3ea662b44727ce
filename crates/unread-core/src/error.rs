use std::fmt;

/// Machine-readable error codes for operator and caller decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    UnknownCollection,
    UnknownReader,
    NoReaderRegistered,
    ConfigParseError,
    StoreFailure,
    SchemaMismatch,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidArgument => "E2001",
            Self::UnknownCollection => "E2002",
            Self::UnknownReader => "E2003",
            Self::NoReaderRegistered => "E1001",
            Self::ConfigParseError => "E1002",
            Self::StoreFailure => "E5001",
            Self::SchemaMismatch => "E5002",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::InvalidArgument => "Invalid argument",
            Self::UnknownCollection => "Collection type not registered",
            Self::UnknownReader => "Unknown reader",
            Self::NoReaderRegistered => "No reader provider registered",
            Self::ConfigParseError => "Config file parse error",
            Self::StoreFailure => "Marker store failure",
            Self::SchemaMismatch => "Marker schema is newer than this binary",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::InvalidArgument => {
                Some("Pass only items that belong to the collection being marked.")
            }
            Self::UnknownCollection => {
                Some("Register the collection with the engine builder before use.")
            }
            Self::UnknownReader => Some("Check that the reader exists and has a positive id."),
            Self::NoReaderRegistered => {
                Some("Supply a reader provider to ReadState::builder() at startup.")
            }
            Self::ConfigParseError => Some("Fix syntax in the unread config.toml and retry."),
            Self::StoreFailure => Some("The transaction was rolled back; retry the operation."),
            Self::SchemaMismatch => Some("Upgrade to a build that understands this schema."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by the read-state API.
///
/// Nothing here is retried internally. A `Store` error always means the
/// enclosing transaction was rolled back.
#[derive(Debug, thiserror::Error)]
pub enum UnreadError {
    /// Caller passed an item outside the stated collection, an unregistered
    /// collection, or a malformed identifier.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Reader is not known to the reader provider or has no usable id.
    #[error("unknown reader: {0}")]
    UnknownReader(String),

    /// The engine was assembled without a reader provider.
    #[error("no reader provider registered")]
    NoReaderRegistered,

    /// Underlying SQLite operation failed.
    #[error("marker store failure: {0}")]
    Store(#[from] rusqlite::Error),

    /// Config file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// On-disk schema version is newer than this build understands.
    #[error("marker schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
}

impl UnreadError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::UnknownReader(_) => ErrorCode::UnknownReader,
            Self::NoReaderRegistered => ErrorCode::NoReaderRegistered,
            Self::Store(_) => ErrorCode::StoreFailure,
            Self::Config(_) => ErrorCode::ConfigParseError,
            Self::SchemaTooNew { .. } => ErrorCode::SchemaMismatch,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// True for errors the compaction job isolates to a single reader.
    #[must_use]
    pub const fn is_per_reader(&self) -> bool {
        matches!(self, Self::Store(_) | Self::UnknownReader(_))
    }

    pub(crate) fn unknown_collection(collection_type: &str) -> Self {
        Self::InvalidArgument(format!(
            "{}: '{collection_type}' is not a registered collection type",
            ErrorCode::UnknownCollection.code()
        ))
    }
}

/// Result alias used across the crate.
pub type Result<T, E = UnreadError> = std::result::Result<T, E>;
