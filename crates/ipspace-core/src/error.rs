//! Error types for ipspace

use thiserror::Error;

/// Main error type for ipspace operations
#[derive(Error, Debug)]
pub enum SpaceError {
    /// Profile initialization failed; the profile cannot be used
    #[error("Profile error: {0}")]
    Profile(String),

    /// Error reported by the storage network
    #[error("Storage network error: {0}")]
    Node(String),

    /// Entry not found in the mutable namespace or block store
    #[error("Not found: {0}")]
    NotFound(String),

    /// The storage network has no DAG capability
    #[error("DAG capability unavailable")]
    DagUnavailable,

    /// DAG contains a link that is not a valid content identifier
    #[error("Invalid link in DAG at {path}: {link}")]
    InvalidLink {
        /// Slash-separated path of the offending entry
        path: String,
        /// The link target as found in the tree
        link: String,
    },

    /// Malformed content identifier
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Envelope format version not supported
    #[error("Envelope version {0} is not supported")]
    EnvelopeVersionUnsupported(u8),

    /// A listener key has no handler in the dispatch table
    #[error("No handler bound for key {0}")]
    UnboundKey(String),

    /// Malformed topic key
    #[error("Invalid topic key: {0}")]
    InvalidKey(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for SpaceError {
    fn from(err: serde_json::Error) -> Self {
        SpaceError::Serialization(err.to_string())
    }
}

impl From<postcard::Error> for SpaceError {
    fn from(err: postcard::Error) -> Self {
        SpaceError::Serialization(err.to_string())
    }
}

/// Result type alias using SpaceError
pub type SpaceResult<T> = Result<T, SpaceError>;
