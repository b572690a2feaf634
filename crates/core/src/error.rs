//! Error types for Tessera
//!
//! Every layer reports failures through one `Error` enum so the router can
//! hand clients stable codes. Call sites never match on codes or messages
//! to decide what to do next; they ask `classify` for an `ErrorKind`.
//!
//! ## Kinds
//!
//! | Kind | Effect on the transaction | Client action |
//! |------|---------------------------|---------------|
//! | Statement | none | fix the statement |
//! | TransactionFatal | unusable, only abort allowed | abort |
//! | Transient | aborted or must be aborted | retry whole transaction |
//! | Retryable | unknown, request not applied or applied idempotently | re-send request |
//! | Invariant | refused | none; indicates a bug or corruption |

use crate::types::{Key, KeyRange, Lsid, ShardId, TxnId, TxnNumber};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes surfaced to clients
///
/// Also used in configuration (for example the list of migration races a
/// broadcast write may tolerate), hence `Serialize`/`Deserialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ErrorCode {
    NoSuchTransaction,
    TransactionTooOld,
    TransactionCommitted,
    TransactionTooLargeForCache,
    TemporarilyUnavailable,
    PreparedTransactionInProgress,
    MaxTimeMSExpired,
    WriteConflict,
    DuplicateKey,
    BadValue,
    InvalidOptions,
    StaleConfig,
    TenantMigrationCommitted,
    TenantMigrationAborted,
    ReshardCollectionCommitted,
    ShardNotFound,
    Interrupted,
    InterruptedDueToReplStateChange,
    NotWritablePrimary,
    HostUnreachable,
    LockTimeout,
    ConflictingDecision,
    Internal,
    Io,
    Serialization,
    Corruption,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error types for Tessera
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The transaction is unknown, was superseded, or was already aborted
    #[error("No such transaction {txn}: {reason}")]
    NoSuchTransaction {
        /// Transaction that was addressed
        txn: TxnId,
        /// Why it is unknown
        reason: String,
    },

    /// A newer transaction already started on the session
    #[error("Cannot use txnNumber {requested} on session {lsid}: txnNumber {active} has already started")]
    TransactionTooOld {
        /// Session
        lsid: Lsid,
        /// Requested transaction number
        requested: TxnNumber,
        /// Currently active transaction number
        active: TxnNumber,
    },

    /// Abort (or a conflicting request) reached an already committed transaction
    #[error("Transaction {0} has been committed")]
    TransactionCommitted(TxnId),

    /// Buffered writes exceed the per-transaction limit
    #[error("Transaction {txn} is too large for the cache: {size} bytes exceeds {limit}")]
    TransactionTooLargeForCache {
        /// Transaction
        txn: TxnId,
        /// Buffered bytes including the rejected write
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Shard-wide resource pressure; retry the whole operation
    #[error("Temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// The session's transaction is prepared and cannot accept this request
    #[error("Transaction {0} is prepared; only commit or abort is allowed")]
    PreparedTransactionInProgress(TxnId),

    /// A bounded wait ran out of time
    #[error("Operation exceeded time limit: {0}")]
    MaxTimeMSExpired(String),

    /// Another transaction wrote the key first
    #[error("Write conflict on key {key}")]
    WriteConflict {
        /// Contended key
        key: Key,
    },

    /// Insert of an existing key
    #[error("Duplicate key {0}")]
    DuplicateKey(Key),

    /// Malformed argument
    #[error("Bad value: {0}")]
    BadValue(String),

    /// Request options are invalid for the transaction's state
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The addressed shard does not own the key (range moved)
    #[error("Stale config on shard {shard}: {message}")]
    StaleConfig {
        /// Shard that refused the request
        shard: ShardId,
        /// Details
        message: String,
    },

    /// The range was handed to another owner by a tenant migration
    #[error("Tenant migration committed for range {0}")]
    TenantMigrationCommitted(KeyRange),

    /// A tenant migration that blocked the request aborted
    #[error("Tenant migration aborted for range {0}")]
    TenantMigrationAborted(KeyRange),

    /// Resharding committed; the range has a new owner
    #[error("Resharding committed for range {0}")]
    ReshardCollectionCommitted(KeyRange),

    /// Unknown shard id
    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    /// Operation was killed or cancelled
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Operation was interrupted by a stepdown
    #[error("Interrupted due to replication state change: {0}")]
    InterruptedDueToReplStateChange(String),

    /// The node is not (or no longer) the primary for its data
    #[error("Not writable primary: {0}")]
    NotWritablePrimary(String),

    /// Transport failure while reaching another node
    #[error("Host unreachable {target}: {message}")]
    HostUnreachable {
        /// Node that could not be reached
        target: String,
        /// Details
        message: String,
    },

    /// Timed out waiting to acquire a range lock or critical section
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// A second, different decision was requested for a decided transaction
    #[error("Conflicting decision for {txn}: already {existing}, refused {requested}")]
    ConflictingDecision {
        /// Transaction
        txn: TxnId,
        /// Recorded outcome
        existing: String,
        /// Refused outcome
        requested: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl Error {
    /// Build an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Build an invalid-options error
    pub fn invalid_options(msg: impl Into<String>) -> Self {
        Error::InvalidOptions(msg.into())
    }

    /// Build a no-such-transaction error
    pub fn no_such_transaction(txn: TxnId, reason: impl Into<String>) -> Self {
        Error::NoSuchTransaction {
            txn,
            reason: reason.into(),
        }
    }

    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoSuchTransaction { .. } => ErrorCode::NoSuchTransaction,
            Error::TransactionTooOld { .. } => ErrorCode::TransactionTooOld,
            Error::TransactionCommitted(_) => ErrorCode::TransactionCommitted,
            Error::TransactionTooLargeForCache { .. } => ErrorCode::TransactionTooLargeForCache,
            Error::TemporarilyUnavailable(_) => ErrorCode::TemporarilyUnavailable,
            Error::PreparedTransactionInProgress(_) => ErrorCode::PreparedTransactionInProgress,
            Error::MaxTimeMSExpired(_) => ErrorCode::MaxTimeMSExpired,
            Error::WriteConflict { .. } => ErrorCode::WriteConflict,
            Error::DuplicateKey(_) => ErrorCode::DuplicateKey,
            Error::BadValue(_) => ErrorCode::BadValue,
            Error::InvalidOptions(_) => ErrorCode::InvalidOptions,
            Error::StaleConfig { .. } => ErrorCode::StaleConfig,
            Error::TenantMigrationCommitted(_) => ErrorCode::TenantMigrationCommitted,
            Error::TenantMigrationAborted(_) => ErrorCode::TenantMigrationAborted,
            Error::ReshardCollectionCommitted(_) => ErrorCode::ReshardCollectionCommitted,
            Error::ShardNotFound(_) => ErrorCode::ShardNotFound,
            Error::Interrupted(_) => ErrorCode::Interrupted,
            Error::InterruptedDueToReplStateChange(_) => ErrorCode::InterruptedDueToReplStateChange,
            Error::NotWritablePrimary(_) => ErrorCode::NotWritablePrimary,
            Error::HostUnreachable { .. } => ErrorCode::HostUnreachable,
            Error::LockTimeout(_) => ErrorCode::LockTimeout,
            Error::ConflictingDecision { .. } => ErrorCode::ConflictingDecision,
            Error::Internal(_) => ErrorCode::Internal,
            Error::Io(_) => ErrorCode::Io,
            Error::Serialization(_) => ErrorCode::Serialization,
            Error::Corruption(_) => ErrorCode::Corruption,
        }
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        classify(self)
    }

    /// True if the whole transaction should be retried from the start
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// True if the same request may be re-sent as-is
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// True if the error signals that a range changed owner
    pub fn is_stale_ownership(&self) -> bool {
        matches!(
            self,
            Error::StaleConfig { .. }
                | Error::TenantMigrationCommitted(_)
                | Error::ReshardCollectionCommitted(_)
        )
    }

    /// Labels attached when this error is returned for `command`
    pub fn labels(&self, command: CommandKind) -> Vec<ErrorLabel> {
        let kind = self.kind();
        match command {
            CommandKind::Commit => match (kind, self) {
                (ErrorKind::Retryable, _) | (_, Error::MaxTimeMSExpired(_)) => {
                    vec![ErrorLabel::UnknownTransactionCommitResult]
                }
                (ErrorKind::Transient, _) => vec![ErrorLabel::TransientTransactionError],
                _ => Vec::new(),
            },
            CommandKind::Statement | CommandKind::Abort => match kind {
                ErrorKind::Transient | ErrorKind::Retryable => {
                    vec![ErrorLabel::TransientTransactionError]
                }
                _ => Vec::new(),
            },
        }
    }
}

/// Classification driving retry and abort behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Local statement failure; the transaction remains usable
    Statement,
    /// The transaction is unusable; only abort is accepted
    TransactionFatal,
    /// Retry the entire transaction from the start
    Transient,
    /// Re-send the same request (network, stepdown)
    Retryable,
    /// Safety violation; never honored
    Invariant,
}

/// Classify an error
///
/// This is the single place that maps error variants to retry/abort
/// behavior.
pub fn classify(error: &Error) -> ErrorKind {
    match error {
        Error::DuplicateKey(_) | Error::BadValue(_) | Error::ShardNotFound(_) => {
            ErrorKind::Statement
        }

        Error::TransactionTooOld { .. }
        | Error::TransactionCommitted(_)
        | Error::PreparedTransactionInProgress(_)
        | Error::InvalidOptions(_)
        | Error::MaxTimeMSExpired(_)
        | Error::Internal(_)
        | Error::Serialization(_) => ErrorKind::TransactionFatal,

        Error::NoSuchTransaction { .. }
        | Error::TransactionTooLargeForCache { .. }
        | Error::TemporarilyUnavailable(_)
        | Error::WriteConflict { .. }
        | Error::StaleConfig { .. }
        | Error::TenantMigrationCommitted(_)
        | Error::TenantMigrationAborted(_)
        | Error::ReshardCollectionCommitted(_)
        | Error::LockTimeout(_) => ErrorKind::Transient,

        Error::Interrupted(_)
        | Error::InterruptedDueToReplStateChange(_)
        | Error::NotWritablePrimary(_)
        | Error::HostUnreachable { .. }
        | Error::Io(_) => ErrorKind::Retryable,

        Error::ConflictingDecision { .. } | Error::Corruption(_) => ErrorKind::Invariant,
    }
}

/// Command family an error is reported for (labels differ per family)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// CRUD statement inside a transaction
    Statement,
    /// commitTransaction
    Commit,
    /// abortTransaction
    Abort,
}

/// Error labels attached to client-visible errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorLabel {
    /// Retry the entire transaction
    TransientTransactionError,
    /// The commit may or may not have happened; retry commitTransaction
    UnknownTransactionCommitResult,
}
