use std::path::PathBuf;

use thiserror::Error;

use crate::payer::Mechanism;

/// Top-level error type for the payout pipeline
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Quote unavailable: {0}")]
    Quote(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), AppError::Cancelled)
    }
}

/// Ledger (storage) errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("Ledger not found at {0}")]
    NotFound(PathBuf),

    #[error("Ledger at {0} is locked by another process")]
    Locked(PathBuf),

    #[error("Ledger schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("Ledger schema version {found} needs migration to {supported}; open read-write first")]
    MigrationRequired { found: i64, supported: i64 },

    #[error("Transaction {0} already recorded")]
    DuplicateTransaction(String),

    #[error("Nonce {nonce} is shared by payout groups {first} and {second}")]
    NonceGroupCorrupted { nonce: u64, first: i64, second: i64 },

    #[error("Ledger {field} mismatch: recorded {recorded}, attempted {attempted}")]
    MetadataMismatch {
        field: &'static str,
        recorded: String,
        attempted: String,
    },

    #[error("Payout group {payout_group_id} already finalized by {existing}, refusing {attempted}")]
    FinalHashConflict {
        payout_group_id: i64,
        existing: String,
        attempted: String,
    },

    #[error("Transaction {0} is not pending in this nonce group")]
    UnknownTransaction(String),

    #[error("Invalid ledger row: {0}")]
    InvalidRow(String),
}

/// Scheduler errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Chain reported next nonce {reported} but nonce {last_assigned} was already assigned")]
    NonceRegression { reported: u64, last_assigned: u64 },

    #[error("{count} transaction(s) failed; resolve the cause before resuming")]
    TransactionsFailed { count: usize },

    #[error("Payout group {payout_group_id} computes to non-positive token amount {amount}")]
    NonPositiveAmount { payout_group_id: i64, amount: String },

    #[error("Insufficient token balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Invalid token price: {0}")]
    InvalidPrice(String),

    #[error("Payout group {0} has no payouts")]
    EmptyPayoutGroup(i64),

    #[error("Window depth must be at least 1, got {0}")]
    InvalidWindow(usize),
}

/// Chain capability errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("{operation} failed: {message}")]
    Rpc { operation: String, message: String },

    #[error("Insufficient allowance: required {required}, available {available}")]
    InsufficientAllowance { required: String, available: String },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Malformed transaction {0}")]
    MalformedTransaction(String),

    #[error("No capability registered for mechanism {0}")]
    UnsupportedMechanism(Mechanism),
}

/// Attach operation context (hash, nonce, path) to an error on its way up
pub trait ErrorContext<T> {
    fn context<C: Into<String>>(self, context: C) -> AppResult<T>;

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> AppResult<T>;
}

impl<T, E: Into<AppError>> ErrorContext<T> for Result<T, E> {
    fn context<C: Into<String>>(self, context: C) -> AppResult<T> {
        self.map_err(|e| AppError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> AppResult<T> {
        self.map_err(|e| AppError::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_root() {
        let result: Result<(), LedgerError> =
            Err(LedgerError::DuplicateTransaction("0xabc".to_string()));
        let err = result.context("create transaction 0xabc").unwrap_err();

        assert!(matches!(
            err.root(),
            AppError::Ledger(LedgerError::DuplicateTransaction(_))
        ));
        assert_eq!(
            err.to_string(),
            "create transaction 0xabc: Ledger error: Transaction 0xabc already recorded"
        );
    }

    #[test]
    fn test_cancelled_through_context() {
        let result: AppResult<()> = Err(AppError::Cancelled);
        let err = result.with_context(|| "poll").unwrap_err();
        assert!(err.is_cancelled());
    }
}
