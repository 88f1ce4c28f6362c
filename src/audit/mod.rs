pub mod receipts;
pub mod reconcile;
pub mod report;

pub use receipts::{JsonReceiptSink, PaymentReceipt, ReceiptSink};
pub use reconcile::{AuditOptions, IntentKey, PayoutIntent, ReconciliationEngine};
pub use report::{AuditReport, AuditStats, DoublePay, GroupOutcome, SourceMismatch, StateMismatch};

use crate::error::AppResult;
use crate::ledger::models::TxState;
use async_trait::async_trait;

/// Auditor trait - independent, read-only view of chain state
///
/// Implemented per mechanism, separately from the payer that sent the
/// transactions, so verification never trusts the sender's own reporting.
#[async_trait]
pub trait Auditor: Send + Sync {
    /// Current state of any transaction hash
    async fn check_transaction_state(&self, hash: &str) -> AppResult<TxState>;

    /// Stricter re-verification through the transaction receipt. Only
    /// called for hashes already reported Confirmed.
    async fn check_confirmed_transaction_state(&self, hash: &str) -> AppResult<TxState>;
}
