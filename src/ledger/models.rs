use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// Lifecycle state of a single broadcast attempt
///
/// Pending is the only non-terminal state. A Dropped attempt is superseded by
/// a resend under the same nonce, never retried in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxState {
    Pending,
    Confirmed,
    Failed,
    Dropped,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Pending => "pending",
            TxState::Confirmed => "confirmed",
            TxState::Failed => "failed",
            TxState::Dropped => "dropped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxState::Pending)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TxState {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TxState::Pending),
            "confirmed" => Ok(TxState::Confirmed),
            "failed" => Ok(TxState::Failed),
            "dropped" => Ok(TxState::Dropped),
            other => Err(LedgerError::InvalidRow(format!(
                "unknown transaction state '{}'",
                other
            ))),
        }
    }
}

/// Unit of disbursement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutGroup {
    pub id: i64,
    /// Hash of the confirmed transaction that paid this group. Set at most once.
    pub final_tx_hash: Option<String>,
}

/// One owed payment. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Line in the source-of-record this payout came from
    pub line: i64,
    pub address: String,
    /// Fiat amount owed
    pub amount: Decimal,
    pub payout_group_id: i64,
    pub mandatory: bool,
    pub bonus: bool,
}

impl Payout {
    pub fn new(payout_group_id: i64, line: i64, address: impl Into<String>, amount: Decimal) -> Self {
        Self {
            line,
            address: address.into(),
            amount,
            payout_group_id,
            mandatory: false,
            bonus: false,
        }
    }
}

/// Receipt summary reported by the chain once a transaction is mined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub gas_used: i64,
}

/// One broadcast attempt for a payout group
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Chain-native hash, unique across the ledger
    pub hash: String,
    pub payout_group_id: i64,
    pub nonce: u64,
    pub owner: String,
    pub spender: String,
    /// Fiat price per token at submission time
    pub token_price: Decimal,
    /// Raw token base units transferred
    pub token_amount: BigDecimal,
    /// Opaque chain-specific payload
    pub raw: Vec<u8>,
    pub state: TxState,
    pub receipt: Option<TxReceipt>,
    pub created_at: DateTime<Utc>,
}

/// Chain status of one transaction, as reported by a payer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatus {
    pub hash: String,
    pub state: TxState,
    pub receipt: Option<TxReceipt>,
}

/// All attempts sharing one nonce for one payout group
///
/// Derived from the ledger; more than one transaction only appears when an
/// earlier attempt was dropped and re-sent under the same nonce.
#[derive(Debug, Clone, PartialEq)]
pub struct NonceGroup {
    pub payout_group_id: i64,
    pub nonce: u64,
    pub txs: Vec<Transaction>,
}

impl NonceGroup {
    pub fn new(tx: Transaction) -> Self {
        Self {
            payout_group_id: tx.payout_group_id,
            nonce: tx.nonce,
            txs: vec![tx],
        }
    }

    /// A group with no transactions has been finalized
    pub fn is_complete(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn hashes(&self) -> Vec<String> {
        self.txs.iter().map(|tx| tx.hash.clone()).collect()
    }
}

/// Singleton ledger metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: i64,
    pub attempts: i64,
    pub spender: Option<String>,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts for progress reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_payout_groups: i64,
    pub pending_payout_groups: i64,
    pub total_payouts: i64,
    pub pending_payouts: i64,
    pub total_transactions: i64,
    pub pending_transactions: i64,
    pub confirmed_transactions: i64,
    pub failed_transactions: i64,
    pub dropped_transactions: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutProgress {
    pub total_payouts: i64,
    pub pending_payouts: i64,
}

impl PayoutProgress {
    pub fn finished_payouts(&self) -> i64 {
        self.total_payouts - self.pending_payouts
    }
}
