use crate::ledger::models::TxState;
use crate::payer::Mechanism;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use sqlx::types::BigDecimal;
use std::collections::BTreeMap;
use std::fmt::Display;

/// Verified outcome of one payout group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOutcome {
    /// No transaction was ever sent
    Unstarted,
    /// Exactly one transaction re-verified as confirmed
    Confirmed,
    /// More than one transaction re-verified as confirmed
    Overpaid,
    /// The ledger records a confirmation the chain does not back up
    FalseConfirmed,
    Pending,
    Failed,
    Dropped,
    Unknown,
}

/// Intent and ledger disagree for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMismatch {
    pub key: String,
    pub intent_amount: Option<Decimal>,
    pub ledger_amount: Option<Decimal>,
}

/// Ledger and chain disagree about a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateMismatch {
    pub hash: String,
    pub payout_group_id: i64,
    pub ledger_state: TxState,
    pub chain_state: TxState,
}

/// A transaction the ledger gave up on that the chain confirmed anyway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoublePay {
    pub hash: String,
    pub payout_group_id: i64,
    pub nonce: u64,
    #[serde(serialize_with = "as_string")]
    pub token_amount: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub payout_group_id: i64,
    pub outcome: GroupOutcome,
    pub confirmed_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub groups: usize,
    pub transactions: usize,
    pub source_mismatches: usize,
    pub state_mismatches: usize,
    pub double_pays: usize,
    /// Raw token base units paid twice
    #[serde(serialize_with = "as_string")]
    pub double_paid_amount: BigDecimal,
    pub outcomes: BTreeMap<GroupOutcome, usize>,
}

impl Default for AuditStats {
    fn default() -> Self {
        Self {
            groups: 0,
            transactions: 0,
            source_mismatches: 0,
            state_mismatches: 0,
            double_pays: 0,
            double_paid_amount: BigDecimal::from(0i64),
            outcomes: BTreeMap::new(),
        }
    }
}

impl AuditStats {
    pub fn outcome_count(&self, outcome: GroupOutcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

/// Point-in-time verification of one ledger
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub mechanism: Mechanism,
    pub generated_at: DateTime<Utc>,
    pub stats: AuditStats,
    pub groups: Vec<GroupReport>,
    pub source_mismatches: Vec<SourceMismatch>,
    pub state_mismatches: Vec<StateMismatch>,
    pub double_pays: Vec<DoublePay>,
    pub receipts_written: bool,
}

impl AuditReport {
    pub fn all_confirmed(&self) -> bool {
        !self.groups.is_empty()
            && self.groups.iter().all(|g| g.outcome == GroupOutcome::Confirmed)
    }

    /// Everything paid exactly once and nothing disagrees
    pub fn is_clean(&self) -> bool {
        self.all_confirmed()
            && self.source_mismatches.is_empty()
            && self.state_mismatches.is_empty()
            && self.double_pays.is_empty()
    }
}

fn as_string<S: Serializer, T: Display>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_amounts_as_strings() {
        let mut stats = AuditStats {
            double_pays: 1,
            double_paid_amount: BigDecimal::from(1_500_000i64),
            ..AuditStats::default()
        };
        stats.outcomes.insert(GroupOutcome::Overpaid, 1);

        let report = AuditReport {
            mechanism: Mechanism::Sim,
            generated_at: Utc::now(),
            stats,
            groups: vec![GroupReport {
                payout_group_id: 1,
                outcome: GroupOutcome::Overpaid,
                confirmed_hash: None,
            }],
            source_mismatches: vec![],
            state_mismatches: vec![],
            double_pays: vec![],
            receipts_written: false,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stats"]["double_paid_amount"], "1500000");
        assert_eq!(json["stats"]["outcomes"]["overpaid"], 1);
        assert_eq!(json["mechanism"], "sim");
        assert!(!report.is_clean());
    }
}
