use super::receipts::{PaymentReceipt, ReceiptSink};
use super::report::*;
use super::Auditor;
use crate::error::{AppResult, ErrorContext};
use crate::ledger::models::*;
use crate::ledger::LedgerRepository;
use crate::payer::Mechanism;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// How intent rows are matched against ledger payouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntentKey {
    /// Destination address (amounts summed per address)
    #[default]
    Address,
    /// Source line, for single-batch ledgers
    Line,
}

/// One row of the declarative source of payout intent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PayoutIntent {
    pub line: i64,
    pub address: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct AuditOptions {
    /// Export receipts for confirmed groups even if others are not confirmed
    pub force_receipts: bool,
    pub key: IntentKey,
}

/// Reconciliation engine - verifies a ledger against intent and chain
///
/// Only reads the ledger (a read-only handle is enough) and never writes
/// payout or transaction rows.
pub struct ReconciliationEngine {
    ledger: Arc<LedgerRepository>,
    auditor: Arc<dyn Auditor>,
    mechanism: Mechanism,
}

impl ReconciliationEngine {
    pub fn new(ledger: Arc<LedgerRepository>, auditor: Arc<dyn Auditor>, mechanism: Mechanism) -> Self {
        Self {
            ledger,
            auditor,
            mechanism,
        }
    }

    #[instrument(skip_all, fields(mechanism = %self.mechanism, intent_rows = intent.len()))]
    pub async fn reconcile(
        &self,
        intent: &[PayoutIntent],
        sink: &mut dyn ReceiptSink,
        options: &AuditOptions,
    ) -> AppResult<AuditReport> {
        let groups = self.ledger.fetch_payout_groups().await?;
        let payouts = self.ledger.fetch_payouts().await?;
        let txs = self.ledger.fetch_transactions().await?;

        let mut stats = AuditStats {
            groups: groups.len(),
            transactions: txs.len(),
            ..AuditStats::default()
        };

        // 1. intent vs ledger, no chain calls
        let source_mismatches = reconcile_source(intent, &payouts, options.key);
        for mismatch in &source_mismatches {
            warn!(
                key = %mismatch.key,
                intent = ?mismatch.intent_amount,
                ledger = ?mismatch.ledger_amount,
                "⚠️ Source mismatch"
            );
        }
        stats.source_mismatches = source_mismatches.len();

        // 2. ledger vs chain, per transaction
        let mut chain_states: HashMap<&str, TxState> = HashMap::new();
        let mut state_mismatches = Vec::new();
        let mut double_pays = Vec::new();

        for tx in &txs {
            let chain_state = self
                .auditor
                .check_transaction_state(&tx.hash)
                .await
                .with_context(|| format!("audit transaction {}", tx.hash))?;
            chain_states.insert(tx.hash.as_str(), chain_state);

            if chain_state == tx.state {
                continue;
            }

            if tx.state == TxState::Dropped && chain_state == TxState::Confirmed {
                error!(
                    hash = %tx.hash,
                    group = tx.payout_group_id,
                    nonce = tx.nonce,
                    amount = %tx.token_amount,
                    "❌ Double pay: dropped transaction confirmed on chain"
                );
                stats.double_paid_amount = &stats.double_paid_amount + &tx.token_amount;
                double_pays.push(DoublePay {
                    hash: tx.hash.clone(),
                    payout_group_id: tx.payout_group_id,
                    nonce: tx.nonce,
                    token_amount: tx.token_amount.clone(),
                });
            } else {
                warn!(
                    hash = %tx.hash,
                    group = tx.payout_group_id,
                    ledger = %tx.state,
                    chain = %chain_state,
                    "⚠️ State mismatch"
                );
                state_mismatches.push(StateMismatch {
                    hash: tx.hash.clone(),
                    payout_group_id: tx.payout_group_id,
                    ledger_state: tx.state,
                    chain_state,
                });
            }
        }
        stats.double_pays = double_pays.len();
        stats.state_mismatches = state_mismatches.len();

        // 3. per-group outcome
        let mut txs_by_group: HashMap<i64, Vec<&Transaction>> = HashMap::new();
        for tx in &txs {
            txs_by_group.entry(tx.payout_group_id).or_default().push(tx);
        }

        let mut group_reports = Vec::with_capacity(groups.len());
        for group in &groups {
            let group_txs = txs_by_group.get(&group.id).map(Vec::as_slice).unwrap_or(&[]);
            let (outcome, confirmed_hash) = self.classify(group_txs, &chain_states).await?;

            if matches!(outcome, GroupOutcome::Overpaid | GroupOutcome::FalseConfirmed) {
                error!(group = group.id, outcome = ?outcome, "❌ Payout group verification failed");
            }
            *stats.outcomes.entry(outcome).or_insert(0) += 1;
            group_reports.push(GroupReport {
                payout_group_id: group.id,
                outcome,
                confirmed_hash,
            });
        }

        // 4. receipts, all or nothing unless forced
        // an empty ledger proves nothing was paid
        let all_confirmed = !group_reports.is_empty()
            && group_reports.iter().all(|g| g.outcome == GroupOutcome::Confirmed);
        let receipts_written = if all_confirmed || options.force_receipts {
            if !all_confirmed {
                warn!("⚠️ Forcing partial receipt export");
            }
            let receipts = self.receipts(&group_reports, &payouts);
            sink.write(&receipts).await.context("write receipts")?;
            true
        } else {
            warn!(
                confirmed = stats.outcome_count(GroupOutcome::Confirmed),
                groups = stats.groups,
                "⚠️ Not every payout group is confirmed; withholding receipts"
            );
            false
        };

        info!(
            groups = stats.groups,
            transactions = stats.transactions,
            source_mismatches = stats.source_mismatches,
            state_mismatches = stats.state_mismatches,
            double_pays = stats.double_pays,
            "✓ Audit completed"
        );

        Ok(AuditReport {
            mechanism: self.mechanism,
            generated_at: Utc::now(),
            stats,
            groups: group_reports,
            source_mismatches,
            state_mismatches,
            double_pays,
            receipts_written,
        })
    }

    async fn classify(
        &self,
        txs: &[&Transaction],
        chain_states: &HashMap<&str, TxState>,
    ) -> AppResult<(GroupOutcome, Option<String>)> {
        if txs.is_empty() {
            return Ok((GroupOutcome::Unstarted, None));
        }

        let mut reconfirmed: Vec<&str> = Vec::new();
        let mut signals: Vec<TxState> = Vec::new();

        for tx in txs {
            let state = chain_states
                .get(tx.hash.as_str())
                .copied()
                .unwrap_or(tx.state);
            if state != TxState::Confirmed {
                signals.push(state);
                continue;
            }

            let verified = self
                .auditor
                .check_confirmed_transaction_state(&tx.hash)
                .await
                .with_context(|| format!("re-verify transaction {}", tx.hash))?;
            if verified == TxState::Confirmed {
                reconfirmed.push(tx.hash.as_str());
            } else {
                signals.push(verified);
            }
        }

        match reconfirmed.as_slice() {
            [hash] => return Ok((GroupOutcome::Confirmed, Some(hash.to_string()))),
            [_, _, ..] => return Ok((GroupOutcome::Overpaid, None)),
            [] => {}
        }

        if txs.iter().any(|tx| tx.state == TxState::Confirmed) {
            return Ok((GroupOutcome::FalseConfirmed, None));
        }

        let outcome = if signals.contains(&TxState::Pending) {
            GroupOutcome::Pending
        } else if signals.contains(&TxState::Failed) {
            GroupOutcome::Failed
        } else if signals.contains(&TxState::Dropped) {
            GroupOutcome::Dropped
        } else {
            GroupOutcome::Unknown
        };
        Ok((outcome, None))
    }

    fn receipts(&self, groups: &[GroupReport], payouts: &[Payout]) -> Vec<PaymentReceipt> {
        let confirmed: HashMap<i64, &str> = groups
            .iter()
            .filter(|g| g.outcome == GroupOutcome::Confirmed)
            .filter_map(|g| g.confirmed_hash.as_deref().map(|h| (g.payout_group_id, h)))
            .collect();

        payouts
            .iter()
            .filter_map(|p| {
                confirmed.get(&p.payout_group_id).map(|hash| PaymentReceipt {
                    address: p.address.clone(),
                    amount: p.amount,
                    hash: hash.to_string(),
                    mechanism: self.mechanism,
                })
            })
            .collect()
    }
}

/// Compare intent with ledger payouts, summing amounts per key
pub fn reconcile_source(
    intent: &[PayoutIntent],
    payouts: &[Payout],
    key: IntentKey,
) -> Vec<SourceMismatch> {
    let mut wanted: BTreeMap<String, Decimal> = BTreeMap::new();
    for row in intent {
        let k = match key {
            IntentKey::Address => row.address.clone(),
            IntentKey::Line => row.line.to_string(),
        };
        *wanted.entry(k).or_insert(Decimal::ZERO) += row.amount;
    }

    let mut recorded: BTreeMap<String, Decimal> = BTreeMap::new();
    for payout in payouts {
        let k = match key {
            IntentKey::Address => payout.address.clone(),
            IntentKey::Line => payout.line.to_string(),
        };
        *recorded.entry(k).or_insert(Decimal::ZERO) += payout.amount;
    }

    let keys: BTreeSet<&String> = wanted.keys().chain(recorded.keys()).collect();
    keys.into_iter()
        .filter_map(|k| {
            let intent_amount = wanted.get(k).copied();
            let ledger_amount = recorded.get(k).copied();
            (intent_amount != ledger_amount).then(|| SourceMismatch {
                key: k.clone(),
                intent_amount,
                ledger_amount,
            })
        })
        .collect()
}
