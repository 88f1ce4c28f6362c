use crate::audit::{AuditOptions, AuditReport, JsonReceiptSink, PayoutIntent, ReconciliationEngine};
use crate::config::Config;
use crate::error::{AppResult, ErrorContext};
use crate::ledger::models::{LedgerStats, Payout};
use crate::ledger::LedgerRepository;
use crate::payer::sim::{SimAuditor, SimChain, SimPayer};
use crate::payer::{token_amount, Mechanism, MechanismRouter};
use crate::pipeline::PipelineScheduler;
use crate::quote_engine::{CachedQuoter, FixedQuoter};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SIM_SPENDER: &str = "0x5157000000000000000000000000000000000001";

/// Read a JSON array of `{ line, address, amount }` rows
pub async fn load_intent(path: impl AsRef<Path>) -> AppResult<Vec<PayoutIntent>> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read intent {}", path.display()))?;
    let intent: Vec<PayoutIntent> = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse intent {}", path.display()))?;
    info!(path = %path.display(), rows = intent.len(), "📋 Loaded payout intent");
    Ok(intent)
}

/// Create a new ledger holding one payout group per intent row
pub async fn create_ledger(path: &Path, intent: &[PayoutIntent]) -> AppResult<()> {
    LedgerRepository::initialize(path).await?;

    let ledger = LedgerRepository::open(path, false).await?;
    let groups: Vec<(i64, Vec<Payout>)> = intent
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let id = i as i64 + 1;
            (id, vec![Payout::new(id, row.line, row.address.clone(), row.amount)])
        })
        .collect();
    let result = ledger.create_payout_groups(&groups).await;
    ledger.close().await;
    result?;

    info!(path = %path.display(), groups = groups.len(), "✅ Ledger created");
    Ok(())
}

/// Progress of the configured ledger, read without taking the write lock
pub async fn stats(config: &Config) -> AppResult<LedgerStats> {
    let ledger = LedgerRepository::open(config.ledger_path(), true).await?;
    let stats = ledger.stats().await?;
    ledger.close().await;

    info!(
        groups = stats.total_payout_groups,
        pending_groups = stats.pending_payout_groups,
        transactions = stats.total_transactions,
        pending = stats.pending_transactions,
        confirmed = stats.confirmed_transactions,
        failed = stats.failed_transactions,
        dropped = stats.dropped_transactions,
        "📊 Ledger stats"
    );
    Ok(stats)
}

/// End-to-end dry run: fresh ledger, funded in-memory chain, full payout
/// run, then an audit of the result with receipts written to
/// `receipts_path`.
pub async fn rehearse(
    config: &Config,
    intent_path: impl AsRef<Path>,
    cancel: CancellationToken,
) -> AppResult<AuditReport> {
    let intent = load_intent(intent_path).await?;
    let path = config.ledger_path();
    create_ledger(&path, &intent).await?;

    let total: Decimal = intent.iter().map(|row| row.amount).sum();
    let chain = Arc::new(SimChain::new(config.sim_decimals, SIM_SPENDER, None));
    chain.fund(token_amount(total, config.sim_price, config.sim_decimals)?);

    info!("⚙️  Initializing payment mechanisms...");
    let mut router = MechanismRouter::new();
    router.register_payer(Arc::new(SimPayer::new(chain.clone())));
    router.register_auditor(Mechanism::Sim, Arc::new(SimAuditor::new(chain)));

    let payer = router.payer(config.mechanism)?;
    let quoter = Arc::new(CachedQuoter::new(
        Arc::new(FixedQuoter::new(config.sim_price)),
        config.quote_ttl_ms,
    ));

    let ledger = Arc::new(LedgerRepository::open(&path, false).await?);
    let mut scheduler = PipelineScheduler::new(
        config.pipeline_config()?,
        ledger.clone(),
        payer,
        quoter,
        cancel,
    );
    let summary = scheduler.process_payouts().await?;
    info!(
        submitted = summary.submitted,
        confirmed = summary.confirmed,
        resent = summary.resent,
        "✅ Rehearsal payouts finished"
    );

    let reader = Arc::new(LedgerRepository::open(&path, true).await?);
    let engine = ReconciliationEngine::new(reader, router.auditor(config.mechanism)?, config.mechanism);
    let mut sink = JsonReceiptSink::new(&config.receipts_path);
    let options = AuditOptions {
        force_receipts: config.force_receipts,
        ..AuditOptions::default()
    };

    engine.reconcile(&intent, &mut sink, &options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::PaymentReceipt;
    use crate::error::{AppError, ChainError, LedgerError};
    use config::Environment;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn config(dir: &Path, mechanism: &str) -> Config {
        let vars: HashMap<String, String> = [
            ("PAYOUTS_LEDGER_DIR", dir.display().to_string()),
            ("PAYOUTS_BATCH_NAME", "rehearsal".to_string()),
            ("PAYOUTS_MECHANISM", mechanism.to_string()),
            ("PAYOUTS_POLL_INTERVAL_MS", "10".to_string()),
            ("PAYOUTS_PRECONDITION_RETRY_MS", "10".to_string()),
            ("PAYOUTS_MAX_PENDING", "2".to_string()),
            ("PAYOUTS_SIM_PRICE", "0.5".to_string()),
            (
                "PAYOUTS_RECEIPTS_PATH",
                dir.join("receipts.json").display().to_string(),
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Config::load(Environment::with_prefix("PAYOUTS").source(Some(vars))).unwrap()
    }

    async fn write_intent(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("intent.json");
        let rows = r#"[
            {"line": 2, "address": "0xalice", "amount": "1.00"},
            {"line": 3, "address": "0xbob", "amount": "2.50"},
            {"line": 4, "address": "0xcarol", "amount": "3"}
        ]"#;
        tokio::fs::write(&path, rows).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_rehearsal_pays_and_audits_clean() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), "sim");
        let intent = write_intent(dir.path()).await;

        let report = rehearse(&config, &intent, CancellationToken::new()).await.unwrap();
        assert!(report.is_clean());
        assert!(report.receipts_written);
        assert_eq!(report.stats.groups, 3);

        let bytes = tokio::fs::read(dir.path().join("receipts.json")).await.unwrap();
        let receipts: Vec<PaymentReceipt> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(receipts.len(), 3);
        assert_eq!(receipts[1].address, "0xbob");

        let stats = stats(&config).await.unwrap();
        assert_eq!(stats.confirmed_transactions, 3);
        assert_eq!(stats.pending_payout_groups, 0);

        // a rehearsal never reuses a ledger
        let err = rehearse(&config, &intent, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.root(), AppError::Ledger(LedgerError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_rehearsal_needs_registered_mechanism() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), "eth");
        let intent = write_intent(dir.path()).await;

        let err = rehearse(&config, &intent, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err.root(),
            AppError::Chain(ChainError::UnsupportedMechanism(Mechanism::Eth))
        ));
    }
}
