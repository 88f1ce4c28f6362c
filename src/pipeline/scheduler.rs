// Pipeline Scheduler - drains the unattached payout backlog into transactions
//
// Window strategy:
// - At most `max_pending` nonce groups in flight
// - Nonces are assigned locally from the window tail; the chain is only
//   asked when the window is empty
// - Groups are checked in nonce order and the pass stops at the first one
//   still pending
// - Any failed transfer aborts the run once the pass completes

use crate::error::{AppError, AppResult, ErrorContext, PipelineError};
use crate::ledger::models::*;
use crate::ledger::LedgerRepository;
use crate::payer::{token_amount, Payer};
use crate::quote_engine::Quoter;
use rust_decimal::Decimal;
use sqlx::types::BigDecimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum nonce groups in flight
    pub max_pending: usize,
    /// Sleep between status-check passes
    pub poll_interval: Duration,
    /// Delay between consecutive submissions, for nodes that misreport
    /// pending nonces under rapid-fire sends
    pub send_delay: Option<Duration>,
    /// Retry interval while payer preconditions are unmet
    pub precondition_retry: Duration,
    /// Finish in-flight work without admitting new payout groups
    pub drain: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pending: 5,
            poll_interval: Duration::from_secs(5),
            send_delay: None,
            precondition_retry: Duration::from_secs(5),
            drain: false,
        }
    }
}

/// What one `process_payouts` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub submitted: usize,
    pub resent: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub progress: PayoutProgress,
}

/// Pipeline scheduler - one per ledger, single writer
///
/// The window mirrors the ledger's pending transactions and is rebuilt
/// from it on every run. Ledger writes always happen before the window
/// is advanced.
pub struct PipelineScheduler {
    config: PipelineConfig,
    ledger: Arc<LedgerRepository>,
    payer: Arc<dyn Payer>,
    quoter: Arc<dyn Quoter>,
    cancel: CancellationToken,
    window: Vec<NonceGroup>,
    /// Highest nonce this process has assigned or recovered
    last_nonce: Option<u64>,
    summary: RunSummary,
}

impl PipelineScheduler {
    pub fn new(
        config: PipelineConfig,
        ledger: Arc<LedgerRepository>,
        payer: Arc<dyn Payer>,
        quoter: Arc<dyn Quoter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            ledger,
            payer,
            quoter,
            cancel,
            window: Vec::new(),
            last_nonce: None,
            summary: RunSummary::default(),
        }
    }

    pub fn window(&self) -> &[NonceGroup] {
        &self.window
    }

    /// Run until the backlog is drained and every in-flight nonce settles.
    ///
    /// Returns an error on any failed transfer, on cancellation, or on a
    /// fatal inconsistency. The ledger is always left resumable.
    #[instrument(skip(self), fields(mechanism = %self.payer.mechanism()))]
    pub async fn process_payouts(&mut self) -> AppResult<RunSummary> {
        if self.config.max_pending == 0 {
            return Err(PipelineError::InvalidWindow(self.config.max_pending).into());
        }
        self.summary = RunSummary::default();
        self.resume().await?;

        loop {
            if self.cancel.is_cancelled() {
                warn!("⚠️ Payout run cancelled");
                return Err(AppError::Cancelled);
            }

            self.trim();
            if !self.config.drain {
                self.fill().await?;
            }
            if self.window.is_empty() {
                break;
            }

            self.check().await?;
            self.trim();

            if !self.window.is_empty() {
                self.pause(self.config.poll_interval).await?;
            }
        }

        self.summary.progress = self.ledger.fetch_payout_progress().await?;
        info!(
            submitted = self.summary.submitted,
            resent = self.summary.resent,
            confirmed = self.summary.confirmed,
            finished = self.summary.progress.finished_payouts(),
            pending = self.summary.progress.pending_payouts,
            "✓ Payout run completed"
        );

        Ok(self.summary.clone())
    }

    /// Record the start, rebuild the window from the ledger and bring it
    /// up to date before any new work is admitted
    async fn resume(&mut self) -> AppResult<()> {
        let addresses = self.payer.addresses();
        let metadata = self
            .ledger
            .record_pipeline_start(&addresses.spender, addresses.owner.as_deref())
            .await?;

        self.rebuild_window().await?;

        let progress = self.ledger.fetch_payout_progress().await?;
        info!(
            attempt = metadata.attempts,
            spender = %addresses.spender,
            in_flight = self.window.len(),
            pending_payouts = progress.pending_payouts,
            total_payouts = progress.total_payouts,
            "🔄 Resuming payouts"
        );

        if !self.window.is_empty() {
            self.check().await?;
            self.trim();
        }
        Ok(())
    }

    async fn rebuild_window(&mut self) -> AppResult<()> {
        self.window = self
            .ledger
            .fetch_unfinished_transactions_sorted_into_nonce_groups()
            .await?;

        if let Some(tail) = self.window.last() {
            self.last_nonce = Some(self.last_nonce.map_or(tail.nonce, |n| n.max(tail.nonce)));
        }
        Ok(())
    }

    /// Drop finalized groups from the head of the window
    fn trim(&mut self) {
        let done = self.window.iter().take_while(|g| g.is_complete()).count();
        if done > 0 {
            self.window.drain(..done);
        }
    }

    /// Admit unattached payout groups until the window is full
    async fn fill(&mut self) -> AppResult<()> {
        while self.window.len() < self.config.max_pending {
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let Some(group) = self
                .ledger
                .fetch_first_unfinished_unattached_payout_group()
                .await?
            else {
                debug!("Backlog empty");
                break;
            };

            let nonce = self.next_nonce().await?;
            let tx = self.submit(group.id, nonce).await?;

            self.last_nonce = Some(nonce);
            self.window.push(NonceGroup::new(tx));
            self.summary.submitted += 1;

            if let Some(delay) = self.config.send_delay {
                self.pause(delay).await?;
            }
        }
        Ok(())
    }

    async fn next_nonce(&self) -> AppResult<u64> {
        if let Some(tail) = self.window.last() {
            return Ok(tail.nonce + 1);
        }

        let reported = self.payer.next_nonce().await.context("fetch next nonce")?;
        if let Some(last_assigned) = self.last_nonce {
            if reported <= last_assigned {
                error!(reported, last_assigned, "❌ Chain nonce regressed");
                return Err(PipelineError::NonceRegression {
                    reported,
                    last_assigned,
                }
                .into());
            }
        }
        Ok(reported)
    }

    /// Build, record and broadcast one transaction for a payout group
    async fn submit(&self, payout_group_id: i64, nonce: u64) -> AppResult<Transaction> {
        let payouts = self.ledger.fetch_payouts_for_group(payout_group_id).await?;
        if payouts.is_empty() {
            return Err(PipelineError::EmptyPayoutGroup(payout_group_id).into());
        }

        self.await_preconditions().await?;

        let price = self.quoter.quote().await.context("quote token price")?;
        let decimals = self
            .payer
            .token_decimals()
            .await
            .context("fetch token decimals")?;

        let fiat: Decimal = payouts.iter().map(|p| p.amount).sum();
        let amount = token_amount(fiat, price, decimals)?;
        if amount <= BigDecimal::from(0i64) {
            return Err(PipelineError::NonPositiveAmount {
                payout_group_id,
                amount: amount.to_string(),
            }
            .into());
        }

        let balance = self
            .payer
            .token_balance()
            .await
            .context("fetch token balance")?;
        if balance < amount {
            return Err(PipelineError::InsufficientBalance {
                required: amount.to_string(),
                available: balance.to_string(),
            }
            .into());
        }

        let (tx, from) = self
            .payer
            .create_raw_transaction(&payouts, nonce, price)
            .await
            .with_context(|| {
                format!(
                    "create transaction for payout group {} at nonce {}",
                    payout_group_id, nonce
                )
            })?;

        self.ledger
            .create_transaction(&tx)
            .await
            .with_context(|| format!("record transaction {}", tx.hash))?;

        self.payer
            .send_transaction(&tx)
            .await
            .with_context(|| format!("send transaction {} at nonce {}", tx.hash, nonce))?;

        info!(
            group = payout_group_id,
            nonce,
            hash = %tx.hash,
            from = %from,
            amount = %tx.token_amount,
            price = %price,
            "✓ Submitted payout"
        );
        Ok(tx)
    }

    async fn await_preconditions(&self) -> AppResult<()> {
        loop {
            let unmet = self
                .payer
                .check_preconditions()
                .await
                .context("check preconditions")?;
            if unmet.is_empty() {
                return Ok(());
            }

            warn!(
                reasons = ?unmet,
                retry_ms = self.config.precondition_retry.as_millis() as u64,
                "⚠️ Preconditions unmet, waiting"
            );
            self.pause(self.config.precondition_retry).await?;
        }
    }

    /// One status pass over the window in nonce order
    async fn check(&mut self) -> AppResult<()> {
        let mut failed = 0usize;

        for i in 0..self.window.len() {
            if self.window[i].is_complete() {
                continue;
            }

            let payout_group_id = self.window[i].payout_group_id;
            let nonce = self.window[i].nonce;

            let (state, statuses) = self
                .payer
                .check_nonce_group(&self.window[i], failed > 0)
                .await
                .with_context(|| format!("check nonce {}", nonce))?;

            match state {
                TxState::Dropped => {
                    warn!(group = payout_group_id, nonce, "⚠️ Transaction dropped, resending");
                    let tx = self.submit(payout_group_id, nonce).await?;
                    self.window[i].txs.push(tx);
                    self.summary.resent += 1;
                    break;
                }
                TxState::Pending => {
                    debug!(group = payout_group_id, nonce, "Nonce still pending");
                    break;
                }
                TxState::Failed => {
                    self.ledger
                        .finalize_nonce_group(&self.window[i], &statuses)
                        .await
                        .with_context(|| format!("finalize failed nonce {}", nonce))?;
                    error!(group = payout_group_id, nonce, "❌ Transaction failed");
                    self.window[i].txs.clear();
                    self.summary.failed += 1;
                    failed += 1;
                }
                TxState::Confirmed => {
                    self.ledger
                        .finalize_nonce_group(&self.window[i], &statuses)
                        .await
                        .with_context(|| format!("finalize confirmed nonce {}", nonce))?;
                    info!(group = payout_group_id, nonce, "✓ Payout confirmed");
                    self.window[i].txs.clear();
                    self.summary.confirmed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(PipelineError::TransactionsFailed { count: failed }.into());
        }
        Ok(())
    }

    async fn pause(&self, duration: Duration) -> AppResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!("⚠️ Cancellation requested");
                Err(AppError::Cancelled)
            }
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payer::sim::{SimChain, SimFate, SimPayer};
    use crate::quote_engine::FixedQuoter;
    use rust_decimal_macros::dec;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _dir: TempDir,
        ledger: Arc<LedgerRepository>,
        chain: Arc<SimChain>,
        cancel: CancellationToken,
    }

    fn units(tokens: i64) -> BigDecimal {
        BigDecimal::from(tokens * 1_000_000)
    }

    fn config(max_pending: usize) -> PipelineConfig {
        PipelineConfig {
            max_pending,
            poll_interval: Duration::from_millis(10),
            send_delay: None,
            precondition_retry: Duration::from_millis(10),
            drain: false,
        }
    }

    async fn harness(amounts: &[Decimal]) -> Harness {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sim.db");
        LedgerRepository::initialize(&path).await.unwrap();
        let ledger = Arc::new(LedgerRepository::open(&path, false).await.unwrap());

        let groups: Vec<(i64, Vec<Payout>)> = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                let id = i as i64 + 1;
                (id, vec![Payout::new(id, id + 1, format!("0xpayee{}", id), *amount)])
            })
            .collect();
        ledger.create_payout_groups(&groups).await.unwrap();

        let chain = Arc::new(SimChain::new(6, "0xspender", None));
        chain.fund(units(1_000));

        Harness {
            _dir: dir,
            ledger,
            chain,
            cancel: CancellationToken::new(),
        }
    }

    impl Harness {
        fn scheduler(&self, config: PipelineConfig) -> PipelineScheduler {
            PipelineScheduler::new(
                config,
                self.ledger.clone(),
                Arc::new(SimPayer::new(self.chain.clone())),
                Arc::new(FixedQuoter::new(dec!(1))),
                self.cancel.clone(),
            )
        }
    }

    fn nonces(scheduler: &PipelineScheduler) -> Vec<u64> {
        scheduler.window().iter().map(|g| g.nonce).collect()
    }

    #[tokio::test]
    async fn test_window_admits_in_nonce_order() {
        let h = harness(&[dec!(1), dec!(2), dec!(3)]).await;
        h.chain.set_auto_mine(false);
        let mut scheduler = h.scheduler(config(2));

        scheduler.resume().await.unwrap();
        scheduler.fill().await.unwrap();
        assert_eq!(nonces(&scheduler), vec![0, 1]);
        let groups: Vec<i64> = scheduler.window().iter().map(|g| g.payout_group_id).collect();
        assert_eq!(groups, vec![1, 2]);

        h.chain.mine();
        scheduler.check().await.unwrap();
        scheduler.trim();
        assert!(scheduler.window().is_empty());

        scheduler.fill().await.unwrap();
        assert_eq!(nonces(&scheduler), vec![2]);
        assert_eq!(scheduler.window()[0].payout_group_id, 3);

        h.chain.set_auto_mine(true);
        scheduler.process_payouts().await.unwrap();

        assert_eq!(h.chain.balance_of("0xpayee1"), units(1));
        assert_eq!(h.chain.balance_of("0xpayee2"), units(2));
        assert_eq!(h.chain.balance_of("0xpayee3"), units(3));

        let txs = h.ledger.fetch_transactions().await.unwrap();
        let assigned: Vec<(i64, u64)> = txs.iter().map(|t| (t.payout_group_id, t.nonce)).collect();
        assert_eq!(assigned, vec![(1, 0), (2, 1), (3, 2)]);
        assert!(txs.iter().all(|t| t.state == TxState::Confirmed));
    }

    #[tokio::test]
    async fn test_full_run_pays_everyone() {
        let h = harness(&[dec!(1), dec!(2), dec!(3)]).await;
        let mut scheduler = h.scheduler(config(2));

        let summary = scheduler.process_payouts().await.unwrap();
        assert_eq!(summary.submitted, 3);
        assert_eq!(summary.confirmed, 3);
        assert_eq!(summary.progress.pending_payouts, 0);

        let groups = h.ledger.fetch_payout_groups().await.unwrap();
        assert!(groups.iter().all(|g| g.final_tx_hash.is_some()));
        assert_eq!(h.chain.balance_of("0xspender"), units(994));
    }

    #[tokio::test]
    async fn test_failed_transfer_aborts_then_resumes_on_next_nonce() {
        let h = harness(&[dec!(1)]).await;
        h.chain.schedule_fate(0, SimFate::Revert);
        let mut scheduler = h.scheduler(config(2));

        let err = scheduler.process_payouts().await.unwrap_err();
        assert!(matches!(
            err.root(),
            AppError::Pipeline(PipelineError::TransactionsFailed { count: 1 })
        ));

        let txs = h.ledger.fetch_transactions().await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].state, TxState::Failed);

        scheduler.process_payouts().await.unwrap();

        let txs = h.ledger.fetch_transactions().await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].payout_group_id, 1);
        assert_eq!(txs[1].nonce, 1);
        assert_eq!(txs[1].state, TxState::Confirmed);

        let groups = h.ledger.fetch_payout_groups().await.unwrap();
        assert_eq!(groups[0].final_tx_hash.as_deref(), Some(txs[1].hash.as_str()));
        assert_eq!(h.chain.balance_of("0xpayee1"), units(1));
    }

    #[tokio::test]
    async fn test_dropped_transaction_resent_under_same_nonce() {
        let h = harness(&[dec!(1)]).await;
        h.chain.schedule_fate(0, SimFate::Drop);
        let mut scheduler = h.scheduler(config(1));

        let summary = scheduler.process_payouts().await.unwrap();
        assert_eq!(summary.resent, 1);

        let txs = h.ledger.fetch_transactions().await.unwrap();
        assert_eq!(txs.len(), 2);
        assert!(txs.iter().all(|t| t.nonce == 0 && t.payout_group_id == 1));
        assert_eq!(txs[0].state, TxState::Dropped);
        assert_eq!(txs[1].state, TxState::Confirmed);

        let groups = h.ledger.fetch_payout_groups().await.unwrap();
        assert_eq!(groups[0].final_tx_hash.as_deref(), Some(txs[1].hash.as_str()));
        assert_eq!(h.chain.balance_of("0xpayee1"), units(1));
    }

    #[tokio::test]
    async fn test_nonce_regression_aborts() {
        let h = harness(&[dec!(1), dec!(2)]).await;
        let mut scheduler = h.scheduler(config(1));

        scheduler.resume().await.unwrap();
        scheduler.fill().await.unwrap();
        h.chain.report_nonce(Some(0));
        scheduler.check().await.unwrap();
        scheduler.trim();

        let err = scheduler.fill().await.unwrap_err();
        assert!(matches!(
            err.root(),
            AppError::Pipeline(PipelineError::NonceRegression {
                reported: 0,
                last_assigned: 0
            })
        ));
        assert_eq!(h.ledger.stats().await.unwrap().total_transactions, 1);
    }

    #[tokio::test]
    async fn test_restart_rebuilds_same_window() {
        let h = harness(&[dec!(1), dec!(2), dec!(3)]).await;
        h.chain.set_auto_mine(false);

        let mut first = h.scheduler(config(3));
        first.resume().await.unwrap();
        first.fill().await.unwrap();
        let before: Vec<(u64, Vec<String>)> =
            first.window().iter().map(|g| (g.nonce, g.hashes())).collect();
        drop(first);

        let mut second = h.scheduler(config(3));
        second.resume().await.unwrap();
        let after: Vec<(u64, Vec<String>)> =
            second.window().iter().map(|g| (g.nonce, g.hashes())).collect();
        assert_eq!(before, after);

        h.chain.set_auto_mine(true);
        let summary = second.process_payouts().await.unwrap();
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.confirmed, 3);
        assert_eq!(h.ledger.stats().await.unwrap().total_transactions, 3);
    }

    #[tokio::test]
    async fn test_waits_out_unmet_preconditions() {
        let h = harness(&[dec!(1)]).await;
        h.chain.script_preconditions(vec![
            vec!["base fee too high".to_string()],
            vec!["base fee too high".to_string()],
        ]);
        let mut scheduler = h.scheduler(config(1));

        scheduler.process_payouts().await.unwrap();
        assert_eq!(h.chain.precondition_checks(), 3);
        assert_eq!(h.chain.balance_of("0xpayee1"), units(1));
    }

    #[tokio::test]
    async fn test_zero_window_rejected() {
        let h = harness(&[dec!(1)]).await;
        let mut scheduler = h.scheduler(config(0));

        let err = scheduler.process_payouts().await.unwrap_err();
        assert!(matches!(
            err.root(),
            AppError::Pipeline(PipelineError::InvalidWindow(0))
        ));
        let progress = h.ledger.fetch_payout_progress().await.unwrap();
        assert_eq!(progress.pending_payouts, 1);
        assert_eq!(h.ledger.stats().await.unwrap().total_transactions, 0);
    }

    #[tokio::test]
    async fn test_send_delay_spaces_submissions() {
        let h = harness(&[dec!(1), dec!(2), dec!(3)]).await;
        let mut scheduler = h.scheduler(PipelineConfig {
            send_delay: Some(Duration::from_millis(100)),
            ..config(3)
        });

        let started = tokio::time::Instant::now();
        let summary = scheduler.process_payouts().await.unwrap();
        assert_eq!(summary.submitted, 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(h.chain.balance_of("0xpayee3"), units(3));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_send_delay() {
        let h = harness(&[dec!(1), dec!(2)]).await;
        let mut scheduler = h.scheduler(PipelineConfig {
            send_delay: Some(Duration::from_secs(60)),
            ..config(2)
        });

        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), scheduler.process_payouts())
            .await
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(h.ledger.stats().await.unwrap().total_transactions, 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_precondition_wait() {
        let h = harness(&[dec!(1)]).await;
        h.chain
            .script_preconditions(vec![vec!["base fee too high".to_string()]; 1_000]);
        let mut scheduler = h.scheduler(PipelineConfig {
            precondition_retry: Duration::from_secs(60),
            ..config(1)
        });

        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), scheduler.process_payouts())
            .await
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(h.chain.precondition_checks(), 1);
        assert_eq!(h.ledger.stats().await.unwrap().total_transactions, 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_poll() {
        let h = harness(&[dec!(1)]).await;
        h.chain.set_auto_mine(false);
        let mut scheduler = h.scheduler(PipelineConfig {
            poll_interval: Duration::from_secs(60),
            ..config(1)
        });

        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), scheduler.process_payouts())
            .await
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());

        // the broadcast attempt is durable and resumable
        let pending = h
            .ledger
            .fetch_unfinished_transactions_sorted_into_nonce_groups()
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_finishes_in_flight_only() {
        let h = harness(&[dec!(1), dec!(2)]).await;
        h.chain.set_auto_mine(false);
        let mut first = h.scheduler(config(1));
        first.resume().await.unwrap();
        first.fill().await.unwrap();

        h.chain.set_auto_mine(true);
        let mut draining = h.scheduler(PipelineConfig {
            drain: true,
            ..config(1)
        });
        let summary = draining.process_payouts().await.unwrap();
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.progress.pending_payouts, 1);

        let stats = h.ledger.stats().await.unwrap();
        assert_eq!(stats.total_transactions, 1);
        assert_eq!(stats.confirmed_transactions, 1);
    }

    #[tokio::test]
    async fn test_zero_token_amount_refused() {
        let h = harness(&[dec!(0.0000001)]).await;
        let mut scheduler = h.scheduler(config(1));

        let err = scheduler.process_payouts().await.unwrap_err();
        assert!(matches!(
            err.root(),
            AppError::Pipeline(PipelineError::NonPositiveAmount { payout_group_id: 1, .. })
        ));
        assert_eq!(h.ledger.stats().await.unwrap().total_transactions, 0);
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_fatal() {
        let h = harness(&[dec!(5000)]).await;
        let mut scheduler = h.scheduler(config(1));

        let err = scheduler.process_payouts().await.unwrap_err();
        assert!(matches!(
            err.root(),
            AppError::Pipeline(PipelineError::InsufficientBalance { .. })
        ));
    }
}
