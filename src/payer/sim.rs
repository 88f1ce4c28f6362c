//! In-memory chain for rehearsals and tests.
//!
//! `SimChain` models just enough of an account-based token chain to drive
//! the pipeline: per-sender nonces, a token balance with an optional
//! allowance, a mempool that can drop transactions, and reverts. Outcomes
//! for individual nonces can be scripted with [`SimFate`].

use super::{token_amount, Mechanism, Payer, PayerAddresses};
use crate::audit::Auditor;
use crate::error::{AppResult, ChainError};
use crate::ledger::models::*;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::types::BigDecimal;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

const GAS_BASE: i64 = 21_000;
const GAS_PER_TRANSFER: i64 = 35_000;

/// Scripted outcome for the next transaction mined at a nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFate {
    /// Evict from the mempool; the nonce stays unused
    Drop,
    /// Mine but revert; the nonce is consumed
    Revert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimStatus {
    Pending,
    Mined { success: bool, gas_used: i64 },
    Dropped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimTransfer {
    to: String,
    amount: String,
}

#[derive(Debug, Clone)]
struct SimTx {
    nonce: u64,
    sequence: u64,
    transfers: Vec<(String, BigDecimal)>,
    total: BigDecimal,
    status: SimStatus,
}

struct SimState {
    decimals: i32,
    spender: String,
    owner: Option<String>,
    balances: HashMap<String, BigDecimal>,
    allowance: BigDecimal,
    /// Next nonce the chain will mine
    next_nonce: u64,
    txs: HashMap<String, SimTx>,
    fates: HashMap<u64, SimFate>,
    auto_mine: bool,
    preconditions: VecDeque<Vec<String>>,
    precondition_checks: usize,
    reported_nonce: Option<u64>,
    sequence: u64,
}

impl SimState {
    fn source(&self) -> &str {
        self.owner.as_deref().unwrap_or(&self.spender)
    }

    fn balance(&self, address: &str) -> BigDecimal {
        self.balances
            .get(address)
            .cloned()
            .unwrap_or_else(|| BigDecimal::from(0i64))
    }

    /// Funds the transfer still lacks, if any
    fn shortfall(&self, amount: &BigDecimal) -> Option<ChainError> {
        if self.owner.is_some() && self.allowance < *amount {
            return Some(ChainError::InsufficientAllowance {
                required: amount.to_string(),
                available: self.allowance.to_string(),
            });
        }
        let balance = self.balance(self.source());
        if balance < *amount {
            return Some(ChainError::InsufficientBalance {
                required: amount.to_string(),
                available: balance.to_string(),
            });
        }
        None
    }

    fn mine(&mut self) {
        loop {
            let nonce = self.next_nonce;
            let candidate = self
                .txs
                .iter()
                .filter(|(_, tx)| tx.nonce == nonce && tx.status == SimStatus::Pending)
                .max_by_key(|(_, tx)| tx.sequence)
                .map(|(hash, _)| hash.clone());

            let Some(hash) = candidate else {
                break;
            };

            match self.fates.remove(&nonce) {
                Some(SimFate::Drop) => {
                    debug!(nonce, hash = %hash, "sim: dropped");
                    self.set_status(&hash, SimStatus::Dropped);
                }
                Some(SimFate::Revert) => {
                    debug!(nonce, hash = %hash, "sim: reverted");
                    self.set_status(&hash, SimStatus::Mined { success: false, gas_used: GAS_BASE });
                    self.next_nonce += 1;
                }
                None => {
                    let status = self.execute(&hash);
                    self.set_status(&hash, status);
                    self.next_nonce += 1;
                }
            }
        }
    }

    fn execute(&mut self, hash: &str) -> SimStatus {
        let Some(tx) = self.txs.get(hash).cloned() else {
            return SimStatus::Dropped;
        };
        let gas_used = GAS_BASE + GAS_PER_TRANSFER * tx.transfers.len() as i64;

        if self.shortfall(&tx.total).is_some() {
            debug!(nonce = tx.nonce, hash, "sim: transfer reverted for lack of funds");
            return SimStatus::Mined { success: false, gas_used };
        }

        let source = self.source().to_string();
        let remaining = self.balance(&source) - &tx.total;
        self.balances.insert(source, remaining);
        if self.owner.is_some() {
            self.allowance = &self.allowance - &tx.total;
        }
        for (to, amount) in &tx.transfers {
            let credited = self.balance(to) + amount;
            self.balances.insert(to.clone(), credited);
        }

        SimStatus::Mined { success: true, gas_used }
    }

    fn set_status(&mut self, hash: &str, status: SimStatus) {
        if let Some(tx) = self.txs.get_mut(hash) {
            tx.status = status;
        }
    }

    fn status(&self, hash: &str) -> TxStatus {
        let (state, receipt) = match self.txs.get(hash).map(|tx| tx.status) {
            Some(SimStatus::Pending) => (TxState::Pending, None),
            Some(SimStatus::Mined { success, gas_used }) => (
                if success { TxState::Confirmed } else { TxState::Failed },
                Some(TxReceipt { gas_used }),
            ),
            Some(SimStatus::Dropped) | None => (TxState::Dropped, None),
        };
        TxStatus {
            hash: hash.to_string(),
            state,
            receipt,
        }
    }
}

/// In-memory token chain
pub struct SimChain {
    state: Mutex<SimState>,
}

impl SimChain {
    pub fn new(decimals: i32, spender: &str, owner: Option<&str>) -> Self {
        Self {
            state: Mutex::new(SimState {
                decimals,
                spender: spender.to_string(),
                owner: owner.map(str::to_string),
                balances: HashMap::new(),
                allowance: BigDecimal::from(0i64),
                next_nonce: 0,
                txs: HashMap::new(),
                fates: HashMap::new(),
                auto_mine: true,
                preconditions: VecDeque::new(),
                precondition_checks: 0,
                reported_nonce: None,
                sequence: 0,
            }),
        }
    }

    pub fn decimals(&self) -> i32 {
        self.state.lock().decimals
    }

    /// Credit the paying account with raw base units
    pub fn fund(&self, amount: BigDecimal) {
        let mut state = self.state.lock();
        let source = state.source().to_string();
        let funded = state.balance(&source) + amount;
        state.balances.insert(source, funded);
    }

    pub fn approve(&self, allowance: BigDecimal) {
        self.state.lock().allowance = allowance;
    }

    pub fn allowance(&self) -> BigDecimal {
        self.state.lock().allowance.clone()
    }

    pub fn balance_of(&self, address: &str) -> BigDecimal {
        self.state.lock().balance(address)
    }

    /// When on, pending transactions are mined each time a nonce group is checked
    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state.lock().auto_mine = auto_mine;
    }

    pub fn schedule_fate(&self, nonce: u64, fate: SimFate) {
        self.state.lock().fates.insert(nonce, fate);
    }

    /// Queue unmet-precondition answers, consumed one per check
    pub fn script_preconditions(&self, answers: Vec<Vec<String>>) {
        self.state.lock().preconditions.extend(answers);
    }

    pub fn precondition_checks(&self) -> usize {
        self.state.lock().precondition_checks
    }

    /// Force the nonce reported to payers, as a lagging node would
    pub fn report_nonce(&self, nonce: Option<u64>) {
        self.state.lock().reported_nonce = nonce;
    }

    /// Mine every contiguous pending nonce
    pub fn mine(&self) {
        self.state.lock().mine();
    }

    pub fn transaction_status(&self, hash: &str) -> TxStatus {
        self.state.lock().status(hash)
    }

    fn next_nonce(&self) -> u64 {
        let state = self.state.lock();
        if let Some(reported) = state.reported_nonce {
            return reported;
        }
        let pending = state
            .txs
            .values()
            .filter(|tx| tx.status == SimStatus::Pending)
            .map(|tx| tx.nonce + 1)
            .max()
            .unwrap_or(0);
        pending.max(state.next_nonce)
    }

    fn next_sequence(&self) -> u64 {
        let mut state = self.state.lock();
        state.sequence += 1;
        state.sequence
    }

    fn broadcast(&self, hash: &str, nonce: u64, transfers: Vec<(String, BigDecimal)>) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.txs.contains_key(hash) {
            return Ok(());
        }
        if nonce < state.next_nonce {
            return Err(ChainError::Rpc {
                operation: "send transaction".to_string(),
                message: format!("nonce too low: {} < {}", nonce, state.next_nonce),
            }
            .into());
        }
        // a new attempt replaces whatever is still pending at this nonce
        for tx in state.txs.values_mut() {
            if tx.nonce == nonce && tx.status == SimStatus::Pending {
                tx.status = SimStatus::Dropped;
            }
        }
        state.sequence += 1;
        let sequence = state.sequence;
        let total = transfers
            .iter()
            .fold(BigDecimal::from(0i64), |acc, (_, amount)| acc + amount);
        state.txs.insert(
            hash.to_string(),
            SimTx {
                nonce,
                sequence,
                transfers,
                total,
                status: SimStatus::Pending,
            },
        );
        Ok(())
    }
}

/// `Payer` backed by a [`SimChain`]
pub struct SimPayer {
    chain: Arc<SimChain>,
}

impl SimPayer {
    pub fn new(chain: Arc<SimChain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Payer for SimPayer {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Sim
    }

    fn addresses(&self) -> PayerAddresses {
        let state = self.chain.state.lock();
        PayerAddresses {
            spender: state.spender.clone(),
            owner: state.owner.clone(),
        }
    }

    async fn next_nonce(&self) -> AppResult<u64> {
        Ok(self.chain.next_nonce())
    }

    async fn check_preconditions(&self) -> AppResult<Vec<String>> {
        let mut state = self.chain.state.lock();
        state.precondition_checks += 1;
        Ok(state.preconditions.pop_front().unwrap_or_default())
    }

    async fn token_balance(&self) -> AppResult<BigDecimal> {
        let state = self.chain.state.lock();
        Ok(state.balance(state.source()))
    }

    async fn token_decimals(&self) -> AppResult<i32> {
        Ok(self.chain.decimals())
    }

    async fn create_raw_transaction(
        &self,
        payouts: &[Payout],
        nonce: u64,
        price: Decimal,
    ) -> AppResult<(Transaction, String)> {
        let first = payouts
            .first()
            .ok_or_else(|| ChainError::MalformedTransaction(format!("nonce {} has no payouts", nonce)))?;

        let decimals = self.chain.decimals();
        let mut transfers = Vec::with_capacity(payouts.len());
        for payout in payouts {
            transfers.push((payout.address.clone(), token_amount(payout.amount, price, decimals)?));
        }
        let total = transfers
            .iter()
            .fold(BigDecimal::from(0i64), |acc, (_, amount)| acc + amount);

        let (spender, source) = {
            let state = self.chain.state.lock();
            if let Some(err) = state.shortfall(&total) {
                return Err(err.into());
            }
            (state.spender.clone(), state.source().to_string())
        };

        let payload: Vec<SimTransfer> = transfers
            .iter()
            .map(|(to, amount)| SimTransfer {
                to: to.clone(),
                amount: amount.to_string(),
            })
            .collect();
        let raw = serde_json::to_vec(&payload)?;

        let mut hasher = Sha256::new();
        hasher.update(nonce.to_be_bytes());
        hasher.update(self.chain.next_sequence().to_be_bytes());
        hasher.update(&raw);
        let hash = format!("0x{}", hex::encode(hasher.finalize()));

        let tx = Transaction {
            hash,
            payout_group_id: first.payout_group_id,
            nonce,
            owner: source.clone(),
            spender,
            token_price: price,
            token_amount: total,
            raw,
            state: TxState::Pending,
            receipt: None,
            created_at: Utc::now(),
        };

        Ok((tx, source))
    }

    async fn send_transaction(&self, tx: &Transaction) -> AppResult<()> {
        let payload: Vec<SimTransfer> = serde_json::from_slice(&tx.raw)
            .map_err(|_| ChainError::MalformedTransaction(tx.hash.clone()))?;

        let mut transfers = Vec::with_capacity(payload.len());
        for transfer in payload {
            let amount = BigDecimal::from_str(&transfer.amount)
                .map_err(|_| ChainError::MalformedTransaction(tx.hash.clone()))?;
            transfers.push((transfer.to, amount));
        }

        self.chain.broadcast(&tx.hash, tx.nonce, transfers)
    }

    async fn check_nonce_group(
        &self,
        group: &NonceGroup,
        fail_fast: bool,
    ) -> AppResult<(TxState, Vec<TxStatus>)> {
        let mut state = self.chain.state.lock();
        if state.auto_mine {
            state.mine();
        }

        let statuses: Vec<TxStatus> = group.txs.iter().map(|tx| state.status(&tx.hash)).collect();
        let has = |wanted: TxState| statuses.iter().any(|s| s.state == wanted);

        let aggregate = if has(TxState::Confirmed) {
            TxState::Confirmed
        } else if has(TxState::Failed) {
            TxState::Failed
        } else if has(TxState::Pending) {
            TxState::Pending
        } else if fail_fast {
            // not certain enough to trigger a resend
            TxState::Pending
        } else {
            TxState::Dropped
        };

        Ok((aggregate, statuses))
    }
}

/// `Auditor` backed by a [`SimChain`]
pub struct SimAuditor {
    chain: Arc<SimChain>,
}

impl SimAuditor {
    pub fn new(chain: Arc<SimChain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Auditor for SimAuditor {
    async fn check_transaction_state(&self, hash: &str) -> AppResult<TxState> {
        Ok(self.chain.transaction_status(hash).state)
    }

    async fn check_confirmed_transaction_state(&self, hash: &str) -> AppResult<TxState> {
        let status = self.chain.transaction_status(hash);
        match (status.state, status.receipt) {
            (TxState::Confirmed, Some(_)) => Ok(TxState::Confirmed),
            (TxState::Confirmed, None) => Ok(TxState::Pending),
            (other, _) => Ok(other),
        }
    }
}
