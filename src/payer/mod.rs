pub mod sim;

use crate::audit::Auditor;
use crate::error::{AppResult, ChainError, PipelineError};
use crate::ledger::models::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Payment mechanism - one per chain a batch can be paid on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    Eth,
    Polygon,
    ZkSync,
    /// In-memory chain for rehearsals and tests
    Sim,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Eth => "eth",
            Mechanism::Polygon => "polygon",
            Mechanism::ZkSync => "zksync",
            Mechanism::Sim => "sim",
        }
    }

    pub fn all() -> Vec<Mechanism> {
        vec![
            Mechanism::Eth,
            Mechanism::Polygon,
            Mechanism::ZkSync,
            Mechanism::Sim,
        ]
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mechanism::all()
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown payment mechanism '{}'", s))
    }
}

/// Addresses a payer sends from
///
/// `owner` is set when the spender moves tokens out of another account under
/// an allowance; otherwise the spender pays from its own balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayerAddresses {
    pub spender: String,
    pub owner: Option<String>,
}

impl PayerAddresses {
    /// Account the tokens leave from
    pub fn source(&self) -> &str {
        self.owner.as_deref().unwrap_or(&self.spender)
    }
}

/// Payer trait - implemented by each mechanism's sender
///
/// Payers build, sign and broadcast transfers and report what the chain
/// knows about a nonce. They never write to the ledger.
#[async_trait]
pub trait Payer: Send + Sync {
    fn mechanism(&self) -> Mechanism;

    fn addresses(&self) -> PayerAddresses;

    /// Chain-sourced next nonce for the spender
    async fn next_nonce(&self) -> AppResult<u64>;

    /// Reasons it is not safe to send right now (e.g. base fee too high).
    /// Empty means clear to proceed.
    async fn check_preconditions(&self) -> AppResult<Vec<String>>;

    /// Spendable balance in raw token base units
    async fn token_balance(&self) -> AppResult<BigDecimal>;

    async fn token_decimals(&self) -> AppResult<i32>;

    /// Build and sign a transfer for `payouts` without broadcasting it.
    /// Returns the transaction and the address it sends from.
    async fn create_raw_transaction(
        &self,
        payouts: &[Payout],
        nonce: u64,
        price: Decimal,
    ) -> AppResult<(Transaction, String)>;

    async fn send_transaction(&self, tx: &Transaction) -> AppResult<()>;

    /// Aggregate chain state of a nonce group plus per-transaction statuses.
    ///
    /// With `fail_fast` set the caller has already seen a failure this pass;
    /// payers must not report Dropped unless certain, since that triggers a
    /// resend.
    async fn check_nonce_group(
        &self,
        group: &NonceGroup,
        fail_fast: bool,
    ) -> AppResult<(TxState, Vec<TxStatus>)>;
}

/// Convert a fiat amount to raw token base units at `price` fiat per token.
///
/// The result is truncated toward zero; fractional base units are never sent.
pub fn token_amount(fiat: Decimal, price: Decimal, decimals: i32) -> AppResult<BigDecimal> {
    if price <= Decimal::ZERO {
        return Err(PipelineError::InvalidPrice(price.to_string()).into());
    }
    if decimals < 0 {
        return Err(ChainError::Rpc {
            operation: "token decimals".to_string(),
            message: format!("negative decimals {}", decimals),
        }
        .into());
    }

    let fiat = to_big(fiat)?;
    let price = to_big(price)?;
    let scale = BigDecimal::from_str(&format!("1e{}", decimals))
        .map_err(|e| PipelineError::InvalidPrice(e.to_string()))?;

    Ok((fiat * scale / price).with_scale(0))
}

fn to_big(value: Decimal) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| PipelineError::InvalidPrice(format!("{}: {}", value, e)).into())
}

/// Routes each mechanism to its payer and auditor
///
/// Populated once at startup; the pipeline and audit only ever see the trait
/// objects it hands out.
pub struct MechanismRouter {
    payers: HashMap<Mechanism, Arc<dyn Payer>>,
    auditors: HashMap<Mechanism, Arc<dyn Auditor>>,
}

impl MechanismRouter {
    pub fn new() -> Self {
        Self {
            payers: HashMap::new(),
            auditors: HashMap::new(),
        }
    }

    pub fn register_payer(&mut self, payer: Arc<dyn Payer>) {
        info!("Registering payer for mechanism: {}", payer.mechanism());
        self.payers.insert(payer.mechanism(), payer);
    }

    pub fn register_auditor(&mut self, mechanism: Mechanism, auditor: Arc<dyn Auditor>) {
        info!("Registering auditor for mechanism: {}", mechanism);
        self.auditors.insert(mechanism, auditor);
    }

    pub fn payer(&self, mechanism: Mechanism) -> AppResult<Arc<dyn Payer>> {
        self.payers
            .get(&mechanism)
            .cloned()
            .ok_or_else(|| ChainError::UnsupportedMechanism(mechanism).into())
    }

    pub fn auditor(&self, mechanism: Mechanism) -> AppResult<Arc<dyn Auditor>> {
        self.auditors
            .get(&mechanism)
            .cloned()
            .ok_or_else(|| ChainError::UnsupportedMechanism(mechanism).into())
    }

    pub fn registered_mechanisms(&self) -> Vec<Mechanism> {
        let mut mechanisms: Vec<_> = self.payers.keys().copied().collect();
        mechanisms.sort_by_key(|m| m.as_str());
        mechanisms
    }
}

impl Default for MechanismRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::sim::{SimAuditor, SimChain, SimPayer};
    use super::*;
    use crate::error::AppError;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mechanism_parse() {
        assert_eq!("zksync".parse::<Mechanism>().unwrap(), Mechanism::ZkSync);
        assert_eq!("SIM".parse::<Mechanism>().unwrap(), Mechanism::Sim);
        assert!("bitcoin".parse::<Mechanism>().is_err());
    }

    #[test]
    fn test_token_amount_scales_and_truncates() {
        assert_eq!(
            token_amount(dec!(3), dec!(1), 6).unwrap(),
            BigDecimal::from(3_000_000i64)
        );
        // 1 / 3 tokens at 2 decimals = 33.33.. base units
        assert_eq!(
            token_amount(dec!(1), dec!(3), 2).unwrap(),
            BigDecimal::from(33i64)
        );
        assert_eq!(
            token_amount(dec!(2.50), dec!(0.5), 18).unwrap(),
            BigDecimal::from_str("5000000000000000000").unwrap()
        );
        assert_eq!(token_amount(dec!(0.001), dec!(10), 2).unwrap(), BigDecimal::from(0i64));
    }

    #[test]
    fn test_token_amount_rejects_bad_price() {
        let err = token_amount(dec!(1), dec!(0), 6).unwrap_err();
        assert!(matches!(err, AppError::Pipeline(PipelineError::InvalidPrice(_))));
        assert!(token_amount(dec!(1), dec!(-2), 6).is_err());
    }

    #[test]
    fn test_router_selects_registered_mechanism() {
        let chain = Arc::new(SimChain::new(6, "0xspender", None));
        let mut router = MechanismRouter::new();
        router.register_payer(Arc::new(SimPayer::new(chain.clone())));
        router.register_auditor(Mechanism::Sim, Arc::new(SimAuditor::new(chain)));

        assert_eq!(router.payer(Mechanism::Sim).unwrap().mechanism(), Mechanism::Sim);
        assert!(router.auditor(Mechanism::Sim).is_ok());
        assert_eq!(router.registered_mechanisms(), vec![Mechanism::Sim]);

        let err = router.payer(Mechanism::Eth).err().unwrap();
        assert!(matches!(
            err,
            AppError::Chain(ChainError::UnsupportedMechanism(Mechanism::Eth))
        ));
    }
}
