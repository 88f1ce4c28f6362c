use crate::error::{AppError, AppResult};
use crate::ledger::ledger_path;
use crate::payer::Mechanism;
use crate::pipeline::PipelineConfig;
use config::{ConfigError, Environment};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub ledger_dir: PathBuf,
    pub batch_name: String,
    pub mechanism: Mechanism,
    pub max_pending: usize,
    pub poll_interval_ms: u64,
    pub send_delay_ms: u64,
    pub precondition_retry_ms: u64,
    pub drain: bool,
    pub quote_ttl_ms: u64,
    pub force_receipts: bool,
    pub receipts_path: PathBuf,
    /// Fixed fiat price per token used by rehearsals
    pub sim_price: Decimal,
    pub sim_decimals: i32,
}

impl Config {
    /// Load from `PAYOUTS_*` environment variables over built-in defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::with_prefix("PAYOUTS"))
    }

    pub fn load(environment: Environment) -> Result<Self, ConfigError> {
        config::Config::builder()
            .set_default("ledger_dir", ".")?
            .set_default("batch_name", "payouts")?
            .set_default("mechanism", "sim")?
            .set_default("max_pending", 5i64)?
            .set_default("poll_interval_ms", 5000i64)?
            .set_default("send_delay_ms", 0i64)?
            .set_default("precondition_retry_ms", 5000i64)?
            .set_default("drain", false)?
            .set_default("quote_ttl_ms", 60_000i64)?
            .set_default("force_receipts", false)?
            .set_default("receipts_path", "receipts.json")?
            .set_default("sim_price", "1")?
            .set_default("sim_decimals", 6i64)?
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn ledger_path(&self) -> PathBuf {
        ledger_path(&self.ledger_dir, &self.batch_name, self.mechanism)
    }

    pub fn pipeline_config(&self) -> AppResult<PipelineConfig> {
        if self.max_pending == 0 {
            return Err(AppError::Config(ConfigError::Message(
                "max_pending must be at least 1".to_string(),
            )));
        }

        Ok(PipelineConfig {
            max_pending: self.max_pending,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            send_delay: (self.send_delay_ms > 0).then(|| Duration::from_millis(self.send_delay_ms)),
            precondition_retry: Duration::from_millis(self.precondition_retry_ms),
            drain: self.drain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix("PAYOUTS").source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = Config::load(env(&[])).unwrap();
        assert_eq!(config.mechanism, Mechanism::Sim);
        assert_eq!(config.max_pending, 5);
        assert_eq!(config.sim_price, dec!(1));
        assert_eq!(config.ledger_path(), PathBuf::from("./payouts.sim.db"));

        let pipeline = config.pipeline_config().unwrap();
        assert_eq!(pipeline.poll_interval, Duration::from_secs(5));
        assert_eq!(pipeline.send_delay, None);
        assert!(!pipeline.drain);
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::load(env(&[
            ("PAYOUTS_MECHANISM", "polygon"),
            ("PAYOUTS_BATCH_NAME", "june"),
            ("PAYOUTS_MAX_PENDING", "2"),
            ("PAYOUTS_SEND_DELAY_MS", "250"),
            ("PAYOUTS_DRAIN", "true"),
        ]))
        .unwrap();

        assert_eq!(config.mechanism, Mechanism::Polygon);
        assert_eq!(config.ledger_path(), PathBuf::from("./june.polygon.db"));

        let pipeline = config.pipeline_config().unwrap();
        assert_eq!(pipeline.max_pending, 2);
        assert_eq!(pipeline.send_delay, Some(Duration::from_millis(250)));
        assert!(pipeline.drain);
    }

    #[test]
    fn test_rejects_empty_window() {
        let config = Config::load(env(&[("PAYOUTS_MAX_PENDING", "0")])).unwrap();
        assert!(matches!(config.pipeline_config(), Err(AppError::Config(_))));
    }
}
