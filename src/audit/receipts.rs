use crate::error::AppResult;
use crate::payer::Mechanism;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Proof of one confirmed payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub address: String,
    pub amount: Decimal,
    pub hash: String,
    pub mechanism: Mechanism,
}

/// Destination for exported receipts. Receives the whole set at once.
#[async_trait]
pub trait ReceiptSink: Send {
    async fn write(&mut self, receipts: &[PaymentReceipt]) -> AppResult<()>;
}

#[async_trait]
impl ReceiptSink for Vec<PaymentReceipt> {
    async fn write(&mut self, receipts: &[PaymentReceipt]) -> AppResult<()> {
        self.extend_from_slice(receipts);
        Ok(())
    }
}

/// Writes receipts as a pretty-printed JSON array
pub struct JsonReceiptSink {
    path: PathBuf,
}

impl JsonReceiptSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReceiptSink for JsonReceiptSink {
    async fn write(&mut self, receipts: &[PaymentReceipt]) -> AppResult<()> {
        let json = serde_json::to_vec_pretty(receipts)?;
        tokio::fs::write(&self.path, json).await?;
        info!(path = %self.path.display(), count = receipts.len(), "💾 Receipts written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_json_sink_writes_whole_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("receipts.json");
        let receipts = vec![PaymentReceipt {
            address: "0xalice".to_string(),
            amount: dec!(12.50),
            hash: "0xabc".to_string(),
            mechanism: Mechanism::Polygon,
        }];

        JsonReceiptSink::new(&path).write(&receipts).await.unwrap();

        let bytes = tokio::fs::read(&path).await.unwrap();
        let read: Vec<PaymentReceipt> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(read, receipts);
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw[0]["amount"], "12.50");
        assert_eq!(raw[0]["mechanism"], "polygon");
    }
}
