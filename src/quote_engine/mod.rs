pub mod price_cache;

pub use price_cache::CachedQuoter;

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Source of the fiat price of one whole token
#[async_trait]
pub trait Quoter: Send + Sync {
    async fn quote(&self) -> AppResult<Decimal>;
}

/// Always answers with the same price
pub struct FixedQuoter {
    price: Decimal,
}

impl FixedQuoter {
    pub fn new(price: Decimal) -> Self {
        Self { price }
    }
}

#[async_trait]
impl Quoter for FixedQuoter {
    async fn quote(&self) -> AppResult<Decimal> {
        if self.price <= Decimal::ZERO {
            return Err(AppError::Quote(format!("fixed price {} is not positive", self.price)));
        }
        Ok(self.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fixed_quoter() {
        assert_eq!(FixedQuoter::new(dec!(1.25)).quote().await.unwrap(), dec!(1.25));
        assert!(matches!(
            FixedQuoter::new(Decimal::ZERO).quote().await,
            Err(AppError::Quote(_))
        ));
    }
}
