use super::Quoter;
use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Cached price entry with timestamp
#[derive(Debug, Clone)]
pub struct CachedPrice {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl CachedPrice {
    pub fn is_valid(&self, ttl_ms: u64) -> bool {
        let age = Utc::now() - self.timestamp;
        age.num_milliseconds() < ttl_ms as i64
    }
}

/// Reuses a quote from the wrapped quoter for `ttl_ms`
pub struct CachedQuoter {
    inner: Arc<dyn Quoter>,
    cache: RwLock<Option<CachedPrice>>,
    ttl_ms: u64,
}

impl CachedQuoter {
    pub fn new(inner: Arc<dyn Quoter>, ttl_ms: u64) -> Self {
        Self {
            inner,
            cache: RwLock::new(None),
            ttl_ms,
        }
    }

    pub async fn cached(&self) -> Option<CachedPrice> {
        let cache = self.cache.read().await;
        cache.as_ref().filter(|entry| entry.is_valid(self.ttl_ms)).cloned()
    }

    /// Forget the cached price (for testing or manual refresh)
    pub async fn clear(&self) {
        *self.cache.write().await = None;
        info!("🔄 Price cache cleared");
    }
}

#[async_trait]
impl Quoter for CachedQuoter {
    async fn quote(&self) -> AppResult<Decimal> {
        if let Some(entry) = self.cached().await {
            debug!("✓ Price cache hit: {}", entry.price);
            return Ok(entry.price);
        }

        let price = self.inner.quote().await?;
        *self.cache.write().await = Some(CachedPrice {
            price,
            timestamp: Utc::now(),
        });
        debug!("💾 Cached price: {}", price);
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingQuoter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Quoter for CountingQuoter {
        async fn quote(&self) -> AppResult<Decimal> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Decimal::from(100 + n as i64))
        }
    }

    #[tokio::test]
    async fn test_price_cache() {
        let inner = Arc::new(CountingQuoter {
            calls: AtomicUsize::new(0),
        });
        let quoter = CachedQuoter::new(inner.clone(), 5000);

        assert_eq!(quoter.quote().await.unwrap(), Decimal::from(100));
        assert_eq!(quoter.quote().await.unwrap(), Decimal::from(100));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        quoter.clear().await;
        assert!(quoter.cached().await.is_none());
        assert_eq!(quoter.quote().await.unwrap(), Decimal::from(101));
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let inner = Arc::new(CountingQuoter {
            calls: AtomicUsize::new(0),
        });
        let quoter = CachedQuoter::new(inner.clone(), 100);

        quoter.quote().await.unwrap();
        assert!(quoter.cached().await.is_some());

        tokio::time::sleep(tokio::time::Duration::from_millis(150)).await;

        assert!(quoter.cached().await.is_none());
        assert_eq!(quoter.quote().await.unwrap(), Decimal::from(101));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
