use anyhow::Result;
use async_trait::async_trait;
use log::warn;
use rust_decimal::Decimal;

/// USD price of one unit of the base asset (TON).
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn base_usd_price(&self) -> Result<Decimal>;
}

pub struct FixedPrice(pub Decimal);

#[async_trait]
impl PriceSource for FixedPrice {
    async fn base_usd_price(&self) -> Result<Decimal> {
        Ok(self.0)
    }
}

/// Live lookup with a constant fallback when the lookup fails.
pub struct FallbackPrice<P> {
    live: P,
    fallback: Decimal,
}

impl<P> FallbackPrice<P> {
    pub fn new(live: P, fallback: Decimal) -> Self {
        Self { live, fallback }
    }
}

#[async_trait]
impl<P: PriceSource> PriceSource for FallbackPrice<P> {
    async fn base_usd_price(&self) -> Result<Decimal> {
        match self.live.base_usd_price().await {
            Ok(p) => Ok(p),
            Err(e) => {
                warn!("price lookup failed, using fallback {}: {e:?}", self.fallback);
                Ok(self.fallback)
            }
        }
    }
}
