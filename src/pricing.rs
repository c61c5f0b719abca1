//! Price lookup flow: cache, compute on miss, write back, sense check in the background.

use crate::address::{normalize, AddressInput, AddressKey, NormalizedAddress};
use crate::database::LocalStore;
use crate::errors::CoreError;
use crate::gather::MethodBatcher;
use crate::limiter::CallLimiter;
use crate::metrics;
use crate::price_cache::PriceCache;
use crate::sense_check::{SenseCheck, SenseCheckPolicy};
use crate::settings::Settings;
use crate::token_metadata::{TokenMetadata, ValueSource};
use crate::transport::Transport;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

/// Protocol-specific pricing. Given the shared batcher, produce a value for `token` at `block`
/// or `None` when the token cannot be priced.
#[async_trait]
pub trait PriceComputer: Send + Sync {
    async fn compute(
        &self,
        token: NormalizedAddress,
        block: u64,
        batcher: &MethodBatcher,
    ) -> Result<Option<Decimal>>;
}

/// Cached value first, computed value otherwise. Does not write back.
#[derive(Clone)]
pub struct CacheThenCompute {
    cache: PriceCache,
    computer: Arc<dyn PriceComputer>,
    batcher: MethodBatcher,
}

impl CacheThenCompute {
    pub fn new(cache: PriceCache, computer: Arc<dyn PriceComputer>, batcher: MethodBatcher) -> Self {
        Self {
            cache,
            computer,
            batcher,
        }
    }
}

#[async_trait]
impl ValueSource for CacheThenCompute {
    async fn value_of(&self, token: NormalizedAddress, block: u64) -> Result<Option<Decimal>> {
        if let Some(price) = self.cache.get_price(token, block).await? {
            return Ok(Some(price));
        }
        self.computer.compute(token, block, &self.batcher).await
    }
}

pub struct PriceService {
    address_key: AddressKey,
    cache: PriceCache,
    batcher: MethodBatcher,
    computer: Arc<dyn PriceComputer>,
    sense_check: Arc<SenseCheck>,
}

impl PriceService {
    pub fn new(
        address_key: AddressKey,
        cache: PriceCache,
        batcher: MethodBatcher,
        computer: Arc<dyn PriceComputer>,
        sense_check: Arc<SenseCheck>,
    ) -> Self {
        Self {
            address_key,
            cache,
            batcher,
            computer,
            sense_check,
        }
    }

    /// Wires every component from `settings`.
    pub fn from_settings(
        settings: &Settings,
        transport: Arc<dyn Transport>,
        metadata: Arc<dyn TokenMetadata>,
        computer: Arc<dyn PriceComputer>,
    ) -> Self {
        let address_key = AddressKey::from_settings(&settings.address_cache);
        let cache = PriceCache::new(LocalStore::from_settings(&settings.store), settings.chain.id);
        let batcher = MethodBatcher::new(transport, CallLimiter::from_settings(&settings.rpc));
        let values = Arc::new(CacheThenCompute::new(
            cache.clone(),
            Arc::clone(&computer),
            batcher.clone(),
        ));
        let sense_check = Arc::new(
            SenseCheck::new(SenseCheckPolicy::from_settings(settings), metadata, values)
                .with_address_key(address_key.clone()),
        );
        Self::new(address_key, cache, batcher, computer, sense_check)
    }

    pub fn address_key(&self) -> &AddressKey {
        &self.address_key
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    pub fn batcher(&self) -> &MethodBatcher {
        &self.batcher
    }

    /// Price of `token` at `block`, `None` when it cannot be computed.
    ///
    /// A fresh value is written back and sense checked on a detached task. Failing to write
    /// back because the store stayed locked is logged and does not fail the lookup.
    pub async fn get_price<'a>(
        &self,
        token: impl Into<AddressInput<'a>>,
        block: u64,
    ) -> Result<Option<Decimal>> {
        let token = normalize(token)?;

        if let Some(price) = self.cache.get_price(token, block).await? {
            metrics::increment_price_cache_hit();
            debug!(%token, block, "price cache hit");
            return Ok(Some(price));
        }
        metrics::increment_price_cache_miss();

        let price = match self.computer.compute(token, block, &self.batcher).await? {
            Some(price) => price,
            None => return Ok(None),
        };

        match self.cache.set_price(token, block, price).await {
            Ok(_) => {}
            Err(e @ CoreError::StoreContention { .. }) => {
                warn!(%token, block, "price not cached: {}", e);
            }
            Err(e) => return Err(e.into()),
        }

        self.sense_check.spawn(token, block, price);
        Ok(Some(price))
    }
}
