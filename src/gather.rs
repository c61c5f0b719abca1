//! # Method Batcher
//!
//! Resolves many read-only calls with as few round trips as possible:
//!
//! 1. All calls go out as one aggregated request, holding a single slot of the shared
//!    [`CallLimiter`].
//! 2. If the aggregate fails as a whole, every call is replayed on its own, each holding its
//!    own slot.
//! 3. Per-call reverts become error entries (`return_exceptions = true`) or fail the whole
//!    request (`return_exceptions = false`). In the latter case the calls still outstanding are
//!    dropped, which returns their slots.
//!
//! Results always come back in request order.

use crate::address::{normalize, AddressInput, NormalizedAddress};
use crate::errors::CoreError;
use crate::limiter::CallLimiter;
use crate::metrics;
use crate::result_count::ResultCount;
use crate::transport::{MethodCall, Transport};
use ethers::abi::Token;
use ethers::types::Address;
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tracing::{debug, warn};

/// Calls against one contract at one block.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub address: NormalizedAddress,
    pub methods: Vec<MethodCall>,
    pub block: Option<u64>,
    pub return_exceptions: bool,
}

impl BatchRequest {
    /// Partial-success request: per-method failures are returned, not raised.
    pub fn new(address: NormalizedAddress, methods: Vec<MethodCall>, block: Option<u64>) -> Self {
        Self {
            address,
            methods,
            block,
            return_exceptions: true,
        }
    }

    pub fn return_exceptions(mut self, return_exceptions: bool) -> Self {
        self.return_exceptions = return_exceptions;
        self
    }
}

/// Results keyed by method label, in request order.
#[derive(Debug, Default)]
pub struct BatchResult {
    entries: Vec<(String, Result<Token, CoreError>)>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First result for `method` (the label it was requested with).
    pub fn get(&self, method: &str) -> Option<&Result<Token, CoreError>> {
        self.entries
            .iter()
            .find(|(label, _)| label == method)
            .map(|(_, result)| result)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<Token, CoreError>)> {
        self.entries.iter().map(|(label, result)| (label.as_str(), result))
    }

    pub fn values(&self) -> impl Iterator<Item = &Result<Token, CoreError>> {
        self.entries.iter().map(|(_, result)| result)
    }

    pub fn into_values(self) -> Vec<Result<Token, CoreError>> {
        self.entries.into_iter().map(|(_, result)| result).collect()
    }

    pub fn into_entries(self) -> Vec<(String, Result<Token, CoreError>)> {
        self.entries
    }
}

impl ResultCount for BatchResult {
    fn result_count(&self) -> usize {
        self.values().filter(|r| r.is_ok()).count()
    }
}

#[derive(Clone)]
pub struct MethodBatcher {
    transport: Arc<dyn Transport>,
    limiter: CallLimiter,
}

impl MethodBatcher {
    pub fn new(transport: Arc<dyn Transport>, limiter: CallLimiter) -> Self {
        Self { transport, limiter }
    }

    pub fn limiter(&self) -> &CallLimiter {
        &self.limiter
    }

    pub async fn gather(&self, request: BatchRequest) -> Result<BatchResult, CoreError> {
        let BatchRequest {
            address,
            methods,
            block,
            return_exceptions,
        } = request;
        if methods.is_empty() {
            return Ok(BatchResult::default());
        }

        let target = address.as_address();
        let calls: Vec<(Address, MethodCall)> =
            methods.into_iter().map(|m| (target, m)).collect();
        let results = self.execute(&calls, block, return_exceptions).await?;

        Ok(BatchResult {
            entries: calls
                .into_iter()
                .map(|(_, m)| m.label().to_string())
                .zip(results)
                .collect(),
        })
    }

    /// [`gather`](Self::gather) from text signatures.
    pub async fn gather_methods<'a>(
        &self,
        address: impl Into<AddressInput<'a>>,
        methods: &[&str],
        block: Option<u64>,
        return_exceptions: bool,
    ) -> Result<BatchResult, CoreError> {
        let address = normalize(address)?;
        let methods = methods
            .iter()
            .map(|m| MethodCall::parse(m))
            .collect::<Result<Vec<_>, _>>()?;
        self.gather(BatchRequest::new(address, methods, block).return_exceptions(return_exceptions))
            .await
    }

    /// The same method against many contracts, results in address order.
    pub async fn gather_across(
        &self,
        addresses: &[NormalizedAddress],
        method: &MethodCall,
        block: Option<u64>,
        return_exceptions: bool,
    ) -> Result<Vec<Result<Token, CoreError>>, CoreError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let calls: Vec<(Address, MethodCall)> = addresses
            .iter()
            .map(|a| (a.as_address(), method.clone()))
            .collect();
        self.execute(&calls, block, return_exceptions).await
    }

    async fn execute(
        &self,
        calls: &[(Address, MethodCall)],
        block: Option<u64>,
        return_exceptions: bool,
    ) -> Result<Vec<Result<Token, CoreError>>, CoreError> {
        match self.batched(calls, block).await {
            Ok(raw) => {
                let decoded: Vec<Result<Token, CoreError>> = calls
                    .iter()
                    .zip(raw)
                    .map(|((_, method), data)| data.and_then(|bytes| method.decode(&bytes)))
                    .collect();
                if return_exceptions {
                    Ok(decoded)
                } else {
                    decoded.into_iter().map(|r| r.map(Ok)).collect()
                }
            }
            Err(e) => {
                warn!(
                    calls = calls.len(),
                    ?block,
                    "batched call failed, falling back to raw calls: {}",
                    e
                );
                metrics::increment_multicall_fallback();
                self.raw(calls, block, return_exceptions).await
            }
        }
    }

    async fn batched(
        &self,
        calls: &[(Address, MethodCall)],
        block: Option<u64>,
    ) -> Result<Vec<Result<ethers::types::Bytes, CoreError>>, CoreError> {
        let _permit = self.limiter.acquire().await?;
        let results = self.transport.call_many(calls, block).await?;
        if results.len() != calls.len() {
            return Err(CoreError::TransportFault(format!(
                "batched call returned {} results for {} calls",
                results.len(),
                calls.len()
            )));
        }
        debug!(calls = calls.len(), ?block, "batched call ok");
        Ok(results)
    }

    async fn raw(
        &self,
        calls: &[(Address, MethodCall)],
        block: Option<u64>,
        return_exceptions: bool,
    ) -> Result<Vec<Result<Token, CoreError>>, CoreError> {
        let futures = calls.iter().map(|(target, method)| async move {
            let _permit = self.limiter.acquire().await?;
            let bytes = self.transport.call(*target, method, block).await?;
            method.decode(&bytes)
        });

        if return_exceptions {
            Ok(join_all(futures).await)
        } else {
            let values = try_join_all(futures).await?;
            Ok(values.into_iter().map(Ok).collect())
        }
    }
}
