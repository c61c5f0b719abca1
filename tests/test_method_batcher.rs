//! Integration tests for the method batcher
//!
//! Tests verify ordering, partial-success and fail-fast modes, the raw-call fallback and the
//! global concurrency ceiling, against an in-memory transport

use async_trait::async_trait;
use chain_price_core::address::{normalize, NormalizedAddress};
use chain_price_core::errors::CoreError;
use chain_price_core::gather::{BatchRequest, MethodBatcher};
use chain_price_core::limiter::CallLimiter;
use chain_price_core::transport::{MethodCall, Transport};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Answers `name()(uint256)` calls with a number derived from the method name, reverts the
/// methods listed in `reverting`, and can be told to fail every aggregated request.
#[derive(Default)]
struct MockTransport {
    reverting: HashSet<String>,
    fail_batches: bool,
    /// Per-call delays by method name, so completion order differs from request order.
    delays: Vec<(String, u64)>,
    batch_delay_ms: u64,
    raw_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    raw_started: AtomicUsize,
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

impl MockTransport {
    fn answer(method: &MethodCall) -> Bytes {
        let value = method.name().bytes().map(|b| b as u64).sum::<u64>();
        Bytes::from(ethers::abi::encode(&[Token::Uint(U256::from(value))]))
    }

    fn respond(&self, method: &MethodCall) -> Result<Bytes, CoreError> {
        if self.reverting.contains(method.name()) {
            Err(method.reverted("execution reverted"))
        } else {
            Ok(Self::answer(method))
        }
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(
        &self,
        _target: Address,
        method: &MethodCall,
        _block: Option<u64>,
    ) -> Result<Bytes, CoreError> {
        self.raw_started.fetch_add(1, Ordering::SeqCst);
        self.enter();
        let delay = self
            .delays
            .iter()
            .find(|(name, _)| name == method.name())
            .map(|(_, ms)| *ms)
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.leave();
        self.raw_calls.fetch_add(1, Ordering::SeqCst);
        self.respond(method)
    }

    async fn call_many(
        &self,
        calls: &[(Address, MethodCall)],
        _block: Option<u64>,
    ) -> Result<Vec<Result<Bytes, CoreError>>, CoreError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.enter();
        tokio::time::sleep(Duration::from_millis(self.batch_delay_ms)).await;
        self.leave();
        if self.fail_batches {
            return Err(CoreError::TransportFault(
                "aggregator not deployed at this block".to_string(),
            ));
        }
        Ok(calls.iter().map(|(_, m)| self.respond(m)).collect())
    }
}

fn target() -> NormalizedAddress {
    normalize("0x6B175474E89094C44Da98b954EedeAC495271d0F").unwrap()
}

fn methods(names: &[&str]) -> Vec<MethodCall> {
    names
        .iter()
        .map(|n| MethodCall::parse(&format!("{}()(uint256)", n)).unwrap())
        .collect()
}

fn expected(name: &str) -> Token {
    Token::Uint(U256::from(name.bytes().map(|b| b as u64).sum::<u64>()))
}

/// Test that results follow request order and only the reverting slot is an error
#[tokio::test]
async fn test_partial_success_keeps_order() {
    let transport = Arc::new(MockTransport {
        reverting: ["m2".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let batcher = MethodBatcher::new(transport.clone(), CallLimiter::new(4));

    let result = batcher
        .gather(BatchRequest::new(target(), methods(&["m1", "m2", "m3"]), Some(100)))
        .await
        .expect("partial success never fails as a whole");

    assert_eq!(result.len(), 3);
    let labels: Vec<&str> = result.iter().map(|(label, _)| label).collect();
    assert_eq!(labels, vec!["m1()(uint256)", "m2()(uint256)", "m3()(uint256)"]);

    let values = result.into_values();
    assert_eq!(values[0].as_ref().unwrap(), &expected("m1"));
    assert!(values[1].as_ref().unwrap_err().is_revert());
    assert_eq!(values[2].as_ref().unwrap(), &expected("m3"));
    assert_eq!(transport.batch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.raw_calls.load(Ordering::SeqCst), 0);
}

/// Test that fail-fast mode raises the revert and returns no partial list
#[tokio::test]
async fn test_fail_fast_raises() {
    let transport = Arc::new(MockTransport {
        reverting: ["m2".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let batcher = MethodBatcher::new(transport, CallLimiter::new(4));

    let result = batcher
        .gather(
            BatchRequest::new(target(), methods(&["m1", "m2", "m3"]), Some(100))
                .return_exceptions(false),
        )
        .await;
    match result {
        Err(CoreError::CallReverted { method, .. }) => assert_eq!(method, "m2()(uint256)"),
        other => panic!("expected revert, got {:?}", other),
    }
}

/// Test that a failed aggregate falls back to raw calls with the same per-method results,
/// even when raw calls complete out of order
#[tokio::test]
async fn test_fallback_to_raw_calls() {
    let transport = Arc::new(MockTransport {
        fail_batches: true,
        reverting: ["m2".to_string()].into_iter().collect(),
        delays: vec![("m1".to_string(), 40), ("m2".to_string(), 20)],
        ..Default::default()
    });
    let batcher = MethodBatcher::new(transport.clone(), CallLimiter::new(4));

    let result = batcher
        .gather_methods(
            target(),
            &["m1()(uint256)", "m2()(uint256)", "m3()(uint256)"],
            Some(100),
            true,
        )
        .await
        .unwrap();

    assert_eq!(transport.batch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.raw_calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.get("m1()(uint256)").unwrap().as_ref().unwrap(), &expected("m1"));
    assert!(result.get("m2()(uint256)").unwrap().is_err());
    assert_eq!(result.get("m3()(uint256)").unwrap().as_ref().unwrap(), &expected("m3"));
    let order: Vec<&str> = result.iter().map(|(label, _)| label).collect();
    assert_eq!(order, vec!["m1()(uint256)", "m2()(uint256)", "m3()(uint256)"]);
}

/// Test that fail-fast on the raw path cancels the siblings and hands their permits back
#[tokio::test]
async fn test_fail_fast_cancels_siblings_and_releases_permits() {
    let transport = Arc::new(MockTransport {
        fail_batches: true,
        reverting: ["bad".to_string()].into_iter().collect(),
        delays: vec![("slow1".to_string(), 5_000), ("slow2".to_string(), 5_000)],
        ..Default::default()
    });
    let limiter = CallLimiter::new(3);
    let batcher = MethodBatcher::new(transport.clone(), limiter.clone());

    let started = std::time::Instant::now();
    let result = batcher
        .gather(
            BatchRequest::new(target(), methods(&["slow1", "bad", "slow2"]), None)
                .return_exceptions(false),
        )
        .await;

    assert!(matches!(result, Err(CoreError::CallReverted { .. })));
    assert!(started.elapsed() < Duration::from_secs(2), "siblings were awaited");
    assert_eq!(limiter.in_flight(), 0);
    assert_eq!(limiter.available(), 3);
    // only the reverting call ran to completion
    assert_eq!(transport.raw_calls.load(Ordering::SeqCst), 1);
    assert!(transport.raw_started.load(Ordering::SeqCst) >= 2);
}

/// Test that K+M concurrent gathers never exceed K in flight and all complete
#[tokio::test]
async fn test_global_ceiling_bounds_in_flight_calls() {
    const K: usize = 3;
    const M: usize = 7;
    let transport = Arc::new(MockTransport {
        batch_delay_ms: 20,
        ..Default::default()
    });
    let limiter = CallLimiter::new(K);
    let batcher = MethodBatcher::new(transport.clone(), limiter.clone());

    let handles: Vec<_> = (0..K + M)
        .map(|_| {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                batcher
                    .gather(BatchRequest::new(target(), methods(&["totalSupply"]), None))
                    .await
            })
        })
        .collect();

    let sampler = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut max = 0;
            for _ in 0..50 {
                max = max.max(limiter.in_flight());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            max
        })
    };

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(result.get("totalSupply()(uint256)").unwrap().is_ok());
    }
    assert!(sampler.await.unwrap() <= K);
    assert!(transport.max_seen.load(Ordering::SeqCst) <= K);
    assert_eq!(transport.batch_calls.load(Ordering::SeqCst), K + M);
    assert_eq!(limiter.in_flight(), 0);
}

/// Test that cancelling a waiting gather hands its permit back
#[tokio::test]
async fn test_cancelled_gather_releases_permit() {
    let transport = Arc::new(MockTransport {
        batch_delay_ms: 5_000,
        ..Default::default()
    });
    let limiter = CallLimiter::new(1);
    let batcher = MethodBatcher::new(transport, limiter.clone());

    let pending = tokio::time::timeout(
        Duration::from_millis(50),
        batcher.gather(BatchRequest::new(target(), methods(&["m1"]), None)),
    )
    .await;
    assert!(pending.is_err());
    assert_eq!(limiter.available(), 1);
}

/// Test the same method across many contracts
#[tokio::test]
async fn test_gather_across_addresses() {
    let transport = Arc::new(MockTransport::default());
    let batcher = MethodBatcher::new(transport.clone(), CallLimiter::new(2));
    let addresses: Vec<_> = (1u64..=5).map(|i| normalize(i).unwrap()).collect();
    let method = MethodCall::parse("decimals()(uint256)").unwrap();

    let results = batcher
        .gather_across(&addresses, &method, Some(1), false)
        .await
        .unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.as_ref().unwrap() == &expected("decimals")));
    assert_eq!(transport.batch_calls.load(Ordering::SeqCst), 1);
}

/// Test that an empty request makes no calls
#[tokio::test]
async fn test_empty_request() {
    let transport = Arc::new(MockTransport::default());
    let batcher = MethodBatcher::new(transport.clone(), CallLimiter::new(1));

    let result = batcher
        .gather(BatchRequest::new(target(), vec![], None))
        .await
        .unwrap();
    assert!(result.is_empty());
    assert_eq!(transport.batch_calls.load(Ordering::SeqCst), 0);
}

/// Test that bad input is reported before anything is sent
#[tokio::test]
async fn test_invalid_input_is_rejected_up_front() {
    let transport = Arc::new(MockTransport::default());
    let batcher = MethodBatcher::new(transport.clone(), CallLimiter::new(1));

    let bad_address = batcher.gather_methods("0x1234", &["m1"], None, true).await;
    assert!(matches!(bad_address, Err(CoreError::InvalidAddressFormat(_))));

    let bad_method = batcher.gather_methods(target(), &["m1(notatype)"], None, true).await;
    assert!(matches!(bad_method, Err(CoreError::InvalidMethod(_))));
    assert_eq!(transport.batch_calls.load(Ordering::SeqCst), 0);
}
