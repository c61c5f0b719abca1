// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

/// Registers descriptions for every metric emitted by the crate.
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        "address_checksum_cache_hits_total",
        "Checksum lookups answered from the memo."
    );
    describe_counter!(
        "address_checksum_cache_misses_total",
        "Checksum lookups that had to hash the address."
    );
    describe_counter!(
        "store_lock_retries_total",
        "Store operations retried after a database-is-locked failure."
    );
    describe_counter!(
        "store_contention_total",
        "Store operations that exhausted the lock-retry budget."
    );
    describe_counter!(
        "price_cache_hits_total",
        "Price lookups served from the local store."
    );
    describe_counter!(
        "price_cache_misses_total",
        "Price lookups that fell through to computation."
    );
    describe_counter!(
        "multicall_fallbacks_total",
        "Batched requests that failed and were replayed as raw calls."
    );
    describe_histogram!(
        "multicall_batch_size",
        "Number of calls submitted in one aggregated request."
    );
    describe_gauge!(
        "rpc_calls_in_flight",
        "Remote calls currently holding a concurrency permit."
    );
    describe_counter!(
        "sense_check_total",
        "Plausibility verdicts by outcome."
    );
}

pub fn increment_checksum_cache_hit() {
    increment_counter!("address_checksum_cache_hits_total");
}

pub fn increment_checksum_cache_miss() {
    increment_counter!("address_checksum_cache_misses_total");
}

pub fn increment_store_lock_retry(operation: &str) {
    increment_counter!("store_lock_retries_total", "operation" => operation.to_string());
}

pub fn increment_store_contention(operation: &str) {
    increment_counter!("store_contention_total", "operation" => operation.to_string());
}

pub fn increment_price_cache_hit() {
    increment_counter!("price_cache_hits_total");
}

pub fn increment_price_cache_miss() {
    increment_counter!("price_cache_misses_total");
}

pub fn increment_multicall_fallback() {
    increment_counter!("multicall_fallbacks_total");
}

pub fn record_multicall_batch_size(size: f64) {
    histogram!("multicall_batch_size", size);
}

pub fn set_rpc_calls_in_flight(count: f64) {
    gauge!("rpc_calls_in_flight", count);
}

pub fn increment_sense_check(outcome: &'static str) {
    counter!("sense_check_total", 1, "outcome" => outcome);
}
