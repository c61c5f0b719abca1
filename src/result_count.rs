//! Row-count logging for cache reads.
//!
//! [`ResultCountLogger::wrap`] awaits a read, logs how many rows it produced under the
//! `chain_price_core::result_count` target, and hands the result back untouched. Errors pass
//! through without being logged here; the caller owns them.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use tracing::{debug, Level};

/// Number of rows a read produced.
pub trait ResultCount {
    fn result_count(&self) -> usize;
}

impl<T> ResultCount for Vec<T> {
    fn result_count(&self) -> usize {
        self.len()
    }
}

impl<T> ResultCount for Option<T> {
    fn result_count(&self) -> usize {
        usize::from(self.is_some())
    }
}

impl<K: Eq + Hash, V> ResultCount for HashMap<K, V> {
    fn result_count(&self) -> usize {
        self.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResultCountLogger {
    chain_id: u64,
}

impl ResultCountLogger {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }

    /// Awaits `fut` and logs its row count as `operation` with the descriptor produced by
    /// `key_args`. The descriptor is only built when the log line is enabled.
    pub async fn wrap<T, E, Fut, K>(&self, operation: &str, key_args: K, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        T: ResultCount,
        K: FnOnce() -> String,
    {
        let result = fut.await;
        if let Ok(value) = &result {
            if tracing::enabled!(target: "chain_price_core::result_count", Level::DEBUG) {
                let count = value.result_count();
                debug!(
                    target: "chain_price_core::result_count",
                    chain_id = self.chain_id,
                    operation,
                    count,
                    "{} {} returned {} rows",
                    operation,
                    key_args(),
                    count
                );
            }
        }
        result
    }
}
