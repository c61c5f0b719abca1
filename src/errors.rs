//! Error taxonomy shared by every core component.
//!
//! Lock contention and transport faults are handled locally by the component that can react
//! to them (the store retries, the batcher falls back to raw calls). Everything else is
//! surfaced to the caller unchanged.

/// Errors raised by the core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Input to the address normaliser is neither 40 hex digits nor a 160-bit integer.
    #[error("invalid address format: {0}")]
    InvalidAddressFormat(String),

    /// The lock-retry budget ran out while the local store stayed locked.
    #[error("store contention: {operation} still locked after {attempts} attempts")]
    StoreContention { operation: String, attempts: u32 },

    /// The store refused the operation itself (constraint violation, malformed value, bad query).
    #[error("store rejected {operation}: {reason}")]
    StoreRejected { operation: String, reason: String },

    /// I/O failure, corruption or any other unrecoverable store condition.
    #[error("fatal store error during {operation}: {source}")]
    StoreFatal {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// Remote call infrastructure failure, distinct from an on-chain revert.
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// A single method call reverted on-chain.
    #[error("call to {method} reverted: {reason}")]
    CallReverted { method: String, reason: String },

    /// Method signature or arguments that cannot be ABI encoded.
    #[error("invalid method {0}")]
    InvalidMethod(String),
}

impl CoreError {
    /// True for errors a caller may reasonably retry later by re-entering the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::StoreContention { .. } | CoreError::TransportFault(_)
        )
    }

    /// True when the error is a per-call revert rather than an infrastructure problem.
    pub fn is_revert(&self) -> bool {
        matches!(self, CoreError::CallReverted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let contention = CoreError::StoreContention {
            operation: "insert price".to_string(),
            attempts: 3,
        };
        assert!(contention.is_transient());
        assert!(CoreError::TransportFault("connection reset".into()).is_transient());
        assert!(!CoreError::InvalidAddressFormat("0x12".into()).is_transient());

        let reverted = CoreError::CallReverted {
            method: "decimals()".into(),
            reason: "execution reverted".into(),
        };
        assert!(reverted.is_revert());
        assert!(!reverted.is_transient());
    }
}
