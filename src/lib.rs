//! # Chain Price Core
//!
//! The concurrency-safe caching and batched-fetch layer underneath on-chain token pricing.
//!
//! ## Overview
//!
//! A caller asks for the value of token `T` at block `B`. The core:
//!
//! - looks for a cached entry in the local SQLite store, retrying while another writer holds
//!   the lock;
//! - on a miss, hands a shared [`MethodBatcher`] to the protocol-specific pricing code, which
//!   pulls raw chain data through aggregated calls under one process-wide concurrency ceiling;
//! - writes the result back and runs a plausibility check on it in the background.
//!
//! Addresses are normalised and checksummed through a memoised [`AddressKey`] wherever they
//! serve as identity or cache keys.
//!
//! ## Layers
//!
//! ### Store
//! [`LocalStore`] / [`Cursor`]: scoped connections with bounded lock-retry, and the
//! [`PriceCache`] built on them.
//!
//! ### Remote calls
//! [`Transport`] is the node seam, [`EthersTransport`] the Multicall3-backed implementation,
//! [`MethodBatcher`] the ordered gather with raw-call fallback, [`CallLimiter`] the ceiling.
//!
//! ### Validation
//! [`SenseCheck`] decomposes composite tokens to explain implausible values.

// Core Types
/// Error taxonomy
pub mod errors;
/// Address normalisation and memoised checksums
pub mod address;

// Store
/// Lock-retrying cursor over the local store
pub mod database;
/// Row-count logging for cache reads
pub mod result_count;
/// Cached prices
pub mod price_cache;

// Remote Calls
/// Process-wide remote call ceiling
pub mod limiter;
/// Node interface and method call model
pub mod transport;
/// Multicall3 transport over ethers
pub mod multicall;
/// Ordered batched gather with raw fallback
pub mod gather;

// Validation
/// Token classification and value lookups
pub mod token_metadata;
/// Plausibility validation
pub mod sense_check;

// Pricing
/// Cache, compute, write back, check
pub mod pricing;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use address::{normalize, AddressKey, ChecksummedAddress, NormalizedAddress};
pub use database::{Cursor, LocalStore, RetryPolicy, SqlValue};
pub use errors::CoreError;
pub use gather::{BatchRequest, BatchResult, MethodBatcher};
pub use limiter::CallLimiter;
pub use multicall::EthersTransport;
pub use price_cache::{CacheEntry, PriceCache};
pub use pricing::{CacheThenCompute, PriceComputer, PriceService};
pub use result_count::{ResultCount, ResultCountLogger};
pub use sense_check::{Plausibility, PlausibilityVerdict, SenseCheck, SenseCheckPolicy};
pub use settings::Settings;
pub use token_metadata::{TokenBucket, TokenMetadata, ValueSource};
pub use transport::{MethodCall, Transport};
