//! # Address Normalisation and Checksumming
//!
//! Addresses arrive in many shapes (mixed case, lowercase, with or without `0x`, as raw
//! integers) and are used everywhere as identity and cache keys. This module collapses
//! them into a single [`NormalizedAddress`] key and memoises the EIP-55 checksummed form
//! keyed on it, so that any casing of the same address hits the same cache entry.
//!
//! The checksum is a pure function of the lowercase form. Concurrent duplicate computation
//! is therefore harmless: the memo only reduces repeated hashing, it never needs a lock
//! around the computation itself.

use crate::errors::CoreError;
use crate::metrics;
use dashmap::DashMap;
use ethers::types::{Address, U256};
use ethers::utils::to_checksum;
use lru::LruCache;
use std::borrow::Cow;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Anything the normaliser accepts as an address.
#[derive(Debug, Clone)]
pub enum AddressInput<'a> {
    Text(Cow<'a, str>),
    Integer(U256),
    Raw(Address),
}

impl<'a> From<&'a str> for AddressInput<'a> {
    fn from(s: &'a str) -> Self {
        AddressInput::Text(Cow::Borrowed(s))
    }
}

impl<'a> From<&'a String> for AddressInput<'a> {
    fn from(s: &'a String) -> Self {
        AddressInput::Text(Cow::Borrowed(s.as_str()))
    }
}

impl From<String> for AddressInput<'static> {
    fn from(s: String) -> Self {
        AddressInput::Text(Cow::Owned(s))
    }
}

impl From<U256> for AddressInput<'static> {
    fn from(v: U256) -> Self {
        AddressInput::Integer(v)
    }
}

impl From<u64> for AddressInput<'static> {
    fn from(v: u64) -> Self {
        AddressInput::Integer(U256::from(v))
    }
}

impl From<u128> for AddressInput<'static> {
    fn from(v: u128) -> Self {
        AddressInput::Integer(U256::from(v))
    }
}

impl From<Address> for AddressInput<'static> {
    fn from(a: Address) -> Self {
        AddressInput::Raw(a)
    }
}

impl From<NormalizedAddress> for AddressInput<'static> {
    fn from(a: NormalizedAddress) -> Self {
        AddressInput::Raw(a.0)
    }
}

/// Canonical 20-byte address key. Displays as lowercase `0x`-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedAddress(Address);

impl NormalizedAddress {
    pub fn as_address(&self) -> Address {
        self.0
    }

    pub fn to_lower_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl fmt::Display for NormalizedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl fmt::Debug for NormalizedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NormalizedAddress({})", self)
    }
}

impl From<NormalizedAddress> for Address {
    fn from(a: NormalizedAddress) -> Self {
        a.0
    }
}

/// EIP-55 mixed-case address text.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChecksummedAddress(Arc<str>);

impl ChecksummedAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChecksummedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ChecksummedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChecksummedAddress({})", self.0)
    }
}

impl AsRef<str> for ChecksummedAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalises any accepted input into a [`NormalizedAddress`].
///
/// Text must be exactly 40 hex digits, optionally `0x`/`0X` prefixed, in any casing.
/// Integers must fit in 160 bits and are left-padded with zeros.
pub fn normalize<'a>(input: impl Into<AddressInput<'a>>) -> Result<NormalizedAddress, CoreError> {
    match input.into() {
        AddressInput::Raw(address) => Ok(NormalizedAddress(address)),
        AddressInput::Integer(value) => {
            if value.bits() > 160 {
                return Err(CoreError::InvalidAddressFormat(format!(
                    "integer {} does not fit in 160 bits",
                    value
                )));
            }
            let mut buf = [0u8; 32];
            value.to_big_endian(&mut buf);
            Ok(NormalizedAddress(Address::from_slice(&buf[12..])))
        }
        AddressInput::Text(text) => parse_hex_address(&text),
    }
}

fn parse_hex_address(text: &str) -> Result<NormalizedAddress, CoreError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);

    if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CoreError::InvalidAddressFormat(text.to_string()));
    }

    let bytes = hex::decode(digits.to_ascii_lowercase())
        .map_err(|e| CoreError::InvalidAddressFormat(format!("{}: {}", text, e)))?;
    Ok(NormalizedAddress(Address::from_slice(&bytes)))
}

fn compute_checksum(address: NormalizedAddress) -> ChecksummedAddress {
    ChecksummedAddress(Arc::from(to_checksum(&address.0, None)))
}

enum ChecksumMemo {
    Unbounded(DashMap<NormalizedAddress, ChecksummedAddress>),
    Bounded(Mutex<LruCache<NormalizedAddress, ChecksummedAddress>>),
}

impl ChecksumMemo {
    fn get(&self, key: &NormalizedAddress) -> Option<ChecksummedAddress> {
        match self {
            ChecksumMemo::Unbounded(map) => map.get(key).map(|e| e.value().clone()),
            // A poisoned lock only means another thread panicked mid-update; the
            // stored values are still valid checksums.
            ChecksumMemo::Bounded(lru) => match lru.lock() {
                Ok(mut guard) => guard.get(key).cloned(),
                Err(poisoned) => poisoned.into_inner().get(key).cloned(),
            },
        }
    }

    fn put(&self, key: NormalizedAddress, value: ChecksummedAddress) {
        match self {
            ChecksumMemo::Unbounded(map) => {
                map.insert(key, value);
            }
            ChecksumMemo::Bounded(lru) => match lru.lock() {
                Ok(mut guard) => {
                    guard.put(key, value);
                }
                Err(poisoned) => {
                    poisoned.into_inner().put(key, value);
                }
            },
        }
    }

    fn len(&self) -> usize {
        match self {
            ChecksumMemo::Unbounded(map) => map.len(),
            ChecksumMemo::Bounded(lru) => match lru.lock() {
                Ok(guard) => guard.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            },
        }
    }
}

/// Memoising address normaliser/checksummer.
///
/// Cheap to clone; clones share the memo.
#[derive(Clone)]
pub struct AddressKey {
    memo: Arc<ChecksumMemo>,
}

impl Default for AddressKey {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressKey {
    /// Unbounded memo, retained for the lifetime of the value.
    pub fn new() -> Self {
        Self {
            memo: Arc::new(ChecksumMemo::Unbounded(DashMap::new())),
        }
    }

    /// Memo capped at `capacity` entries with least-recently-used eviction.
    pub fn bounded(capacity: NonZeroUsize) -> Self {
        Self {
            memo: Arc::new(ChecksumMemo::Bounded(Mutex::new(LruCache::new(capacity)))),
        }
    }

    pub fn from_settings(settings: &crate::settings::AddressCache) -> Self {
        match settings.capacity.and_then(NonZeroUsize::new) {
            Some(capacity) => Self::bounded(capacity),
            None => Self::new(),
        }
    }

    pub fn normalize<'a>(
        &self,
        input: impl Into<AddressInput<'a>>,
    ) -> Result<NormalizedAddress, CoreError> {
        normalize(input)
    }

    /// Checksummed form of `address`, memoised on the lowercase key.
    pub fn checksum(&self, address: NormalizedAddress) -> ChecksummedAddress {
        if let Some(hit) = self.memo.get(&address) {
            metrics::increment_checksum_cache_hit();
            return hit;
        }
        metrics::increment_checksum_cache_miss();
        let computed = compute_checksum(address);
        self.memo.put(address, computed.clone());
        computed
    }

    /// Same as [`checksum`](Self::checksum) but runs the hashing step on the blocking pool
    /// so concurrent async callers are not held up by it.
    pub async fn checksum_offloaded(&self, address: NormalizedAddress) -> ChecksummedAddress {
        if let Some(hit) = self.memo.get(&address) {
            metrics::increment_checksum_cache_hit();
            return hit;
        }
        metrics::increment_checksum_cache_miss();
        let computed = match tokio::task::spawn_blocking(move || compute_checksum(address)).await
        {
            Ok(value) => value,
            Err(e) => {
                log::debug!("checksum worker failed for {}: {}, hashing inline", address, e);
                compute_checksum(address)
            }
        };
        self.memo.put(address, computed.clone());
        computed
    }

    /// Normalise then checksum in one step.
    pub fn to_checksummed<'a>(
        &self,
        input: impl Into<AddressInput<'a>>,
    ) -> Result<ChecksummedAddress, CoreError> {
        Ok(self.checksum(normalize(input)?))
    }

    /// Number of memoised checksums.
    pub fn len(&self) -> usize {
        self.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
