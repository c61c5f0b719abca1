use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Chain {
    #[serde(default = "default_chain_id")]
    pub id: u64,
    #[serde(default = "default_chain_name")]
    pub name: String,
}

fn default_chain_id() -> u64 {
    1
}
fn default_chain_name() -> String {
    "Mainnet".to_string()
}

impl Default for Chain {
    fn default() -> Self {
        Self {
            id: default_chain_id(),
            name: default_chain_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Store {
    /// SQLite file; defaults to `$HOME/.chain-price-core/cache.sqlite`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
    #[serde(default = "default_lock_retry_max_attempts")]
    pub lock_retry_max_attempts: u32,
    #[serde(default = "default_true")]
    pub wal: bool,
}

fn default_true() -> bool {
    true
}
fn default_lock_retry_delay_ms() -> u64 {
    50
}
fn default_lock_retry_max_attempts() -> u32 {
    20
}

impl Default for Store {
    fn default() -> Self {
        Self {
            path: None,
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            lock_retry_max_attempts: default_lock_retry_max_attempts(),
            wal: default_true(),
        }
    }
}

impl Store {
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) if !p.trim().is_empty() => PathBuf::from(p.trim()),
            _ => {
                let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home)
                    .join(".chain-price-core")
                    .join("cache.sqlite")
            }
        }
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    /// Process-wide ceiling on outstanding remote calls.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_multicall_address")]
    pub multicall_address: String,
    #[serde(default = "default_multicall_batch_size")]
    pub multicall_batch_size: usize,
}

fn default_max_concurrent_calls() -> usize {
    32
}
fn default_multicall_address() -> String {
    // Multicall3, same address on every supported network
    "0xcA11bde05977b3631167028862bE2a173976CA11".to_string()
}
fn default_multicall_batch_size() -> usize {
    200
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent_calls(),
            multicall_address: default_multicall_address(),
            multicall_batch_size: default_multicall_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AddressCache {
    /// `None` keeps every checksum for the process lifetime.
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SenseCheck {
    #[serde(default = "default_price_ceiling")]
    pub price_ceiling: f64,
    #[serde(default)]
    pub price_floor: f64,
    /// Chain id (as a string key) -> tokens whose high nominal price is expected.
    #[serde(default)]
    pub acceptable_high_prices: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub acceptable_all_chains: Vec<String>,
}

fn default_price_ceiling() -> f64 {
    1000.0
}

impl Default for SenseCheck {
    fn default() -> Self {
        Self {
            price_ceiling: default_price_ceiling(),
            price_floor: 0.0,
            acceptable_high_prices: HashMap::new(),
            acceptable_all_chains: Vec::new(),
        }
    }
}

impl SenseCheck {
    /// Allowlist entries that apply on `chain_id`.
    pub fn acceptable_for_chain(&self, chain_id: u64) -> Vec<String> {
        let mut out = self.acceptable_all_chains.clone();
        if let Some(list) = self.acceptable_high_prices.get(&chain_id.to_string()) {
            out.extend(list.iter().cloned());
        }
        out
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub chain: Chain,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub address_cache: AddressCache,
    #[serde(default)]
    pub sense_check: SenseCheck,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config.toml")
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        apply_env_overrides(&mut settings);
        Ok(settings)
    }
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(path) = env::var("CPC_DB_PATH") {
        if !path.trim().is_empty() {
            settings.store.path = Some(path.trim().to_string());
        }
    }

    if let Ok(raw) = env::var("CPC_MAX_CONCURRENT_CALLS") {
        match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => settings.rpc.max_concurrent_calls = n,
            _ => log::warn!("Ignoring CPC_MAX_CONCURRENT_CALLS={:?}: expected a positive integer", raw),
        }
    }

    if let Ok(raw) = env::var("CPC_CHAIN_ID") {
        match raw.trim().parse::<u64>() {
            Ok(id) => settings.chain.id = id,
            Err(e) => log::warn!("Ignoring CPC_CHAIN_ID={:?}: {}", raw, e),
        }
    }

    // Extra allowlist entries for the active chain (JSON list or comma separated)
    if let Ok(raw) = env::var("CPC_ACCEPTABLE_HIGH_PRICES") {
        if let Some(list) = parse_string_list(&raw) {
            if !list.is_empty() {
                settings
                    .sense_check
                    .acceptable_high_prices
                    .entry(settings.chain.id.to_string())
                    .or_default()
                    .extend(list);
            }
        }
    }
}

pub(crate) fn parse_string_list(input: &str) -> Option<Vec<String>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(vec![]);
    }

    if trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Some(v);
        }
        // Not valid JSON: strip the brackets and fall through to comma splitting
        let without_brackets = trimmed.trim_start_matches('[').trim_end_matches(']');
        return Some(split_list(without_brackets));
    }

    Some(split_list(trimmed))
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
