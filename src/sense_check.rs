//! # Plausibility Validation
//!
//! A post-hoc look at a freshly computed price. Values inside `[floor, ceiling]`, or for
//! allowlisted tokens, are plausible and nothing is logged. Anything else is flagged; for
//! composite tokens the validator descends into the constituents, valuing each one and
//! checking it against its own bound, so the warning can say which underlying looks wrong.
//!
//! A composite whose constituents are all allowlisted, or are themselves wrappers of
//! allowlisted tokens, is exempt: a vault over WETH is expected to be priced like WETH.
//!
//! The descent carries the set of tokens on the current path. A constituent that is already
//! an ancestor is recorded as [`ConstituentReport::SkippedCycle`] and not descended again; a
//! token shared by two parents is evaluated under each.
//!
//! Nothing here fails or alters the price: lookup errors become
//! [`ConstituentReport::Unexplained`] entries and the verdict is only logged.

use crate::address::{normalize, AddressKey, NormalizedAddress};
use crate::metrics;
use crate::settings::Settings;
use crate::token_metadata::{TokenBucket, TokenMetadata, ValueSource};
use futures::future::BoxFuture;
use log::{debug, warn};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plausibility {
    Plausible,
    ImplausibleHigh,
    ImplausibleLow,
    /// The token is out of bounds and at least one constituent is too.
    UnderlyingImplausible,
}

impl Plausibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plausibility::Plausible => "plausible",
            Plausibility::ImplausibleHigh => "implausible_high",
            Plausibility::ImplausibleLow => "implausible_low",
            Plausibility::UnderlyingImplausible => "underlying_implausible",
        }
    }

    pub fn is_plausible(&self) -> bool {
        matches!(self, Plausibility::Plausible)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstituentReport {
    Evaluated(PlausibilityVerdict),
    SkippedCycle(NormalizedAddress),
    Unexplained {
        token: NormalizedAddress,
        reason: String,
    },
}

impl ConstituentReport {
    pub fn token(&self) -> NormalizedAddress {
        match self {
            ConstituentReport::Evaluated(v) => v.token,
            ConstituentReport::SkippedCycle(token) => *token,
            ConstituentReport::Unexplained { token, .. } => *token,
        }
    }

    pub fn is_implausible(&self) -> bool {
        matches!(self, ConstituentReport::Evaluated(v) if !v.plausibility.is_plausible())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlausibilityVerdict {
    pub token: NormalizedAddress,
    pub block: u64,
    pub value: Decimal,
    pub plausibility: Plausibility,
    pub constituents: Vec<ConstituentReport>,
    /// Set when the token could not be classified.
    pub unexplained: Option<String>,
}

impl PlausibilityVerdict {
    /// Constituents whose own value is out of bounds.
    pub fn implausible_underlyings(&self) -> Vec<&PlausibilityVerdict> {
        self.constituents
            .iter()
            .filter_map(|c| match c {
                ConstituentReport::Evaluated(v) if !v.plausibility.is_plausible() => Some(v),
                _ => None,
            })
            .collect()
    }

    /// Every root-to-leaf path through implausible tokens.
    pub fn implausible_paths(&self) -> Vec<Vec<NormalizedAddress>> {
        if self.plausibility.is_plausible() {
            return Vec::new();
        }
        let mut paths = Vec::new();
        for child in self.implausible_underlyings() {
            for mut path in child.implausible_paths() {
                path.insert(0, self.token);
                paths.push(path);
            }
        }
        if paths.is_empty() {
            paths.push(vec![self.token]);
        }
        paths
    }

    /// Skipped-cycle markers anywhere in the tree.
    pub fn skipped_cycles(&self) -> Vec<NormalizedAddress> {
        let mut out = Vec::new();
        for c in &self.constituents {
            match c {
                ConstituentReport::SkippedCycle(token) => out.push(*token),
                ConstituentReport::Evaluated(v) => out.extend(v.skipped_cycles()),
                ConstituentReport::Unexplained { .. } => {}
            }
        }
        out
    }
}

/// Bounds and allowlist for one chain.
#[derive(Debug, Clone)]
pub struct SenseCheckPolicy {
    chain_id: u64,
    chain_name: String,
    ceiling: Decimal,
    floor: Decimal,
    acceptable: HashSet<NormalizedAddress>,
}

impl SenseCheckPolicy {
    pub fn new(chain_id: u64, chain_name: impl Into<String>, floor: Decimal, ceiling: Decimal) -> Self {
        Self {
            chain_id,
            chain_name: chain_name.into(),
            ceiling,
            floor,
            acceptable: HashSet::new(),
        }
    }

    pub fn with_acceptable(mut self, tokens: impl IntoIterator<Item = NormalizedAddress>) -> Self {
        self.acceptable.extend(tokens);
        self
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let sense = &settings.sense_check;
        let ceiling = Decimal::try_from(sense.price_ceiling).unwrap_or_else(|e| {
            warn!("Invalid price_ceiling {}: {}, using 1000", sense.price_ceiling, e);
            Decimal::from(1000)
        });
        let floor = Decimal::try_from(sense.price_floor).unwrap_or_else(|e| {
            warn!("Invalid price_floor {}: {}, using 0", sense.price_floor, e);
            Decimal::ZERO
        });

        let acceptable = sense
            .acceptable_for_chain(settings.chain.id)
            .into_iter()
            .filter_map(|raw| match normalize(raw.as_str()) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Skipping acceptable_high_prices entry: {}", e);
                    None
                }
            });

        Self::new(settings.chain.id, settings.chain.name.clone(), floor, ceiling)
            .with_acceptable(acceptable)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn is_acceptable(&self, token: &NormalizedAddress) -> bool {
        self.acceptable.contains(token)
    }

    /// Bound check for one token, ignoring constituents.
    pub fn classify(&self, token: &NormalizedAddress, value: Decimal) -> Plausibility {
        if self.is_acceptable(token) {
            Plausibility::Plausible
        } else if value > self.ceiling {
            Plausibility::ImplausibleHigh
        } else if value < self.floor {
            Plausibility::ImplausibleLow
        } else {
            Plausibility::Plausible
        }
    }
}

pub struct SenseCheck {
    policy: SenseCheckPolicy,
    metadata: Arc<dyn TokenMetadata>,
    values: Arc<dyn ValueSource>,
    address_key: AddressKey,
}

impl SenseCheck {
    pub fn new(
        policy: SenseCheckPolicy,
        metadata: Arc<dyn TokenMetadata>,
        values: Arc<dyn ValueSource>,
    ) -> Self {
        Self {
            policy,
            metadata,
            values,
            address_key: AddressKey::new(),
        }
    }

    /// Shares an existing checksum memo for the addresses in log lines.
    pub fn with_address_key(mut self, address_key: AddressKey) -> Self {
        self.address_key = address_key;
        self
    }

    pub fn policy(&self) -> &SenseCheckPolicy {
        &self.policy
    }

    /// Full verdict tree for `value`.
    pub async fn evaluate(
        &self,
        token: NormalizedAddress,
        block: u64,
        value: Decimal,
    ) -> PlausibilityVerdict {
        let mut visited = HashSet::new();
        visited.insert(token);
        self.descend(token, block, value, &mut visited).await
    }

    fn descend<'a>(
        &'a self,
        token: NormalizedAddress,
        block: u64,
        value: Decimal,
        visited: &'a mut HashSet<NormalizedAddress>,
    ) -> BoxFuture<'a, PlausibilityVerdict> {
        Box::pin(async move {
            let mut verdict = PlausibilityVerdict {
                token,
                block,
                value,
                plausibility: self.policy.classify(&token, value),
                constituents: Vec::new(),
                unexplained: None,
            };
            if verdict.plausibility.is_plausible() {
                return verdict;
            }

            let constituents = match self.metadata.bucket(token).await {
                Ok(TokenBucket::Simple) => return verdict,
                Ok(TokenBucket::Composite(constituents)) => constituents,
                Err(e) => {
                    verdict.unexplained = Some(format!("bucket lookup failed: {:#}", e));
                    return verdict;
                }
            };

            for constituent in constituents {
                if !visited.insert(constituent) {
                    verdict
                        .constituents
                        .push(ConstituentReport::SkippedCycle(constituent));
                    continue;
                }
                let report = match self.values.value_of(constituent, block).await {
                    Ok(Some(v)) => ConstituentReport::Evaluated(
                        self.descend(constituent, block, v, &mut *visited).await,
                    ),
                    Ok(None) => ConstituentReport::Unexplained {
                        token: constituent,
                        reason: "no value available".to_string(),
                    },
                    Err(e) => ConstituentReport::Unexplained {
                        token: constituent,
                        reason: format!("{:#}", e),
                    },
                };
                visited.remove(&constituent);
                verdict.constituents.push(report);
            }

            if self.wraps_acceptable(&verdict) {
                verdict.plausibility = Plausibility::Plausible;
            } else if verdict.constituents.iter().any(ConstituentReport::is_implausible) {
                verdict.plausibility = Plausibility::UnderlyingImplausible;
            }
            verdict
        })
    }

    /// True when every constituent is allowlisted or itself wraps only allowlisted tokens.
    fn wraps_acceptable(&self, verdict: &PlausibilityVerdict) -> bool {
        !verdict.constituents.is_empty()
            && verdict.constituents.iter().all(|c| match c {
                ConstituentReport::Evaluated(v) => {
                    self.policy.is_acceptable(&v.token) || self.wraps_acceptable(v)
                }
                _ => false,
            })
    }

    /// Evaluates and logs. Never fails.
    pub async fn validate(&self, token: NormalizedAddress, block: u64, value: Decimal) {
        let verdict = self.evaluate(token, block, value).await;
        self.report(&verdict).await;
    }

    /// [`validate`](Self::validate) on a detached task.
    pub fn spawn(self: &Arc<Self>, token: NormalizedAddress, block: u64, value: Decimal) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.validate(token, block, value).await })
    }

    async fn describe(&self, token: NormalizedAddress) -> String {
        let checksummed = self.address_key.checksum_offloaded(token).await;
        match self.metadata.symbol(token).await {
            Some(symbol) => format!("{} {}", symbol, checksummed),
            None => checksummed.to_string(),
        }
    }

    async fn report(&self, verdict: &PlausibilityVerdict) {
        metrics::increment_sense_check(verdict.plausibility.as_str());
        if verdict.plausibility.is_plausible() {
            return;
        }

        let subject = self.describe(verdict.token).await;
        let kind = match verdict.plausibility {
            Plausibility::ImplausibleLow => "unusually low",
            _ => "unusually high",
        };
        let mut message = format!(
            "{} price ({}) returned for {} on {} block {}.",
            kind,
            verdict.value.round_dp(4),
            subject,
            self.policy.chain_name,
            verdict.block
        );

        if verdict.plausibility == Plausibility::UnderlyingImplausible {
            let mut paths = Vec::new();
            for path in verdict.implausible_paths() {
                let mut hops = Vec::with_capacity(path.len());
                for hop in path {
                    hops.push(self.describe(hop).await);
                }
                paths.push(hops.join(" -> "));
            }
            message.push_str(&format!(" Implausible underlyings: {}.", paths.join("; ")));
        }

        let mut unexplained: Vec<String> = verdict
            .constituents
            .iter()
            .filter_map(|c| match c {
                ConstituentReport::Unexplained { token, reason } => Some(format!("{} ({})", token, reason)),
                _ => None,
            })
            .collect();
        if let Some(reason) = &verdict.unexplained {
            unexplained.push(reason.clone());
        }
        if !unexplained.is_empty() {
            message.push_str(&format!(" Could not check: {}.", unexplained.join(", ")));
        }

        let cycles = verdict.skipped_cycles();
        if !cycles.is_empty() {
            debug!("sense check for {} skipped cyclic constituents {:?}", verdict.token, cycles);
        }

        warn!(
            "{} This does not necessarily mean that the price is wrong, but you may want to validate the price for yourself before proceeding.",
            message
        );
    }
}
