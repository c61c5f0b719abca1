use crate::address::NormalizedAddress;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// How a token's value is made up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenBucket {
    /// Priced directly.
    Simple,
    /// Priced from the listed underlying tokens (LP shares, vault shares, wrappers).
    Composite(Vec<NormalizedAddress>),
}

impl TokenBucket {
    pub fn is_composite(&self) -> bool {
        matches!(self, TokenBucket::Composite(_))
    }
}

/// Token classification, provided by whoever owns the token universe.
#[async_trait]
pub trait TokenMetadata: Send + Sync {
    async fn bucket(&self, token: NormalizedAddress) -> anyhow::Result<TokenBucket>;

    /// Display symbol for diagnostics.
    async fn symbol(&self, _token: NormalizedAddress) -> Option<String> {
        None
    }
}

/// Current value of a token at a block, cached or freshly computed.
#[async_trait]
pub trait ValueSource: Send + Sync {
    async fn value_of(&self, token: NormalizedAddress, block: u64)
        -> anyhow::Result<Option<Decimal>>;
}
