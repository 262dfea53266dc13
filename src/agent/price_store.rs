//! Price Store
//!
//! The Price Store holds the latest price per (chain, token) pair in a single hash of a
//! shared key/value store. Each field is keyed by `<chainId>_<address>` and holds the
//! JSON encoding of a `SymbolPrice`. Writes are last-write-wins.

use {
    crate::agent::coin::{
        ChainId,
        SymbolInfo,
        SymbolPrice,
    },
    anyhow::{
        Context,
        Result,
    },
};

pub mod redis;

pub use self::redis::RedisHash;

/// Hash holding all coin prices.
pub const COIN_PRICE_HASH_KEY: &str = "bridge_coin_prices";

/// Stand-in for the address of tokens that have none (e.g. native tokens).
const NULL_TOKEN: &str = "null";

pub type RedisPriceStore = HashPriceStore<RedisHash>;

/// Batched access to a single hash of the backing store.
#[async_trait::async_trait]
pub trait PriceHash: Send + Sync {
    /// Sets all `fields` in one round trip.
    async fn set_fields(&self, hash: &str, fields: Vec<(String, String)>) -> Result<()>;

    /// Reads all `fields` in one round trip. The result is positionally aligned with
    /// `fields`, with `None` for fields that are not set.
    async fn get_fields(&self, hash: &str, fields: Vec<String>) -> Result<Vec<Option<String>>>;
}

#[async_trait::async_trait]
pub trait PriceStore: Send + Sync {
    /// Writes every present record as one batch. A failure covers the whole batch.
    async fn set_coin_price(&self, prices: &[Option<SymbolPrice>]) -> Result<()>;

    /// Reads the latest price of each requested token. The output is aligned with
    /// `symbols`: missing entries, unknown tokens and undecodable stored values all yield
    /// an empty `SymbolPrice`.
    async fn get_coin_price(&self, symbols: &[Option<SymbolInfo>]) -> Result<Vec<SymbolPrice>>;
}

pub fn coin_price_key(chain_id: ChainId, address: &str) -> String {
    let address = if address.is_empty() {
        NULL_TOKEN
    } else {
        address
    };
    format!("{}_{}", chain_id, address)
}

pub struct HashPriceStore<H> {
    hash: H,
}

impl<H: PriceHash> HashPriceStore<H> {
    pub fn new(hash: H) -> Self {
        Self { hash }
    }
}

#[async_trait::async_trait]
impl<H: PriceHash> PriceStore for HashPriceStore<H> {
    async fn set_coin_price(&self, prices: &[Option<SymbolPrice>]) -> Result<()> {
        tracing::debug!(size = prices.len(), "Price store: setting coin prices.");

        let fields = prices
            .iter()
            .flatten()
            .map(|price| {
                let value = serde_json::to_string(price).context("failed to encode price")?;
                Ok((coin_price_key(price.chain_id, &price.address), value))
            })
            .collect::<Result<Vec<_>>>()?;

        if fields.is_empty() {
            return Ok(());
        }

        self.hash
            .set_fields(COIN_PRICE_HASH_KEY, fields)
            .await
            .context("failed to write coin prices")
    }

    async fn get_coin_price(&self, symbols: &[Option<SymbolInfo>]) -> Result<Vec<SymbolPrice>> {
        tracing::debug!(size = symbols.len(), "Price store: getting coin prices.");

        let keys: Vec<String> = symbols
            .iter()
            .flatten()
            .map(|symbol| coin_price_key(symbol.chain_id, &symbol.address))
            .collect();

        let values = if keys.is_empty() {
            Vec::new()
        } else {
            self.hash
                .get_fields(COIN_PRICE_HASH_KEY, keys)
                .await
                .context("failed to read coin prices")?
        };
        let mut values = values.into_iter();

        Ok(symbols
            .iter()
            .map(|symbol| match symbol {
                // Absent requests hold their position with a placeholder.
                None => SymbolPrice::default(),
                Some(symbol) => values
                    .next()
                    .flatten()
                    .map(|value| decode_price(symbol, &value))
                    .unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
impl<H> HashPriceStore<H> {
    pub fn backend(&self) -> &H {
        &self.hash
    }
}

fn decode_price(symbol: &SymbolInfo, value: &str) -> SymbolPrice {
    serde_json::from_str(value).unwrap_or_else(|err| {
        tracing::info!(
            key = %coin_price_key(symbol.chain_id, &symbol.address),
            value,
            err = ?err,
            "Price store: cannot decode stored price.",
        );
        SymbolPrice::default()
    })
}
