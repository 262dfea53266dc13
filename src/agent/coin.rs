//! Coin and price value types shared by the cache, the price store and the ingestion path.

use {
    serde::{
        Deserialize,
        Serialize,
    },
    serde_this_or_that::as_u64,
};

pub type NetworkId = u32;
pub type ChainId = u64;

/// A main (featured) coin of a network, as stored in the relational database.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CoinInfo {
    pub id:         u64,
    pub network_id: NetworkId,
    pub chain_id:   ChainId,
    pub symbol:     String,
    pub name:       String,
    pub address:    String,
    pub decimals:   u32,
    pub logo_link:  String,
}

/// Identifies a token whose price is being looked up.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SymbolInfo {
    #[serde(deserialize_with = "as_u64")]
    pub chain_id: ChainId,
    pub address:  String,
}

impl SymbolInfo {
    pub fn new(chain_id: ChainId, address: impl Into<String>) -> Self {
        Self {
            chain_id,
            address: address.into(),
        }
    }
}

/// Latest known price of a token.
///
/// `chainId` and `time` accept both JSON numbers and decimal strings, since producers
/// using protobuf JSON render 64-bit integers as strings. Unknown fields are rejected, so
/// unrelated JSON objects never pass for a price.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SymbolPrice {
    #[serde(deserialize_with = "as_u64")]
    pub chain_id:        ChainId,
    pub address:         String,
    pub symbol:          String,
    pub price:           f64,
    /// Milliseconds since the unix epoch at which the producer observed `price`.
    #[serde(deserialize_with = "as_u64")]
    pub time:            u64,
    pub is_native_token: bool,
}

impl SymbolPrice {
    /// True for the placeholder returned when no usable price is stored for a key.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl From<&SymbolPrice> for SymbolInfo {
    fn from(price: &SymbolPrice) -> Self {
        SymbolInfo::new(price.chain_id, price.address.clone())
    }
}
