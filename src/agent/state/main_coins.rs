// The Main Coins cache keeps an in-memory copy of every main coin in the bridge database,
// grouped by network. A refresh pass reads the whole table page by page and swaps the new
// snapshot in at once, so readers only ever see complete snapshots.
use {
    super::State,
    crate::agent::{
        coin::{
            CoinInfo,
            NetworkId,
        },
        database::CoinSource,
        metrics::{
            MainCoinsMetrics,
            RefreshOutcome,
        },
    },
    anyhow::{
        Context,
        Result,
    },
    backoff::{
        ExponentialBackoff,
        backoff::Backoff,
    },
    prometheus_client::registry::Registry,
    serde::{
        Deserialize,
        Serialize,
    },
    std::{
        collections::HashMap,
        ops::{
            Deref,
            Range,
        },
        sync::Arc,
        time::Duration,
    },
    tokio::sync::RwLock,
    tracing::instrument,
};

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    /// Duration of the interval at which the cache is refreshed from the database.
    #[serde(with = "humantime_serde")]
    pub refresh_interval_duration: Duration,
    /// Number of rows read from the database per query.
    pub page_size:                 usize,
    /// Number of times a failed page read is retried before the refresh pass is abandoned.
    pub max_retries:               usize,
    /// Delay before the first retry of a page. Later retries double it up to
    /// `retry_max_interval`. Zero retries immediately.
    #[serde(with = "humantime_serde")]
    pub retry_initial_interval:    Duration,
    #[serde(with = "humantime_serde")]
    pub retry_max_interval:        Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_duration: Duration::from_secs(5),
            page_size:                 100,
            max_retries:               5,
            retry_initial_interval:    Duration::from_millis(100),
            retry_max_interval:        Duration::from_secs(2),
        }
    }
}

impl Config {
    fn retry_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.retry_initial_interval,
            initial_interval: self.retry_initial_interval,
            max_interval: self.retry_max_interval,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// A page of main coins.
///
/// The page shares the snapshot it was cut from, so it stays valid and unchanged after
/// a refresh publishes a newer snapshot.
#[derive(Clone, Debug)]
pub struct CoinPage {
    coins: Arc<[CoinInfo]>,
    range: Range<usize>,
}

impl CoinPage {
    fn empty() -> Self {
        Self {
            coins: Arc::from(Vec::new()),
            range: 0..0,
        }
    }

    fn new(coins: Arc<[CoinInfo]>, limit: usize, offset: usize) -> Self {
        if limit == 0 || offset >= coins.len() {
            return Self::empty();
        }
        let end = offset.saturating_add(limit).min(coins.len());
        Self {
            coins,
            range: offset..end,
        }
    }
}

impl Deref for CoinPage {
    type Target = [CoinInfo];

    fn deref(&self) -> &Self::Target {
        &self.coins[self.range.clone()]
    }
}

pub struct MainCoinsState {
    config:   Config,
    /// networkID -> coins of that network, in database order
    snapshot: RwLock<HashMap<NetworkId, Arc<[CoinInfo]>>>,
    metrics:  MainCoinsMetrics,
}

impl MainCoinsState {
    pub fn new(config: Config, registry: &mut Registry) -> Self {
        Self {
            config,
            snapshot: Default::default(),
            metrics: MainCoinsMetrics::new(registry),
        }
    }
}

#[async_trait::async_trait]
pub trait MainCoins {
    fn main_coins_refresh_interval(&self) -> Duration;

    /// Reads every main coin from `source` and publishes them as the new snapshot. On
    /// failure the previous snapshot stays in place.
    async fn refresh_main_coins(&self, source: &dyn CoinSource) -> Result<()>;

    /// Returns the coins of `network_id` in `[offset, offset + limit)`. Out of range
    /// windows yield an empty page.
    async fn main_coins_by_network(
        &self,
        network_id: NetworkId,
        limit: usize,
        offset: usize,
    ) -> CoinPage;
}

// Allow downcasting State into MainCoinsState for functions that depend on the `MainCoins` service.
impl<'a> From<&'a State> for &'a MainCoinsState {
    fn from(state: &'a State) -> &'a MainCoinsState {
        &state.main_coins
    }
}

#[async_trait::async_trait]
impl<T> MainCoins for T
where
    for<'a> &'a T: Into<&'a MainCoinsState>,
    T: Sync,
{
    fn main_coins_refresh_interval(&self) -> Duration {
        self.into().config.refresh_interval_duration
    }

    #[instrument(skip(self, source))]
    async fn refresh_main_coins(&self, source: &dyn CoinSource) -> Result<()> {
        let state: &MainCoinsState = self.into();

        let snapshot = match read_all_main_coins(&state.config, source).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                state.metrics.record_refresh(RefreshOutcome::Failure);
                return Err(err);
            }
        };

        let counts = snapshot
            .iter()
            .map(|(network, coins)| (*network, coins.len()))
            .collect::<HashMap<_, _>>();
        tracing::debug!(networks = counts.len(), "Main coins: publishing snapshot.");

        *state.snapshot.write().await = snapshot;

        state.metrics.record_snapshot(&counts);
        state.metrics.record_refresh(RefreshOutcome::Success);
        Ok(())
    }

    async fn main_coins_by_network(
        &self,
        network_id: NetworkId,
        limit: usize,
        offset: usize,
    ) -> CoinPage {
        let coins = self.into().snapshot.read().await.get(&network_id).cloned();
        match coins {
            Some(coins) => CoinPage::new(coins, limit, offset),
            None => CoinPage::empty(),
        }
    }
}

/// Pages through `source` until a short page marks the end of the table. A page that
/// keeps failing past the retry budget abandons the whole pass.
async fn read_all_main_coins(
    config: &Config,
    source: &dyn CoinSource,
) -> Result<HashMap<NetworkId, Arc<[CoinInfo]>>> {
    let page_size = config.page_size.max(1);
    let mut grouped: HashMap<NetworkId, Vec<CoinInfo>> = HashMap::new();
    let mut offset = 0;
    let mut retries = 0;
    let mut backoff = config.retry_backoff();

    loop {
        let coins = match source.get_all_main_coins(page_size, offset).await {
            Ok(coins) => coins,
            Err(err) => {
                if retries >= config.max_retries {
                    return Err(err).with_context(|| {
                        format!(
                            "failed to read main coins at offset {} after {} retries",
                            offset, retries
                        )
                    });
                }
                retries += 1;

                let delay = backoff.next_backoff().unwrap_or(config.retry_max_interval);
                tracing::warn!(
                    offset,
                    retries,
                    delay = ?delay,
                    err = ?err,
                    "Main coins: failed to read page, retrying."
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }
        };

        retries = 0;
        backoff.reset();

        let count = coins.len();
        for coin in coins {
            grouped.entry(coin.network_id).or_default().push(coin);
        }

        if count < page_size {
            break;
        }
        offset += count;
    }

    Ok(grouped
        .into_iter()
        .map(|(network, coins)| (network, Arc::from(coins)))
        .collect())
}
