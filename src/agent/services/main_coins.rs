//! Main Coins
//!
//! The Main Coins service keeps the main coins cache in sync with the database by running
//! a full refresh pass on every tick.

use {
    crate::agent::{
        database::CoinSource,
        state::MainCoins,
    },
    std::sync::Arc,
    tokio::time::MissedTickBehavior,
    tracing::instrument,
};

#[instrument(skip(state, source))]
pub async fn main_coins<S>(state: Arc<S>, source: Arc<dyn CoinSource>)
where
    S: MainCoins,
    S: Send + Sync + 'static,
{
    let mut interval = tokio::time::interval(state.main_coins_refresh_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut exit = crate::agent::EXIT.subscribe();
    loop {
        tokio::select! {
            _ = exit.changed() => {
                tracing::info!("Shutdown signal received.");
                return;
            }
            _ = interval.tick() => {
                // The pass runs to completion before a shutdown signal is looked at.
                tracing::info!("Refreshing main coins cache.");
                if let Err(err) = state.refresh_main_coins(&*source).await {
                    tracing::error!(err = ?err, "Failed to refresh main coins cache.");
                }
                tracing::info!("Finished refreshing main coins cache.");
            }
        }
    }
}
