use crate::agent::metrics::PROMETHEUS_REGISTRY;

pub mod main_coins;
pub use main_coins::MainCoins;

/// State contains all relevant shared application state.
pub struct State {
    /// Cache of the main coins of every network.
    main_coins: main_coins::MainCoinsState,
}

impl State {
    pub async fn new(config: &crate::agent::config::Config) -> Self {
        let registry = &mut *PROMETHEUS_REGISTRY.lock().await;
        State {
            main_coins: main_coins::MainCoinsState::new(config.main_coins.clone(), registry),
        }
    }

    #[cfg(test)]
    pub async fn new_tests(config: main_coins::Config) -> Self {
        let registry = &mut *PROMETHEUS_REGISTRY.lock().await;
        State {
            main_coins: main_coins::MainCoinsState::new(config, registry),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{
            MainCoins,
            State,
            main_coins,
        },
        crate::agent::{
            database::tests::{
                InMemoryCoinSource,
                coin,
            },
            services::main_coins as main_coins_service,
        },
        std::{
            sync::Arc,
            time::Duration,
        },
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_service_populates_state() {
        let config = main_coins::Config {
            refresh_interval_duration: Duration::from_millis(10),
            retry_initial_interval: Duration::ZERO,
            ..Default::default()
        };
        let state = Arc::new(State::new_tests(config).await);
        let source = Arc::new(InMemoryCoinSource::new(vec![coin(1, 7), coin(2, 7)]));

        let jh = tokio::spawn(main_coins_service(state.clone(), source.clone()));

        let mut page = state.main_coins_by_network(7, 10, 0).await;
        for _ in 0..100 {
            if !page.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            page = state.main_coins_by_network(7, 10, 0).await;
        }
        assert_eq!(page.len(), 2);

        // Later ticks pick up changes in the database.
        source.set_coins(vec![coin(3, 7)]);
        for _ in 0..100 {
            if state.main_coins_by_network(7, 10, 0).await.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.main_coins_by_network(7, 10, 0).await[0].id, 3);

        jh.abort();
    }
}
