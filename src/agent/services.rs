pub mod main_coins;
pub mod price_consumer;

pub use {
    main_coins::main_coins,
    price_consumer::price_consumer,
};
