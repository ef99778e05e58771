pub mod demo;
pub mod prices;

pub use demo::{demo_chain, demo_prices, DEMO_WALLET};
pub use prices::{CoingeckoPriceSource, FallbackPriceSource};
