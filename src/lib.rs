pub mod core;
pub mod exchanges;

pub use crate::core::{
    config::QuikConfig,
    errors::QuikError,
    traits::{MarketDataSource, OrderPlacer, TerminalConnector},
    types::*,
};
pub use exchanges::quik::{QuikConnector, ShutdownHandle};
