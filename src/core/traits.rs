use crate::core::{
    errors::QuikError,
    types::{AllTrade, TransReply, TransactionId},
};

pub trait MarketDataSource {
    /// Register a tick callback for one security.
    ///
    /// The callback is kept even while disconnected; the data source request
    /// goes out once the connection is authenticated.
    fn subscribe<F>(&self, class_code: &str, sec_code: &str, callback: F) -> Result<(), QuikError>
    where
        F: Fn(&AllTrade) + Send + Sync + 'static;
}

pub trait OrderPlacer {
    /// Send a new order; the outcome arrives later as a transaction reply
    fn send_order(
        &self,
        class_code: &str,
        sec_code: &str,
        quantity: u64,
    ) -> Result<TransactionId, QuikError>;

    /// Receive every transaction reply the terminal reports
    fn subscribe_transactions<F>(&self, callback: F)
    where
        F: Fn(&TransReply) + Send + Sync + 'static;
}

// Composite trait for code that needs both feeds and orders
pub trait TerminalConnector: MarketDataSource + OrderPlacer {}
