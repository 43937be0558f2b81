pub mod codec;
pub mod connector;
mod dispatch;
pub mod session;
pub mod subscriptions;
pub mod transactions;

use crate::core::config::QuikConfig;
use crate::core::errors::QuikError;

// Re-export main types for easier importing
pub use codec::{QuikCodec, QuikEvent, QuikMessage, QuikRequest};
pub use connector::{QuikConnector, ShutdownHandle};
pub use session::{Session, TransReplyCallback};
pub use subscriptions::{FeedCallback, SubscriptionRegistry};
pub use transactions::TransactionTracker;

/// Create a QUIK connector from an explicit configuration
pub fn create_quik_connector(config: QuikConfig) -> Result<QuikConnector, QuikError> {
    QuikConnector::new(config)
}

/// Create a QUIK connector from `<prefix>_*` environment variables
pub fn create_quik_connector_from_env(prefix: &str) -> Result<QuikConnector, QuikError> {
    QuikConnector::new(QuikConfig::from_env(prefix)?)
}
