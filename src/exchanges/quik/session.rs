use super::codec::{QuikCodec, QuikRequest};
use super::subscriptions::{FeedCallback, SubscriptionRegistry};
use super::transactions::{transaction_payload, TransactionTracker};
use crate::core::errors::QuikError;
use crate::core::kernel::{FrameSender, StreamCodec};
use crate::core::types::{
    ConnectionStatus, OrderSide, SecurityKey, TransReply, TransactionId, TypesError,
};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, instrument, warn};

pub type TransReplyCallback = Arc<dyn Fn(&TransReply) + Send + Sync>;

/// Connection state shared between caller threads and the receive loop.
///
/// The outbound frame queue exists exactly while the status is `Connecting`
/// or `Connected`: `attach` and `detach` change both together.
pub struct Session {
    status: AtomicU8,
    outbound: Mutex<Option<FrameSender>>,
    auth_rejected: AtomicBool,
    codec: QuikCodec,
    account: String,
    client_code: String,
    pub(super) subscriptions: SubscriptionRegistry,
    pub(super) transactions: TransactionTracker,
    pub(super) transaction_callbacks: RwLock<Vec<TransReplyCallback>>,
}

impl Session {
    pub fn new(codec: QuikCodec, account: impl Into<String>, client_code: impl Into<String>) -> Self {
        Self {
            status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            outbound: Mutex::new(None),
            auth_rejected: AtomicBool::new(false),
            codec,
            account: account.into(),
            client_code: client_code.into(),
            subscriptions: SubscriptionRegistry::new(),
            transactions: TransactionTracker::new(),
            transaction_callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Whether the terminal refused the password at some point
    pub fn auth_rejected(&self) -> bool {
        self.auth_rejected.load(Ordering::SeqCst)
    }

    /// Socket is open and the handshake was sent: `Connecting`.
    pub fn attach(&self, frames: FrameSender) {
        let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        *outbound = Some(frames);
        self.set_status(ConnectionStatus::Connecting);
    }

    /// Drop the outbound queue, which lets the writer task close the socket.
    pub fn detach(&self) {
        let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        *outbound = None;
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// `Connecting -> Connected`; false if the session was in any other state.
    pub(super) fn mark_connected(&self) -> bool {
        self.status
            .compare_exchange(
                ConnectionStatus::Connecting as u8,
                ConnectionStatus::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(super) fn reject_auth(&self) {
        self.auth_rejected.store(true, Ordering::SeqCst);
        self.detach();
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = ConnectionStatus::from_u8(self.status.swap(status as u8, Ordering::SeqCst));
        if previous != status {
            debug!("Status {} -> {}", previous, status);
        }
    }

    /// Queue a request for the writer task.
    pub fn send(&self, request: &QuikRequest) -> Result<(), QuikError> {
        let frame = self.codec.encode_request(request)?;
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = outbound.as_ref().ok_or(QuikError::NotConnected)?;
        debug!(id = %request.id, method = %request.method, "Sending message");
        sender
            .send(frame)
            .map_err(|_| QuikError::ConnectionClosed)
    }

    /// Record the feed callback and, when already connected, request the
    /// data source right away. Otherwise the request waits for the replay
    /// that follows authentication.
    pub fn subscribe(&self, key: SecurityKey, callback: FeedCallback) -> Result<(), QuikError> {
        if self.subscriptions.insert(key.clone(), callback) {
            debug!("Replaced feed callback for {}", key);
        }
        if self.is_connected() {
            self.create_datasource(&key)?;
        }
        Ok(())
    }

    pub fn subscribe_transactions(&self, callback: TransReplyCallback) {
        self.transaction_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn create_datasource(&self, key: &SecurityKey) -> Result<(), QuikError> {
        info!("Creating datasource for {}", key);
        self.send(&QuikRequest::create_datasource(key))
    }

    /// Issue `CreateDataSource` for every registered security. Failures are
    /// logged; the terminal tolerates a repeated request for the same feed.
    pub(super) fn replay_subscriptions(&self) {
        for key in self.subscriptions.keys() {
            if let Err(e) = self.create_datasource(&key) {
                warn!("Failed to create datasource for {}: {}", key, e);
            }
        }
    }

    /// Send a new buy order followed by the request to report its outcome.
    ///
    /// Returns the assigned transaction id as soon as both frames are queued;
    /// the result of the order only shows up as an `OnTransReply` event.
    #[instrument(skip(self), fields(account = %self.account))]
    pub fn send_order(
        &self,
        class_code: &str,
        sec_code: &str,
        quantity: u64,
    ) -> Result<TransactionId, QuikError> {
        let key = SecurityKey::new(class_code, sec_code)?;
        if quantity == 0 {
            return Err(TypesError::InvalidQuantity(quantity).into());
        }
        if !self.is_connected() {
            return Err(QuikError::NotConnected);
        }

        let pending = self
            .transactions
            .register(&self.account, &key, quantity, OrderSide::Buy);
        let trans_id = pending.trans_id;
        let payload = transaction_payload(&pending, &self.client_code);

        info!(trans_id, "Sending order {}", payload.replace('\n', ";"));
        if let Err(e) = self.send(&QuikRequest::send_transaction(trans_id, payload)) {
            self.transactions.complete(trans_id);
            return Err(e);
        }
        self.send(&QuikRequest::trans_reply(trans_id))?;

        Ok(trans_id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status())
            .field("account", &self.account)
            .field("subscriptions", &self.subscriptions)
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}
