use crate::core::types::{OrderSide, PendingTransaction, SecurityKey, TransactionId};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Order type sent with every transaction: limit
const ORDER_TYPE: &str = "L";
const ACTION_NEW_ORDER: &str = "NEW_ORDER";

/// Issues transaction ids and remembers orders until their reply arrives.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    last_id: AtomicU64,
    pending: DashMap<TransactionId, PendingTransaction>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id (1, 2, 3, ... without gaps) and record the order.
    pub fn register(
        &self,
        account: &str,
        key: &SecurityKey,
        quantity: u64,
        side: OrderSide,
    ) -> PendingTransaction {
        let trans_id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = PendingTransaction {
            trans_id,
            account: account.to_string(),
            class_code: key.class_code.clone(),
            sec_code: key.sec_code.clone(),
            quantity,
            side,
            acknowledged: false,
            created_at: Utc::now(),
        };
        self.pending.insert(trans_id, pending.clone());
        pending
    }

    /// Mark a transaction as received by the terminal.
    pub fn acknowledge(&self, trans_id: TransactionId) -> bool {
        match self.pending.get_mut(&trans_id) {
            Some(mut entry) => {
                entry.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Remove a transaction once its detailed reply came back.
    pub fn complete(&self, trans_id: TransactionId) -> Option<PendingTransaction> {
        self.pending.remove(&trans_id).map(|(_, pending)| pending)
    }

    /// Drop transactions that waited longer than `ttl` for a reply.
    pub fn evict_expired(&self, ttl: Duration) -> Vec<TransactionId> {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - ttl;

        let expired: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|entry| entry.created_at < cutoff)
            .map(|entry| *entry.key())
            .collect();
        for trans_id in &expired {
            self.pending.remove(trans_id);
        }
        expired
    }

    pub fn get(&self, trans_id: TransactionId) -> Option<PendingTransaction> {
        self.pending.get(&trans_id).map(|entry| entry.clone())
    }

    /// Pending transactions ordered by id
    pub fn pending(&self) -> Vec<PendingTransaction> {
        let mut pending: Vec<PendingTransaction> =
            self.pending.iter().map(|entry| entry.clone()).collect();
        pending.sort_by_key(|p| p.trans_id);
        pending
    }

    pub fn last_id(&self) -> TransactionId {
        self.last_id.load(Ordering::SeqCst)
    }
}

/// Render the newline separated `KEY=VALUE` transaction string that the
/// terminal's `sendTransaction` expects.
pub fn transaction_payload(pending: &PendingTransaction, client_code: &str) -> String {
    [
        format!("ACCOUNT={}", pending.account),
        format!("CLIENT_CODE={}", client_code),
        format!("TYPE={}", ORDER_TYPE),
        format!("TRANS_ID={}", pending.trans_id),
        format!("CLASSCODE={}", pending.class_code),
        format!("SECCODE={}", pending.sec_code),
        format!("ACTION={}", ACTION_NEW_ORDER),
        format!("OPERATION={}", pending.side.as_operation()),
        "PRICE=0".to_string(),
        format!("QUANTITY={}", pending.quantity),
    ]
    .join("\n")
}
