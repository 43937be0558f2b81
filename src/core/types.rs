use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Typed errors for the types subsystem
#[derive(Error, Debug)]
pub enum TypesError {
    #[error("Invalid class code: {0}")]
    InvalidClassCode(String),
    #[error("Invalid security code: {0}")]
    InvalidSecurityCode(String),
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(u64),
}

/// Locally assigned order transaction identifier
pub type TransactionId = u64;

/// Lifecycle of the terminal connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 3,
}

impl ConnectionStatus {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            3 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Identity of one data feed: class code plus security code,
/// e.g. `SPBFUT` / `RIU8`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityKey {
    pub class_code: String,
    pub sec_code: String,
}

impl SecurityKey {
    /// Create a new key with validation
    pub fn new(
        class_code: impl Into<String>,
        sec_code: impl Into<String>,
    ) -> Result<Self, TypesError> {
        let class_code = class_code.into();
        let sec_code = sec_code.into();

        if class_code.trim().is_empty() {
            return Err(TypesError::InvalidClassCode(class_code));
        }
        if sec_code.trim().is_empty() {
            return Err(TypesError::InvalidSecurityCode(sec_code));
        }

        Ok(Self {
            class_code,
            sec_code,
        })
    }
}

impl fmt::Display for SecurityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_code, self.sec_code)
    }
}

/// Anonymous trade tick delivered by the `OnAllTrade` push event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AllTrade {
    pub class_code: String,
    pub sec_code: String,
    pub price: Decimal,
    pub qty: Decimal,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub trade_num: Option<u64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub flags: Option<i64>,
}

impl AllTrade {
    pub fn key(&self) -> SecurityKey {
        SecurityKey {
            class_code: self.class_code.clone(),
            sec_code: self.sec_code.clone(),
        }
    }
}

/// Detailed transaction reply, the table row QUIK reports once a
/// transaction has been processed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransReplyDetail {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub trans_id: Option<TransactionId>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub status: Option<i64>,
    #[serde(default)]
    pub result_msg: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub order_num: Option<u64>,
    #[serde(default)]
    pub class_code: Option<String>,
    #[serde(default)]
    pub sec_code: Option<String>,
}

/// `OnTransReply` arrives in two shapes under the same event name: an early
/// acknowledgement carrying a bare value, and the detailed reply object.
#[derive(Debug, Clone, PartialEq)]
pub enum TransReply {
    Ack(Value),
    Detailed(TransReplyDetail),
}

impl TransReply {
    pub fn trans_id(&self) -> Option<TransactionId> {
        match self {
            Self::Detailed(detail) => detail.trans_id,
            Self::Ack(_) => None,
        }
    }
}

/// Order direction, rendered as the `OPERATION` transaction field.
/// The terminal bridge only places buy orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
}

impl OrderSide {
    pub const fn as_operation(self) -> &'static str {
        match self {
            Self::Buy => "B",
        }
    }
}

/// An order transaction sent to the terminal and not yet answered in detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub trans_id: TransactionId,
    pub account: String,
    pub class_code: String,
    pub sec_code: String,
    pub quantity: u64,
    pub side: OrderSide,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

/// Accepts integers, floats with no fractional part and numeric strings.
/// Lua-side serializers are inconsistent about which one they emit.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

/// Signed counterpart of `lenient_u64`. Values that are not integral become
/// `None` instead of failing the whole event.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}
