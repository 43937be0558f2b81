use crate::core::errors::QuikError;
use crate::core::kernel::{ChunkDecoder, Codepage, StreamCodec};
use crate::core::types::{AllTrade, SecurityKey, TransReply, TransReplyDetail, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Separator written in front of every request after the handshake, and
/// between messages coming back.
pub const MSG_DELIMITER: &str = "message:";
pub const MSG_ID_AUTH: &str = "msg_auth";
pub const MSG_ID_CREATE_DATASOURCE: &str = "msg_create_ds";
pub const MSG_ID_CALLBACK: &str = "callback";
pub const CALLBACK_ALL_TRADE: &str = "OnAllTrade";
pub const CALLBACK_TRANS_REPLY: &str = "OnTransReply";
const TRANS_REPLY_SUFFIX: &str = "_reply";
const DATASOURCE_INTERVAL: &str = "INTERVAL_TICK";

/// Outgoing request as understood by the terminal-side Lua script
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuikRequest {
    pub id: String,
    pub method: String,
    pub args: Vec<String>,
}

impl QuikRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            args,
        }
    }

    pub fn auth(password: &str) -> Self {
        Self::new(MSG_ID_AUTH, "checkSecurity", vec![password.to_string()])
    }

    /// After `CreateDataSource` the terminal starts pushing `OnAllTrade`
    /// events for the security.
    pub fn create_datasource(key: &SecurityKey) -> Self {
        Self::new(
            datasource_message_id(key),
            "CreateDataSource",
            vec![
                key.class_code.clone(),
                key.sec_code.clone(),
                DATASOURCE_INTERVAL.to_string(),
            ],
        )
    }

    pub fn send_transaction(trans_id: TransactionId, payload: String) -> Self {
        Self::new(trans_id.to_string(), "sendTransaction", vec![payload])
    }

    /// Ask the terminal to report the outcome of a transaction via `OnTransReply`
    pub fn trans_reply(trans_id: TransactionId) -> Self {
        Self::new(
            format!("{}{}", trans_id, TRANS_REPLY_SUFFIX),
            CALLBACK_TRANS_REPLY,
            vec![trans_id.to_string()],
        )
    }
}

pub fn datasource_message_id(key: &SecurityKey) -> String {
    format!(
        "{}_{}_{}",
        MSG_ID_CREATE_DATASOURCE, key.class_code, key.sec_code
    )
}

/// Decoded incoming message
#[derive(Debug, Clone, PartialEq)]
pub enum QuikMessage {
    AuthReply {
        authorized: bool,
    },
    /// Data source id or error text for a `CreateDataSource` request
    DataSourceReply {
        key: Option<SecurityKey>,
        result: Value,
    },
    Callback(QuikEvent),
    /// Direct response to `sendTransaction` (`"<id>"`) or to the reply
    /// request (`"<id>_reply"`)
    TransactionResponse {
        trans_id: TransactionId,
        reply_request: bool,
        result: Value,
    },
}

/// Push events routed by `callback_name`
#[derive(Debug, Clone, PartialEq)]
pub enum QuikEvent {
    AllTrade(AllTrade),
    TransReply(TransReply),
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    callback_name: Option<String>,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct QuikCodec {
    codepage: Codepage,
}

impl QuikCodec {
    pub const fn new(codepage: Codepage) -> Self {
        Self { codepage }
    }

    /// The handshake is the only request written without a delimiter.
    pub fn encode_auth(&self, password: &str) -> Result<Vec<u8>, QuikError> {
        let json = serde_json::to_string(&QuikRequest::auth(password))?;
        self.codepage.encode(&json)
    }

    fn decode_raw(&self, raw: RawMessage) -> Result<Option<QuikMessage>, QuikError> {
        let id = match (raw.id.as_deref(), raw.callback_name.is_some()) {
            (Some(id), _) => id,
            (None, true) => MSG_ID_CALLBACK,
            (None, false) => {
                return Err(QuikError::DeserializationError(
                    "Message has neither id nor callback_name".to_string(),
                ))
            }
        };

        if id == MSG_ID_AUTH {
            let authorized = decode_auth_result(&raw.result)?;
            return Ok(Some(QuikMessage::AuthReply { authorized }));
        }

        if id == MSG_ID_CALLBACK {
            let Some(name) = raw.callback_name else {
                return Err(QuikError::DeserializationError(
                    "Callback message without callback_name".to_string(),
                ));
            };
            return decode_event(&name, raw.result).map(|event| event.map(QuikMessage::Callback));
        }

        if let Some(rest) = id
            .strip_prefix(MSG_ID_CREATE_DATASOURCE)
            .and_then(|rest| rest.strip_prefix('_'))
        {
            let key = rest
                .split_once('_')
                .and_then(|(class_code, sec_code)| SecurityKey::new(class_code, sec_code).ok());
            return Ok(Some(QuikMessage::DataSourceReply {
                key,
                result: raw.result,
            }));
        }

        let (number, reply_request) = match id.strip_suffix(TRANS_REPLY_SUFFIX) {
            Some(number) => (number, true),
            None => (id, false),
        };
        if let Ok(trans_id) = number.parse::<TransactionId>() {
            return Ok(Some(QuikMessage::TransactionResponse {
                trans_id,
                reply_request,
                result: raw.result,
            }));
        }

        debug!("No handler for message id {}", id);
        Ok(None)
    }
}

impl StreamCodec for QuikCodec {
    type Request = QuikRequest;
    type Message = QuikMessage;

    fn encode_request(&self, request: &QuikRequest) -> Result<Vec<u8>, QuikError> {
        let json = serde_json::to_string(request)?;
        self.codepage.encode(&format!("{}{}", MSG_DELIMITER, json))
    }

    fn chunk_decoder(&self) -> ChunkDecoder {
        self.codepage.decoder()
    }

    fn decode_message(&self, fragment: &str) -> Result<Option<QuikMessage>, QuikError> {
        let raw: RawMessage = serde_json::from_str(fragment)?;
        self.decode_raw(raw)
    }
}

/// The terminal answers `checkSecurity` with `[true]` or `[false]`.
fn decode_auth_result(result: &Value) -> Result<bool, QuikError> {
    let flag = match result {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    flag.and_then(Value::as_bool).ok_or_else(|| {
        QuikError::DeserializationError(format!("Unexpected auth result: {}", result))
    })
}

fn decode_event(name: &str, result: Value) -> Result<Option<QuikEvent>, QuikError> {
    match name {
        CALLBACK_ALL_TRADE => {
            let trade: AllTrade = serde_json::from_value(result).map_err(|e| {
                QuikError::DeserializationError(format!("Failed to parse {}: {}", name, e))
            })?;
            Ok(Some(QuikEvent::AllTrade(trade)))
        }
        CALLBACK_TRANS_REPLY => {
            let reply = if result.is_object() {
                let detail: TransReplyDetail = serde_json::from_value(result).map_err(|e| {
                    QuikError::DeserializationError(format!("Failed to parse {}: {}", name, e))
                })?;
                TransReply::Detailed(detail)
            } else {
                TransReply::Ack(result)
            };
            Ok(Some(QuikEvent::TransReply(reply)))
        }
        _ => {
            debug!("No handler for callback {}", name);
            Ok(None)
        }
    }
}
