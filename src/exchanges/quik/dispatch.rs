use super::codec::{QuikEvent, QuikMessage};
use super::session::Session;
use crate::core::errors::QuikError;
use crate::core::types::{AllTrade, SecurityKey, TransReply, TransactionId};
use serde_json::Value;
use std::sync::PoisonError;
use tracing::{debug, error, info, warn};

impl Session {
    /// Route one decoded message to its handler.
    ///
    /// Only a rejected authentication comes back as an error; every other
    /// outcome is logged.
    pub fn dispatch(&self, message: QuikMessage) -> Result<(), QuikError> {
        match message {
            QuikMessage::AuthReply { authorized } => self.on_auth(authorized),
            QuikMessage::DataSourceReply { key, result } => {
                self.on_create_datasource(key.as_ref(), &result);
                Ok(())
            }
            QuikMessage::Callback(event) => {
                self.on_callback(event);
                Ok(())
            }
            QuikMessage::TransactionResponse {
                trans_id,
                reply_request,
                result,
            } => {
                self.on_transaction_response(trans_id, reply_request, &result);
                Ok(())
            }
        }
    }

    fn on_auth(&self, authorized: bool) -> Result<(), QuikError> {
        if !authorized {
            error!("QUIK Lua authentication failed");
            self.reject_auth();
            return Err(QuikError::AuthError(
                "QUIK Lua authentication failed".to_string(),
            ));
        }

        if !self.mark_connected() {
            warn!("Ignoring auth reply while {}", self.status());
            return Ok(());
        }
        info!("Connected");
        self.replay_subscriptions();
        Ok(())
    }

    fn on_create_datasource(&self, key: Option<&SecurityKey>, result: &Value) {
        // Either the data source id or an error text
        let outcome = match result {
            Value::Array(items) => items.first().cloned().unwrap_or_default(),
            other => other.clone(),
        };
        match key {
            Some(key) => info!("Created datasource id for {}: {}", key, outcome),
            None => info!("Created datasource id: {}", outcome),
        }
    }

    fn on_callback(&self, event: QuikEvent) {
        match event {
            QuikEvent::AllTrade(trade) => self.on_all_trade(&trade),
            QuikEvent::TransReply(reply) => self.on_trans_reply(&reply),
        }
    }

    fn on_all_trade(&self, trade: &AllTrade) {
        if !self.is_connected() {
            debug!(
                "Dropping tick for {}:{} while {}",
                trade.class_code,
                trade.sec_code,
                self.status()
            );
            return;
        }

        if let Some(callback) = self.subscriptions.get(&trade.key()) {
            debug!(
                "Feed callback found for class_code={}, sec_code={}",
                trade.class_code, trade.sec_code
            );
            callback(trade);
        }
    }

    fn on_trans_reply(&self, reply: &TransReply) {
        match reply {
            TransReply::Detailed(detail) => {
                info!("{}", detail.result_msg);
                if let Some(trans_id) = detail.trans_id {
                    match self.transactions.complete(trans_id) {
                        Some(pending) => debug!(
                            trans_id,
                            "Transaction for {}:{} completed",
                            pending.class_code,
                            pending.sec_code
                        ),
                        None => debug!(trans_id, "Reply for untracked transaction"),
                    }
                }
            }
            TransReply::Ack(result) => info!("Result: {}", result),
        }

        let callbacks = self
            .transaction_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(reply);
        }
    }

    fn on_transaction_response(&self, trans_id: TransactionId, reply_request: bool, result: &Value) {
        let tracked = self.transactions.acknowledge(trans_id);
        debug!(
            trans_id,
            reply_request, tracked, "Terminal answered transaction request: {}", result
        );
    }
}

#[cfg(test)]
mod tests {
    use super::super::codec::QuikCodec;
    use super::super::session::tests::{attached, drain, session};
    use super::*;
    use crate::core::kernel::{Codepage, DelimiterFramer, FramingMode, StreamCodec};
    use crate::core::types::ConnectionStatus;
    use rust_decimal::Decimal;
    use std::sync::{Arc, Mutex};

    type Ticks = Arc<Mutex<Vec<(String, String, Decimal, Decimal)>>>;

    fn recorder(ticks: &Ticks) -> Arc<dyn Fn(&AllTrade) + Send + Sync> {
        let ticks = Arc::clone(ticks);
        Arc::new(move |trade: &AllTrade| {
            ticks.lock().unwrap().push((
                trade.class_code.clone(),
                trade.sec_code.clone(),
                trade.price,
                trade.qty,
            ));
        })
    }

    fn connected_session() -> (Session, crate::core::kernel::FrameReceiver) {
        let session = session();
        let rx = attached(&session);
        session
            .dispatch(QuikMessage::AuthReply { authorized: true })
            .unwrap();
        (session, rx)
    }

    /// Frame, decode and dispatch a raw batch the way the receive loop does.
    fn feed(session: &Session, batch: &str) -> usize {
        let codec = QuikCodec::new(Codepage::new(encoding_rs::WINDOWS_1251));
        let mut framer = DelimiterFramer::new("message:", FramingMode::CarryOver, 65_536);
        let mut dispatched = 0;
        for fragment in framer.push(batch) {
            if let Ok(Some(message)) = codec.decode_message(&fragment) {
                session.dispatch(message).unwrap();
                dispatched += 1;
            }
        }
        dispatched
    }

    fn all_trade(sec_code: &str, price: &str, qty: u32) -> String {
        format!(
            r#"message:{{"id":"callback","callback_name":"OnAllTrade","result":{{"class_code":"SPBFUT","sec_code":"{}","price":{},"qty":{}}}}}"#,
            sec_code, price, qty
        )
    }

    #[test]
    fn test_auth_success_connects_and_replays() {
        let session = session();
        let mut rx = attached(&session);
        session
            .subscribe(SecurityKey::new("SPBFUT", "RIU8").unwrap(), Arc::new(|_| {}))
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        session
            .dispatch(QuikMessage::AuthReply { authorized: true })
            .unwrap();

        assert_eq!(session.status(), ConnectionStatus::Connected);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("msg_create_ds_SPBFUT_RIU8"));
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        let session = session();
        let _rx = attached(&session);

        let result = session.dispatch(QuikMessage::AuthReply { authorized: false });

        assert!(matches!(result, Err(QuikError::AuthError(_))));
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert!(session.auth_rejected());

        // A late positive reply cannot resurrect the session
        session
            .dispatch(QuikMessage::AuthReply { authorized: true })
            .unwrap();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_tick_invokes_subscribed_callback_once() {
        let (session, _rx) = connected_session();
        let ticks: Ticks = Arc::default();
        session
            .subscribe(SecurityKey::new("SPBFUT", "RIU8").unwrap(), recorder(&ticks))
            .unwrap();

        let batch = r#"message:{"id":"callback","callback_name":"OnAllTrade","result":{"class_code":"SPBFUT","sec_code":"RIU8","price":100.5,"qty":2}}"#;
        assert_eq!(feed(&session, batch), 1);

        let ticks = ticks.lock().unwrap();
        assert_eq!(
            *ticks,
            vec![(
                "SPBFUT".to_string(),
                "RIU8".to_string(),
                Decimal::new(1005, 1),
                Decimal::from(2)
            )]
        );
    }

    #[test]
    fn test_batch_dispatches_every_message_in_order() {
        let (session, _rx) = connected_session();
        let ticks: Ticks = Arc::default();
        session
            .subscribe(SecurityKey::new("SPBFUT", "RIU8").unwrap(), recorder(&ticks))
            .unwrap();

        let batch: String = (1..=5)
            .map(|i| all_trade("RIU8", &format!("{}.25", 100 + i), i))
            .collect();
        assert_eq!(feed(&session, &batch), 5);

        let quantities: Vec<Decimal> = ticks.lock().unwrap().iter().map(|t| t.3).collect();
        assert_eq!(quantities, (1..=5).map(Decimal::from).collect::<Vec<_>>());
    }

    #[test]
    fn test_malformed_fragment_does_not_block_the_rest() {
        let (session, _rx) = connected_session();
        let ticks: Ticks = Arc::default();
        session
            .subscribe(SecurityKey::new("SPBFUT", "RIU8").unwrap(), recorder(&ticks))
            .unwrap();

        let batch = format!(
            "{}message:{{\"id\": oops}}{}",
            all_trade("RIU8", "1", 1),
            all_trade("RIU8", "2", 2)
        );
        assert_eq!(feed(&session, &batch), 2);
        assert_eq!(ticks.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_tick_for_unregistered_security_is_dropped() {
        let (session, _rx) = connected_session();
        let ticks: Ticks = Arc::default();
        session
            .subscribe(SecurityKey::new("SPBFUT", "RIU8").unwrap(), recorder(&ticks))
            .unwrap();

        assert_eq!(feed(&session, &all_trade("SiU8", "64000", 1)), 1);
        assert!(ticks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ticks_are_not_delivered_before_connected() {
        let session = session();
        let _rx = attached(&session);
        let ticks: Ticks = Arc::default();
        session
            .subscribe(SecurityKey::new("SPBFUT", "RIU8").unwrap(), recorder(&ticks))
            .unwrap();

        feed(&session, &all_trade("RIU8", "1", 1));
        assert!(ticks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_ids_and_events_are_ignored() {
        let (session, _rx) = connected_session();
        let batch = concat!(
            r#"message:{"id":"msg_set_upd_callback","result":[true]}"#,
            r#"message:{"id":"callback","callback_name":"OnQuote","result":{}}"#
        );
        assert_eq!(feed(&session, batch), 0);
        assert_eq!(session.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_trans_reply_shapes_and_correlation() {
        let (session, _rx) = connected_session();
        let replies: Arc<Mutex<Vec<TransReply>>> = Arc::default();
        let sink = Arc::clone(&replies);
        session.subscribe_transactions(Arc::new(move |reply: &TransReply| {
            sink.lock().unwrap().push(reply.clone());
        }));

        let trans_id = session.send_order("SPBFUT", "RIU8", 1).unwrap();
        let batch = format!(
            concat!(
                r#"message:{{"id":"{id}","result":[""]}}"#,
                r#"message:{{"id":"callback","callback_name":"OnTransReply","result":[true]}}"#,
            ),
            id = trans_id
        );
        feed(&session, &batch);
        assert!(session.transactions.get(trans_id).unwrap().acknowledged);

        let detailed = format!(
            r#"message:{{"id":"callback","callback_name":"OnTransReply","result":{{"trans_id":{},"status":3,"result_msg":"Заявка зарегистрирована"}}}}"#,
            trans_id
        );
        feed(&session, &detailed);

        assert!(session.transactions.get(trans_id).is_none());
        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert!(matches!(replies[0], TransReply::Ack(_)));
        assert_eq!(replies[1].trans_id(), Some(trans_id));
    }

    #[test]
    fn test_float_encoded_flags_and_status_are_dispatched() {
        let (session, _rx) = connected_session();
        let ticks: Ticks = Arc::default();
        session
            .subscribe(SecurityKey::new("SPBFUT", "RIU8").unwrap(), recorder(&ticks))
            .unwrap();
        let replies: Arc<Mutex<Vec<TransReply>>> = Arc::default();
        let sink = Arc::clone(&replies);
        session.subscribe_transactions(Arc::new(move |reply: &TransReply| {
            sink.lock().unwrap().push(reply.clone());
        }));

        let tick = r#"message:{"id":"callback","callback_name":"OnAllTrade","result":{"class_code":"SPBFUT","sec_code":"RIU8","price":100.5,"qty":2,"flags":1025.0}}"#;
        assert_eq!(feed(&session, tick), 1);
        assert_eq!(ticks.lock().unwrap().len(), 1);

        let trans_id = session.send_order("SPBFUT", "RIU8", 1).unwrap();
        let detailed = format!(
            r#"message:{{"id":"callback","callback_name":"OnTransReply","result":{{"trans_id":{},"status":3.0,"result_msg":"ok"}}}}"#,
            trans_id
        );
        assert_eq!(feed(&session, &detailed), 1);

        assert!(session.transactions.get(trans_id).is_none());
        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            TransReply::Detailed(detail) => assert_eq!(detail.status, Some(3)),
            other => panic!("expected a detailed reply, got {:?}", other),
        }
    }

    #[test]
    fn test_datasource_reply_is_logged_only() {
        let (session, mut rx) = connected_session();
        session
            .dispatch(QuikMessage::DataSourceReply {
                key: SecurityKey::new("SPBFUT", "RIU8").ok(),
                result: serde_json::json!([null, "Unknown security"]),
            })
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }
}
