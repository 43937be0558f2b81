use super::codec::{QuikCodec, MSG_DELIMITER};
use super::session::Session;
use crate::core::{
    config::QuikConfig,
    errors::QuikError,
    kernel::{
        spawn_writer, ChunkDecoder, Codepage, ConnectionStats, DelimiterFramer, StreamCodec,
        TcpTransport,
    },
    traits::{MarketDataSource, OrderPlacer, TerminalConnector},
    types::{AllTrade, ConnectionStatus, PendingTransaction, SecurityKey, TransReply, TransactionId},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long queued frames may take to flush once the session ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type WriterHandle = JoinHandle<Result<ConnectionStats, QuikError>>;

/// Stops a running receive loop from any thread or task.
///
/// Cancelling is permanent for the connector it came from: later `run()`
/// calls return immediately.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Client for the QUIK Lua socket bridge.
///
/// `subscribe`, `subscribe_transactions` and `send_order` are synchronous and
/// can be called from any thread, before or during `run()`. `run()` owns the
/// socket for one session and returns when it ends.
pub struct QuikConnector {
    config: QuikConfig,
    codec: QuikCodec,
    transport: TcpTransport,
    session: Session,
    shutdown: CancellationToken,
    running: tokio::sync::Mutex<()>,
}

struct Connection {
    reader: OwnedReadHalf,
    writer: WriterHandle,
}

/// Receive-side state of one session. Both halves carry partial input from
/// one read over to the next.
struct Inbound {
    decoder: ChunkDecoder,
    framer: DelimiterFramer,
}

enum LoopExit {
    Shutdown,
    WriterStopped(Result<Result<ConnectionStats, QuikError>, JoinError>),
    Failed(QuikError),
}

impl QuikConnector {
    pub fn new(config: QuikConfig) -> Result<Self, QuikError> {
        config.validate()?;
        let codec = QuikCodec::new(Codepage::new(config.text_encoding()?));
        let transport = TcpTransport::new(config.address(), config.connect_timeout);
        let session = Session::new(codec, config.account.clone(), config.client_code());

        Ok(Self {
            config,
            codec,
            transport,
            session,
            shutdown: CancellationToken::new(),
            running: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &QuikConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Orders sent and not yet answered with a detailed reply, by id
    pub fn pending_transactions(&self) -> Vec<PendingTransaction> {
        self.session.transactions.pending()
    }

    pub fn last_transaction_id(&self) -> TransactionId {
        self.session.transactions.last_id()
    }

    /// Connect, authenticate and process incoming messages until shutdown or
    /// a fatal error.
    ///
    /// Returns `Ok(())` after a shutdown request. Transport failures and a
    /// rejected password come back as errors; after a transport failure
    /// `run()` may be called again to open a new session with the same
    /// subscriptions.
    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    pub async fn run(&self) -> Result<(), QuikError> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| QuikError::AlreadyRunning)?;

        if self.session.auth_rejected() {
            return Err(QuikError::AuthError(
                "terminal rejected the password for this connector".to_string(),
            ));
        }
        if self.shutdown.is_cancelled() {
            debug!("Shutdown already requested");
            return Ok(());
        }

        let Connection {
            mut reader,
            mut writer,
        } = self.connect().await?;

        let exit = self.receive(&mut reader, &mut writer).await;
        self.session.detach();

        let result = match exit {
            LoopExit::Shutdown => {
                drain_writer(&mut writer).await;
                Ok(())
            }
            LoopExit::WriterStopped(joined) => Err(writer_failure(joined)),
            LoopExit::Failed(e) => {
                drain_writer(&mut writer).await;
                Err(e)
            }
        };

        match &result {
            Ok(()) => info!("Disconnected"),
            Err(e) => error!("Disconnected: {}", e),
        }
        result
    }

    /// Open the socket and queue the handshake as the very first frame.
    async fn connect(&self) -> Result<Connection, QuikError> {
        info!("Connecting to {}", self.transport.address());
        let (reader, writer) = self.transport.connect().await?;

        let auth = self.codec.encode_auth(self.config.password())?;
        let (frames, queue) = mpsc::unbounded_channel();
        frames
            .send(auth)
            .map_err(|_| QuikError::ConnectionClosed)?;
        self.session.attach(frames);
        debug!("Auth request queued (password redacted)");

        Ok(Connection {
            reader,
            writer: spawn_writer(writer, queue),
        })
    }

    async fn receive(&self, reader: &mut OwnedReadHalf, writer: &mut WriterHandle) -> LoopExit {
        let mut inbound = self.inbound();
        let mut buffer = vec![0u8; self.config.buffer_size];

        let auth_deadline = deadline(self.config.auth_timeout);
        tokio::pin!(auth_deadline);
        let mut eviction = self.config.transaction_ttl.map(|ttl| {
            let mut interval = tokio::time::interval(ttl);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return LoopExit::Shutdown;
                }
                joined = &mut *writer => return LoopExit::WriterStopped(joined),
                () = &mut auth_deadline, if self.session.status() == ConnectionStatus::Connecting => {
                    error!("No auth reply from terminal");
                    return LoopExit::Failed(QuikError::AuthTimeout);
                }
                () = next_tick(eviction.as_mut()) => self.evict_expired(),
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => return LoopExit::Failed(QuikError::ConnectionClosed),
                    Ok(n) => {
                        if let Err(e) = self.process_chunk(&mut inbound, &buffer[..n]) {
                            return LoopExit::Failed(e);
                        }
                    }
                    Err(e) => return LoopExit::Failed(QuikError::NetworkError(e)),
                },
            }
        }
    }

    fn inbound(&self) -> Inbound {
        Inbound {
            decoder: self.codec.chunk_decoder(),
            framer: DelimiterFramer::new(
                MSG_DELIMITER,
                self.config.framing,
                self.config.buffer_size,
            ),
        }
    }

    /// Decode one read and dispatch every complete message in it, in order.
    /// Only errors that end the session are returned.
    fn process_chunk(&self, inbound: &mut Inbound, bytes: &[u8]) -> Result<(), QuikError> {
        let text = match inbound.decoder.decode(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping {} undecodable bytes: {}", bytes.len(), e);
                return Ok(());
            }
        };

        for fragment in inbound.framer.push(&text) {
            match self.codec.decode_message(&fragment) {
                Ok(Some(message)) => self.session.dispatch(message)?,
                Ok(None) => {}
                Err(e) => warn!("Failed to decode message: {} ({})", e, fragment),
            }
        }
        Ok(())
    }

    fn evict_expired(&self) {
        let Some(ttl) = self.config.transaction_ttl else {
            return;
        };
        let expired = self.session.transactions.evict_expired(ttl);
        if !expired.is_empty() {
            warn!(?expired, "No reply within {:?}, dropping transactions", ttl);
        }
    }
}

impl MarketDataSource for QuikConnector {
    fn subscribe<F>(&self, class_code: &str, sec_code: &str, callback: F) -> Result<(), QuikError>
    where
        F: Fn(&AllTrade) + Send + Sync + 'static,
    {
        let key = SecurityKey::new(class_code, sec_code)?;
        self.session.subscribe(key, Arc::new(callback))
    }
}

impl OrderPlacer for QuikConnector {
    fn send_order(
        &self,
        class_code: &str,
        sec_code: &str,
        quantity: u64,
    ) -> Result<TransactionId, QuikError> {
        self.session.send_order(class_code, sec_code, quantity)
    }

    fn subscribe_transactions<F>(&self, callback: F)
    where
        F: Fn(&TransReply) + Send + Sync + 'static,
    {
        self.session.subscribe_transactions(Arc::new(callback));
    }
}

impl TerminalConnector for QuikConnector {}

impl std::fmt::Debug for QuikConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuikConnector")
            .field("address", &self.transport.address())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Let the writer flush what is queued and close the socket.
async fn drain_writer(writer: &mut WriterHandle) {
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut *writer).await {
        Ok(Ok(Ok(stats))) => debug!(frames = stats.frames_sent, "Writer drained"),
        Ok(Ok(Err(e))) => warn!("Writer failed while draining: {}", e),
        Ok(Err(e)) => warn!("Writer task failed: {}", e),
        Err(_) => {
            warn!("Writer did not stop within {:?}", WRITER_DRAIN_TIMEOUT);
            writer.abort();
        }
    }
}

fn writer_failure(joined: Result<Result<ConnectionStats, QuikError>, JoinError>) -> QuikError {
    match joined {
        Ok(Ok(_)) => QuikError::ConnectionClosed,
        Ok(Err(e)) => e,
        Err(e) => QuikError::NetworkError(std::io::Error::other(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::FramingMode;
    use std::sync::Mutex;

    fn connector(framing: FramingMode) -> (QuikConnector, crate::core::kernel::FrameReceiver) {
        let config = QuikConfig::new("127.0.0.1", 1111, "secret", "SPBFUT00998").with_framing(framing);
        let connector = QuikConnector::new(config).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        connector.session.attach(tx);
        (connector, rx)
    }

    fn record_quantities(connector: &QuikConnector) -> Arc<Mutex<Vec<String>>> {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        connector
            .subscribe("SPBFUT", "RIU8", move |trade: &AllTrade| {
                sink.lock().unwrap().push(trade.qty.to_string());
            })
            .unwrap();
        seen
    }

    const AUTH_OK: &[u8] = br#"message:{"id":"msg_auth","result":[true]}"#;
    const TICK: &str = r#"message:{"id":"callback","callback_name":"OnAllTrade","result":{"class_code":"SPBFUT","sec_code":"RIU8","price":100.5,"qty":2}}"#;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = QuikConfig::new("127.0.0.1", 1111, "secret", "ACC").with_encoding("nope");
        assert!(matches!(
            QuikConnector::new(config),
            Err(QuikError::ConfigError(_))
        ));
    }

    #[test]
    fn test_message_split_across_reads_is_reassembled() {
        let (connector, _rx) = connector(FramingMode::CarryOver);
        let mut inbound = connector.inbound();
        let seen = record_quantities(&connector);

        connector.process_chunk(&mut inbound, AUTH_OK).unwrap();
        assert!(connector.is_connected());

        let (head, tail) = TICK.split_at(40);
        connector.process_chunk(&mut inbound, head.as_bytes()).unwrap();
        assert!(seen.lock().unwrap().is_empty());
        connector.process_chunk(&mut inbound, tail.as_bytes()).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["2".to_string()]);
    }

    #[test]
    fn test_per_read_framing_loses_split_message() {
        let (connector, _rx) = connector(FramingMode::PerRead);
        let mut inbound = connector.inbound();
        let seen = record_quantities(&connector);

        connector.process_chunk(&mut inbound, AUTH_OK).unwrap();
        let (head, tail) = TICK.split_at(40);
        connector.process_chunk(&mut inbound, head.as_bytes()).unwrap();
        connector.process_chunk(&mut inbound, tail.as_bytes()).unwrap();
        connector.process_chunk(&mut inbound, TICK.as_bytes()).unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_auth_rejection_ends_session() {
        let (connector, _rx) = connector(FramingMode::CarryOver);
        let mut inbound = connector.inbound();

        let result = connector.process_chunk(
            &mut inbound,
            br#"message:{"id":"msg_auth","result":[false]}"#,
        );
        assert!(matches!(result, Err(QuikError::AuthError(_))));
        assert_eq!(connector.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_cyrillic_reply_is_decoded_from_codepage() {
        let (connector, _rx) = connector(FramingMode::CarryOver);
        let mut inbound = connector.inbound();
        let replies: Arc<Mutex<Vec<TransReply>>> = Arc::default();
        let sink = Arc::clone(&replies);
        connector.subscribe_transactions(move |reply: &TransReply| {
            sink.lock().unwrap().push(reply.clone());
        });

        connector.process_chunk(&mut inbound, AUTH_OK).unwrap();
        let text = r#"message:{"id":"callback","callback_name":"OnTransReply","result":{"trans_id":7,"status":3,"result_msg":"Заявка №1 зарегистрирована"}}"#;
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode(text);
        connector.process_chunk(&mut inbound, &bytes).unwrap();

        let replies = replies.lock().unwrap();
        match &replies[..] {
            [TransReply::Detailed(detail)] => {
                assert_eq!(detail.result_msg, "Заявка №1 зарегистрирована");
                assert_eq!(detail.trans_id, Some(7));
            }
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[test]
    fn test_utf8_character_split_across_reads_keeps_message() {
        let config = QuikConfig::new("127.0.0.1", 1111, "secret", "ACC").with_encoding("utf-8");
        let connector = QuikConnector::new(config).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        connector.session.attach(tx);
        let mut inbound = connector.inbound();
        let replies: Arc<Mutex<Vec<TransReply>>> = Arc::default();
        let sink = Arc::clone(&replies);
        connector.subscribe_transactions(move |reply: &TransReply| {
            sink.lock().unwrap().push(reply.clone());
        });

        connector.process_chunk(&mut inbound, AUTH_OK).unwrap();
        let text = r#"message:{"id":"callback","callback_name":"OnTransReply","result":{"trans_id":3,"result_msg":"Заявка"}}"#;
        let bytes = text.as_bytes();
        let cut = text.find("Заявка").unwrap() + 1;
        connector.process_chunk(&mut inbound, &bytes[..cut]).unwrap();
        assert!(replies.lock().unwrap().is_empty());
        connector.process_chunk(&mut inbound, &bytes[cut..]).unwrap();

        let replies = replies.lock().unwrap();
        match &replies[..] {
            [TransReply::Detailed(detail)] => assert_eq!(detail.result_msg, "Заявка"),
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[test]
    fn test_expired_transactions_are_evicted() {
        let config = QuikConfig::new("127.0.0.1", 1111, "secret", "ACC")
            .with_transaction_ttl(Duration::from_millis(1));
        let connector = QuikConnector::new(config).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        connector.session.attach(tx);
        assert!(connector.session.mark_connected());

        connector.send_order("SPBFUT", "RIU8", 1).unwrap();
        assert_eq!(connector.pending_transactions().len(), 1);

        std::thread::sleep(Duration::from_millis(20));
        connector.evict_expired();
        assert!(connector.pending_transactions().is_empty());
        assert_eq!(connector.last_transaction_id(), 1);
    }

    #[tokio::test]
    async fn test_run_after_shutdown_returns_immediately() {
        let config = QuikConfig::new("127.0.0.1", 1, "secret", "ACC");
        let connector = QuikConnector::new(config).unwrap();
        let handle = connector.shutdown_handle();
        handle.shutdown();

        assert!(handle.is_shutdown());
        assert!(connector.run().await.is_ok());
        assert_eq!(connector.status(), ConnectionStatus::Disconnected);
    }
}
