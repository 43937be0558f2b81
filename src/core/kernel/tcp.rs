use crate::core::errors::QuikError;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

/// Outgoing frames queued for the writer task
pub type FrameSender = mpsc::UnboundedSender<Vec<u8>>;
pub type FrameReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Connection statistics reported when the writer stops
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
}

/// Plain TCP transport to a terminal endpoint
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    connect_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new(address: String, connect_timeout: Option<Duration>) -> Self {
        Self {
            address,
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Open the socket; without a configured timeout this waits as long as
    /// the OS does.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn connect(&self) -> Result<(OwnedReadHalf, OwnedWriteHalf), QuikError> {
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(&self.address))
                .await
                .map_err(|_| {
                    QuikError::ConnectionTimeout(format!(
                        "no connection to {} after {:?}",
                        self.address, timeout
                    ))
                })??,
            None => TcpStream::connect(&self.address).await?,
        };

        // Ticks are small and latency matters more than packet count
        stream.set_nodelay(true)?;

        Ok(stream.into_split())
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<(), QuikError> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Drain queued frames into the socket until every sender is dropped.
///
/// A failed write ends the task with the error; the receive loop treats that
/// as the end of the session.
pub fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut frames: FrameReceiver,
) -> JoinHandle<Result<ConnectionStats, QuikError>> {
    tokio::spawn(async move {
        let mut stats = ConnectionStats::default();

        while let Some(frame) = frames.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                error!("Failed to send frame: {}", e);
                return Err(e);
            }
            stats.frames_sent += 1;
            stats.bytes_sent += frame.len() as u64;
        }

        if let Err(e) = writer.shutdown().await {
            debug!("Socket shutdown failed: {}", e);
        }
        debug!(
            frames = stats.frames_sent,
            bytes = stats.bytes_sent,
            "Writer stopped"
        );
        Ok(stats)
    })
}
