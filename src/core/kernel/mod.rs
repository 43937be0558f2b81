/// Terminal transport kernel
///
/// Transport-only building blocks shared by terminal connectors. Nothing in
/// here knows about QUIK message ids or events.
///
/// # Components
///
/// - `TcpTransport`: socket connect with an optional timeout, split into
///   owned read/write halves
/// - `spawn_writer`: a task draining queued frames into the write half, so
///   callers on any thread can send without awaiting the socket
/// - `DelimiterFramer`: cuts a text stream into fragments on a literal
///   delimiter, optionally carrying partial fragments across reads
/// - `StreamCodec`: terminal-specific encoding of requests and decoding of
///   fragments into typed messages
/// - `Codepage`: the text encoding used on the wire, with a streaming
///   `ChunkDecoder` per connection
///
/// # Example
/// ```rust,no_run
/// use quik_connector::core::kernel::*;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::new("127.0.0.1:1111".to_string(), None);
/// let (_reader, writer) = transport.connect().await?;
///
/// let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
/// let writer_task = spawn_writer(writer, rx);
/// tx.send(b"message:{}".to_vec())?;
/// drop(tx);
/// writer_task.await??;
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod framer;
pub mod tcp;

pub use codec::{ChunkDecoder, Codepage, StreamCodec};
pub use framer::{DelimiterFramer, FramingMode};
pub use tcp::{spawn_writer, ConnectionStats, FrameReceiver, FrameSender, TcpTransport};
