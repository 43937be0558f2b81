use crate::core::errors::QuikError;
use encoding_rs::{CoderResult, Decoder, Encoding};

/// Codec trait for handling terminal-specific stream message encoding/decoding
///
/// A stream codec converts between raw socket bytes and typed messages. Framing
/// is not its concern: `decode_message` receives one fragment already cut out of
/// the stream by the framer.
pub trait StreamCodec: Send + Sync + 'static {
    /// Outgoing request type
    type Request: Send;

    /// The type representing parsed messages from the terminal
    type Message: Send;

    /// Encode a request into a frame ready to be written to the socket
    fn encode_request(&self, request: &Self::Request) -> Result<Vec<u8>, QuikError>;

    /// Fresh byte-to-text decoder for one connection
    fn chunk_decoder(&self) -> ChunkDecoder;

    /// Decode a single fragment into a typed message
    ///
    /// # Returns
    /// - `Ok(Some(message))` - Successfully decoded message
    /// - `Ok(None)` - Message is well-formed but nothing routes it
    /// - `Err(error)` - Failed to decode message
    fn decode_message(&self, fragment: &str) -> Result<Option<Self::Message>, QuikError>;
}

/// Single text encoding used in both directions of the stream.
#[derive(Debug, Clone, Copy)]
pub struct Codepage {
    encoding: &'static Encoding,
}

impl Codepage {
    pub const fn new(encoding: &'static Encoding) -> Self {
        Self { encoding }
    }

    fn name(&self) -> &'static str {
        self.encoding.name()
    }

    pub fn decoder(&self) -> ChunkDecoder {
        ChunkDecoder {
            decoder: self.encoding.new_decoder_without_bom_handling(),
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u8>, QuikError> {
        let (bytes, _, had_unmappable) = self.encoding.encode(text);
        if had_unmappable {
            return Err(QuikError::EncodingError(format!(
                "text cannot be represented in {}",
                self.name()
            )));
        }
        Ok(bytes.into_owned())
    }
}

/// Streaming decoder for one connection.
///
/// A multi-byte sequence cut by a read boundary is kept and completed by the
/// next read.
pub struct ChunkDecoder {
    decoder: Decoder,
}

impl ChunkDecoder {
    /// Decode one socket read. Malformed bytes fail the whole read; the
    /// decoder state stays usable for the next one.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<String, QuikError> {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .ok_or_else(|| QuikError::EncodingError("read too large to decode".to_string()))?;
        let mut text = String::with_capacity(capacity);

        let (result, _, had_errors) = self.decoder.decode_to_string(bytes, &mut text, false);
        if result == CoderResult::OutputFull {
            return Err(QuikError::EncodingError(
                "decode buffer too small".to_string(),
            ));
        }
        if had_errors {
            return Err(QuikError::EncodingError(format!(
                "{} bytes are not valid {}",
                bytes.len(),
                self.decoder.encoding().name()
            )));
        }
        Ok(text)
    }
}

impl std::fmt::Debug for ChunkDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDecoder")
            .field("encoding", &self.decoder.encoding().name())
            .finish()
    }
}
