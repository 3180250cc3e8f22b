//! NUL-delimited object framing.
//!
//! Each object is encoded as `<metadata><0x00><payload>`: a UTF-8 JSON object,
//! one NUL byte, then exactly `size` raw payload bytes. There is no length
//! prefix on the metadata segment; its end is found by scanning for the NUL.
//! JSON escapes control characters, so a NUL never appears inside metadata.

use crate::message::{Metadata, keys};
use serde_json::Value;

/// Separates metadata from payload.
pub const DELIMITER: u8 = 0;

/// Longest metadata segment buffered while waiting for a delimiter.
pub const MAX_METADATA_LEN: usize = 1024 * 1024;

/// A decoded object.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub metadata: Metadata,
    /// `None` when the metadata declared no `size`.
    pub payload: Option<Vec<u8>>,
}

impl Frame {
    /// Bundle metadata with an optional payload.
    pub fn new(metadata: Metadata, payload: Option<Vec<u8>>) -> Self {
        Self { metadata, payload }
    }

    /// Serialize to wire bytes, filling in `size`.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_frame(&mut self.metadata.clone(), self.payload.as_deref())
    }
}

/// Errors that make a byte stream undecodable. The connection must be closed.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("metadata is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("metadata is not valid JSON: {0}")]
    InvalidMetadata(#[source] serde_json::Error),
    #[error("metadata must be a JSON object")]
    NotAnObject,
    #[error("metadata exceeds {MAX_METADATA_LEN} bytes without a delimiter")]
    MetadataTooLong,
    #[error("failed to encode metadata: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Serialize `metadata` and `payload` to wire bytes.
///
/// Sets `size` to the payload length in bytes, or removes it when there is
/// no payload.
pub fn encode_frame(
    metadata: &mut Metadata,
    payload: Option<&[u8]>,
) -> Result<Vec<u8>, FrameError> {
    match payload {
        Some(payload) => {
            metadata.insert(keys::SIZE, payload.len());
        }
        None => {
            metadata.remove(keys::SIZE);
        }
    }
    let mut bytes = serde_json::to_vec(metadata).map_err(FrameError::Encode)?;
    bytes.push(DELIMITER);
    if let Some(payload) = payload {
        bytes.extend_from_slice(payload);
    }
    Ok(bytes)
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    AwaitingMetadata,
    AwaitingPayload { metadata: Metadata, size: usize },
}

/// Incremental decoder for one connection.
///
/// Feed bytes with [`push`](Self::push) as they arrive, in chunks of any size,
/// and drain complete frames with [`next_frame`](Self::next_frame) until it
/// returns `Ok(None)`. After an error the decoder must be discarded.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already scanned for a delimiter.
    scanned: usize,
    state: DecodeState,
}

impl FrameDecoder {
    /// Decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream. Frames are taken out with
    /// [`FrameDecoder::next_frame`].
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of an emitted frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the decoder is between frames with nothing buffered.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, DecodeState::AwaitingMetadata)
    }

    /// Next complete frame, if the buffered bytes contain one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            match std::mem::take(&mut self.state) {
                DecodeState::AwaitingMetadata => {
                    let Some(offset) = self.buffer[self.scanned..]
                        .iter()
                        .position(|b| *b == DELIMITER)
                    else {
                        self.scanned = self.buffer.len();
                        if self.scanned > MAX_METADATA_LEN {
                            return Err(FrameError::MetadataTooLong);
                        }
                        return Ok(None);
                    };
                    let end = self.scanned + offset;
                    if end > MAX_METADATA_LEN {
                        return Err(FrameError::MetadataTooLong);
                    }
                    let metadata = parse_metadata(&self.buffer[..end])?;
                    self.buffer.drain(..=end);
                    self.scanned = 0;
                    match metadata.declared_size() {
                        None => return Ok(Some(Frame::new(metadata, None))),
                        Some(size) => self.state = DecodeState::AwaitingPayload { metadata, size },
                    }
                }
                DecodeState::AwaitingPayload { metadata, size } => {
                    if self.buffer.len() < size {
                        self.state = DecodeState::AwaitingPayload { metadata, size };
                        return Ok(None);
                    }
                    let payload: Vec<u8> = self.buffer.drain(..size).collect();
                    return Ok(Some(Frame::new(metadata, Some(payload))));
                }
            }
        }
    }

    /// Push `bytes` and return every frame completed by them.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

fn parse_metadata(bytes: &[u8]) -> Result<Metadata, FrameError> {
    let text = std::str::from_utf8(bytes)?;
    match serde_json::from_str(text).map_err(FrameError::InvalidMetadata)? {
        Value::Object(map) => Ok(Metadata::from(map)),
        _ => Err(FrameError::NotAnObject),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_frame(text: &str) -> Vec<u8> {
        encode_frame(&mut Metadata::data("text/plain"), Some(text.as_bytes())).unwrap()
    }

    #[test]
    fn encode_sets_size_in_bytes() {
        let bytes = text_frame("héllo");
        let nul = bytes.iter().position(|b| *b == 0).unwrap();
        let metadata: serde_json::Value = serde_json::from_slice(&bytes[..nul]).unwrap();
        assert_eq!(metadata["size"], json!(6));
        assert_eq!(&bytes[nul + 1..], "héllo".as_bytes());
    }

    #[test]
    fn encode_without_payload_drops_size() {
        let mut metadata = Metadata::data("text/plain");
        metadata.insert("size", 99);
        let bytes = encode_frame(&mut metadata, None).unwrap();
        assert_eq!(*bytes.last().unwrap(), DELIMITER);
        assert!(!metadata.contains_key("size"));
    }

    #[test]
    fn decodes_many_frames_in_one_read() {
        let mut stream = text_frame("one");
        stream.extend(text_frame("two"));
        stream.extend(text_frame(""));
        let frames = FrameDecoder::new().decode(&stream).unwrap();
        let payloads: Vec<_> = frames.iter().map(|f| f.payload.clone().unwrap()).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), Vec::new()]);
    }

    #[test]
    fn payload_may_contain_nul() {
        let payload = [0u8, 1, 0, 2];
        let mut metadata = Metadata::data("application/octet-stream");
        let bytes = encode_frame(&mut metadata, Some(&payload)).unwrap();
        let frames = FrameDecoder::new().decode(&bytes).unwrap();
        assert_eq!(frames[0].payload.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn split_frame_is_reassembled() {
        let bytes = text_frame("hello");
        let mut decoder = FrameDecoder::new();
        for byte in &bytes[..bytes.len() - 1] {
            assert!(decoder.decode(std::slice::from_ref(byte)).unwrap().is_empty());
        }
        let frames = decoder.decode(&bytes[bytes.len() - 1..]).unwrap();
        assert_eq!(frames[0].payload.as_deref(), Some(&b"hello"[..]));
        assert!(decoder.is_idle());
    }

    #[test]
    fn event_without_size_has_no_payload() {
        let frames = FrameDecoder::new().decode(b"{\"event\":\"ping\"}\0").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, None);
    }

    #[test]
    fn non_numeric_size_means_empty_payload() {
        let frames = FrameDecoder::new()
            .decode(b"{\"type\":\"text/plain\",\"size\":\"lots\"}\0")
            .unwrap();
        assert_eq!(frames[0].payload.as_deref(), Some(&b""[..]));
    }

    #[test]
    fn invalid_utf8_is_fatal() {
        let err = FrameDecoder::new().decode(b"{\"type\":\"\xff\"}\0").unwrap_err();
        assert!(matches!(err, FrameError::InvalidUtf8(_)));
    }

    #[test]
    fn invalid_json_is_fatal() {
        let err = FrameDecoder::new().decode(b"{not json\0").unwrap_err();
        assert!(matches!(err, FrameError::InvalidMetadata(_)));
        let err = FrameDecoder::new().decode(b"[1,2]\0").unwrap_err();
        assert!(matches!(err, FrameError::NotAnObject));
    }

    #[test]
    fn unterminated_metadata_is_bounded() {
        let mut decoder = FrameDecoder::new();
        let chunk = vec![b' '; MAX_METADATA_LEN];
        assert!(decoder.decode(&chunk).unwrap().is_empty());
        let err = decoder.decode(b"  ").unwrap_err();
        assert!(matches!(err, FrameError::MetadataTooLong));
    }
}
