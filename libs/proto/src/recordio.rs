//! RecordIO framing: `<decimal length>\n<payload>` repeated.
//!
//! The subscription response body is an unbounded sequence of records.
//! Chunks from the HTTP body arrive at arbitrary boundaries, so the decoder
//! buffers until a full record is available.

use bytes::{Buf, BytesMut};

use crate::error::ProtoError;
use crate::event::Event;

/// Default upper bound on a single record.
pub const DEFAULT_MAX_RECORD: usize = 16 * 1024 * 1024;

/// Longest accepted length header (digits only).
const MAX_HEADER_DIGITS: usize = 20;

/// Encodes one payload as a RecordIO record.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let header = payload.len().to_string();
    let mut out = Vec::with_capacity(header.len() + 1 + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out
}

/// Encodes an event as a RecordIO record (used by test transports).
pub fn encode_event(event: &Event) -> Result<Vec<u8>, ProtoError> {
    let json = serde_json::to_vec(event)?;
    Ok(encode(&json))
}

/// Parses one record payload as an event.
pub fn decode_event(payload: &[u8]) -> Result<Event, ProtoError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Incremental RecordIO decoder.
#[derive(Debug)]
pub struct RecordIoDecoder {
    buf: BytesMut,
    /// Length of the record currently being read, once its header is parsed.
    pending: Option<usize>,
    max_record: usize,
}

impl Default for RecordIoDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD)
    }
}

impl RecordIoDecoder {
    pub fn new(max_record: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            pending: None,
            max_record,
        }
    }

    /// Appends a chunk received from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete record, or `None` if more bytes are needed.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, ProtoError> {
        if self.pending.is_none() {
            let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > MAX_HEADER_DIGITS {
                    return Err(ProtoError::InvalidLength(
                        String::from_utf8_lossy(&self.buf[..MAX_HEADER_DIGITS]).into_owned(),
                    ));
                }
                return Ok(None);
            };

            let header = self.buf.split_to(newline);
            self.buf.advance(1);

            let text = std::str::from_utf8(&header)
                .map_err(|_| ProtoError::InvalidLength(format!("{:?}", &header[..])))?
                .trim();
            let len: usize = text
                .parse()
                .map_err(|_| ProtoError::InvalidLength(text.to_string()))?;
            if len > self.max_record {
                return Err(ProtoError::RecordTooLarge {
                    len,
                    max: self.max_record,
                });
            }
            self.pending = Some(len);
        }

        match self.pending {
            Some(len) if self.buf.len() >= len => {
                self.pending = None;
                Ok(Some(self.buf.split_to(len).to_vec()))
            }
            _ => Ok(None),
        }
    }

    /// Checks that the stream ended on a record boundary.
    pub fn finish(&self) -> Result<(), ProtoError> {
        let leftover = self.buf.len() + usize::from(self.pending.is_some());
        if leftover == 0 {
            Ok(())
        } else {
            Err(ProtoError::Truncated(self.buf.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefixes_length() {
        assert_eq!(encode(b"hello"), b"5\nhello".to_vec());
        assert_eq!(encode(b""), b"0\n".to_vec());
    }

    #[test]
    fn test_decode_across_chunk_boundaries() {
        let mut stream = encode(br#"{"type":"HEARTBEAT"}"#);
        stream.extend(encode(br#"{"type":"SHUTDOWN"}"#));

        let mut decoder = RecordIoDecoder::default();
        let mut events = Vec::new();
        for byte in stream.chunks(3) {
            decoder.push(byte);
            while let Some(record) = decoder.next_record().unwrap() {
                events.push(decode_event(&record).unwrap());
            }
        }

        assert_eq!(events, vec![Event::Heartbeat, Event::Shutdown]);
        decoder.finish().unwrap();
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let mut decoder = RecordIoDecoder::default();
        decoder.push(b"abc\n{}");
        assert!(matches!(
            decoder.next_record(),
            Err(ProtoError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let mut decoder = RecordIoDecoder::new(4);
        decoder.push(b"10\n");
        assert!(matches!(
            decoder.next_record(),
            Err(ProtoError::RecordTooLarge { len: 10, max: 4 })
        ));
    }

    #[test]
    fn test_runaway_header_is_rejected() {
        let mut decoder = RecordIoDecoder::default();
        decoder.push(&[b'1'; 32]);
        assert!(decoder.next_record().is_err());
    }

    #[test]
    fn test_truncated_stream_is_detected() {
        let mut decoder = RecordIoDecoder::default();
        decoder.push(b"5\nhel");
        assert_eq!(decoder.next_record().unwrap(), None);
        assert!(matches!(decoder.finish(), Err(ProtoError::Truncated(3))));
    }

    #[test]
    fn test_encode_event_roundtrip() {
        let bytes = encode_event(&Event::Shutdown).unwrap();
        let mut decoder = RecordIoDecoder::default();
        decoder.push(&bytes);
        let record = decoder.next_record().unwrap().unwrap();
        assert_eq!(decode_event(&record).unwrap(), Event::Shutdown);
    }
}
