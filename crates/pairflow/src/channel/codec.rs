//! Fixed-width record codec.
//!
//! One record is one native-endian `i32`: no header, no length prefix. Works
//! over any AsyncRead/AsyncWrite via FramedRead/FramedWrite.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// A single value carried over a channel.
pub type Record = i32;

/// Size of one record on the wire.
pub const RECORD_WIDTH: usize = std::mem::size_of::<Record>();

/// Codec that frames the byte stream into whole records.
///
/// A record is never split: bytes left over when the stream ends are reported
/// as `InvalidData`, not returned as a partial value.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordCodec;

impl RecordCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < RECORD_WIDTH {
            src.reserve(RECORD_WIDTH - src.len());
            return Ok(None);
        }

        let bytes = src.split_to(RECORD_WIDTH);
        let mut raw = [0u8; RECORD_WIDTH];
        raw.copy_from_slice(&bytes);
        Ok(Some(Record::from_ne_bytes(raw)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(record) => Ok(Some(record)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "truncated record: stream ended after {} of {} bytes",
                    src.len(),
                    RECORD_WIDTH
                ),
            )),
        }
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Record, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(RECORD_WIDTH);
        dst.extend_from_slice(&item.to_ne_bytes());
        Ok(())
    }
}
