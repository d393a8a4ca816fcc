//! Newline-delimited JSON codec for agent communication.
//!
//! One JSON object per line, never split across lines. Encoding uses
//! serde_json's compact form, which never emits a raw newline, so the
//! separator is unambiguous. Decoding is line framing only: parsing is left
//! to the reader so a malformed line can be skipped instead of tearing down
//! the stream.

use std::io;
use std::marker::PhantomData;

use serde::Serialize;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::framer::LineFramer;

/// Codec that writes `T` as one JSON line and reads raw lines.
pub struct JsonLineCodec<T> {
    framer: LineFramer,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            framer: LineFramer::new(),
            _phantom: PhantomData,
        }
    }
}

impl<T> Decoder for JsonLineCodec<T> {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.framer.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.framer.decode_eof(src)
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
