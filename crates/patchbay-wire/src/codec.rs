//! Newline-delimited JSON codec.
//!
//! One compact JSON object per line, UTF-8, `\n`-terminated. Works over
//! any AsyncRead/AsyncWrite via tokio-util's framed adapters.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Defensive cap on a single buffered line. A peer that streams more
/// than this without a newline gets its connection closed rather than
/// growing the buffer without bound.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Line-framed JSON codec over a message type.
///
/// Decoding is lenient: lines that fail to parse (malformed JSON, or a
/// missing/unknown discriminator) are skipped, not surfaced as errors.
/// Only the line-length cap closes the connection.
pub struct LineCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> LineCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for LineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for LineCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_LINE_LEN {
                    src.clear();
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "buffered line exceeds maximum length",
                    ));
                }
                return Ok(None);
            };

            // A complete line past the cap is just as hostile as a
            // buffered one.
            if pos > MAX_LINE_LEN {
                src.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "line exceeds maximum length",
                ));
            }

            let line = src.split_to(pos + 1);
            let mut line = &line[..pos];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice(line) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    tracing::debug!(error = %e, len = line.len(), "Skipping undecodable line");
                    continue;
                }
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for LineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
