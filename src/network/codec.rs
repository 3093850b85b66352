use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::network::message::WireMessage;

/// Frames larger than this are protocol violations and kill the connection.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Length-delimited JSON frames carrying [`WireMessage`] values. The JSON
/// wire encoding is contractual for the overlay.
#[derive(Debug)]
pub struct JsonCodec {
    inner: LengthDelimitedCodec,
}

impl JsonCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        Self { inner }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonCodec {
    type Item = WireMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = match self.inner.decode(src)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<WireMessage> for JsonCodec {
    type Error = io::Error;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let raw = serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(raw), dst)
    }
}
