//! Framing for a raw stream of concatenated PDUs.
//!
//! The relay adds no framing of its own; frame boundaries come from the
//! length field in each PDU header. Decoding never fails the stream: a frame
//! that cannot be decoded is yielded with its error so the reader can report
//! it and keep going.

use std::io;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::pdu::{DecodeError, EntityStatePdu, HEADER_LEN, LENGTH_OFFSET};

/// Upper bound on a single frame; anything larger is treated as garbage.
pub const MAX_FRAME_LEN: usize = 8 * 1024;

/// One frame as read off the wire plus the result of decoding it.
#[derive(Debug, Clone)]
pub struct PduFrame {
    pub bytes: Bytes,
    pub decoded: Result<EntityStatePdu, DecodeError>,
}

impl PduFrame {
    pub fn summary(&self) -> String {
        match &self.decoded {
            Ok(pdu) => pdu.summary(),
            Err(_) => "Unable to decode PDU".to_string(),
        }
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.is_ok()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PduCodec;

impl PduCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PduCodec {
    type Item = PduFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PduFrame>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let declared = u16::from_be_bytes([src[LENGTH_OFFSET], src[LENGTH_OFFSET + 1]]);
        let frame_len = usize::from(declared);

        // No way to find the next boundary, so the rest of the buffer goes as one bad frame
        if frame_len < HEADER_LEN || frame_len > MAX_FRAME_LEN {
            let bytes = src.split().freeze();
            return Ok(Some(PduFrame {
                bytes,
                decoded: Err(DecodeError::BadLength(declared)),
            }));
        }

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let bytes = src.split_to(frame_len).freeze();
        let decoded = EntityStatePdu::unmarshal(&bytes);
        Ok(Some(PduFrame { bytes, decoded }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<PduFrame>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let expected = if src.len() >= HEADER_LEN {
            usize::from(u16::from_be_bytes([src[LENGTH_OFFSET], src[LENGTH_OFFSET + 1]]))
        } else {
            HEADER_LEN
        };
        let bytes = src.split().freeze();
        let actual = bytes.len();
        Ok(Some(PduFrame {
            bytes,
            decoded: Err(DecodeError::Truncated { expected, actual }),
        }))
    }
}

impl<'a> Encoder<&'a EntityStatePdu> for PduCodec {
    type Error = io::Error;

    fn encode(&mut self, pdu: &'a EntityStatePdu, dst: &mut BytesMut) -> Result<(), io::Error> {
        pdu.marshal_into(dst)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}
