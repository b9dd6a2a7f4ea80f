//! Framed codec for the command transport.
//!
//! One frame is a 112-byte header followed by `header.size` body bytes.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::{CommandHeader, Packet, HEADER_SIZE};
use crate::error::WireError;

/// tokio codec turning a byte stream into [`Packet`]s.
#[derive(Debug, Default)]
pub struct CommandCodec;

impl Decoder for CommandCodec {
    type Item = Packet;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek the header without consuming so a partial body keeps state.
        let header = CommandHeader::decode(&mut &src[..HEADER_SIZE])?;
        let body_len = header.size as usize;
        if src.len() < HEADER_SIZE + body_len {
            src.reserve(HEADER_SIZE + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(body_len).freeze();
        Ok(Some(Packet { header, body }))
    }
}

impl Encoder<Packet> for CommandCodec {
    type Error = WireError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), WireError> {
        let mut header = item.header;
        header.size = item.body.len() as u64;
        dst.reserve(HEADER_SIZE + item.body.len());
        header.encode(dst);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}
