//! Streaming RPC messages and their frame codec.
//!
//! The streaming transport moves large records as chunked multi-message
//! exchanges: a server-streaming read and a client-streaming write. Frames
//! are length-prefixed, crc-checked bincode payloads; every message must fit
//! the transport cap so a single oversized record never wedges a connection.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::{CommandHeader, Time};
use crate::error::{WireError, WireResult};

/// Hard cap for one streaming message on the wire.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Reserve kept for the frame prefix and bincode envelope overhead.
pub const FRAME_RESERVE: usize = 1024;

/// Frame prefix: payload length + crc32 of the payload.
pub const FRAME_PREFIX: usize = 8;

/// Largest chunk payload that still fits a message already `used` bytes big.
pub fn chunk_budget(used: usize) -> usize {
    (MAX_MESSAGE_SIZE - FRAME_RESERVE).saturating_sub(used)
}

/// First (and only first) message of a streaming read response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReadStreamHeader {
    pub cmd: Option<CommandHeader>,
    pub record_flags: u64,
    pub user_flags: u64,
    pub json_timestamp: Time,
    pub json_size: u64,
    pub json_capacity: u64,
    pub read_json_size: u64,
    pub data_timestamp: Time,
    pub data_size: u64,
    pub read_data_offset: u64,
    pub read_data_size: u64,
}

/// First (and only first) message of a streaming write request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteStreamHeader {
    pub cmd: Option<CommandHeader>,
    pub ioflags: u64,
    pub user_flags: u64,
    pub json_timestamp: Time,
    pub json_size: u64,
    pub json_capacity: u64,
    pub data_timestamp: Time,
    pub data_offset: u64,
    pub data_size: u64,
    pub data_capacity: u64,
    pub data_commit_size: u64,
    pub cache_lifetime: u64,
}

/// Streaming messages multiplexed over one connection by `stream_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StreamMessage {
    /// Client opens a server-streaming read.
    ReadRequest {
        cmd: CommandHeader,
        ioflags: u64,
        read_flags: u64,
        data_offset: u64,
        data_size: u64,
    },
    /// One part of a read response; `header` present exactly on the first.
    ReadResponse {
        header: Option<ReadStreamHeader>,
        json_chunk: Vec<u8>,
        data_chunk: Vec<u8>,
        last: bool,
    },
    /// One part of a client-streaming write; `header` present on the first.
    WriteRequest {
        header: Option<WriteStreamHeader>,
        json_chunk: Vec<u8>,
        data_chunk: Vec<u8>,
    },
    /// Client signals the write stream is complete.
    WritesDone,
    /// Terminal write response (lookup-shaped), serialized by the server.
    WriteResponse {
        status: i32,
        response: Option<crate::body::LookupResponse>,
    },
    /// Terminal failure of either stream kind.
    Error { status: i32, message: String },
}

/// One streaming frame: a message bound to a logical stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub message: StreamMessage,
}

/// tokio codec for [`StreamFrame`]s.
#[derive(Debug, Default)]
pub struct StreamCodec;

impl Decoder for StreamCodec {
    type Item = StreamFrame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> WireResult<Option<StreamFrame>> {
        if src.len() < FRAME_PREFIX {
            return Ok(None);
        }
        let len = u32::from_le_bytes(src[..4].try_into().unwrap()) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(WireError::OversizedMessage {
                got: len,
                cap: MAX_MESSAGE_SIZE,
            });
        }
        if src.len() < FRAME_PREFIX + len {
            src.reserve(FRAME_PREFIX + len - src.len());
            return Ok(None);
        }
        let crc = u32::from_le_bytes(src[4..8].try_into().unwrap());
        src.advance(FRAME_PREFIX);
        let payload = src.split_to(len);
        if crc32fast::hash(&payload) != crc {
            return Err(WireError::BadFrameChecksum);
        }
        Ok(Some(bincode::deserialize(&payload)?))
    }
}

impl Encoder<StreamFrame> for StreamCodec {
    type Error = WireError;

    fn encode(&mut self, item: StreamFrame, dst: &mut BytesMut) -> WireResult<()> {
        let payload = bincode::serialize(&item)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::OversizedMessage {
                got: payload.len(),
                cap: MAX_MESSAGE_SIZE,
            });
        }
        dst.reserve(FRAME_PREFIX + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_u32_le(crc32fast::hash(&payload));
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Opcode;
    use crate::key::KeyId;

    #[test]
    fn stream_frame_round_trip() {
        let mut codec = StreamCodec;
        let frame = StreamFrame {
            stream_id: 9,
            message: StreamMessage::ReadRequest {
                cmd: CommandHeader::new(Opcode::Read, KeyId::from_name(b"", b"k"), 2),
                ioflags: 0,
                read_flags: 3,
                data_offset: 0,
                data_size: 0,
            },
        };

        let mut wire = BytesMut::new();
        codec.encode(frame, &mut wire).unwrap();
        let back = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(back.stream_id, 9);
        assert!(matches!(
            back.message,
            StreamMessage::ReadRequest { read_flags: 3, .. }
        ));
    }

    #[test]
    fn corrupted_frame_fails_checksum() {
        let mut codec = StreamCodec;
        let frame = StreamFrame {
            stream_id: 1,
            message: StreamMessage::WritesDone,
        };
        let mut wire = BytesMut::new();
        codec.encode(frame, &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(matches!(
            codec.decode(&mut wire),
            Err(WireError::BadFrameChecksum)
        ));
    }

    #[test]
    fn chunk_budget_respects_cap() {
        assert_eq!(chunk_budget(0), MAX_MESSAGE_SIZE - FRAME_RESERVE);
        assert_eq!(chunk_budget(MAX_MESSAGE_SIZE), 0);
        let used = 1000;
        assert!(used + chunk_budget(used) + FRAME_RESERVE <= MAX_MESSAGE_SIZE);
    }
}
