//! Client half of the chunked streaming RPCs.
//!
//! Large records move over a dedicated streaming port: reads arrive as a
//! header message followed by payload chunks, writes leave as a header
//! message, payload chunks and an explicit end-of-stream marker. Every
//! message respects the transport cap.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use strand_proto::body::LookupResponse;
use strand_proto::stream::{
    chunk_budget, ReadStreamHeader, StreamCodec, StreamFrame, StreamMessage, WriteStreamHeader,
};
use strand_proto::{CommandHeader, ErrorCode, KeyId, Opcode};

use crate::error::{Error, Result};

/// Dial and exchange budget for one streaming call.
const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully reassembled streaming read.
#[derive(Debug)]
pub struct StreamReadResult {
    pub header: ReadStreamHeader,
    pub json: Vec<u8>,
    pub data: Vec<u8>,
}

/// Connection to one node's streaming port.
pub struct StreamClient {
    framed: Framed<TcpStream, StreamCodec>,
    next_stream: AtomicU64,
}

impl StreamClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(STREAM_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::new(ErrorCode::TimedOut, format!("connect to {addr} timed out")))?
            .map_err(|err| {
                Error::new(ErrorCode::ConnectionReset, format!("connect to {addr}: {err}"))
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            framed: Framed::new(stream, StreamCodec),
            next_stream: AtomicU64::new(1),
        })
    }

    async fn send(&mut self, frame: StreamFrame) -> Result<()> {
        self.framed.send(frame).await.map_err(Error::from)
    }

    async fn recv(&mut self, stream_id: u64) -> Result<StreamMessage> {
        loop {
            let frame = tokio::time::timeout(STREAM_TIMEOUT, self.framed.next())
                .await
                .map_err(|_| Error::new(ErrorCode::TimedOut, "streaming reply timed out"))?
                .ok_or_else(|| Error::new(ErrorCode::ConnectionReset, "stream closed"))?
                .map_err(Error::from)?;
            if frame.stream_id == stream_id {
                return Ok(frame.message);
            }
            tracing::debug!(
                got = frame.stream_id,
                want = stream_id,
                "frame for foreign stream skipped"
            );
        }
    }

    /// Server-streaming read: one request, a header message, then payload
    /// chunks until the server finishes the stream.
    pub async fn read(
        &mut self,
        key: KeyId,
        group: u32,
        read_flags: u64,
        data_offset: u64,
        data_size: u64,
    ) -> Result<StreamReadResult> {
        let stream_id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let cmd = CommandHeader::new(Opcode::Read, key, group);
        self.send(StreamFrame {
            stream_id,
            message: StreamMessage::ReadRequest {
                cmd,
                ioflags: 0,
                read_flags,
                data_offset,
                data_size,
            },
        })
        .await?;

        let mut header: Option<ReadStreamHeader> = None;
        let mut json = Vec::new();
        let mut data = Vec::new();
        loop {
            match self.recv(stream_id).await? {
                StreamMessage::ReadResponse {
                    header: part_header,
                    json_chunk,
                    data_chunk,
                    last,
                } => {
                    if let Some(h) = part_header {
                        json.reserve(h.read_json_size as usize);
                        data.reserve(h.read_data_size as usize);
                        header = Some(h);
                    }
                    json.extend_from_slice(&json_chunk);
                    data.extend_from_slice(&data_chunk);
                    if last {
                        let header = header.ok_or_else(|| {
                            Error::new(ErrorCode::Protocol, "read stream finished without header")
                        })?;
                        return Ok(StreamReadResult { header, json, data });
                    }
                }
                StreamMessage::Error { status, message } => {
                    return Err(Error::from_status(status, message));
                }
                other => {
                    return Err(Error::new(
                        ErrorCode::Protocol,
                        format!("unexpected stream message: {other:?}"),
                    ));
                }
            }
        }
    }

    /// Client-streaming write: header first, chunked payload, end-of-stream,
    /// then a single lookup-shaped response.
    pub async fn write(
        &mut self,
        key: KeyId,
        group: u32,
        json: &[u8],
        data: &[u8],
    ) -> Result<LookupResponse> {
        let stream_id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let cmd = CommandHeader::new(Opcode::Write, key, group);
        let header = WriteStreamHeader {
            cmd: Some(cmd),
            json_size: json.len() as u64,
            json_capacity: json.len() as u64,
            data_size: data.len() as u64,
            data_capacity: data.len() as u64,
            ..Default::default()
        };

        let mut json_offset = 0usize;
        let mut data_offset = 0usize;
        let mut first = true;
        loop {
            // Greedily fill each message up to the transport cap.
            let mut budget = chunk_budget(0);
            let json_part = budget.min(json.len() - json_offset);
            budget -= json_part;
            let data_part = budget.min(data.len() - data_offset);

            let message = StreamMessage::WriteRequest {
                header: if first { Some(header.clone()) } else { None },
                json_chunk: json[json_offset..json_offset + json_part].to_vec(),
                data_chunk: data[data_offset..data_offset + data_part].to_vec(),
            };
            json_offset += json_part;
            data_offset += data_part;
            first = false;
            self.send(StreamFrame { stream_id, message }).await?;

            if json_offset == json.len() && data_offset == data.len() {
                break;
            }
        }
        self.send(StreamFrame {
            stream_id,
            message: StreamMessage::WritesDone,
        })
        .await?;

        match self.recv(stream_id).await? {
            StreamMessage::WriteResponse { status, response } => {
                if status != 0 {
                    return Err(Error::from_status(status, "streaming write failed"));
                }
                response.ok_or_else(|| {
                    Error::new(ErrorCode::Protocol, "write response missing body")
                })
            }
            StreamMessage::Error { status, message } => Err(Error::from_status(status, message)),
            other => Err(Error::new(
                ErrorCode::Protocol,
                format!("unexpected stream message: {other:?}"),
            )),
        }
    }
}
