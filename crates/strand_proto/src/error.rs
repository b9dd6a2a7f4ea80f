//! Wire-level status taxonomy and codec errors.

use thiserror::Error;

/// Errno-style status carried in the command header `status` field.
///
/// Statuses are negative on the wire, zero means success. Storage backends
/// may produce statuses outside this set; these are the ones the engine
/// itself synthesizes or branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    /// Key absent in the replica.
    #[error("key not found")]
    NotFound,
    /// Client deadline, server queue-timeout or forward-node deadline.
    #[error("timed out")]
    TimedOut,
    /// No owning node for the key/group.
    #[error("no route to key")]
    NoRoute,
    /// Group unknown to the addressed node.
    #[error("group not supported")]
    NotSupported,
    /// Second terminal reply attempt on the same transaction.
    #[error("reply already sent")]
    Already,
    /// Malformed header, unparseable body or streaming size mismatch.
    #[error("protocol violation")]
    Protocol,
    /// Allocation failure during dispatch.
    #[error("out of memory")]
    NoMemory,
    /// Compare-and-swap checksum mismatch.
    #[error("checksum mismatch")]
    BadChecksum,
    /// Peer connection was lost while the transaction was in flight.
    #[error("connection reset")]
    ConnectionReset,
    /// Payload exceeds the record's reserved capacity.
    #[error("payload too big")]
    TooBig,
}

impl ErrorCode {
    /// Wire representation, always negative.
    pub fn status(self) -> i32 {
        match self {
            ErrorCode::NotFound => -2,
            ErrorCode::TimedOut => -110,
            ErrorCode::NoRoute => -6,
            ErrorCode::NotSupported => -95,
            ErrorCode::Already => -114,
            ErrorCode::Protocol => -22,
            ErrorCode::NoMemory => -12,
            ErrorCode::BadChecksum => -77,
            ErrorCode::ConnectionReset => -104,
            ErrorCode::TooBig => -7,
        }
    }

    /// Map a wire status back to a known code, if it is one of ours.
    pub fn from_status(status: i32) -> Option<Self> {
        match status {
            -2 => Some(ErrorCode::NotFound),
            -110 => Some(ErrorCode::TimedOut),
            -6 => Some(ErrorCode::NoRoute),
            -95 => Some(ErrorCode::NotSupported),
            -114 => Some(ErrorCode::Already),
            -22 => Some(ErrorCode::Protocol),
            -12 => Some(ErrorCode::NoMemory),
            -77 => Some(ErrorCode::BadChecksum),
            -104 => Some(ErrorCode::ConnectionReset),
            -7 => Some(ErrorCode::TooBig),
            _ => None,
        }
    }
}

/// Errors produced while encoding or decoding wire traffic.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated command header: {0} bytes")]
    TruncatedHeader(usize),
    #[error("command body of {got} bytes exceeds limit {limit}")]
    OversizedBody { got: u64, limit: u64 },
    #[error("unknown command opcode {0}")]
    UnknownOpcode(u32),
    #[error("reserved header field is non-zero")]
    DirtyReserved,
    #[error("streaming frame checksum mismatch")]
    BadFrameChecksum,
    #[error("streaming message of {got} bytes exceeds cap {cap}")]
    OversizedMessage { got: usize, cap: usize },
    #[error("body serialization failed: {0}")]
    Serialization(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for WireError {
    fn from(err: bincode::Error) -> Self {
        WireError::Serialization(err.to_string())
    }
}

pub type WireResult<T> = Result<T, WireError>;
