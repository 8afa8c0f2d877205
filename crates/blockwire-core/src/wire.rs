//! Transmission-phase wire structures.
//!
//! Everything on the wire is big-endian. Requests flow client→server as a
//! fixed 28-byte header optionally followed by write payload; replies arrive
//! either as 16-byte simple replies or as a sequence of 20-byte structured
//! chunk headers, each carrying its own payload, terminated by a chunk with
//! the DONE flag.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

/// Leads every request header.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
/// Leads every simple reply.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
/// Leads every structured reply chunk.
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

/// Encoded size of a request header.
pub const REQUEST_LEN: usize = 28;
/// Bytes of a simple reply following the magic.
pub const SIMPLE_REPLY_TAIL: usize = 12;
/// Bytes of a structured chunk header following the magic.
pub const CHUNK_HEADER_TAIL: usize = 16;

/// Upper bound on a single read/write transfer.
pub const MAX_TRANSFER_SIZE: u32 = 32 * 1024 * 1024;

/// Upper bound on a structured chunk's metadata payload (error chunks).
///
/// Anything larger is rejected before allocation; the peer controls the
/// advertised length.
pub const MAX_STRUCTURED_PAYLOAD: u32 = 4096;

/// Transmission-phase command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Read = 0,
    Write = 1,
    Disconnect = 2,
    Flush = 3,
    Trim = 4,
    WriteZeroes = 6,
}

bitflags! {
    /// Per-export capability bits fixed at negotiation time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransmissionFlags: u16 {
        const HAS_FLAGS         = 1 << 0;
        const READ_ONLY         = 1 << 1;
        const SEND_FLUSH        = 1 << 2;
        const SEND_FUA          = 1 << 3;
        const ROTATIONAL        = 1 << 4;
        const SEND_TRIM         = 1 << 5;
        const SEND_WRITE_ZEROES = 1 << 6;
        const SEND_DF           = 1 << 7;
        const CAN_MULTI_CONN    = 1 << 8;
    }

    /// Per-request modifier bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u16 {
        /// Force unit access: the reply may not arrive before the data is on
        /// stable storage.
        const FUA     = 1 << 0;
        /// For WRITE_ZEROES: the server must not punch a hole; the range
        /// stays allocated.
        const NO_HOLE = 1 << 1;
    }

    /// Bits carried in a structured reply chunk header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReplyFlags: u16 {
        /// Final chunk of this request's reply.
        const DONE = 1 << 0;
    }
}

/// Bit 15 of a chunk type marks error chunks.
pub const CHUNK_TYPE_ERROR_BIT: u16 = 1 << 15;

/// Structured chunk payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ChunkType {
    /// Terminal marker; must carry DONE and an empty payload.
    None = 0,
    /// `offset u64` followed by literal data bytes.
    OffsetData = 1,
    /// `offset u64` + `hole_size u32`: a run of zeroes, no data on the wire.
    OffsetHole = 2,
    /// `errno u32` + `msg_len u16` + message.
    Error = CHUNK_TYPE_ERROR_BIT | 1,
    /// As `Error`, with the failing `offset u64` appended.
    ErrorOffset = CHUNK_TYPE_ERROR_BIT | 2,
}

impl ChunkType {
    pub fn from_wire(kind: u16) -> Option<Self> {
        match kind {
            0 => Some(Self::None),
            1 => Some(Self::OffsetData),
            2 => Some(Self::OffsetHole),
            k if k == CHUNK_TYPE_ERROR_BIT | 1 => Some(Self::Error),
            k if k == CHUNK_TYPE_ERROR_BIT | 2 => Some(Self::ErrorOffset),
            _ => None,
        }
    }

    pub fn is_error(self) -> bool {
        self as u16 & CHUNK_TYPE_ERROR_BIT != 0
    }
}

/// One request header as placed on the wire.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub flags: CommandFlags,
    pub command: Command,
    pub cookie: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        let mut w = &mut buf[..];
        w.put_u32(REQUEST_MAGIC);
        w.put_u16(self.flags.bits());
        w.put_u16(self.command as u16);
        w.put_u64(self.cookie);
        w.put_u64(self.offset);
        w.put_u32(self.length);
        buf
    }
}

/// A decoded simple reply: one error code, payload only for successful READ.
#[derive(Debug, Clone, Copy)]
pub struct SimpleReply {
    pub error: u32,
    pub cookie: u64,
}

impl SimpleReply {
    /// Decode from the [`SIMPLE_REPLY_TAIL`] bytes following the magic.
    pub fn decode(mut tail: &[u8]) -> Self {
        debug_assert_eq!(tail.len(), SIMPLE_REPLY_TAIL);
        Self {
            error: tail.get_u32(),
            cookie: tail.get_u64(),
        }
    }
}

/// A decoded structured chunk header; `length` payload bytes follow.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub flags: ReplyFlags,
    pub kind: u16,
    pub cookie: u64,
    pub length: u32,
}

impl ChunkHeader {
    /// Decode from the [`CHUNK_HEADER_TAIL`] bytes following the magic.
    pub fn decode(mut tail: &[u8]) -> Self {
        debug_assert_eq!(tail.len(), CHUNK_HEADER_TAIL);
        Self {
            flags: ReplyFlags::from_bits_truncate(tail.get_u16()),
            kind: tail.get_u16(),
            cookie: tail.get_u64(),
            length: tail.get_u32(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.flags.contains(ReplyFlags::DONE)
    }

    pub fn chunk_type(&self) -> Option<ChunkType> {
        ChunkType::from_wire(self.kind)
    }
}

/// A decoded reply header, as handed from the dispatch loop to a waiter.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Simple(SimpleReply),
    Chunk(ChunkHeader),
}

impl Reply {
    pub fn cookie(&self) -> u64 {
        match self {
            Reply::Simple(r) => r.cookie,
            Reply::Chunk(c) => c.cookie,
        }
    }
}

/// Wire error codes: errno values as fixed by the protocol.
pub mod errcode {
    pub const PERM: u32 = 1;
    pub const IO: u32 = 5;
    pub const NOMEM: u32 = 12;
    pub const INVAL: u32 = 22;
    pub const NOSPC: u32 = 28;
    pub const OVERFLOW: u32 = 75;
    pub const NOTSUP: u32 = 95;
    pub const SHUTDOWN: u32 = 108;
}

/// What negotiation (an external concern) agreed with the peer.
#[derive(Debug, Clone)]
pub struct ExportInfo {
    /// Export size in bytes.
    pub size: u64,
    /// Capability bits advertised by the server.
    pub flags: TransmissionFlags,
    /// Alignment granularity for offsets and lengths.
    pub min_block_size: u32,
    /// Whether structured replies were negotiated.
    pub structured_replies: bool,
}

impl ExportInfo {
    pub fn read_only(&self) -> bool {
        self.flags.contains(TransmissionFlags::READ_ONLY)
    }

    pub fn can_flush(&self) -> bool {
        self.flags.contains(TransmissionFlags::SEND_FLUSH)
    }

    pub fn can_fua(&self) -> bool {
        self.flags.contains(TransmissionFlags::SEND_FUA)
    }

    pub fn can_trim(&self) -> bool {
        self.flags.contains(TransmissionFlags::SEND_TRIM)
    }

    pub fn can_write_zeroes(&self) -> bool {
        self.flags.contains(TransmissionFlags::SEND_WRITE_ZEROES)
    }
}
