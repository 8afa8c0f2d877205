//! blockwire: an async client for the NBD transmission phase.
//!
//! The client turns block-device operations (read, write, flush, trim,
//! write-zeroes) into wire requests over one byte stream and routes the
//! asynchronous, possibly chunked replies back to their callers. One
//! dispatch task owns every reply-header read; callers rendezvous with it
//! through per-request channels and a bounded slot table.
//!
//! # Quick start
//!
//! ```ignore
//! use blockwire::prelude::*;
//!
//! // Negotiation (handshake, export selection, optional TLS upgrade) is an
//! // external concern that yields a stream plus the agreed ExportInfo.
//! let (stream, export) = negotiate(tcp, "backup").await?;
//!
//! let client = BlockClient::new(stream, export, SessionConfig::default());
//!
//! let mut buf = vec![0; 4096];
//! client.read_at(&mut buf, 0).await?;
//! client.write_at(&buf, 8192, false).await?;
//! client.flush().await?;
//! client.disconnect().await;
//! ```
//!
//! # Error model
//!
//! Every operation distinguishes "the connection is dead, reconnect to
//! retry" ([`Error::Disconnected`]) from "this operation failed, the
//! connection is fine" ([`Error::Server`]). Optional commands the export
//! never negotiated either complete locally or report
//! [`Error::Unsupported`]; see [`BlockClient`] for the per-command rules.

#![forbid(unsafe_code)]

mod client;

pub use client::BlockClient;

// Re-export the core types callers interact with.
pub use blockwire_core::{
    errcode, ChunkType, Command, CommandFlags, DisconnectReason, Error, ExportInfo, ServerError,
    Session, SessionConfig, StreamTransport, TransmissionFlags, TransportError, MAX_IN_FLIGHT,
    MAX_STRUCTURED_PAYLOAD, MAX_TRANSFER_SIZE,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        BlockClient, DisconnectReason, Error, ExportInfo, ServerError, SessionConfig,
        TransmissionFlags,
    };
}
