//! blockwire-core: protocol engine for the NBD transmission phase.
//!
//! This crate defines:
//! - Wire structures and constants ([`Request`], [`SimpleReply`],
//!   [`ChunkHeader`], [`TransmissionFlags`], [`CommandFlags`])
//! - The cookie codec ([`CookieJar`])
//! - The byte-stream transport ([`StreamTransport`])
//! - The session engine ([`Session`], [`SessionConfig`])
//! - The error taxonomy ([`Error`], [`DisconnectReason`], [`ServerError`])
//!
//! The command layer lives in the `blockwire` crate; negotiation and TLS are
//! the caller's concern — a [`Session`] is built from an already-negotiated
//! stream plus the [`ExportInfo`] that negotiation produced.

#![forbid(unsafe_code)]

mod cookie;
mod error;
mod session;
mod transport;
mod wire;

pub use cookie::*;
pub use error::*;
pub use session::*;
pub use transport::*;
pub use wire::*;
