//! Block-device command layer over a [`Session`].
//!
//! Each operation maps one block-layer call onto at most one wire request,
//! consulting the negotiated capability bits first. Optional commands the
//! export lacks either complete locally (flush, discard — they are
//! advisory) or report [`Error::Unsupported`] (write-zeroes — the caller
//! must know zeroing did not happen and fall back to explicit writes).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use blockwire_core::{
    errcode, Command, CommandFlags, Error, ExportInfo, ServerError, Session, SessionConfig,
    StreamTransport, MAX_TRANSFER_SIZE,
};

/// Handle for issuing block I/O against one connected export.
///
/// Cheap to clone; all clones share the session. Building a client spawns
/// the session's reply dispatch loop on the current runtime.
#[derive(Clone)]
pub struct BlockClient {
    session: Arc<Session>,
}

impl BlockClient {
    /// Wrap an already-negotiated stream (plain TCP, TLS, anything
    /// `AsyncRead + AsyncWrite`).
    pub fn new<S>(stream: S, export: ExportInfo, config: SessionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::from_transport(StreamTransport::new(stream), export, config)
    }

    pub fn from_transport(
        transport: StreamTransport,
        export: ExportInfo,
        config: SessionConfig,
    ) -> Self {
        let session = Session::new(transport, export, config);
        session.attach();
        Self { session }
    }

    pub fn export(&self) -> &ExportInfo {
        self.session.export()
    }

    /// Requests currently on the wire.
    pub fn in_flight(&self) -> usize {
        self.session.in_flight()
    }

    /// Read `buf.len()` bytes starting at `offset`.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_io(offset, buf.len());
        let length = buf.len() as u32;
        self.session
            .request(
                Command::Read,
                CommandFlags::empty(),
                offset,
                length,
                None,
                Some(buf),
            )
            .await
    }

    /// Write `buf` at `offset`.
    ///
    /// `fua` forces the data to stable storage before the reply; it is a
    /// contract violation to pass it on an export without FUA support.
    pub async fn write_at(&self, buf: &[u8], offset: u64, fua: bool) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_io(offset, buf.len());
        self.check_writable()?;
        assert!(
            !fua || self.export().can_fua(),
            "FUA requested on an export without FUA support"
        );
        let flags = if fua {
            CommandFlags::FUA
        } else {
            CommandFlags::empty()
        };
        self.session
            .request(Command::Write, flags, offset, buf.len() as u32, Some(buf), None)
            .await
    }

    /// Flush volatile caches to stable storage. Completes locally when the
    /// export cannot flush.
    pub async fn flush(&self) -> Result<(), Error> {
        if !self.export().can_flush() {
            tracing::debug!("flush elided: export has no flush support");
            return Ok(());
        }
        self.session
            .request(Command::Flush, CommandFlags::empty(), 0, 0, None, None)
            .await
    }

    /// Discard `length` bytes at `offset`. Advisory: completes locally when
    /// the export cannot trim.
    pub async fn discard(&self, offset: u64, length: u32) -> Result<(), Error> {
        if length == 0 {
            return Ok(());
        }
        self.check_io(offset, length as usize);
        self.check_writable()?;
        if !self.export().can_trim() {
            tracing::debug!(offset, length, "discard elided: export has no trim support");
            return Ok(());
        }
        self.session
            .request(Command::Trim, CommandFlags::empty(), offset, length, None, None)
            .await
    }

    /// Zero `length` bytes at `offset`.
    ///
    /// `may_unmap` permits the server to deallocate the range; without it
    /// the range must stay allocated. Reports [`Error::Unsupported`] when
    /// the export lacks the command, so callers can fall back to explicit
    /// writes.
    pub async fn write_zeroes_at(
        &self,
        offset: u64,
        length: u32,
        may_unmap: bool,
    ) -> Result<(), Error> {
        if length == 0 {
            return Ok(());
        }
        self.check_io(offset, length as usize);
        self.check_writable()?;
        if !self.export().can_write_zeroes() {
            return Err(Error::Unsupported);
        }
        let flags = if may_unmap {
            CommandFlags::empty()
        } else {
            CommandFlags::NO_HOLE
        };
        self.session
            .request(Command::WriteZeroes, flags, offset, length, None, None)
            .await
    }

    /// Notify the server we are leaving, then tear the session down.
    pub async fn disconnect(&self) {
        self.session.send_disconnect().await;
        self.session.close().await;
    }

    /// Abrupt teardown: fails every in-flight request and stops all
    /// transport I/O. Idempotent.
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Re-spawn the reply dispatch loop on the current runtime (after a
    /// [`BlockClient::detach`]).
    pub fn attach(&self) {
        self.session.attach();
    }

    /// Park the reply dispatch loop so the session can migrate to another
    /// runtime. In-flight requests are left undisturbed.
    pub async fn detach(&self) {
        self.session.detach().await;
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.export().read_only() {
            return Err(Error::Server(ServerError::from_code(errcode::PERM)));
        }
        Ok(())
    }

    fn check_io(&self, offset: u64, len: usize) {
        assert!(
            len as u64 <= MAX_TRANSFER_SIZE as u64,
            "transfer of {len} bytes exceeds the {MAX_TRANSFER_SIZE} byte limit"
        );
        let align = u64::from(self.export().min_block_size.max(1));
        debug_assert!(
            offset % align == 0 && len as u64 % align == 0,
            "request [{offset}, +{len}) not aligned to {align}"
        );
    }
}

impl std::fmt::Debug for BlockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockClient")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
