//! The session engine: slot table, send path, reply dispatch loop, and the
//! per-request reply cursor.
//!
//! # Architecture
//!
//! ```text
//!   submit()                dispatch loop                    waiter
//!   ────────                ─────────────                    ──────
//!   acquire permit
//!   claim slot
//!   corked write ───► (wire) ───► read one reply header
//!                            resolve cookie → slot
//!                            send (header, baton) ────────► recv handoff
//!                            park on baton                  read payload bytes
//!                              ▲                            scatter / record error
//!                              └─────────────────────────── fire baton
//!                            read next header …             loop until DONE
//! ```
//!
//! Only the dispatch loop reads reply headers; a waiter reads payload bytes
//! only while the loop is parked on that waiter's baton. The two never run
//! concurrently against the stream, so its position is always owned by
//! exactly one task. A dropped baton means the owner vanished with payload
//! bytes unconsumed — the stream position is unknowable and the session is
//! torn down.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::cookie::{CookieJar, MAX_ADDRESSABLE_SLOTS};
use crate::error::{DisconnectReason, Error, ServerError};
use crate::transport::{StreamTransport, TransportError};
use crate::wire::{
    ChunkHeader, ChunkType, Command, CommandFlags, ExportInfo, Reply, Request, SimpleReply,
    CHUNK_HEADER_TAIL, MAX_STRUCTURED_PAYLOAD, MAX_TRANSFER_SIZE, SIMPLE_REPLY_MAGIC,
    SIMPLE_REPLY_TAIL, STRUCTURED_REPLY_MAGIC,
};

/// Default slot-table capacity.
pub const MAX_IN_FLIGHT: usize = 64;

fn default_max_in_flight() -> usize {
    std::env::var("BLOCKWIRE_MAX_IN_FLIGHT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0 && *v < MAX_ADDRESSABLE_SLOTS)
        .unwrap_or(MAX_IN_FLIGHT)
}

/// Tunables fixed at session construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How many requests may be on the wire at once. Further submissions
    /// queue in FIFO order.
    pub max_in_flight: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Authoritative session state; every failure path funnels through it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Connected,
    Closing,
    Closed(DisconnectReason),
}

/// One reply header handed from the dispatch loop to a slot's owner, with
/// the baton the owner fires once every payload byte belonging to this
/// header has been consumed.
struct Handoff {
    reply: Reply,
    resume: oneshot::Sender<()>,
}

struct SlotEntry {
    tx: mpsc::Sender<Handoff>,
    command: Command,
}

/// One connected export's transmission phase.
///
/// Built on an already-negotiated transport; negotiation itself is the
/// caller's concern. Spawn the reply loop with [`Session::attach`] before
/// issuing requests.
pub struct Session {
    transport: StreamTransport,
    export: ExportInfo,
    cookies: CookieJar,
    state: Mutex<SessionState>,
    slots: Mutex<Vec<Option<SlotEntry>>>,
    admission: Semaphore,
    paused: watch::Sender<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(transport: StreamTransport, export: ExportInfo, config: SessionConfig) -> Arc<Self> {
        let capacity = config.max_in_flight;
        assert!(
            capacity > 0 && capacity < MAX_ADDRESSABLE_SLOTS,
            "max_in_flight {capacity} out of range"
        );
        Arc::new(Self {
            transport,
            export,
            cookies: CookieJar::new(),
            state: Mutex::new(SessionState::Connected),
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
            admission: Semaphore::new(capacity),
            paused: watch::channel(false).0,
            dispatch: Mutex::new(None),
        })
    }

    pub fn export(&self) -> &ExportInfo {
        &self.export
    }

    /// Number of requests currently occupying slots.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Spawn the dispatch loop onto the current runtime. No-op if it is
    /// already running or the session is dead.
    pub fn attach(self: &Arc<Self>) {
        let mut dispatch = self.dispatch.lock();
        if dispatch.is_some() || *self.state.lock() != SessionState::Connected {
            return;
        }
        self.paused.send_replace(false);
        let session = Arc::clone(self);
        *dispatch = Some(tokio::spawn(async move { session.run_dispatch().await }));
    }

    /// Park the dispatch loop at its next iteration boundary and wait for it
    /// to stop. In-flight slot state is untouched; [`Session::attach`] on
    /// another runtime resumes exactly where it left off.
    pub async fn detach(&self) {
        let handle = {
            let mut dispatch = self.dispatch.lock();
            self.paused.send_replace(true);
            dispatch.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Tear the session down. Idempotent; returns once every in-flight
    /// request has been failed and the dispatch loop has stopped.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Connected {
                *state = SessionState::Closing;
            }
        }
        self.admission.close();
        self.transport.shutdown().await;
        let handle = self.dispatch.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Connected | SessionState::Closing) {
                *state = SessionState::Closed(DisconnectReason::Shutdown);
            }
        }
        // Covers waiters left behind when no loop was attached.
        self.wake_all();
    }

    /// Best-effort disconnect notification. It never receives a reply and
    /// uses the reserved cookie 0 outside the slot table.
    pub async fn send_disconnect(&self) {
        if self.fail_fast().is_err() {
            return;
        }
        let request = Request {
            flags: CommandFlags::empty(),
            command: Command::Disconnect,
            cookie: 0,
            offset: 0,
            length: 0,
        };
        tracing::debug!("sending disconnect notification");
        if let Err(e) = self.transport.write_message(&request.encode(), None).await {
            tracing::debug!(error = %e, "disconnect notification failed");
        }
    }

    /// Issue one command and drive its reply to completion.
    ///
    /// `payload` supplies WRITE bytes; `read_into` receives READ bytes.
    /// Commands with neither pass `None` for both.
    pub async fn request(
        &self,
        command: Command,
        flags: CommandFlags,
        offset: u64,
        length: u32,
        payload: Option<&[u8]>,
        read_into: Option<&mut [u8]>,
    ) -> Result<(), Error> {
        let exchange = self.submit(command, flags, offset, length, payload).await?;
        exchange.complete(read_into).await
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Send one request, returning the exchange to drive for its reply.
    /// Suspends in FIFO order while the slot table is full.
    async fn submit(
        &self,
        command: Command,
        flags: CommandFlags,
        offset: u64,
        length: u32,
        payload: Option<&[u8]>,
    ) -> Result<Exchange<'_>, Error> {
        self.fail_fast()?;
        debug_assert!(length <= MAX_TRANSFER_SIZE);
        if let Some(payload) = payload {
            debug_assert_eq!(payload.len() as u32, length);
        }

        let Ok(permit) = self.admission.acquire().await else {
            return Err(Error::Disconnected(self.current_reason()));
        };
        // Returned through release_slot, one permit per occupied slot.
        permit.forget();

        let (slot, rx) = {
            let mut slots = self.slots.lock();
            let idx = slots
                .iter()
                .position(|s| s.is_none())
                .expect("admission permit guarantees a free slot");
            let (tx, rx) = mpsc::channel(1);
            slots[idx] = Some(SlotEntry { tx, command });
            (idx, rx)
        };
        let cookie = self.cookies.encode(slot);

        // The session may have died while we waited for admission.
        if let Err(e) = self.fail_fast() {
            self.release_slot(slot);
            return Err(e);
        }

        tracing::debug!(cookie, slot, ?command, offset, length, "submitting request");

        let request = Request {
            flags,
            command,
            cookie,
            offset,
            length,
        };
        if let Err(e) = self.transport.write_message(&request.encode(), payload).await {
            tracing::warn!(cookie, error = %e, "request write failed");
            self.release_slot(slot);
            let reason = self.fail(io_reason(e)).await;
            return Err(Error::Disconnected(reason));
        }

        Ok(Exchange {
            session: self,
            slot,
            cookie,
            rx,
            released: false,
        })
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    async fn run_dispatch(self: Arc<Self>) {
        tracing::debug!("dispatch loop running");
        let mut paused = self.paused.subscribe();
        loop {
            if *paused.borrow_and_update() {
                // Detach: preserve all slot state for a later attach.
                tracing::debug!("dispatch loop parked");
                return;
            }
            let reply = tokio::select! {
                biased;
                _ = paused.changed() => continue,
                res = self.read_reply() => match res {
                    Ok(reply) => reply,
                    Err(ReadFail::Transport(e)) => {
                        self.fail(io_reason(e)).await;
                        break;
                    }
                    Err(ReadFail::Protocol(detail)) => {
                        tracing::warn!(detail = %detail, "protocol error reading reply header");
                        self.fail(DisconnectReason::Protocol(detail)).await;
                        break;
                    }
                },
            };

            let cookie = reply.cookie();
            let Some(slot) = self.cookies.decode(cookie) else {
                self.fail_protocol(format!("reply for unknown cookie {cookie:#x}"))
                    .await;
                break;
            };
            let entry = {
                let slots = self.slots.lock();
                slots
                    .get(slot)
                    .and_then(|e| e.as_ref())
                    .map(|e| (e.tx.clone(), e.command))
            };
            let Some((tx, command)) = entry else {
                self.fail_protocol(format!("reply for vacant slot {slot}")).await;
                break;
            };

            tracing::debug!(cookie, slot, ?command, "delivering reply header");
            let (resume_tx, resume_rx) = oneshot::channel();
            let handoff = Handoff {
                reply,
                resume: resume_tx,
            };
            // Capacity 1 and strictly alternating handoffs: a failure means
            // the waiter vanished, and its share of the stream can no longer
            // be consumed safely.
            if tx.try_send(handoff).is_err() {
                self.fail_protocol(format!("reply consumer for slot {slot} vanished"))
                    .await;
                break;
            }
            // Park until the waiter has consumed its payload bytes. An
            // abandoned baton is the waiter's failure signal; the state it
            // set (if any) wins over the generic reason below.
            if resume_rx.await.is_err() {
                self.fail(DisconnectReason::Protocol(
                    "reply consumer abandoned its exchange".into(),
                ))
                .await;
                break;
            }
        }
        self.wake_all();
        tracing::debug!("dispatch loop stopped");
    }

    /// Read and decode one reply header. Cancel-safe: bytes are consumed
    /// only once a complete header is available.
    async fn read_reply(&self) -> Result<Reply, ReadFail> {
        let magic = self.transport.peek_u32().await?;
        match magic {
            SIMPLE_REPLY_MAGIC => {
                let header = self.transport.take(4 + SIMPLE_REPLY_TAIL).await?;
                Ok(Reply::Simple(SimpleReply::decode(&header[4..])))
            }
            STRUCTURED_REPLY_MAGIC => {
                if !self.export.structured_replies {
                    return Err(ReadFail::Protocol(
                        "structured reply on a session that never negotiated them".into(),
                    ));
                }
                let header = self.transport.take(4 + CHUNK_HEADER_TAIL).await?;
                Ok(Reply::Chunk(ChunkHeader::decode(&header[4..])))
            }
            other => Err(ReadFail::Protocol(format!("bad reply magic {other:#010x}"))),
        }
    }

    // ------------------------------------------------------------------
    // State and teardown plumbing
    // ------------------------------------------------------------------

    fn fail_fast(&self) -> Result<(), Error> {
        match &*self.state.lock() {
            SessionState::Connected => Ok(()),
            SessionState::Closing => Err(Error::Disconnected(DisconnectReason::Shutdown)),
            SessionState::Closed(reason) => Err(Error::Disconnected(reason.clone())),
        }
    }

    fn current_reason(&self) -> DisconnectReason {
        match &*self.state.lock() {
            SessionState::Closed(reason) => reason.clone(),
            _ => DisconnectReason::Shutdown,
        }
    }

    /// Mark the session dead. The first reason wins; a session already in
    /// `Closing` dies as a plain shutdown regardless of what the dispatch
    /// loop tripped over while draining.
    async fn fail(&self, reason: DisconnectReason) -> DisconnectReason {
        let reason = {
            let mut state = self.state.lock();
            match &*state {
                SessionState::Closed(existing) => existing.clone(),
                SessionState::Closing => {
                    *state = SessionState::Closed(DisconnectReason::Shutdown);
                    DisconnectReason::Shutdown
                }
                SessionState::Connected => {
                    tracing::warn!(%reason, "session failed");
                    *state = SessionState::Closed(reason.clone());
                    reason
                }
            }
        };
        self.admission.close();
        self.transport.shutdown().await;
        reason
    }

    async fn fail_protocol(&self, detail: String) {
        tracing::warn!(detail = %detail, "protocol error");
        self.fail(DisconnectReason::Protocol(detail)).await;
    }

    /// Fail every occupied slot by dropping its sender; the owners observe a
    /// closed channel and convert it to the session's disconnect reason.
    fn wake_all(&self) {
        let mut slots = self.slots.lock();
        let woken = slots.iter_mut().filter_map(Option::take).count();
        if woken > 0 {
            tracing::debug!(woken, "failed remaining in-flight requests");
        }
    }

    fn release_slot(&self, slot: usize) {
        if self.slots.lock()[slot].take().is_some() {
            self.admission.add_permits(1);
        }
    }
}

fn io_reason(e: TransportError) -> DisconnectReason {
    DisconnectReason::Io(e.to_string())
}

enum ReadFail {
    Transport(TransportError),
    Protocol(String),
}

impl From<TransportError> for ReadFail {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ----------------------------------------------------------------------
// Reply cursor
// ----------------------------------------------------------------------

/// One in-flight request: created by the send path, consumed by driving the
/// reply to completion.
///
/// If the owning future is dropped mid-flight the slot stays occupied on
/// purpose; when the orphaned reply eventually arrives the dispatch loop
/// finds the consumer gone and tears the session down (cancellation is
/// connection-wide, never per-request).
struct Exchange<'a> {
    session: &'a Session,
    slot: usize,
    cookie: u64,
    rx: mpsc::Receiver<Handoff>,
    released: bool,
}

enum ChunkFail {
    Transport(TransportError),
    Protocol(String),
}

impl From<TransportError> for ChunkFail {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl Exchange<'_> {
    /// Drain this request's reply: exactly one simple reply, or structured
    /// chunks until one carries DONE. Server-reported errors accumulate
    /// (first wins) without killing the session; transport or protocol
    /// failures are fatal to the whole session.
    async fn complete(mut self, mut dest: Option<&mut [u8]>) -> Result<(), Error> {
        let mut outcome: Option<ServerError> = None;
        let mut structured = false;
        loop {
            let Some(Handoff { reply, resume }) = self.rx.recv().await else {
                // The dispatch loop dropped our slot: the session is dead.
                self.finish();
                return Err(Error::Disconnected(self.session.current_reason()));
            };
            match reply {
                Reply::Simple(simple) => {
                    if structured {
                        return Err(self
                            .fatal(
                                resume,
                                format!(
                                    "simple reply interleaved into a structured exchange \
                                     for cookie {:#x}",
                                    self.cookie
                                ),
                            )
                            .await);
                    }
                    tracing::debug!(cookie = self.cookie, error = simple.error, "simple reply");
                    if simple.error == 0 {
                        if let Some(buf) = dest.as_deref_mut() {
                            if let Err(e) = self.session.transport.read_into(buf).await {
                                return Err(self.fatal_io(resume, e).await);
                            }
                        }
                    } else {
                        // Error replies carry no payload, even for READ.
                        outcome = Some(ServerError::from_code(simple.error));
                    }
                    self.finish();
                    let _ = resume.send(());
                    return match outcome {
                        Some(e) => Err(Error::Server(e)),
                        None => Ok(()),
                    };
                }
                Reply::Chunk(chunk) => {
                    structured = true;
                    let done = chunk.is_done();
                    match self
                        .consume_chunk(&chunk, dest.as_deref_mut(), &mut outcome)
                        .await
                    {
                        Ok(()) => {}
                        Err(ChunkFail::Transport(e)) => return Err(self.fatal_io(resume, e).await),
                        Err(ChunkFail::Protocol(detail)) => {
                            return Err(self.fatal(resume, detail).await)
                        }
                    }
                    if done {
                        self.finish();
                        let _ = resume.send(());
                        return match outcome {
                            Some(e) => Err(Error::Server(e)),
                            None => Ok(()),
                        };
                    }
                    let _ = resume.send(());
                }
            }
        }
    }

    /// Consume one structured chunk's payload per its type.
    async fn consume_chunk(
        &mut self,
        chunk: &ChunkHeader,
        dest: Option<&mut [u8]>,
        outcome: &mut Option<ServerError>,
    ) -> Result<(), ChunkFail> {
        use bytes::Buf;

        let Some(kind) = chunk.chunk_type() else {
            return Err(ChunkFail::Protocol(format!(
                "unknown chunk type {:#06x}",
                chunk.kind
            )));
        };
        tracing::debug!(cookie = self.cookie, ?kind, length = chunk.length, "reply chunk");
        match kind {
            ChunkType::None => {
                if !chunk.is_done() {
                    return Err(ChunkFail::Protocol("terminal chunk without DONE".into()));
                }
                if chunk.length != 0 {
                    return Err(ChunkFail::Protocol("terminal chunk with payload".into()));
                }
                Ok(())
            }
            ChunkType::OffsetData => {
                let Some(buf) = dest else {
                    return Err(ChunkFail::Protocol(
                        "data chunk for a command without a read buffer".into(),
                    ));
                };
                if chunk.length <= 8 {
                    return Err(ChunkFail::Protocol(format!(
                        "data chunk of {} bytes cannot hold offset + data",
                        chunk.length
                    )));
                }
                let mut head = self.session.transport.take(8).await?;
                let offset = head.get_u64() as usize;
                let data_len = (chunk.length - 8) as usize;
                let Some(end) = offset.checked_add(data_len).filter(|end| *end <= buf.len())
                else {
                    return Err(ChunkFail::Protocol(format!(
                        "data chunk [{offset}, +{data_len}) outside a {} byte buffer",
                        buf.len()
                    )));
                };
                self.session.transport.read_into(&mut buf[offset..end]).await?;
                Ok(())
            }
            ChunkType::OffsetHole => {
                let Some(buf) = dest else {
                    return Err(ChunkFail::Protocol(
                        "hole chunk for a command without a read buffer".into(),
                    ));
                };
                if chunk.length != 12 {
                    return Err(ChunkFail::Protocol(format!(
                        "hole chunk payload must be 12 bytes, got {}",
                        chunk.length
                    )));
                }
                let mut payload = self.session.transport.take(12).await?;
                let offset = payload.get_u64() as usize;
                let hole = payload.get_u32() as usize;
                if hole == 0 {
                    return Err(ChunkFail::Protocol("zero-length hole chunk".into()));
                }
                let Some(end) = offset.checked_add(hole).filter(|end| *end <= buf.len()) else {
                    return Err(ChunkFail::Protocol(format!(
                        "hole chunk [{offset}, +{hole}) outside a {} byte buffer",
                        buf.len()
                    )));
                };
                buf[offset..end].fill(0);
                Ok(())
            }
            ChunkType::Error | ChunkType::ErrorOffset => {
                if chunk.length > MAX_STRUCTURED_PAYLOAD {
                    return Err(ChunkFail::Protocol(format!(
                        "error payload of {} bytes exceeds the {} byte bound",
                        chunk.length, MAX_STRUCTURED_PAYLOAD
                    )));
                }
                let tail = if kind == ChunkType::ErrorOffset { 8 } else { 0 };
                if (chunk.length as usize) < 6 + tail {
                    return Err(ChunkFail::Protocol(format!(
                        "error payload of {} bytes too short",
                        chunk.length
                    )));
                }
                let mut payload = self.session.transport.take(chunk.length as usize).await?;
                let code = payload.get_u32();
                let msg_len = payload.get_u16() as usize;
                if payload.len() != msg_len + tail {
                    return Err(ChunkFail::Protocol(format!(
                        "error payload length {} inconsistent with message length {msg_len}",
                        chunk.length
                    )));
                }
                if code == 0 {
                    return Err(ChunkFail::Protocol("error chunk with zero error code".into()));
                }
                let message = (msg_len > 0)
                    .then(|| String::from_utf8_lossy(&payload[..msg_len]).into_owned());
                payload.advance(msg_len);
                let offset = (tail > 0).then(|| payload.get_u64());
                tracing::warn!(
                    cookie = self.cookie,
                    code,
                    message = message.as_deref().unwrap_or(""),
                    "server reported an error chunk"
                );
                if outcome.is_none() {
                    *outcome = Some(ServerError {
                        code,
                        message,
                        offset,
                    });
                }
                Ok(())
            }
        }
    }

    /// Fatal protocol failure declared by this waiter: poison the session,
    /// abandon the baton so the parked dispatch loop runs its teardown, and
    /// surface the disconnect.
    async fn fatal(&mut self, resume: oneshot::Sender<()>, detail: String) -> Error {
        tracing::warn!(cookie = self.cookie, detail = %detail, "protocol error in reply payload");
        let reason = self
            .session
            .fail(DisconnectReason::Protocol(detail))
            .await;
        drop(resume);
        self.finish();
        Error::Disconnected(reason)
    }

    async fn fatal_io(&mut self, resume: oneshot::Sender<()>, e: TransportError) -> Error {
        let reason = self.session.fail(io_reason(e)).await;
        drop(resume);
        self.finish();
        Error::Disconnected(reason)
    }

    fn finish(&mut self) {
        if !self.released {
            self.released = true;
            self.session.release_slot(self.slot);
        }
    }
}
