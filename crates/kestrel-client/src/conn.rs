//! A single multiplexed connection to one coordinator node.
//!
//! # Architecture
//!
//! ```text
//! caller ──call()/events()──► CallTable.allocate ─► FrameWriter (write lock)
//!                                                        │
//!                                                        ▼
//!                                                     network
//!                                                        │
//! caller ◄── oneshot / mpsc ◄── CallTable.dispatch ◄── read loop (sole reader)
//! ```
//!
//! The first failure seen on either direction becomes the connection's
//! sticky error. From then on nothing more is written or read, every pending
//! call is terminated, and every new call fails fast with that error.

use std::sync::{Arc, Mutex, OnceLock};

use kestrel_core::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN};
use crate::table::{CallId, CallTable, Delivery, Dispatch, Sink};
use crate::watch::Watch;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A live connection carrying many concurrent calls.
///
/// Created by [`Connection::spawn`], which starts the read loop. Shared as
/// `Arc<Connection>`; the read loop keeps it alive until the stream ends.
pub struct Connection {
    addr: String,
    writer: tokio::sync::Mutex<FrameWriter<BoxedWrite>>,
    table: CallTable,
    failure: OnceLock<Error>,
    redirect: Mutex<Option<String>>,
    closed: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("failure", &self.failure.get())
            .field("pending", &self.table.len())
            .finish()
    }
}

impl Connection {
    /// Wrap a connected byte stream and start its read loop.
    pub fn spawn<S>(addr: impl Into<String>, stream: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_with_max_frame(addr, stream, DEFAULT_MAX_FRAME_LEN)
    }

    /// Like [`Connection::spawn`], rejecting inbound frames over `max_frame_len`.
    pub fn spawn_with_max_frame<S>(addr: impl Into<String>, stream: S, max_frame_len: u32) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: BoxedWrite = Box::new(write_half);

        let conn = Arc::new(Self {
            addr: addr.into(),
            writer: tokio::sync::Mutex::new(FrameWriter::new(writer)),
            table: CallTable::new(),
            failure: OnceLock::new(),
            redirect: Mutex::new(None),
            closed: watch::channel(false).0,
            shutdown: watch::channel(false).0,
        });

        let reader = FrameReader::with_max_len(read_half, max_frame_len);
        tokio::spawn(Arc::clone(&conn).read_loop(reader));
        conn
    }

    /// Address this connection was dialed to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The sticky error, once the connection has failed.
    pub fn failure(&self) -> Option<Error> {
        self.failure.get().cloned()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.get().is_some()
    }

    /// Address the remote end redirected us to, if it ever did.
    pub fn redirect_addr(&self) -> Option<String> {
        self.redirect.lock().expect("redirect lock").clone()
    }

    pub fn is_redirected(&self) -> bool {
        self.redirect.lock().expect("redirect lock").is_some()
    }

    /// Number of calls currently open or reserved on this connection.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    /// Resolves once the read loop has finished tearing the connection down.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Fail the connection with [`Error::Closed`] and stop its read loop.
    pub fn close(&self) {
        self.fail(Error::Closed);
    }

    /// Issue a one-shot call and wait for its single response.
    pub async fn call(&self, req: Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        self.send(req, Sink::unary(tx)).await?;

        let resp = rx.await.map_err(|_| Error::UnexpectedEof)?;
        match Error::from_response(&resp) {
            Some(err) => Err(err),
            None => Ok(resp),
        }
    }

    /// Issue a streaming call. Responses arrive as events on the returned
    /// [`Watch`] until the remote end finishes the stream or it is cancelled.
    pub async fn events(self: &Arc<Self>, req: Request) -> Result<Watch> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (tag, call) = self.send(req, Sink::Stream(tx)).await?;
        Ok(Watch::spawn(Arc::clone(self), tag, call, rx))
    }

    /// Cancel the streaming call registered as (`tag`, `call`).
    ///
    /// The tag is held in reserve until the remote end confirms. If the
    /// CANCEL itself fails the tag stays reserved for the rest of this
    /// connection's life rather than risk colliding with a live remote stream.
    pub(crate) async fn cancel(&self, tag: i32, call: CallId) -> Result<()> {
        let sink = self.table.reserve(tag, call)?;

        match self.call(Request::cancel(tag)).await {
            Ok(_) => {
                self.table.release(tag);
                drop(sink);
                debug!(addr = %self.addr, tag, "stream cancelled");
                Ok(())
            }
            Err(e) => {
                // Teardown skips reserved tags, so a lost connection has to
                // reach the stream from here.
                if e.is_connection() {
                    if let Sink::Stream(tx) = &sink {
                        let _ = tx.send(Delivery::Lost(e.clone()));
                    }
                }
                drop(sink);
                warn!(addr = %self.addr, tag, error = %e, "cancel failed, retiring tag");
                Err(e)
            }
        }
    }

    async fn send(&self, mut req: Request, sink: Sink) -> Result<(i32, CallId)> {
        if let Some(err) = self.failure() {
            return Err(err);
        }

        let (tag, call) = self.table.allocate(sink)?;
        req.tag = Some(tag);

        if let Err(e) = self.write_request(&req).await {
            self.table.release(tag);
            return Err(e);
        }

        debug!(addr = %self.addr, tag, verb = ?req.known_verb(), "request sent");
        Ok((tag, call))
    }

    async fn write_request(&self, req: &Request) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(err) = self.failure() {
            return Err(err);
        }

        // A write abandoned halfway leaves a torn frame on the wire.
        let mut guard = TornWriteGuard { conn: self, armed: true };
        let res = writer.write_message(req).await;
        guard.armed = false;

        if let Err(e) = res {
            self.fail(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Record `err` as the sticky error (the first one wins) and stop reading.
    fn fail(&self, err: Error) {
        let _ = self.failure.set(err);
        self.shutdown.send_replace(true);
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: FrameReader<R>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();

        let err = loop {
            let resp = tokio::select! {
                res = reader.read_message::<Response>() => match res {
                    Ok(resp) => resp,
                    Err(e) => break e,
                },
                _ = shutdown.wait_for(|stop| *stop) => {
                    break self.failure().unwrap_or(Error::Closed);
                }
            };
            self.route(resp);
        };

        self.teardown(err).await;
    }

    fn route(&self, resp: Response) {
        if resp.is_redirect() {
            let target = resp.err_detail.clone().unwrap_or_default();
            info!(addr = %self.addr, redirect = %target, "remote redirected us");
            *self.redirect.lock().expect("redirect lock") = Some(target);
        }

        match self.table.dispatch(resp) {
            Dispatch::Delivered => {}
            Dispatch::Dropped => {
                debug!(addr = %self.addr, "dropped response for tag being cancelled");
            }
            Dispatch::Unexpected(r) => {
                warn!(
                    addr = %self.addr,
                    tag = r.tag.unwrap_or_default(),
                    flags = r.flag_bits(),
                    rev = r.rev.unwrap_or_default(),
                    path = r.path.as_deref().unwrap_or_default(),
                    len = r.len.unwrap_or_default(),
                    err_code = r.err_code.unwrap_or_default(),
                    err_detail = r.err_detail.as_deref().unwrap_or_default(),
                    "unexpected response"
                );
            }
        }
    }

    async fn teardown(&self, err: Error) {
        let _ = self.failure.set(err);
        let err = self.failure().unwrap_or(Error::Closed);

        let open = self.table.close_all(&err);
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }

        info!(addr = %self.addr, error = %err, open_calls = open, "connection closed");
        self.closed.send_replace(true);
    }
}

struct TornWriteGuard<'a> {
    conn: &'a Connection,
    armed: bool,
}

impl Drop for TornWriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.fail(Error::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "frame write abandoned midway",
            ))));
        }
    }
}
