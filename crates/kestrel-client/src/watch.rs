//! Streaming calls: events and the handle that receives them.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use kestrel_core::{flag, Response};
use tokio::sync::mpsc;
use tracing::debug;

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::table::{CallId, Delivery};

/// One response on a streaming call.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub rev: i64,
    pub path: String,
    pub body: Vec<u8>,
    pub flags: i32,
    /// Set on the final event of a stream that ended abnormally.
    pub err: Option<Error>,
}

impl Event {
    fn from_response(resp: Response) -> Self {
        let err = Error::from_response(&resp);
        Self {
            rev: resp.rev.unwrap_or_default(),
            flags: resp.flag_bits(),
            path: resp.path.unwrap_or_default(),
            body: resp.value.unwrap_or_default(),
            err,
        }
    }

    fn failed(err: Error) -> Self {
        Self {
            err: Some(err),
            ..Default::default()
        }
    }

    pub fn is_set(&self) -> bool {
        self.flags & flag::SET != 0
    }

    pub fn is_del(&self) -> bool {
        self.flags & flag::DEL != 0
    }
}

/// Receiving end of a WATCH, WALK or GETDIR call.
///
/// Yields events in the order the remote end sent them and ends once the
/// stream is done, cancelled, or its connection is gone. Dropping a `Watch`
/// without cancelling leaves the remote stream running and its tag in use
/// until the connection closes.
#[derive(Debug)]
pub struct Watch {
    events: mpsc::UnboundedReceiver<Event>,
    canceller: Canceller,
}

/// Cancels one streaming call. Cloneable, so a stream can be stopped from a
/// task other than the one consuming it.
#[derive(Debug, Clone)]
pub struct Canceller {
    conn: Arc<Connection>,
    tag: i32,
    call: CallId,
}

impl Canceller {
    pub async fn cancel(&self) -> Result<()> {
        self.conn.cancel(self.tag, self.call).await
    }
}

impl Watch {
    pub(crate) fn spawn(
        conn: Arc<Connection>,
        tag: i32,
        call: CallId,
        raw: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(forward(raw, tx, tag));
        Self {
            events,
            canceller: Canceller { conn, tag, call },
        }
    }

    /// Tag the call occupies on its connection.
    pub fn tag(&self) -> i32 {
        self.canceller.tag
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Ask the remote end to stop the stream.
    ///
    /// On success the stream ends after any events already queued. Cancelling
    /// a stream that already finished fails with [`Error::BadTag`].
    pub async fn cancel(&self) -> Result<()> {
        self.canceller.cancel().await
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }
}

impl Stream for Watch {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.events.poll_recv(cx)
    }
}

async fn forward(
    mut raw: mpsc::UnboundedReceiver<Delivery>,
    events: mpsc::UnboundedSender<Event>,
    tag: i32,
) {
    while let Some(delivery) = raw.recv().await {
        let event = match delivery {
            Delivery::Frame(resp) => Event::from_response(resp),
            Delivery::Lost(err) => Event::failed(err),
        };

        let terminal = event.err.clone();
        if events.send(event).is_err() {
            debug!(tag, "watch receiver dropped");
            return;
        }
        if let Some(err) = terminal {
            debug!(tag, error = %err, "stream ended with error");
            return;
        }
    }
}
