//! Correlation table: in-flight tags and where their responses go.
//!
//! A tag is in one of three states: absent (free), open (a sink is waiting),
//! or reserved (a cancellation is in flight; frames for it are dropped and
//! the tag may not be reused). All transitions happen under one lock, which
//! is separate from the connection's write lock.

use std::collections::BTreeMap;
use std::sync::Mutex;

use kestrel_core::{flag, Response};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// Identifies one registration, so a stale handle cannot act on a later call
/// that happens to reuse the same tag.
pub(crate) type CallId = u64;

/// What a streaming sink receives.
#[derive(Debug)]
pub(crate) enum Delivery {
    Frame(Response),
    /// The connection went away while the stream was open.
    Lost(Error),
}

/// Delivery end for one call. Dropping it closes the call.
#[derive(Debug)]
pub(crate) enum Sink {
    /// Taken on first delivery, so a unary call sees at most one response.
    Unary(Option<oneshot::Sender<Response>>),
    Stream(mpsc::UnboundedSender<Delivery>),
}

impl Sink {
    pub(crate) fn unary(tx: oneshot::Sender<Response>) -> Self {
        Sink::Unary(Some(tx))
    }

    fn deliver(&mut self, resp: Response) -> bool {
        match self {
            Sink::Unary(slot) => match slot.take() {
                Some(tx) => tx.send(resp).is_ok(),
                None => false,
            },
            Sink::Stream(tx) => tx.send(Delivery::Frame(resp)).is_ok(),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Open { call: CallId, sink: Sink },
    Reserved,
}

/// Outcome of routing one inbound response.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Delivered,
    /// The tag is reserved by an in-flight cancellation.
    Dropped,
    /// Nothing is registered under the tag.
    Unexpected(Response),
}

#[derive(Debug, Default)]
struct Inner {
    slots: BTreeMap<i32, Slot>,
    next_call: CallId,
    /// Set by teardown; no registrations are accepted afterwards.
    closed: Option<Error>,
}

#[derive(Debug, Default)]
pub(crate) struct CallTable {
    inner: Mutex<Inner>,
}

impl CallTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `sink` under the lowest free tag.
    pub(crate) fn allocate(&self, sink: Sink) -> Result<(i32, CallId)> {
        let mut inner = self.inner.lock().expect("call table lock");
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }

        let mut tag: i32 = 0;
        for &used in inner.slots.keys() {
            if used != tag {
                break;
            }
            tag = tag.checked_add(1).ok_or(Error::TagsExhausted)?;
        }

        let call = inner.next_call;
        inner.next_call += 1;
        inner.slots.insert(tag, Slot::Open { call, sink });
        Ok((tag, call))
    }

    /// Forget `tag` entirely, making it available again.
    pub(crate) fn release(&self, tag: i32) {
        let mut inner = self.inner.lock().expect("call table lock");
        inner.slots.remove(&tag);
    }

    /// Swap the open entry for (`tag`, `call`) with a placeholder and hand
    /// back its sink.
    pub(crate) fn reserve(&self, tag: i32, call: CallId) -> Result<Sink> {
        let mut inner = self.inner.lock().expect("call table lock");
        match inner.slots.get(&tag) {
            Some(Slot::Open { call: open, .. }) if *open == call => {}
            _ => return Err(Error::BadTag),
        }
        match inner.slots.insert(tag, Slot::Reserved) {
            Some(Slot::Open { sink, .. }) => Ok(sink),
            _ => Err(Error::BadTag),
        }
    }

    /// Route an inbound response to its sink.
    ///
    /// A `DONE` response releases the tag before the value is handed over,
    /// and the sink is closed once delivery is complete.
    pub(crate) fn dispatch(&self, resp: Response) -> Dispatch {
        let tag = resp.tag.unwrap_or_default();
        let done = resp.has_flag(flag::DONE);
        let valid = resp.has_flag(flag::VALID);

        let mut inner = self.inner.lock().expect("call table lock");
        match inner.slots.get_mut(&tag) {
            None => return Dispatch::Unexpected(resp),
            Some(Slot::Reserved) => return Dispatch::Dropped,
            Some(Slot::Open { sink, .. }) if !done => {
                if valid {
                    sink.deliver(resp);
                }
                return Dispatch::Delivered;
            }
            Some(Slot::Open { .. }) => {}
        }

        if let Some(Slot::Open { mut sink, .. }) = inner.slots.remove(&tag) {
            if valid {
                sink.deliver(resp);
            }
        }
        Dispatch::Delivered
    }

    /// Close every open sink and refuse further registrations. Streaming
    /// sinks are told why before they close. Returns the number of calls
    /// that were still open.
    pub(crate) fn close_all(&self, err: &Error) -> usize {
        let slots = {
            let mut inner = self.inner.lock().expect("call table lock");
            inner.closed.get_or_insert_with(|| err.clone());
            std::mem::take(&mut inner.slots)
        };

        let mut open = 0;
        for slot in slots.into_values() {
            if let Slot::Open { sink, .. } = slot {
                open += 1;
                if let Sink::Stream(tx) = &sink {
                    let _ = tx.send(Delivery::Lost(err.clone()));
                }
            }
        }
        open
    }

    /// Number of tags currently open or reserved.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("call table lock").slots.len()
    }

    #[cfg(test)]
    fn is_reserved(&self, tag: i32) -> bool {
        matches!(
            self.inner.lock().expect("call table lock").slots.get(&tag),
            Some(Slot::Reserved)
        )
    }
}
