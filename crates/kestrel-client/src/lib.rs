//! Kestrel client: the session layer for a replicated coordination cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── Client (cheap handle) ────────────────────────┐
//! │                                                                       │
//! │   commands ──► session actor ── owns ──► address pool                 │
//! │                     │                         ▲                       │
//! │                     │ dial / redial           │ AddAddr / RemoveAddr  │
//! │                     ▼                         │                       │
//! │               Connection ──────────► membership tracker               │
//! │               │   ▲                                                   │
//! │        frames │   │ read loop ─► call table ─► unary / Watch sinks    │
//! │               ▼   │                                                   │
//! │              node (tcp)                                               │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One connection carries any number of concurrent calls, correlated by
//! tag. Unary calls get exactly one response; streaming calls (watch, walk,
//! getdir) deliver events until done or cancelled. When the connection dies
//! the session dials another known node, preferring the one it was
//! redirected to, and idempotent reads are retried transparently.

pub mod conn;
pub mod dial;
pub mod error;
pub mod frame;
pub mod session;
mod table;
mod tracker;
pub mod watch;

pub use conn::Connection;
pub use dial::{Dialer, TcpDialer};
pub use error::{Error, Result};
pub use session::Client;
pub use watch::{Canceller, Event, Watch};
