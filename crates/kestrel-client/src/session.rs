//! Cluster session: one live connection chosen from a pool of node addresses.
//!
//! A single actor task owns the pool and the active connection. Everything
//! else talks to it through [`Command`]s, so pool mutation, reconnection and
//! redirect handling never race each other.

use std::collections::BTreeSet;
use std::sync::Arc;

use kestrel_core::config::{ClientConfig, MembershipConfig};
use kestrel_core::{Request, Response};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::conn::Connection;
use crate::dial::{Dialer, TcpDialer};
use crate::error::{Error, Result};
use crate::tracker;
use crate::watch::Watch;

pub(crate) enum Command {
    Current(oneshot::Sender<Option<Arc<Connection>>>),
    AddAddr(String),
    RemoveAddr(String),
    Len(oneshot::Sender<usize>),
    Addrs(oneshot::Sender<Vec<String>>),
}

/// Handle to a cluster session.
///
/// Cheap to clone; all clones share one session. When the last handle is
/// dropped the session stops and its connection is closed.
#[derive(Debug, Clone)]
pub struct Client {
    name: Arc<str>,
    commands: UnboundedSender<Command>,
}

impl Client {
    /// Start a session over TCP using `config`.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let dialer = TcpDialer::from_config(&config.connection)?;
        Ok(Self::with_dialer(config, dialer))
    }

    /// Start a session that reaches nodes through `dialer`.
    ///
    /// Must be called from within a tokio runtime. The first connection is
    /// made in the background; calls issued before it is up wait for it.
    pub fn with_dialer<D: Dialer>(config: &ClientConfig, dialer: D) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let membership = config.membership.enabled.then(|| config.membership.clone());

        let session = Session {
            name: config.cluster.name.clone(),
            pool: config
                .cluster
                .addrs
                .iter()
                .filter(|a| !a.is_empty())
                .cloned()
                .collect(),
            preferred: None,
            conn: None,
            dialer,
            max_frame_len: config.connection.max_frame_len,
            membership,
            commands: tx.downgrade(),
        };
        tokio::spawn(session.run(rx));

        Self {
            name: config.cluster.name.as_str().into(),
            commands: tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The active connection, reconnecting first if it has failed.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Current(tx))
            .map_err(|_| Error::NoAddrs)?;
        rx.await.ok().flatten().ok_or(Error::NoAddrs)
    }

    /// Send `req` once on the active connection.
    pub async fn call(&self, req: Request) -> Result<Response> {
        self.connection().await?.call(req).await
    }

    /// Send `req`, re-issuing it on a fresh connection whenever the one it
    /// went out on fails. Only for requests that are safe to repeat.
    pub async fn retry(&self, req: Request) -> Result<Response> {
        loop {
            let conn = self.connection().await?;
            match conn.call(req.clone()).await {
                Err(e) if conn.is_failed() => {
                    debug!(cluster = %self.name, addr = %conn.addr(), error = %e, "connection lost, retrying");
                }
                res => return res,
            }
        }
    }

    /// Write `body` at `path` if its current revision is `old_rev`.
    /// Returns the new revision.
    pub async fn set(&self, path: &str, old_rev: i64, body: &[u8]) -> Result<i64> {
        let resp = self.call(Request::set(path, old_rev, body)).await?;
        Ok(resp.rev.unwrap_or_default())
    }

    /// Body and revision of `path`, at `rev` or the latest revision.
    pub async fn get(&self, path: &str, rev: Option<i64>) -> Result<(Vec<u8>, i64)> {
        let resp = self.retry(Request::get(path, rev)).await?;
        Ok((resp.value.unwrap_or_default(), resp.rev.unwrap_or_default()))
    }

    /// Delete `path` if its current revision is `rev`.
    pub async fn del(&self, path: &str, rev: i64) -> Result<()> {
        self.call(Request::del(path, rev)).await?;
        Ok(())
    }

    /// Length and revision of `path`. For a directory the length is its
    /// number of entries.
    pub async fn stat(&self, path: &str, rev: Option<i64>) -> Result<(i32, i64)> {
        let resp = self.retry(Request::stat(path, rev)).await?;
        Ok((resp.len.unwrap_or_default(), resp.rev.unwrap_or_default()))
    }

    /// Current revision of the store.
    pub async fn rev(&self) -> Result<i64> {
        let resp = self.retry(Request::current_rev()).await?;
        Ok(resp.rev.unwrap_or_default())
    }

    pub async fn nop(&self) -> Result<()> {
        self.call(Request::nop()).await?;
        Ok(())
    }

    /// Stream every change under `glob` starting at `from_rev`.
    pub async fn watch(&self, glob: &str, from_rev: i64) -> Result<Watch> {
        self.connection()
            .await?
            .events(Request::watch(glob, Some(from_rev)))
            .await
    }

    /// Stream the entries matching `glob` as of `rev`.
    pub async fn walk(
        &self,
        glob: &str,
        rev: Option<i64>,
        offset: Option<i32>,
        limit: Option<i32>,
    ) -> Result<Watch> {
        self.connection()
            .await?
            .events(Request::walk(glob, rev, offset, limit))
            .await
    }

    /// Stream the names in directory `path`.
    pub async fn getdir(&self, path: &str, offset: i32, limit: i32, rev: Option<i64>) -> Result<Watch> {
        self.connection()
            .await?
            .events(Request::getdir(path, offset, limit, rev))
            .await
    }

    pub fn add_addr(&self, addr: impl Into<String>) {
        let _ = self.commands.send(Command::AddAddr(addr.into()));
    }

    pub fn remove_addr(&self, addr: impl Into<String>) {
        let _ = self.commands.send(Command::RemoveAddr(addr.into()));
    }

    /// Number of addresses in the pool.
    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Len(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the address pool, sorted.
    pub async fn addrs(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Addrs(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Feeds pool changes back to a session without keeping it alive.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    commands: WeakUnboundedSender<Command>,
}

impl PoolHandle {
    pub(crate) fn new(commands: WeakUnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Returns `false` once the session is gone.
    pub(crate) fn add(&self, addr: String) -> bool {
        self.send(Command::AddAddr(addr))
    }

    pub(crate) fn remove(&self, addr: String) -> bool {
        self.send(Command::RemoveAddr(addr))
    }

    fn send(&self, cmd: Command) -> bool {
        match self.commands.upgrade() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

struct Session<D> {
    name: String,
    pool: BTreeSet<String>,
    /// Tried first on the next connect.
    preferred: Option<String>,
    /// `None` once the pool has been exhausted.
    conn: Option<Arc<Connection>>,
    dialer: D,
    max_frame_len: u32,
    membership: Option<MembershipConfig>,
    commands: WeakUnboundedSender<Command>,
}

impl<D: Dialer> Session<D> {
    async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        self.connect().await;

        loop {
            let current = self.conn.clone();
            let closed = async move {
                match current {
                    Some(conn) => conn.closed().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = closed => self.reconnect().await,
            }
        }

        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        debug!(cluster = %self.name, "session stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Current(reply) => {
                if self.conn.as_ref().is_some_and(|c| c.is_failed()) {
                    self.reconnect().await;
                }
                let _ = reply.send(self.conn.clone());
            }
            Command::AddAddr(addr) => {
                if !addr.is_empty() && self.pool.insert(addr.clone()) {
                    debug!(cluster = %self.name, %addr, "address added");
                }
            }
            Command::RemoveAddr(addr) => {
                if self.pool.remove(&addr) {
                    debug!(cluster = %self.name, %addr, "address removed");
                }
            }
            Command::Len(reply) => {
                let _ = reply.send(self.pool.len());
            }
            Command::Addrs(reply) => {
                let _ = reply.send(self.pool.iter().cloned().collect());
            }
        }
    }

    /// Replace a connection that has gone away.
    async fn reconnect(&mut self) {
        let Some(old) = self.conn.take() else {
            return;
        };

        self.pool.remove(old.addr());
        if let Some(target) = old.redirect_addr().filter(|a| !a.is_empty()) {
            info!(cluster = %self.name, from = %old.addr(), to = %target, "following redirect");
            self.pool.insert(target.clone());
            self.preferred = Some(target);
        }

        self.connect().await;
    }

    /// Dial until something answers, dropping every address that does not.
    async fn connect(&mut self) {
        loop {
            let addr = match self.preferred.take().filter(|a| self.pool.contains(a)) {
                Some(addr) => addr,
                None => match self.pool.iter().next() {
                    Some(addr) => addr.clone(),
                    None => break,
                },
            };

            match self.dialer.dial(&addr).await {
                Ok(stream) => {
                    let conn = Connection::spawn_with_max_frame(addr.clone(), stream, self.max_frame_len);
                    info!(cluster = %self.name, %addr, "connected");
                    self.start_tracker(&conn);
                    self.conn = Some(conn);
                    return;
                }
                Err(e) => {
                    warn!(cluster = %self.name, %addr, error = %e, "dial failed, dropping address");
                    self.pool.remove(&addr);
                }
            }
        }

        info!(cluster = %self.name, "no known address, session is disconnected");
    }

    fn start_tracker(&self, conn: &Arc<Connection>) {
        if let Some(membership) = &self.membership {
            tokio::spawn(tracker::track_membership(
                Arc::clone(conn),
                PoolHandle::new(self.commands.clone()),
                membership.clone(),
            ));
        }
    }
}
