//! Membership tracking: keeps the session's address pool in step with the
//! cluster's published node addresses and current leaders.
//!
//! Runs once per connection, in two phases:
//!
//! 1. Watch and walk the node address entries until the walk completes, so
//!    every node id can be resolved to an address.
//! 2. Walk and watch the leader entries. A leader entry naming a node adds
//!    that node's address to the pool; an emptied entry removes it again.
//!    A leader naming a node whose address has not been seen yet waits for
//!    it on the address watch.
//!
//! The address watch keeps running through phase 2. The tracker ends when
//! its connection closes or the session is gone.

use std::collections::HashMap;
use std::sync::Arc;

use kestrel_core::config::MembershipConfig;
use kestrel_core::Request;
use tracing::{debug, info, warn};

use crate::conn::Connection;
use crate::error::Result;
use crate::session::PoolHandle;
use crate::watch::{Event, Watch};

pub(crate) async fn track_membership(conn: Arc<Connection>, pool: PoolHandle, config: MembershipConfig) {
    let mut tracker = Tracker::new(pool, config);
    match tracker.run(&conn).await {
        Ok(()) => debug!(addr = %conn.addr(), "membership tracker finished"),
        Err(e) => debug!(addr = %conn.addr(), error = %e, "membership tracker stopped"),
    }
}

struct Tracker {
    pool: PoolHandle,
    config: MembershipConfig,
    /// Node address entry path to address.
    nodes: HashMap<String, String>,
    /// Leader entry path to the address published for it.
    leaders: HashMap<String, String>,
    /// Leader entry path to the node address path it is still waiting on.
    pending: HashMap<String, String>,
}

impl Tracker {
    fn new(pool: PoolHandle, config: MembershipConfig) -> Self {
        Self {
            pool,
            config,
            nodes: HashMap::new(),
            leaders: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    async fn run(&mut self, conn: &Arc<Connection>) -> Result<()> {
        let mut addr_watch = Some(conn.events(Request::watch(&self.config.node_addr_glob, None)).await?);
        let mut addr_walk = conn
            .events(Request::walk(&self.config.node_addr_glob, None, None, None))
            .await?;

        loop {
            tokio::select! {
                ev = addr_walk.recv() => match ev {
                    Some(ev) => {
                        self.node_event(ev);
                    }
                    None => break,
                },
                ev = next(&mut addr_watch) => match ev {
                    Some(ev) => {
                        self.node_event(ev);
                    }
                    None => addr_watch = None,
                },
            }
        }
        debug!(addr = %conn.addr(), nodes = self.nodes.len(), "node addresses loaded");

        let mut leader_watch = Some(conn.events(Request::watch(&self.config.leader_glob, None)).await?);
        let mut leader_walk = Some(
            conn.events(Request::walk(&self.config.leader_glob, None, None, None))
                .await?,
        );

        while addr_watch.is_some() || leader_walk.is_some() || leader_watch.is_some() {
            let alive = tokio::select! {
                ev = next(&mut addr_watch) => match ev {
                    Some(ev) => self.node_event(ev),
                    None => {
                        addr_watch = None;
                        true
                    }
                },
                ev = next(&mut leader_walk) => match ev {
                    Some(ev) => self.leader_event(ev),
                    None => {
                        leader_walk = None;
                        true
                    }
                },
                ev = next(&mut leader_watch) => match ev {
                    Some(ev) => self.leader_event(ev),
                    None => {
                        leader_watch = None;
                        true
                    }
                },
            };
            if !alive {
                debug!(addr = %conn.addr(), "session gone");
                break;
            }
        }
        Ok(())
    }

    /// Returns `false` once the session can no longer be told anything.
    fn node_event(&mut self, ev: Event) -> bool {
        if let Some(err) = ev.err {
            debug!(error = %err, "node address stream ended");
            return true;
        }
        if ev.is_del() || ev.body.is_empty() {
            self.nodes.remove(&ev.path);
            return true;
        }

        let addr = String::from_utf8_lossy(&ev.body).into_owned();
        self.nodes.insert(ev.path.clone(), addr.clone());

        // Leaders that named this node before its address was seen.
        let waiting: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, node_path)| **node_path == ev.path)
            .map(|(leader, _)| leader.clone())
            .collect();
        let mut alive = true;
        for leader in waiting {
            self.pending.remove(&leader);
            info!(%leader, node = %ev.path, %addr, "leader address published late");
            self.leaders.insert(leader, addr.clone());
            alive &= self.pool.add(addr.clone());
        }
        alive
    }

    /// Returns `false` once the session can no longer be told anything.
    fn leader_event(&mut self, ev: Event) -> bool {
        if let Some(err) = ev.err {
            debug!(error = %err, "leader stream ended");
            return true;
        }

        self.pending.remove(&ev.path);
        if ev.is_del() || ev.body.is_empty() {
            return match self.leaders.remove(&ev.path) {
                Some(addr) => {
                    info!(leader = %ev.path, %addr, "leader gone, removing address");
                    self.pool.remove(addr)
                }
                None => true,
            };
        }

        let id = String::from_utf8_lossy(&ev.body);
        let node_path = self.config.node_addr_path(&id);
        match self.nodes.get(&node_path) {
            Some(addr) => {
                let addr = addr.clone();
                info!(leader = %ev.path, node = %id, %addr, "leader address published");
                self.leaders.insert(ev.path, addr.clone());
                self.pool.add(addr)
            }
            None => {
                warn!(leader = %ev.path, node = %id, "leader has no known address yet");
                self.pending.insert(ev.path, node_path);
                true
            }
        }
    }
}

/// Next event from an optional stream; pends forever once it is gone.
async fn next(watch: &mut Option<Watch>) -> Option<Event> {
    match watch {
        Some(w) => w.recv().await,
        None => std::future::pending().await,
    }
}
