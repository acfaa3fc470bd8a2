//! In-memory cluster for integration tests.
//!
//! Every node shares one store, so failing over between nodes keeps the
//! data. Connections are `tokio::io::duplex` pipes handed out by
//! [`MockDialer`]; a node can be killed (dropping its live connections and
//! refusing new ones) or made to redirect writes elsewhere.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kestrel_client::frame::{FrameReader, FrameWriter};
use kestrel_client::{Client, Dialer};
use kestrel_core::{flag, ClientConfig, ErrCode, Request, Response, Verb};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};

pub const ADDR_A: &str = "10.0.0.1:8046";
pub const ADDR_B: &str = "10.0.0.2:8046";
pub const ADDR_C: &str = "10.0.0.3:8046";

/// Client config for `addrs`, with membership tracking on or off.
pub fn config(addrs: &[&str], membership: bool) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.cluster.name = "test".to_string();
    config.cluster.addrs = addrs.iter().map(|a| a.to_string()).collect();
    config.membership.enabled = membership;
    config
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

struct Node {
    up: bool,
    redirect: Option<String>,
    /// Read requests but never answer them.
    stalled: bool,
    down: watch::Sender<bool>,
    dials: usize,
}

struct Change {
    rev: i64,
    path: String,
    body: Vec<u8>,
    del: bool,
}

struct Watcher {
    conn: u64,
    tag: Option<i32>,
    glob: String,
    out: mpsc::UnboundedSender<Response>,
}

#[derive(Default)]
struct Store {
    rev: i64,
    files: BTreeMap<String, (Vec<u8>, i64)>,
    history: Vec<Change>,
    watchers: Vec<Watcher>,
}

impl Store {
    fn apply(&mut self, path: &str, body: Option<&[u8]>) -> i64 {
        self.rev += 1;
        let rev = self.rev;
        match body {
            Some(body) => {
                self.files.insert(path.to_string(), (body.to_vec(), rev));
            }
            None => {
                self.files.remove(path);
            }
        }

        let flags = if body.is_some() { flag::SET } else { flag::DEL };
        for w in self.watchers.iter().filter(|w| glob_match(&w.glob, path)) {
            let _ = w.out.send(event(w.tag, flags, path, body.unwrap_or_default(), rev));
        }
        self.history.push(Change {
            rev,
            path: path.to_string(),
            body: body.unwrap_or_default().to_vec(),
            del: body.is_none(),
        });
        rev
    }

    fn children(&self, dir: &str) -> BTreeSet<String> {
        let prefix = if dir.ends_with('/') { dir.to_string() } else { format!("{dir}/") };
        self.files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    nodes: Arc<Mutex<HashMap<String, Node>>>,
    store: Arc<Mutex<Store>>,
    next_conn: Arc<AtomicU64>,
}

impl FakeCluster {
    pub fn new(addrs: &[&str]) -> Self {
        let cluster = Self::default();
        {
            let mut nodes = cluster.nodes.lock().unwrap();
            for addr in addrs {
                nodes.insert(
                    addr.to_string(),
                    Node {
                        up: true,
                        redirect: None,
                        stalled: false,
                        down: watch::channel(false).0,
                        dials: 0,
                    },
                );
            }
        }
        cluster
    }

    pub fn dialer(&self) -> MockDialer {
        MockDialer {
            cluster: self.clone(),
        }
    }

    pub fn client(&self, addrs: &[&str], membership: bool) -> Client {
        Client::with_dialer(&config(addrs, membership), self.dialer())
    }

    /// Drop every live connection to `addr` and refuse new ones.
    pub fn kill(&self, addr: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.up = false;
            node.down.send_replace(true);
        }
    }

    pub fn revive(&self, addr: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.up = true;
            node.down.send_replace(false);
        }
    }

    /// Answer writes on `addr` with a redirect to `to`.
    pub fn redirect(&self, addr: &str, to: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.redirect = Some(to.to_string());
        }
    }

    pub fn stall(&self, addr: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.stalled = true;
        }
    }

    pub fn dials(&self, addr: &str) -> usize {
        self.nodes.lock().unwrap().get(addr).map_or(0, |n| n.dials)
    }

    /// Write directly to the store, bypassing any node.
    pub fn put(&self, path: &str, body: &[u8]) -> i64 {
        self.store.lock().unwrap().apply(path, Some(body))
    }

    pub fn remove(&self, path: &str) -> i64 {
        self.store.lock().unwrap().apply(path, None)
    }

    pub fn watchers(&self) -> usize {
        self.store.lock().unwrap().watchers.len()
    }

    /// Publish node `id` at `addr` and make it the leader for `slot`.
    pub fn publish_leader(&self, slot: &str, id: &str, addr: &str) {
        self.put(&format!("/ctl/node/{id}/addr"), addr.as_bytes());
        self.put(&format!("/ctl/cal/{slot}"), id.as_bytes());
    }

    fn connect(&self, addr: &str) -> io::Result<DuplexStream> {
        let down = {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(addr)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no route to {addr}")))?;
            node.dials += 1;
            if !node.up {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, format!("{addr} is down")));
            }
            node.down.subscribe()
        };

        let (client, server) = tokio::io::duplex(256 * 1024);
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(self.clone().serve(addr.to_string(), conn, server, down));
        Ok(client)
    }

    async fn serve(self, addr: String, conn: u64, stream: DuplexStream, mut down: watch::Receiver<bool>) {
        let (r, w) = tokio::io::split(stream);
        let mut reader = FrameReader::new(r);
        let (out, mut outbox) = mpsc::unbounded_channel::<Response>();

        let writer = tokio::spawn(async move {
            let mut writer = FrameWriter::new(w);
            while let Some(resp) = outbox.recv().await {
                if writer.write_message(&resp).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                req = reader.read_message::<Request>() => match req {
                    Ok(req) => self.handle(&addr, conn, req, &out),
                    Err(_) => break,
                },
                _ = down.wait_for(|d| *d) => break,
            }
        }

        self.store.lock().unwrap().watchers.retain(|w| w.conn != conn);
        writer.abort();
    }

    fn handle(&self, addr: &str, conn: u64, req: Request, out: &mpsc::UnboundedSender<Response>) {
        let (redirect, stalled) = match self.nodes.lock().unwrap().get(addr) {
            Some(node) => (node.redirect.clone(), node.stalled),
            None => (None, false),
        };
        if stalled {
            return;
        }
        let tag = req.tag;
        let path = req.path.clone().unwrap_or_default();
        let mut store = self.store.lock().unwrap();

        match req.known_verb() {
            Some(Verb::Set | Verb::Del) if redirect.is_some() => {
                send(out, tag, failure(ErrCode::Redirect, redirect.as_deref().unwrap_or_default()));
            }
            Some(Verb::Get) => match store.files.get(&path) {
                Some((body, rev)) => {
                    let mut resp = ok();
                    resp.value = Some(body.clone());
                    resp.rev = Some(*rev);
                    send(out, tag, resp);
                }
                None => send(out, tag, failure(ErrCode::Noent, &path)),
            },
            Some(Verb::Set) => {
                let current = store.files.get(&path).map_or(0, |(_, rev)| *rev);
                let given = req.rev.unwrap_or_default();
                if given != -1 && given != current {
                    send(out, tag, failure(ErrCode::RevMismatch, &path));
                    return;
                }
                let rev = store.apply(&path, Some(req.value.as_deref().unwrap_or_default()));
                let mut resp = ok();
                resp.rev = Some(rev);
                send(out, tag, resp);
            }
            Some(Verb::Del) => {
                let Some(current) = store.files.get(&path).map(|(_, rev)| *rev) else {
                    send(out, tag, failure(ErrCode::Noent, &path));
                    return;
                };
                let given = req.rev.unwrap_or_default();
                if given != -1 && given != current {
                    send(out, tag, failure(ErrCode::RevMismatch, &path));
                    return;
                }
                store.apply(&path, None);
                send(out, tag, ok());
            }
            Some(Verb::Stat) => {
                let mut resp = ok();
                if let Some((body, rev)) = store.files.get(&path) {
                    resp.len = Some(body.len() as i32);
                    resp.rev = Some(*rev);
                } else {
                    let children = store.children(&path);
                    if children.is_empty() {
                        send(out, tag, failure(ErrCode::Noent, &path));
                        return;
                    }
                    resp.len = Some(children.len() as i32);
                    resp.rev = Some(store.rev);
                }
                send(out, tag, resp);
            }
            Some(Verb::Rev) => {
                let mut resp = ok();
                resp.rev = Some(store.rev);
                send(out, tag, resp);
            }
            Some(Verb::Nop) => send(out, tag, ok()),
            Some(Verb::Walk) => {
                let offset = req.offset.unwrap_or_default().max(0) as usize;
                let limit = req.limit.filter(|l| *l > 0).map_or(usize::MAX, |l| l as usize);
                for (p, (body, rev)) in store
                    .files
                    .iter()
                    .filter(|(p, _)| glob_match(&path, p))
                    .skip(offset)
                    .take(limit)
                {
                    send(out, tag, event(None, flag::SET, p, body, *rev));
                }
                send(out, tag, done());
            }
            Some(Verb::Getdir) => {
                if store.files.contains_key(&path) {
                    send(out, tag, failure(ErrCode::Notdir, &path));
                    return;
                }
                let children = store.children(&path);
                if children.is_empty() {
                    send(out, tag, failure(ErrCode::Noent, &path));
                    return;
                }
                let offset = req.offset.unwrap_or_default().max(0) as usize;
                let limit = req.limit.filter(|l| *l > 0).map_or(usize::MAX, |l| l as usize);
                let rev = store.rev;
                for name in children.iter().skip(offset).take(limit) {
                    send(out, tag, event(None, 0, name, b"", rev));
                }
                send(out, tag, done());
            }
            Some(Verb::Watch) => {
                let from = req.rev.unwrap_or(store.rev + 1);
                for change in store
                    .history
                    .iter()
                    .filter(|c| c.rev >= from && glob_match(&path, &c.path))
                {
                    let flags = if change.del { flag::DEL } else { flag::SET };
                    send(out, tag, event(None, flags, &change.path, &change.body, change.rev));
                }
                store.watchers.push(Watcher {
                    conn,
                    tag,
                    glob: path,
                    out: out.clone(),
                });
            }
            Some(Verb::Cancel) => {
                store
                    .watchers
                    .retain(|w| !(w.conn == conn && w.tag == req.other_tag));
                send(out, tag, ok());
            }
            None => send(out, tag, failure(ErrCode::UnknownVerb, "")),
        }
    }
}

#[derive(Clone)]
pub struct MockDialer {
    cluster: FakeCluster,
}

impl Dialer for MockDialer {
    type Stream = DuplexStream;

    fn dial(&self, addr: &str) -> impl Future<Output = io::Result<DuplexStream>> + Send {
        let result = self.cluster.connect(addr);
        async move { result }
    }
}

fn send(out: &mpsc::UnboundedSender<Response>, tag: Option<i32>, mut resp: Response) {
    resp.tag = tag;
    let _ = out.send(resp);
}

fn ok() -> Response {
    Response {
        flags: Some(flag::VALID | flag::DONE),
        ..Default::default()
    }
}

fn done() -> Response {
    Response {
        flags: Some(flag::DONE),
        ..Default::default()
    }
}

fn failure(code: ErrCode, detail: &str) -> Response {
    Response {
        flags: Some(flag::VALID | flag::DONE),
        err_code: Some(code as i32),
        err_detail: (!detail.is_empty()).then(|| detail.to_string()),
        ..Default::default()
    }
}

fn event(tag: Option<i32>, flags: i32, path: &str, body: &[u8], rev: i64) -> Response {
    Response {
        tag,
        flags: Some(flag::VALID | flags),
        rev: Some(rev),
        path: Some(path.to_string()),
        value: Some(body.to_vec()),
        ..Default::default()
    }
}

/// `*` matches within one path segment, `**` across segments.
pub fn glob_match(glob: &str, path: &str) -> bool {
    fn matches(g: &[u8], p: &[u8]) -> bool {
        match g {
            [] => p.is_empty(),
            [b'*', b'*', rest @ ..] => (0..=p.len()).any(|i| matches(rest, &p[i..])),
            [b'*', rest @ ..] => {
                let segment = p.iter().position(|&c| c == b'/').unwrap_or(p.len());
                (0..=segment).any(|i| matches(rest, &p[i..]))
            }
            [c, rest @ ..] => p.first() == Some(c) && matches(rest, &p[1..]),
        }
    }
    matches(glob.as_bytes(), path.as_bytes())
}
