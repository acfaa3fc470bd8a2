//! Streaming commands: `watch`, `walk`, `getdir`, `members`.

use anyhow::Result;
use kestrel_client::{Client, Event, Watch};
use kestrel_core::ClientConfig;
use serde_json::json;
use tracing::info;

use crate::Format;

pub async fn watch(client: &Client, glob: &str, from: Option<i64>, format: Format) -> Result<()> {
    let from = match from {
        Some(rev) => rev,
        None => client.rev().await? + 1,
    };
    let events = client.watch(glob, from).await?;
    info!(%glob, from, "watching");
    follow(events, tokio::signal::ctrl_c(), format).await
}

/// Print changes until the stream ends or `stop` resolves, then cancel it.
async fn follow<F: Future>(mut events: Watch, stop: F, format: Format) -> Result<()> {
    tokio::pin!(stop);
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(ev) => print_change(&ev, format)?,
                None => return Ok(()),
            },
            _ = &mut stop => {
                events.cancel().await?;
                return Ok(());
            }
        }
    }
}

pub async fn walk(
    client: &Client,
    glob: &str,
    rev: Option<i64>,
    offset: Option<i32>,
    limit: Option<i32>,
    format: Format,
) -> Result<()> {
    let events = client.walk(glob, rev, offset, limit).await?;
    drain(events, |ev| print_entry(ev, format)).await
}

pub async fn getdir(
    client: &Client,
    path: &str,
    offset: i32,
    limit: i32,
    rev: Option<i64>,
    format: Format,
) -> Result<()> {
    let events = client.getdir(path, offset, limit, rev).await?;
    drain(events, |ev| {
        match format {
            Format::Text => println!("{}", ev.path),
            Format::Json => println!("{}", json!({ "name": ev.path, "rev": ev.rev })),
        }
        Ok(())
    })
    .await
}

/// Print every node that publishes an address, then the client's pool.
pub async fn members(client: &Client, config: &ClientConfig, format: Format) -> Result<()> {
    let glob = &config.membership.node_addr_glob;
    let events = client.walk(glob, None, None, None).await?;
    drain(events, |ev| {
        let addr = String::from_utf8_lossy(&ev.body);
        let id = node_id(glob, &ev.path);
        match format {
            Format::Text => println!("{id} {addr}"),
            Format::Json => println!("{}", json!({ "node": id, "addr": addr, "rev": ev.rev })),
        }
        Ok(())
    })
    .await?;

    info!(cluster = client.name(), pool = ?client.addrs().await, "client address pool");
    Ok(())
}

async fn drain(mut events: Watch, mut each: impl FnMut(&Event) -> Result<()>) -> Result<()> {
    while let Some(ev) = events.recv().await {
        if let Some(err) = ev.err {
            return Err(err.into());
        }
        each(&ev)?;
    }
    Ok(())
}

fn print_change(ev: &Event, format: Format) -> Result<()> {
    if let Some(err) = &ev.err {
        return Err(err.clone().into());
    }
    let kind = if ev.is_del() { "del" } else { "set" };
    match format {
        Format::Text => println!("{kind} {} {} {}", ev.rev, ev.path, String::from_utf8_lossy(&ev.body)),
        Format::Json => println!(
            "{}",
            json!({
                "kind": kind,
                "rev": ev.rev,
                "path": ev.path,
                "body": String::from_utf8_lossy(&ev.body),
            })
        ),
    }
    Ok(())
}

fn print_entry(ev: &Event, format: Format) -> Result<()> {
    match format {
        Format::Text => println!("{} = {}", ev.path, String::from_utf8_lossy(&ev.body)),
        Format::Json => println!(
            "{}",
            json!({ "path": ev.path, "rev": ev.rev, "body": String::from_utf8_lossy(&ev.body) })
        ),
    }
    Ok(())
}

/// The part of `path` matched by the `*` in `glob`.
fn node_id<'a>(glob: &str, path: &'a str) -> &'a str {
    let Some((prefix, suffix)) = glob.split_once('*') else {
        return path;
    };
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(suffix))
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kestrel_client::frame::{FrameReader, FrameWriter};
    use kestrel_client::Connection;
    use kestrel_core::{flag, Request, Response, Verb};
    use tokio::sync::{mpsc, oneshot};

    #[tokio::test]
    async fn follow_cancels_once_stopped() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let conn = Connection::spawn("10.0.0.1:8046", client);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let node = tokio::spawn(async move {
            let (r, w) = tokio::io::split(server);
            let mut reader = FrameReader::new(r);
            let mut writer = FrameWriter::new(w);
            let watch = reader.read_message::<Request>().await.unwrap();
            for rev in 1..=3 {
                let ev = Response {
                    tag: watch.tag,
                    flags: Some(flag::VALID | flag::SET),
                    rev: Some(rev),
                    path: Some("/a".into()),
                    ..Default::default()
                };
                writer.write_message(&ev).await.unwrap();
            }
            seen_tx.send(()).unwrap();

            let cancel = reader.read_message::<Request>().await.unwrap();
            assert_eq!(cancel.known_verb(), Some(Verb::Cancel));
            assert_eq!(cancel.other_tag, watch.tag);
            let ack = Response {
                tag: cancel.tag,
                flags: Some(flag::VALID | flag::DONE),
                ..Default::default()
            };
            writer.write_message(&ack).await.unwrap();
        });

        let events = conn.events(Request::watch("/a", None)).await.unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(follow(events, stop_rx, Format::Text));

        seen_rx.recv().await.unwrap();
        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("follow did not stop")
            .unwrap()
            .unwrap();
        node.await.unwrap();
        assert_eq!(conn.pending(), 0);
    }

    #[test]
    fn node_id_is_the_wildcard_segment() {
        assert_eq!(node_id("/ctl/node/*/addr", "/ctl/node/abc/addr"), "abc");
        assert_eq!(node_id("/ctl/node/*/addr", "/other"), "/other");
        assert_eq!(node_id("/nodes", "/nodes"), "/nodes");
    }
}
