//! One-shot commands: `get`, `set`, `del`, `stat`, `rev`, `nop`.

use anyhow::Result;
use kestrel_client::Client;
use serde_json::json;

use crate::Format;

pub async fn get(client: &Client, path: &str, rev: Option<i64>, format: Format) -> Result<()> {
    let (body, rev) = client.get(path, rev).await?;
    match format {
        Format::Text => println!("{rev} {}", String::from_utf8_lossy(&body)),
        Format::Json => println!(
            "{}",
            json!({ "path": path, "rev": rev, "body": String::from_utf8_lossy(&body) })
        ),
    }
    Ok(())
}

pub async fn set(client: &Client, path: &str, rev: i64, value: &str, format: Format) -> Result<()> {
    let new_rev = client.set(path, rev, value.as_bytes()).await?;
    match format {
        Format::Text => println!("{new_rev}"),
        Format::Json => println!("{}", json!({ "path": path, "rev": new_rev })),
    }
    Ok(())
}

pub async fn del(client: &Client, path: &str, rev: i64) -> Result<()> {
    client.del(path, rev).await?;
    Ok(())
}

pub async fn stat(client: &Client, path: &str, rev: Option<i64>, format: Format) -> Result<()> {
    let (len, rev) = client.stat(path, rev).await?;
    match format {
        Format::Text => println!("{rev} {len}"),
        Format::Json => println!("{}", json!({ "path": path, "rev": rev, "len": len })),
    }
    Ok(())
}

pub async fn rev(client: &Client, format: Format) -> Result<()> {
    let rev = client.rev().await?;
    match format {
        Format::Text => println!("{rev}"),
        Format::Json => println!("{}", json!({ "rev": rev })),
    }
    Ok(())
}

pub async fn nop(client: &Client) -> Result<()> {
    client.nop().await?;
    Ok(())
}
