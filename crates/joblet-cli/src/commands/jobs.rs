//! Job commands.

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt as _;
use serde_json::{Value, json};
use std::io::Write as _;

use super::{Client, field};

pub struct RunArgs {
    pub command: String,
    pub args: Vec<String>,
    pub max_cpu: i64,
    pub max_memory: i64,
    pub max_iobps: i64,
    pub network: String,
    pub volumes: Vec<String>,
    pub runtime: Option<String>,
    pub env: Vec<String>,
    pub uploads: Vec<String>,
    pub schedule: Option<String>,
}

pub async fn run(client: &Client, args: RunArgs) -> Result<()> {
    let mut environment = serde_json::Map::new();
    for entry in &args.env {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("--env entries must look like KEY=VALUE, got {entry:?}");
        };
        environment.insert(key.to_string(), Value::String(value.to_string()));
    }

    let mut uploads = Vec::new();
    for path in &args.uploads {
        let content =
            std::fs::read(path).with_context(|| format!("reading upload {path}"))?;
        let name = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone());
        uploads.push(json!({ "path": name, "content": BASE64.encode(content) }));
    }

    let body = json!({
        "command": args.command,
        "args": args.args,
        "max_cpu": args.max_cpu,
        "max_memory": args.max_memory,
        "max_iobps": args.max_iobps,
        "network": args.network,
        "volumes": args.volumes,
        "runtime": args.runtime,
        "environment": environment,
        "uploads": uploads,
        "schedule": args.schedule.unwrap_or_default(),
    });

    let response = client.post_json("/jobs", &body).await?;
    println!("{}  {}", field(&response, "uuid"), field(&response, "status"));
    Ok(())
}

pub async fn list(client: &Client) -> Result<()> {
    let jobs = client.get_json("/jobs").await?;
    let Some(jobs) = jobs.as_array() else {
        return Ok(());
    };
    println!("{:<38} {:<13} {:<6} COMMAND", "UUID", "STATUS", "EXIT");
    for job in jobs {
        let exit = job
            .get("exit_code")
            .and_then(Value::as_i64)
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<13} {:<6} {}",
            field(job, "uuid"),
            field(job, "status"),
            exit,
            field(job, "command"),
        );
    }
    Ok(())
}

pub async fn status(client: &Client, reference: &str) -> Result<()> {
    let job = client.get_json(&format!("/jobs/{reference}")).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn logs(client: &Client, reference: &str) -> Result<()> {
    let response = client.get_raw(&format!("/jobs/{reference}/logs")).await?;
    let mut stream = response.bytes_stream();
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        stdout.write_all(&chunk)?;
        stdout.flush()?;
    }
    Ok(())
}

pub async fn metrics(client: &Client, reference: &str) -> Result<()> {
    let response = client
        .get_raw(&format!("/jobs/{reference}/metrics"))
        .await?;
    print!("{}", response.text().await?);
    Ok(())
}

pub async fn stop(client: &Client, reference: &str) -> Result<()> {
    let job = client
        .post_json(&format!("/jobs/{reference}/stop"), &json!({}))
        .await?;
    println!("{}  {}", field(&job, "uuid"), field(&job, "status"));
    Ok(())
}

pub async fn delete(client: &Client, reference: &str) -> Result<()> {
    let response = client.delete_json(&format!("/jobs/{reference}")).await?;
    println!("deleted {}", field(&response, "deleted"));
    Ok(())
}

pub async fn clear(client: &Client) -> Result<()> {
    let response = client.delete_json("/jobs").await?;
    println!(
        "deleted {} skipped {}",
        response.get("deleted_count").and_then(Value::as_u64).unwrap_or(0),
        response.get("skipped_count").and_then(Value::as_u64).unwrap_or(0),
    );
    Ok(())
}
