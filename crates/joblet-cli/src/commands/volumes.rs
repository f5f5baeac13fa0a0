//! Volume and runtime commands.

use anyhow::Result;
use serde_json::{Value, json};

use super::{Client, field};

pub async fn list(client: &Client) -> Result<()> {
    let volumes = client.get_json("/volumes").await?;
    let Some(volumes) = volumes.as_array() else {
        return Ok(());
    };
    println!("{:<24} {:<8} CREATED", "NAME", "SIZE");
    for volume in volumes {
        println!(
            "{:<24} {:<8} {}",
            field(volume, "name"),
            field(volume, "size"),
            field(volume, "created_at"),
        );
    }
    Ok(())
}

pub async fn create(client: &Client, name: &str, size: &str) -> Result<()> {
    let volume = client
        .post_json("/volumes", &json!({ "name": name, "size": size }))
        .await?;
    println!("created {}", field(&volume, "name"));
    Ok(())
}

pub async fn delete(client: &Client, name: &str) -> Result<()> {
    client.delete_json(&format!("/volumes/{name}")).await?;
    println!("deleted {name}");
    Ok(())
}

pub async fn runtime_list(client: &Client) -> Result<()> {
    let runtimes = client.get_json("/runtimes").await?;
    let Some(runtimes) = runtimes.as_array() else {
        return Ok(());
    };
    println!("{:<24} {:<12} {:<10} DESCRIPTION", "NAME", "LANGUAGE", "VERSION");
    for runtime in runtimes {
        println!(
            "{:<24} {:<12} {:<10} {}",
            field(runtime, "name"),
            field(runtime, "language"),
            field(runtime, "version"),
            field(runtime, "description"),
        );
    }
    Ok(())
}

pub async fn runtime_info(client: &Client, name: &str) -> Result<()> {
    let runtime = client.get_json(&format!("/runtimes/{name}")).await?;
    println!("{}", serde_json::to_string_pretty(&runtime)?);
    Ok(())
}

pub async fn runtime_test(client: &Client, name: &str) -> Result<()> {
    let result = client
        .post_json(&format!("/runtimes/{name}/test"), &json!({}))
        .await?;
    println!("{}: {}", name, field(&result, "status"));
    Ok(())
}

pub async fn runtime_remove(client: &Client, name: &str) -> Result<()> {
    let result = client.delete_json(&format!("/runtimes/{name}")).await?;
    println!(
        "removed {} tree(s)",
        result.get("removed").and_then(Value::as_u64).unwrap_or(0)
    );
    Ok(())
}
