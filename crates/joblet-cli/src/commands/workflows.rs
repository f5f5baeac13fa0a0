//! Workflow commands.

use anyhow::{Context, Result};
use serde_json::{Value, json};

use super::{Client, field};

pub async fn run(client: &Client, path: &str) -> Result<()> {
    let yaml =
        std::fs::read_to_string(path).with_context(|| format!("reading workflow {path}"))?;
    let name = std::path::Path::new(path)
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let body = json!({
        "workflow_name": name,
        "yaml_content": yaml,
        "workflow_files": [],
    });
    let response = client.post_json("/workflows", &body).await?;
    println!(
        "{}  {}",
        field(&response, "workflow_id"),
        field(&response, "status")
    );
    Ok(())
}

pub async fn list(client: &Client, include_completed: bool) -> Result<()> {
    let path = format!("/workflows?include_completed={include_completed}");
    let workflows = client.get_json(&path).await?;
    let Some(workflows) = workflows.as_array() else {
        return Ok(());
    };
    println!("{:<38} {:<11} {:>5} {:>5} {:>5}  NAME", "ID", "STATUS", "TOTAL", "DONE", "FAIL");
    for workflow in workflows {
        println!(
            "{:<38} {:<11} {:>5} {:>5} {:>5}  {}",
            field(workflow, "workflow_id"),
            field(workflow, "status"),
            count(workflow, "total_jobs"),
            count(workflow, "completed_jobs"),
            count(workflow, "failed_jobs"),
            field(workflow, "name"),
        );
    }
    Ok(())
}

pub async fn status(client: &Client, id: &str) -> Result<()> {
    let workflow = client.get_json(&format!("/workflows/{id}")).await?;
    println!("{}", serde_json::to_string_pretty(&workflow)?);
    Ok(())
}

pub async fn jobs(client: &Client, id: &str) -> Result<()> {
    let jobs = client.get_json(&format!("/workflows/{id}/jobs")).await?;
    let Some(jobs) = jobs.as_array() else {
        return Ok(());
    };
    println!("{:<20} {:<13} {:<38} REQUIRES", "NAME", "STATUS", "JOB");
    for job in jobs {
        let requires = job
            .get("requires")
            .and_then(Value::as_array)
            .map(|reqs| {
                reqs.iter()
                    .map(|r| format!("{}:{}", field(r, "job"), field(r, "status")))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        println!(
            "{:<20} {:<13} {:<38} {}",
            field(job, "name"),
            field(job, "status"),
            field(job, "job_uuid"),
            requires,
        );
    }
    Ok(())
}

fn count(value: &Value, name: &str) -> u64 {
    value.get(name).and_then(Value::as_u64).unwrap_or(0)
}
