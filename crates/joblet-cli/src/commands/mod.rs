//! Command implementations.

pub mod jobs;
pub mod volumes;
pub mod workflows;

use anyhow::{Result, bail};
use serde_json::Value;

/// Thin wrapper over the daemon's JSON API.
pub struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base: String) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base)
    }

    pub async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self.http.get(self.url(path)).send().await?;
        Self::decode(response).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    pub async fn delete_json(&self, path: &str) -> Result<Value> {
        let response = self.http.delete(self.url(path)).send().await?;
        Self::decode(response).await
    }

    pub async fn get_raw(&self, path: &str) -> Result<reqwest::Response> {
        let response = self.http.get(self.url(path)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("{status}: {body}");
        }
        Ok(response)
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            bail!("{status}: {message}");
        }
        Ok(body)
    }
}

/// Pull a display string out of a JSON field.
pub fn field<'a>(value: &'a Value, name: &str) -> &'a str {
    value.get(name).and_then(Value::as_str).unwrap_or("-")
}
