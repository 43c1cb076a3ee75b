use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::collections::HashMap;

use super::Operation;

/// POSTs the payload as JSON to a fixed endpoint and returns the response
/// body. Non-JSON bodies come back as a JSON string.
pub struct HttpOperation {
    client: reqwest::Client,
    endpoint: Url,
    headers: HashMap<String, String>,
    bearer: Option<String>,
}

impl HttpOperation {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("invalid endpoint: {endpoint}"))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            bail!("unsupported endpoint scheme: {}", endpoint.scheme());
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            headers: HashMap::new(),
            bearer: None,
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Send `authorization: Bearer <token>` with every request.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Operation for HttpOperation {
    fn name(&self) -> &str {
        "http"
    }

    async fn call(&self, payload: &Value) -> Result<Value> {
        let mut req = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", "application/json");

        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.bearer {
            req = req.header("authorization", format!("Bearer {token}"));
        }

        let resp = req.json(payload).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("endpoint error ({}): {}", status, text);
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
