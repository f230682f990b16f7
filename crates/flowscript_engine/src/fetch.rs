//! HTTP Fetch
//!
//! The Rust half of the `fetch` capability. Scripts build a request in
//! JavaScript; the request is sent here with `reqwest` on the artifact's
//! runtime thread and the response comes back fully buffered.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::EngineConfig;

/// Errors that can occur while fetching
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Unsupported HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid header '{0}'")]
    InvalidHeader(String),

    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// A request as a script described it
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// A buffered response
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl FetchResponse {
    /// Shape handed to the script-side `Response` class
    pub fn to_json(&self) -> Value {
        let headers: Vec<Value> = self.headers.iter().map(|(k, v)| json!([k, v])).collect();
        json!({
            "url": self.url,
            "status": self.status,
            "statusText": self.status_text,
            "headers": headers,
            "body": self.body,
        })
    }
}

/// Lazily built HTTP client shared by one artifact's scripts
#[derive(Debug, Clone)]
pub struct FetchClient {
    timeout: Option<Duration>,
    system_proxy: bool,
    client: Arc<Mutex<Option<Client>>>,
}

impl Default for FetchClient {
    fn default() -> Self {
        Self {
            timeout: None,
            system_proxy: true,
            client: Arc::new(Mutex::new(None)),
        }
    }
}

impl FetchClient {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            timeout: config.fetch_timeout(),
            system_proxy: config.fetch_system_proxy,
            ..Self::default()
        }
    }

    fn client(&self) -> Result<Client, FetchError> {
        let mut slot = self.client.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let mut builder = Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if !self.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build().map_err(|e| FetchError::Client(e.to_string()))?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Send a request and buffer the whole response
    pub async fn send(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = reqwest::Url::parse(&request.url).map_err(|e| FetchError::InvalidUrl {
            url: request.url.clone(),
            message: e.to_string(),
        })?;
        let method = parse_method(&request.method)?;
        let client = self.client()?;

        let mut builder = client.request(method.clone(), url);
        for (name, value) in &request.headers {
            if name.trim().is_empty() {
                return Err(FetchError::InvalidHeader(name.clone()));
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
            .collect();
        let body = response.text().await?;

        debug!("{} {} -> {}", method, final_url, status.as_u16());
        Ok(FetchResponse {
            url: final_url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

fn parse_method(method: &str) -> Result<Method, FetchError> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "PATCH" => Ok(Method::PATCH),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        _ => Err(FetchError::InvalidMethod(method.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("post").unwrap(), Method::POST);
        assert!(matches!(parse_method("BREW"), Err(FetchError::InvalidMethod(_))));
    }

    #[test]
    fn test_response_shape() {
        let response = FetchResponse {
            url: "http://example.com/".into(),
            status: 404,
            status_text: "Not Found".into(),
            headers: vec![("content-type".into(), "text/plain".into())],
            body: "missing".into(),
        };
        assert_eq!(
            response.to_json(),
            json!({
                "url": "http://example.com/",
                "status": 404,
                "statusText": "Not Found",
                "headers": [["content-type", "text/plain"]],
                "body": "missing",
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_sending() {
        let err = FetchClient::default().send(FetchRequest::get("not a url")).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }
}
