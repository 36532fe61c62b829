// ABOUTME: HTTP transport underneath the versioned API client
// ABOUTME: Applies the TLS policy once and reports failures as transient or not

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::{Certificate, Client, Method};
use std::time::Duration;

use crate::config::TlsPolicy;

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Failure below the HTTP layer. Every variant is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout(String),
    Connect(String),
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransportError::Timeout(msg) => write!(f, "timed out: {}", msg),
            TransportError::Connect(msg) => write!(f, "connection failed: {}", msg),
            TransportError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

pub trait Transport: Send + Sync {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<RawResponse, TransportError>>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(tls: &TlsPolicy, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);

        match tls {
            TlsPolicy::Verify {
                ca_bundle: Some(path),
            } => {
                let pem = std::fs::read(path).with_context(|| {
                    format!("Failed to read CA bundle {}", path.display())
                })?;
                let cert = Certificate::from_pem(&pem)
                    .with_context(|| format!("Invalid PEM in CA bundle {}", path.display()))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsPolicy::Verify { ca_bundle: None } | TlsPolicy::SystemDefault => {}
            TlsPolicy::Disabled => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let client = builder.build().context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<RawResponse, TransportError>> {
        Box::pin(async move {
            let mut builder = self.client.request(request.method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(classify)?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(classify)?;
            Ok(RawResponse { status, body })
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
