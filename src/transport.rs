//! Abstract HTTP transport boundary (spec component C11, §6.1).
//!
//! The core never calls `reqwest` directly: every network-facing component —
//! the capture queue's batch shipper, the ruleset loader's conditional GETs,
//! and the remote flag fetcher's POST — goes through [`Transport::request`].
//! [`ReqwestTransport`] is the default implementation, but callers may
//! substitute their own.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ClientOptions;
use crate::error::Error;

/// HTTP verb for [`Transport::request`]. Only the two methods this crate's
/// components actually issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A raw HTTP response. Callers are responsible for interpreting status and
/// decoding the body; the transport boundary doesn't know about ETags,
/// quota-limit bodies, or batch-capture error shapes.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup, since servers and proxies disagree on
    /// casing (`ETag` vs `Etag` vs `etag`).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues one request and returns the raw response, or an error if the
    /// request could not be sent/completed at all (a non-2xx status is still
    /// `Ok` — that's for the caller to interpret).
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<TransportResponse, Error>;
}

pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(options: &ClientOptions) -> Self {
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout())
            .build()
            .expect("reqwest client configuration is valid");
        Self { http }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<TransportResponse, Error> {
        let mut builder = match method {
            Method::Get => self.http.get(url),
            Method::Post => self.http.post(url),
        };
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(TransportResponse { status, headers, body })
    }
}
