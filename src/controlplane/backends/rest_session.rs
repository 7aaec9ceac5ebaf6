//! REST wire session
//!
//! [`RestSession`] is the seam between the REST adapter and HTTP: the adapter
//! builds [`RestRequest`]s and interprets replies, the session owns transport,
//! authentication, TLS and asynchronous job completion.

use crate::config::ArrayCredentials;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Interval between job status polls
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Request / Reply
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RestBody {
    Empty,
    Json(Value),
    /// Raw bytes sent as `application/octet-stream`
    Octets(Bytes),
    /// Single-part `multipart/form-data` upload
    FormData { field: String, data: Bytes },
}

/// Response encoding the caller expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accept {
    #[default]
    Json,
    /// File content returned as a multipart body
    Multipart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: Method,
    /// Absolute path including the `/api` prefix
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RestBody,
    pub accept: Accept,
}

impl RestRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RestBody::Empty,
            accept: Accept::Json,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).json(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).json(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RestBody::Json(body);
        self
    }

    pub fn octets(mut self, data: Bytes) -> Self {
        self.body = RestBody::Octets(data);
        self
    }

    pub fn form(mut self, field: impl Into<String>, data: Bytes) -> Self {
        self.body = RestBody::FormData {
            field: field.into(),
            data,
        };
        self
    }

    pub fn accept_multipart(mut self) -> Self {
        self.accept = Accept::Multipart;
        self
    }

    /// Value of a query parameter, if present
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestReply {
    pub status: u16,
    /// Parsed JSON body, `Null` when empty or not JSON
    pub body: Value,
    /// Raw content for [`Accept::Multipart`] requests
    pub content: Bytes,
}

impl RestReply {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            content: Bytes::new(),
        }
    }

    /// `records` array of a collection reply
    pub fn records(&self) -> Vec<Value> {
        self.body
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    /// `_links.next.href` of a paged collection reply
    pub fn next_href(&self) -> Option<&str> {
        self.body
            .pointer("/_links/next/href")
            .and_then(Value::as_str)
    }
}

/// Failure of a single REST exchange
#[derive(Debug)]
pub enum RestFault {
    /// The array answered with an error document
    Api {
        status: u16,
        code: String,
        message: String,
    },
    /// The exchange itself failed
    Transport(Error),
}

impl From<reqwest::Error> for RestFault {
    fn from(e: reqwest::Error) -> Self {
        RestFault::Transport(Error::Transport(e))
    }
}

/// One authenticated REST session against the array
#[async_trait]
pub trait RestSession: Send + Sync {
    async fn send(&self, request: RestRequest) -> std::result::Result<RestReply, RestFault>;
}

// =============================================================================
// HTTP Session
// =============================================================================

/// REST session over HTTPS with basic authentication
pub struct HttpRestSession {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    timeout: Duration,
}

impl HttpRestSession {
    pub fn new(credentials: &ArrayCredentials) -> Result<Self> {
        let timeout = Duration::from_secs(credentials.timeout_secs());
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!credentials.verify_tls)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: credentials.base_url(),
            user: credentials.user.clone(),
            password: credentials.password.clone(),
            timeout,
        })
    }

    async fn exchange(&self, request: &RestRequest) -> std::result::Result<RestReply, RestFault> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!("REST {} {}", request.method, request.path);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .basic_auth(&self.user, Some(&self.password))
            .query(&request.query);
        builder = match &request.body {
            RestBody::Empty => builder,
            RestBody::Json(body) => builder.json(body),
            RestBody::Octets(data) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(data.clone()),
            RestBody::FormData { field, data } => {
                let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(field.clone());
                builder.multipart(reqwest::multipart::Form::new().part(field.clone(), part))
            }
        };
        if request.accept == Accept::Multipart {
            builder = builder.header(reqwest::header::ACCEPT, "multipart/form-data");
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let raw = response.bytes().await?;

        if !(200..300).contains(&status) {
            let body: Value = serde_json::from_slice(&raw).unwrap_or(Value::Null);
            return Err(api_fault(status, &body));
        }

        if request.accept == Accept::Multipart && content_type.starts_with("multipart/") {
            let content = parse_multipart(&content_type, &raw).map_err(RestFault::Transport)?;
            return Ok(RestReply {
                status,
                body: Value::Null,
                content,
            });
        }

        let body = if raw.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&raw).unwrap_or(Value::Null)
        };
        Ok(RestReply {
            status,
            body,
            content: raw,
        })
    }

    /// Poll a job until it leaves the running states
    async fn wait_for_job(&self, uuid: &str) -> std::result::Result<(), RestFault> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let request = RestRequest::get(format!("/api/cluster/jobs/{}", uuid))
                .query("fields", "state,message,code");
            let reply = self.exchange(&request).await?;
            let state = reply.body.get("state").and_then(Value::as_str).unwrap_or_default();
            match state {
                "success" => return Ok(()),
                "failure" => {
                    let code = match reply.body.get("code") {
                        Some(Value::Number(n)) => n.to_string(),
                        Some(Value::String(s)) => s.clone(),
                        _ => String::new(),
                    };
                    let message = reply
                        .body
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("job failed")
                        .to_string();
                    return Err(RestFault::Api {
                        status: 200,
                        code,
                        message,
                    });
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Job {} still {} after {:?}", uuid, state, self.timeout);
                return Err(RestFault::Transport(Error::Timeout {
                    operation: format!("job {}", uuid),
                    seconds: self.timeout.as_secs(),
                }));
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl RestSession for HttpRestSession {
    async fn send(&self, request: RestRequest) -> std::result::Result<RestReply, RestFault> {
        let reply = self.exchange(&request).await?;
        if reply.status == 202 {
            if let Some(uuid) = reply.body.pointer("/job/uuid").and_then(Value::as_str) {
                self.wait_for_job(uuid).await?;
            }
        }
        Ok(reply)
    }
}

/// Error document of a failed exchange
pub fn api_fault(status: u16, body: &Value) -> RestFault {
    let error = body.get("error");
    let code = match error.and_then(|e| e.get("code")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("request failed")
        .to_string();
    RestFault::Api {
        status,
        code,
        message,
    }
}

/// Split a paged `_links.next.href` into path and decoded query
pub fn split_href(href: &str) -> Result<(String, Vec<(String, String)>)> {
    let (path, query) = href.split_once('?').unwrap_or((href, ""));
    let mut pairs = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key)
            .map_err(|e| Error::Internal(format!("bad next link {}: {}", href, e)))?;
        let value = urlencoding::decode(value)
            .map_err(|e| Error::Internal(format!("bad next link {}: {}", href, e)))?;
        pairs.push((key.into_owned(), value.into_owned()));
    }
    Ok((path.to_string(), pairs))
}

/// Body of the first part of a multipart response
pub fn parse_multipart(content_type: &str, body: &[u8]) -> Result<Bytes> {
    let boundary = content_type
        .split(';')
        .filter_map(|p| p.trim().strip_prefix("boundary="))
        .next()
        .map(|b| b.trim_matches('"'))
        .ok_or_else(|| Error::Internal(format!("no multipart boundary in {}", content_type)))?;
    let delimiter = format!("--{}", boundary);

    let start = find(body, delimiter.as_bytes())
        .ok_or_else(|| Error::Internal("multipart delimiter not found".into()))?;
    let part = &body[start + delimiter.len()..];
    let headers_end = find(part, b"\r\n\r\n")
        .ok_or_else(|| Error::Internal("multipart part headers not terminated".into()))?;
    let content = &part[headers_end + 4..];
    let closing = format!("\r\n{}", delimiter);
    let end = find(content, closing.as_bytes()).unwrap_or(content.len());
    Ok(Bytes::copy_from_slice(&content[..end]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
