// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The HTTP seam and size-bounded metadata fetching.
//!
//! The client only speaks `http` request/response types at this boundary;
//! the actual connection handling (TLS, client certificates, timeouts) is
//! supplied by the embedder. [`Fetcher`] layers the Uptane role endpoints and
//! the size caps on top.

use crate::error::{Error, Result};
use crate::metadata::{RepositoryType, Role};
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Transient failures at the HTTP boundary. Nothing is persisted when one of
/// these occurs; the next poll cycle simply retries.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not reach {0}: {1}")]
    Connection(String, String),

    #[error("invalid request for {0}: {1}")]
    Request(String, String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} returned HTTP status {1}")]
    BadStatus(String, StatusCode),

    #[error("response for {0} exceeded the {1} byte limit")]
    Oversized(String, u64),
}

/// One HTTP round trip. Implementations resolve any HTTP status to `Ok`;
/// `Err` is reserved for connection-level failures.
pub trait Transport {
    fn request(
        &mut self,
        req: Request<Vec<u8>>,
    ) -> BoxFuture<'_, std::result::Result<Response<Vec<u8>>, TransportError>>;
}

/// Cooperative cancellation for long pulls.
///
/// Cloned tokens share state; aborting one cancels every holder. Checked at
/// progress-callback granularity, so cancellation takes effect within a few
/// hundred milliseconds.
#[derive(Clone, Debug, Default)]
pub struct FlowControlToken(Arc<AtomicBool>);

impl FlowControlToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn can_continue(&self) -> bool {
        !self.0.load(Ordering::SeqCst)
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// GET `url`, refusing bodies larger than `max_size`.
pub async fn get_bytes(
    transport: &mut dyn Transport,
    url: &str,
    max_size: u64,
) -> Result<Vec<u8>> {
    let req = Request::get(url)
        .body(Vec::new())
        .map_err(|e| TransportError::Request(url.to_string(), e.to_string()))?;
    let resp = transport.request(req).await?;
    match resp.status() {
        StatusCode::OK => {
            let body = resp.into_body();
            if body.len() as u64 > max_size {
                return Err(TransportError::Oversized(url.to_string(), max_size).into());
            }
            Ok(body)
        }
        StatusCode::NOT_FOUND => Err(TransportError::NotFound(url.to_string()).into()),
        status => Err(TransportError::BadStatus(url.to_string(), status).into()),
    }
}

async fn send_json(
    transport: &mut dyn Transport,
    method: http::Method,
    url: &str,
    body: &Value,
) -> Result<()> {
    let req = Request::builder()
        .method(method)
        .uri(url)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(body).map_err(|e| Error::MalformedMetadata(e.to_string()))?)
        .map_err(|e| TransportError::Request(url.to_string(), e.to_string()))?;
    let resp = transport.request(req).await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(TransportError::BadStatus(url.to_string(), resp.status()).into())
    }
}

/// PUT a JSON document and require a 2xx response.
pub async fn put_json(transport: &mut dyn Transport, url: &str, body: &Value) -> Result<()> {
    send_json(transport, http::Method::PUT, url, body).await
}

/// POST a JSON document and require a 2xx response.
pub async fn post_json(transport: &mut dyn Transport, url: &str, body: &Value) -> Result<()> {
    send_json(transport, http::Method::POST, url, body).await
}

/// Builds role URLs for the two repositories and fetches them size-bounded.
#[derive(Clone, Debug)]
pub struct Fetcher {
    director_server: String,
    repo_server: String,
}

impl Fetcher {
    pub fn new(director_server: impl Into<String>, repo_server: impl Into<String>) -> Self {
        let mut director_server = director_server.into();
        let mut repo_server = repo_server.into();
        while director_server.ends_with('/') {
            director_server.pop();
        }
        while repo_server.ends_with('/') {
            repo_server.pop();
        }
        Fetcher { director_server, repo_server }
    }

    fn server(&self, repo: RepositoryType) -> &str {
        match repo {
            RepositoryType::Director => &self.director_server,
            RepositoryType::Images => &self.repo_server,
        }
    }

    pub fn role_url(&self, repo: RepositoryType, role: Role, version: Option<u64>) -> String {
        match version {
            Some(version) => {
                format!("{}/{}.{}", self.server(repo), version, role.metadata_path())
            }
            None => format!("{}/{}", self.server(repo), role.metadata_path()),
        }
    }

    /// Fetch a specific version of a role, or the latest when `version` is
    /// `None`.
    pub async fn fetch_role(
        &self,
        transport: &mut dyn Transport,
        repo: RepositoryType,
        role: Role,
        version: Option<u64>,
        max_size: u64,
    ) -> Result<Vec<u8>> {
        get_bytes(transport, &self.role_url(repo, role, version), max_size).await
    }

    /// Fetch a target payload, following the custom uri when one is set.
    pub async fn fetch_target_payload(
        &self,
        transport: &mut dyn Transport,
        filename: &str,
        uri: Option<&str>,
        max_size: u64,
    ) -> Result<Vec<u8>> {
        let url = match uri {
            Some(uri) => uri.to_string(),
            None => format!("{}/targets/{}", self.repo_server, filename),
        };
        get_bytes(transport, &url, max_size).await
    }
}

pub mod mock {
    use super::*;
    use futures::FutureExt;
    use std::collections::HashMap;

    #[derive(Clone, Debug)]
    pub struct RecordedRequest {
        pub method: http::Method,
        pub uri: String,
        pub body: Vec<u8>,
    }

    /// Serves canned bodies by URL and records every request.
    ///
    /// GETs for unknown URLs answer 404; PUT/POST answer 200 unless an error
    /// status was configured for the URL.
    #[derive(Default)]
    pub struct MockTransport {
        routes: HashMap<String, Vec<u8>>,
        statuses: HashMap<String, u16>,
        pub offline: bool,
        pub requests: Vec<RecordedRequest>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Default::default()
        }

        pub fn serve(&mut self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
            self.routes.insert(url.into(), body.into());
        }

        pub fn serve_status(&mut self, url: impl Into<String>, status: u16) {
            self.statuses.insert(url.into(), status);
        }

        pub fn unserve(&mut self, url: &str) {
            self.routes.remove(url);
        }

        /// Requests made with `method` whose URL ends with `suffix`.
        pub fn requests_to(&self, method: http::Method, suffix: &str) -> Vec<&RecordedRequest> {
            self.requests
                .iter()
                .filter(|r| r.method == method && r.uri.ends_with(suffix))
                .collect()
        }
    }

    impl Transport for MockTransport {
        fn request(
            &mut self,
            req: Request<Vec<u8>>,
        ) -> BoxFuture<'_, std::result::Result<Response<Vec<u8>>, TransportError>> {
            let uri = req.uri().to_string();
            let method = req.method().clone();
            self.requests.push(RecordedRequest {
                method: method.clone(),
                uri: uri.clone(),
                body: req.into_body(),
            });

            let result = if self.offline {
                Err(TransportError::Connection(uri, "connection refused".to_string()))
            } else if let Some(&status) = self.statuses.get(&uri) {
                Ok(Response::builder().status(status).body(Vec::new()).unwrap())
            } else if method == http::Method::GET {
                match self.routes.get(&uri) {
                    Some(body) => Ok(Response::builder().status(200).body(body.clone()).unwrap()),
                    None => Ok(Response::builder().status(404).body(Vec::new()).unwrap()),
                }
            } else {
                Ok(Response::builder().status(200).body(Vec::new()).unwrap())
            };
            futures::future::ready(result).boxed()
        }
    }
}
