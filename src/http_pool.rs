//! HTTP upstream connection pool.
//!
//! Implements [`ConnectionPool`] over the hyper legacy client: round-robin
//! endpoint selection, per-attempt request buffering, and response events
//! posted back to the owning [`UpstreamRequest`] on the stream's context.

use crate::cluster::{ConnectionPool, HostInfo, UpstreamProtocol};
use crate::codec::{StreamDecoder, StreamEncoder, StreamResetReason, STATUS_HEADER};
use crate::error::{ProxyError, Result};
use crate::headers::Headers;
use crate::upstream::{UpstreamRequest, UpstreamResponseDecoder};
use bytes::{Bytes, BytesMut};
use http::Method;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Connection pool for an HTTP cluster.
pub struct HttpConnectionPool {
    cluster_name: String,
    endpoints: Vec<String>,
    next_endpoint: AtomicUsize,
    client: Client<HttpConnector, Full<Bytes>>,
    protocol: UpstreamProtocol,
}

impl HttpConnectionPool {
    /// Creates an HTTP/1.1 pool over the given endpoints
    /// (e.g. `http://127.0.0.1:8080`).
    pub fn new(cluster_name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            endpoints,
            next_endpoint: AtomicUsize::new(0),
            client: Client::builder(TokioExecutor::new()).build_http(),
            protocol: UpstreamProtocol::Http1,
        }
    }

    /// Creates an HTTP/2 (prior knowledge) pool over the given endpoints.
    pub fn http2(cluster_name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            endpoints,
            next_endpoint: AtomicUsize::new(0),
            client: Client::builder(TokioExecutor::new())
                .http2_only(true)
                .build_http(),
            protocol: UpstreamProtocol::Http2,
        }
    }

    /// Selects the next endpoint using round-robin.
    fn select_endpoint(&self) -> Option<String> {
        if self.endpoints.is_empty() {
            return None;
        }
        let index = self.next_endpoint.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        Some(self.endpoints[index].clone())
    }
}

impl ConnectionPool for HttpConnectionPool {
    fn protocol(&self) -> UpstreamProtocol {
        self.protocol
    }

    fn new_stream(&self, request: Rc<RefCell<UpstreamRequest>>) {
        let Some(endpoint) = self.select_endpoint() else {
            warn!(cluster = %self.cluster_name, "no endpoints configured");
            tokio::task::spawn_local(async move {
                UpstreamRequest::pool_failure(&request, StreamResetReason::ConnectionFailure, None);
            });
            return;
        };

        debug!(cluster = %self.cluster_name, endpoint = %endpoint, "binding upstream attempt");

        let encoder = Box::new(HttpRequestEncoder {
            client: self.client.clone(),
            endpoint: endpoint.clone(),
            request: Rc::downgrade(&request),
            headers: None,
            body: BytesMut::new(),
            dispatched: false,
        });
        let host = HostInfo { address: endpoint };

        tokio::task::spawn_local(async move {
            UpstreamRequest::pool_ready(&request, encoder, host);
        });
    }
}

/// Buffers one upstream request and dispatches it when complete.
struct HttpRequestEncoder {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoint: String,
    request: Weak<RefCell<UpstreamRequest>>,
    headers: Option<Headers>,
    body: BytesMut,
    dispatched: bool,
}

impl HttpRequestEncoder {
    fn dispatch(&mut self) {
        if self.dispatched {
            return;
        }
        self.dispatched = true;

        let Some(headers) = self.headers.take() else {
            return;
        };
        let body = std::mem::take(&mut self.body).freeze();
        let request_handle = self.request.clone();
        let client = self.client.clone();

        let http_request = match build_request(&self.endpoint, &headers, body) {
            Ok(request) => request,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "failed to build upstream request");
                tokio::task::spawn_local(async move {
                    let Some(request) = request_handle.upgrade() else {
                        return;
                    };
                    UpstreamRequest::deliver_reset(&request, StreamResetReason::ConnectionFailure);
                });
                return;
            }
        };

        tokio::task::spawn_local(async move {
            match client.request(http_request).await {
                Ok(response) => {
                    let (parts, body) = response.into_parts();

                    let mut response_headers = Headers::new();
                    response_headers.set(STATUS_HEADER, parts.status.as_u16().to_string());
                    for (name, value) in parts.headers.iter() {
                        if let Ok(value) = value.to_str() {
                            response_headers.set(name.as_str(), value);
                        }
                    }

                    let body = match body.collect().await {
                        Ok(collected) => collected.to_bytes(),
                        Err(e) => {
                            warn!(error = %e, "upstream response body failed");
                            let Some(request) = request_handle.upgrade() else {
                                return;
                            };
                            UpstreamRequest::deliver_reset(
                                &request,
                                StreamResetReason::ConnectionTermination,
                            );
                            return;
                        }
                    };

                    let Some(request) = request_handle.upgrade() else {
                        return;
                    };
                    let mut decoder = UpstreamResponseDecoder::new(request);
                    if body.is_empty() {
                        decoder.on_decode_headers(response_headers, true);
                    } else {
                        decoder.on_decode_headers(response_headers, false);
                        decoder.on_decode_data(body, true);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "upstream request failed");
                    let Some(request) = request_handle.upgrade() else {
                        return;
                    };
                    UpstreamRequest::deliver_reset(&request, StreamResetReason::ConnectionFailure);
                }
            }
        });
    }
}

impl StreamEncoder for HttpRequestEncoder {
    fn encode_headers(&mut self, headers: &Headers, end_stream: bool) -> Result<()> {
        self.headers = Some(headers.clone());
        if end_stream {
            self.dispatch();
        }
        Ok(())
    }

    fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<()> {
        self.body.extend_from_slice(&data);
        if end_stream {
            self.dispatch();
        }
        Ok(())
    }

    fn encode_trailers(&mut self, _trailers: &Headers) -> Result<()> {
        self.dispatch();
        Ok(())
    }

    fn reset_stream(&mut self, _reason: StreamResetReason) {
        // abandoned attempt: suppress a not-yet-sent dispatch; in-flight
        // responses are dropped by the attempt's cancellation guard
        self.dispatched = true;
    }
}

fn build_request(endpoint: &str, headers: &Headers, body: Bytes) -> Result<Request<Full<Bytes>>> {
    let path = headers.get(":path").unwrap_or("/");
    let uri: http::Uri = format!("{}{}", endpoint, path)
        .parse()
        .map_err(|e| ProxyError::Codec(format!("invalid upstream uri: {}", e)))?;

    let method = headers
        .get(":method")
        .and_then(|m| m.parse::<Method>().ok())
        .unwrap_or(Method::GET);

    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers.iter() {
        if name.starts_with(':')
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder.body(Full::new(body)).map_err(ProxyError::HttpBuild)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_endpoint_selection() {
        let pool = HttpConnectionPool::new(
            "api",
            vec![
                "http://host1:8080".to_string(),
                "http://host2:8080".to_string(),
            ],
        );

        let first = pool.select_endpoint().unwrap();
        let second = pool.select_endpoint().unwrap();
        let third = pool.select_endpoint().unwrap();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_select_endpoint_empty() {
        let pool = HttpConnectionPool::new("api", vec![]);
        assert!(pool.select_endpoint().is_none());
    }

    #[test]
    fn test_build_request_maps_headers() {
        let headers = Headers::from([
            (":method", "POST"),
            (":path", "/v1/echo"),
            ("host", "ignored"),
            ("x-k", "v"),
        ]);
        let request =
            build_request("http://127.0.0.1:8080", &headers, Bytes::from_static(b"hi")).unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().path(), "/v1/echo");
        assert_eq!(request.headers().get("x-k").unwrap(), "v");
        assert!(request.headers().get("host").is_none());
    }

    #[test]
    fn test_build_request_rejects_bad_uri() {
        let headers = Headers::from([(":path", "/\u{0}")]);
        assert!(build_request("http://127.0.0.1:8080", &headers, Bytes::new()).is_err());
    }
}
