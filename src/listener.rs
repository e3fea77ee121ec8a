//! HTTP/1.1 downstream bridge with graceful shutdown support.
//!
//! The listener accepts TCP connections, serves them with hyper, and adapts
//! each request into the abstract codec contract: headers and the collected
//! body become decode events on a fresh [`crate::downstream::ActiveStream`],
//! and a channel-backed [`StreamEncoder`] fulfills the hyper response when
//! the engine encodes downstream. The bridge is a codec adapter only; all
//! proxy semantics live in the engine.

use crate::codec::{StreamDecoder, StreamEncoder, StreamEventListener, StreamResetReason, STATUS_HEADER};
use crate::downstream::ActiveStream;
use crate::error::{ProxyError, Result};
use crate::headers::Headers;
use crate::proxy::Proxy;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::cell::RefCell;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

/// HTTP listener that accepts connections and feeds the stream engine.
///
/// Connections are served on the current `LocalSet`. Supports graceful
/// shutdown via a broadcast channel.
pub struct Listener {
    tcp_listener: TcpListener,
    proxy: Rc<Proxy>,
    addr: SocketAddr,
}

impl Listener {
    /// Binds to the specified address.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    pub async fn bind(addr: &str, proxy: Rc<Proxy>) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            proxy,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming connections until a shutdown signal is received.
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            info!("accepted connection from {}", peer_addr);
                            let proxy = Rc::clone(&self.proxy);
                            let local_addr = self.addr;
                            tokio::task::spawn_local(async move {
                                if let Err(e) =
                                    handle_connection(stream, proxy, local_addr, peer_addr).await
                                {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Handles a single TCP connection using HTTP/1.1.
async fn handle_connection(
    stream: tokio::net::TcpStream,
    proxy: Rc<Proxy>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
) -> Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = Rc::clone(&proxy);
        async move { dispatch(proxy, req, local_addr, peer_addr).await }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(ProxyError::Http)
}

/// Adapts one hyper request into engine decode events and awaits the
/// engine's response.
async fn dispatch(
    proxy: Rc<Proxy>,
    req: Request<Incoming>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let mut headers = Headers::new();
    headers.set(":method", parts.method.as_str());
    headers.set(
        ":path",
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/"),
    );
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            headers.set(name.as_str(), value);
        }
    }

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return Ok(plain_response(StatusCode::BAD_REQUEST, "invalid request body"));
        }
    };

    let (response_tx, response_rx) = oneshot::channel();
    let encoder = Box::new(BridgeResponseEncoder::new(response_tx));

    let stream = proxy.new_stream(proxy.next_stream_id(), encoder);
    let mut guard = StreamGuard {
        stream: Rc::downgrade(&stream),
        completed: false,
    };

    {
        let mut active = stream.borrow_mut();
        active.set_downstream_addresses(local_addr, peer_addr);
        active.on_decode_headers(headers, body.is_empty());
    }
    if !body.is_empty() {
        stream.borrow_mut().on_decode_data(body, true);
    }

    let response = match response_rx.await {
        Ok(bridge_response) => bridge_response.into_http(),
        Err(_) => plain_response(StatusCode::BAD_GATEWAY, "upstream unavailable"),
    };
    guard.completed = true;

    Ok(response)
}

/// Surfaces a client disconnect to the engine if the request future is
/// dropped before the stream finished.
struct StreamGuard {
    stream: Weak<RefCell<ActiveStream>>,
    completed: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(stream) = self.stream.upgrade() {
            let mut stream = stream.borrow_mut();
            if !stream.is_finished() {
                stream.on_reset_stream(StreamResetReason::ConnectionTermination);
            }
        }
    }
}

/// Engine response rendered back to hyper.
struct BridgeResponse {
    status: u16,
    headers: Headers,
    body: Bytes,
}

impl BridgeResponse {
    fn into_http(self) -> Response<Full<Bytes>> {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in self.headers.iter() {
            if name.starts_with(':') {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder
            .body(Full::new(self.body))
            .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "bad response"))
    }
}

/// Downstream encoder backed by a oneshot channel to the hyper service.
struct BridgeResponseEncoder {
    response_tx: Option<oneshot::Sender<BridgeResponse>>,
    headers: Option<Headers>,
    body: BytesMut,
}

impl BridgeResponseEncoder {
    fn new(response_tx: oneshot::Sender<BridgeResponse>) -> Self {
        Self {
            response_tx: Some(response_tx),
            headers: None,
            body: BytesMut::new(),
        }
    }

    fn finish(&mut self) {
        let Some(tx) = self.response_tx.take() else {
            return;
        };
        let headers = self.headers.take().unwrap_or_default();
        let status = headers
            .get(STATUS_HEADER)
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(200);
        let _ = tx.send(BridgeResponse {
            status,
            headers,
            body: std::mem::take(&mut self.body).freeze(),
        });
    }
}

impl StreamEncoder for BridgeResponseEncoder {
    fn encode_headers(&mut self, headers: &Headers, end_stream: bool) -> Result<()> {
        self.headers = Some(headers.clone());
        if end_stream {
            self.finish();
        }
        Ok(())
    }

    fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<()> {
        self.body.extend_from_slice(&data);
        if end_stream {
            self.finish();
        }
        Ok(())
    }

    fn encode_trailers(&mut self, _trailers: &Headers) -> Result<()> {
        // HTTP/1.1 bridge responses are buffered; trailers just end the message
        self.finish();
        Ok(())
    }

    fn reset_stream(&mut self, _reason: StreamResetReason) {
        // dropping the sender surfaces 502 at the service
        self.response_tx = None;
    }
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticClusterManager;
    use crate::config::ProxyConfig;
    use crate::router::RouteTable;

    fn test_proxy() -> Rc<Proxy> {
        Rc::new(Proxy::new(
            &ProxyConfig::default(),
            Rc::new(RouteTable::new()),
            Rc::new(StaticClusterManager::new()),
        ))
    }

    #[tokio::test]
    async fn test_listener_bind() {
        let listener = Listener::bind("127.0.0.1:0", test_proxy()).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_listener_bind_invalid_address() {
        let listener = Listener::bind("999.999.999.999:0", test_proxy()).await;
        assert!(listener.is_err());
    }
}
