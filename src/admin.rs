//! Admin endpoints for health checks and metrics.

use crate::metrics::Metrics;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

/// Admin service for health checks and metrics endpoints.
///
/// Serves:
/// - `/health` - Health check endpoint returning 200 OK
/// - `/metrics` - Prometheus metrics in text format
#[derive(Clone, Default)]
pub struct AdminService;

impl AdminService {
    /// Creates a new admin service.
    pub fn new() -> Self {
        Self
    }

    /// Handles admin requests for health and metrics endpoints.
    async fn handle_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path();

        match path {
            "/health" => {
                debug!("health check requested");
                Ok(Self::text_response(StatusCode::OK, "OK".to_string()))
            }
            "/metrics" => {
                debug!("metrics requested");
                match Metrics::encode() {
                    Ok(metrics) => Ok(Self::text_response(StatusCode::OK, metrics)),
                    Err(e) => {
                        warn!("failed to encode metrics: {}", e);
                        Ok(Self::text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Failed to encode metrics".to_string(),
                        ))
                    }
                }
            }
            _ => Ok(Self::text_response(
                StatusCode::NOT_FOUND,
                "Not Found".to_string(),
            )),
        }
    }

    fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        Box::pin(Self::handle_request(req))
    }
}
