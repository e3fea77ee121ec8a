//! Access logging emitted on every terminal stream path.

use crate::headers::Headers;
use crate::request_info::RequestInfo;
use tracing::info;

/// Sink for one record per completed (or aborted) stream.
pub trait AccessLog {
    /// Logs a finished stream. `response_headers` is absent when the stream
    /// ended before any response headers were produced.
    fn log(
        &self,
        request_headers: Option<&Headers>,
        response_headers: Option<&Headers>,
        info: &RequestInfo,
    );
}

/// Default access log writing structured records through `tracing`.
#[derive(Debug, Default)]
pub struct TracingAccessLog;

impl TracingAccessLog {
    pub fn new() -> Self {
        Self
    }
}

impl AccessLog for TracingAccessLog {
    fn log(
        &self,
        request_headers: Option<&Headers>,
        response_headers: Option<&Headers>,
        info: &RequestInfo,
    ) {
        let path = request_headers.and_then(|h| h.get(":path")).unwrap_or("-");
        let status = response_headers
            .and_then(|h| h.get(crate::codec::STATUS_HEADER))
            .unwrap_or("-");

        info!(
            target: "meshproxy::access",
            path = %path,
            status = %status,
            route = info.route_name().unwrap_or("-"),
            bytes_received = info.bytes_received(),
            bytes_sent = info.bytes_sent(),
            duration_ms = info.duration().as_millis() as u64,
            response_flags = ?info.response_flags(),
            remote = ?info.downstream_remote_address(),
            "request finished"
        );
    }
}
