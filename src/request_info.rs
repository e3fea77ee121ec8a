//! Per-stream request accounting surfaced to access logs.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Bit-set of terminal conditions observed on a stream.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseFlags(u32);

impl ResponseFlags {
    pub const NO_ROUTE_FOUND: ResponseFlags = ResponseFlags(1 << 0);
    pub const NO_HEALTHY_UPSTREAM: ResponseFlags = ResponseFlags(1 << 1);
    pub const UPSTREAM_REQUEST_TIMEOUT: ResponseFlags = ResponseFlags(1 << 2);
    pub const UPSTREAM_OVERFLOW: ResponseFlags = ResponseFlags(1 << 3);
    pub const UPSTREAM_CONNECTION_FAILURE: ResponseFlags = ResponseFlags(1 << 4);
    pub const UPSTREAM_CONNECTION_TERMINATION: ResponseFlags = ResponseFlags(1 << 5);
    pub const UPSTREAM_REMOTE_RESET: ResponseFlags = ResponseFlags(1 << 6);
    pub const UPSTREAM_LOCAL_RESET: ResponseFlags = ResponseFlags(1 << 7);
    pub const DOWNSTREAM_REQUEST_RESET: ResponseFlags = ResponseFlags(1 << 8);

    /// Merges another flag set into this one.
    pub fn set(&mut self, other: ResponseFlags) {
        self.0 |= other.0;
    }

    /// Returns true if all bits of `other` are set.
    pub fn contains(self, other: ResponseFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ResponseFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ResponseFlags, &str); 9] = [
            (ResponseFlags::NO_ROUTE_FOUND, "NR"),
            (ResponseFlags::NO_HEALTHY_UPSTREAM, "UH"),
            (ResponseFlags::UPSTREAM_REQUEST_TIMEOUT, "UT"),
            (ResponseFlags::UPSTREAM_OVERFLOW, "UO"),
            (ResponseFlags::UPSTREAM_CONNECTION_FAILURE, "UF"),
            (ResponseFlags::UPSTREAM_CONNECTION_TERMINATION, "UC"),
            (ResponseFlags::UPSTREAM_REMOTE_RESET, "URX"),
            (ResponseFlags::UPSTREAM_LOCAL_RESET, "ULX"),
            (ResponseFlags::DOWNSTREAM_REQUEST_RESET, "DR"),
        ];

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// Accumulated facts about one downstream request/response cycle.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    start_time: Instant,
    bytes_received: u64,
    bytes_sent: u64,
    request_received_duration: Option<Duration>,
    response_received_duration: Option<Duration>,
    downstream_local_address: Option<SocketAddr>,
    downstream_remote_address: Option<SocketAddr>,
    route_name: Option<String>,
    response_flags: ResponseFlags,
}

impl RequestInfo {
    /// Creates request info stamped with the current instant.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_received: 0,
            bytes_sent: 0,
            request_received_duration: None,
            response_received_duration: None,
            downstream_local_address: None,
            downstream_remote_address: None,
            route_name: None,
            response_flags: ResponseFlags::default(),
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn add_bytes_received(&mut self, n: u64) {
        self.bytes_received += n;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn add_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
    }

    /// Stamps the instant the request was fully received and forwarded.
    pub fn stamp_request_received(&mut self) {
        self.request_received_duration = Some(self.start_time.elapsed());
    }

    pub fn request_received_duration(&self) -> Option<Duration> {
        self.request_received_duration
    }

    /// Stamps the instant upstream response headers arrived.
    pub fn stamp_response_received(&mut self) {
        self.response_received_duration = Some(self.start_time.elapsed());
    }

    pub fn response_received_duration(&self) -> Option<Duration> {
        self.response_received_duration
    }

    pub fn set_downstream_local_address(&mut self, addr: SocketAddr) {
        self.downstream_local_address = Some(addr);
    }

    pub fn downstream_local_address(&self) -> Option<SocketAddr> {
        self.downstream_local_address
    }

    pub fn set_downstream_remote_address(&mut self, addr: SocketAddr) {
        self.downstream_remote_address = Some(addr);
    }

    pub fn downstream_remote_address(&self) -> Option<SocketAddr> {
        self.downstream_remote_address
    }

    pub fn set_route_name(&mut self, name: impl Into<String>) {
        self.route_name = Some(name.into());
    }

    pub fn route_name(&self) -> Option<&str> {
        self.route_name.as_deref()
    }

    pub fn set_response_flag(&mut self, flag: ResponseFlags) {
        self.response_flags.set(flag);
    }

    pub fn response_flags(&self) -> ResponseFlags {
        self.response_flags
    }

    /// Total wall-clock time since the stream was created.
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_set_and_contains() {
        let mut flags = ResponseFlags::default();
        assert!(flags.is_empty());

        flags.set(ResponseFlags::NO_ROUTE_FOUND);
        flags.set(ResponseFlags::UPSTREAM_REQUEST_TIMEOUT);

        assert!(flags.contains(ResponseFlags::NO_ROUTE_FOUND));
        assert!(flags.contains(ResponseFlags::UPSTREAM_REQUEST_TIMEOUT));
        assert!(!flags.contains(ResponseFlags::NO_HEALTHY_UPSTREAM));
    }

    #[test]
    fn test_flags_debug_names() {
        let mut flags = ResponseFlags::default();
        assert_eq!(format!("{:?}", flags), "-");

        flags.set(ResponseFlags::NO_ROUTE_FOUND);
        flags.set(ResponseFlags::UPSTREAM_OVERFLOW);
        assert_eq!(format!("{:?}", flags), "NR,UO");
    }

    #[test]
    fn test_byte_accounting() {
        let mut info = RequestInfo::new();
        info.add_bytes_received(10);
        info.add_bytes_received(5);
        info.add_bytes_sent(7);

        assert_eq!(info.bytes_received(), 15);
        assert_eq!(info.bytes_sent(), 7);
    }

    #[test]
    fn test_duration_stamps() {
        let mut info = RequestInfo::new();
        assert!(info.request_received_duration().is_none());

        info.stamp_request_received();
        info.stamp_response_received();

        assert!(info.request_received_duration().is_some());
        assert!(info.response_received_duration().is_some());
    }
}
