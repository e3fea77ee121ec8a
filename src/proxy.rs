//! Per-listener proxy: spawns active streams and owns the active set.

use crate::access_log::AccessLog;
use crate::cluster::{ClusterManager, UpstreamProtocol};
use crate::codec::{StreamEncoder, StreamResetReason};
use crate::config::ProxyConfig;
use crate::downstream::ActiveStream;
use crate::filter::FilterChainFactory;
use crate::headers::Headers;
use crate::metrics::Metrics;
use crate::request_info::{RequestInfo, ResponseFlags};
use crate::router::Router;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::debug;

/// Per-listener stream counters.
#[derive(Debug, Default)]
pub struct ProxyStats {
    downstream_request_total: AtomicU64,
    downstream_request_active: AtomicI64,
    downstream_request_reset: AtomicU64,
}

impl ProxyStats {
    pub(crate) fn inc_request(&self) {
        self.downstream_request_total.fetch_add(1, Ordering::Relaxed);
        self.downstream_request_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_active(&self) {
        self.downstream_request_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_reset(&self) {
        self.downstream_request_reset.fetch_add(1, Ordering::Relaxed);
    }

    /// Total streams ever spawned on this listener.
    pub fn downstream_request_total(&self) -> u64 {
        self.downstream_request_total.load(Ordering::Relaxed)
    }

    /// Streams currently in flight.
    pub fn downstream_request_active(&self) -> i64 {
        self.downstream_request_active.load(Ordering::Relaxed)
    }

    /// Streams that ended in a reset.
    pub fn downstream_request_reset(&self) -> u64 {
        self.downstream_request_reset.load(Ordering::Relaxed)
    }
}

/// The per-listener proxy.
///
/// Holds the router and cluster-manager handles consumed by every stream,
/// the set of live streams, and per-listener stats. The downstream codec
/// calls [`Proxy::new_stream`] on the first header event of each request and
/// then drives the returned stream directly.
pub struct Proxy {
    upstream_protocol: UpstreamProtocol,
    buffer_limit: u32,
    router: Rc<dyn Router>,
    cluster_manager: Rc<dyn ClusterManager>,
    filter_factory: Option<Rc<dyn FilterChainFactory>>,
    access_logs: Vec<Rc<dyn AccessLog>>,
    streams: RefCell<HashMap<String, Rc<RefCell<ActiveStream>>>>,
    stats: ProxyStats,
    next_stream_id: Cell<u64>,
}

impl Proxy {
    /// Creates a proxy with the given collaborators.
    pub fn new(
        config: &ProxyConfig,
        router: Rc<dyn Router>,
        cluster_manager: Rc<dyn ClusterManager>,
    ) -> Self {
        Self {
            upstream_protocol: config.upstream_protocol,
            buffer_limit: config.buffer_limit,
            router,
            cluster_manager,
            filter_factory: None,
            access_logs: Vec::new(),
            streams: RefCell::new(HashMap::new()),
            stats: ProxyStats::default(),
            next_stream_id: Cell::new(0),
        }
    }

    /// Installs a filter chain factory applied to every new stream.
    pub fn with_filter_factory(mut self, factory: Rc<dyn FilterChainFactory>) -> Self {
        self.filter_factory = Some(factory);
        self
    }

    /// Adds an access log; all logs receive every terminal stream.
    pub fn with_access_log(mut self, log: Rc<dyn AccessLog>) -> Self {
        self.access_logs.push(log);
        self
    }

    /// Spawns a stream for a newly decoded request.
    ///
    /// The codec keeps driving the returned stream through its
    /// [`crate::codec::StreamDecoder`] entry points; the stream writes the
    /// response back through `response_encoder`. Callers must hold the
    /// returned strong handle for the duration of any callback they invoke.
    pub fn new_stream(
        self: &Rc<Self>,
        stream_id: impl Into<String>,
        response_encoder: Box<dyn StreamEncoder>,
    ) -> Rc<RefCell<ActiveStream>> {
        let stream_id = stream_id.into();

        self.stats.inc_request();
        Metrics::inc_downstream_request();

        let proxy = Rc::downgrade(self);
        let buffer_limit = self.buffer_limit;
        let id = stream_id.clone();
        let stream = Rc::new_cyclic(|weak: &Weak<RefCell<ActiveStream>>| {
            RefCell::new(ActiveStream::new(
                id,
                proxy,
                weak.clone(),
                response_encoder,
                buffer_limit,
            ))
        });

        if let Some(factory) = &self.filter_factory {
            factory.create_filter_chain(Rc::downgrade(&stream), &mut *stream.borrow_mut());
        }

        debug!(stream_id = %stream_id, "new active stream");
        self.streams
            .borrow_mut()
            .insert(stream_id, Rc::clone(&stream));

        stream
    }

    /// Allocates a listener-unique stream id for codecs without their own.
    pub fn next_stream_id(&self) -> String {
        let id = self.next_stream_id.get();
        self.next_stream_id.set(id + 1);
        format!("stream-{}", id)
    }

    /// Looks up a live stream by id.
    pub fn stream(&self, stream_id: &str) -> Option<Rc<RefCell<ActiveStream>>> {
        self.streams.borrow().get(stream_id).cloned()
    }

    /// Number of streams currently in the active set.
    pub fn active_stream_count(&self) -> usize {
        self.streams.borrow().len()
    }

    /// Per-listener stream counters.
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    pub(crate) fn remove_stream(&self, stream_id: &str) -> bool {
        self.streams.borrow_mut().remove(stream_id).is_some()
    }

    pub(crate) fn router(&self) -> &dyn Router {
        &*self.router
    }

    pub(crate) fn cluster_manager(&self) -> &dyn ClusterManager {
        &*self.cluster_manager
    }

    pub(crate) fn upstream_protocol(&self) -> UpstreamProtocol {
        self.upstream_protocol
    }

    pub(crate) fn log_access(
        &self,
        request_headers: Option<&Headers>,
        response_headers: Option<&Headers>,
        info: &RequestInfo,
    ) {
        for log in &self.access_logs {
            log.log(request_headers, response_headers, info);
        }
    }

    /// Maps an upstream reset reason into its response flag.
    pub(crate) fn reset_reason_to_flag(reason: StreamResetReason) -> ResponseFlags {
        match reason {
            StreamResetReason::ConnectionFailure => ResponseFlags::UPSTREAM_CONNECTION_FAILURE,
            StreamResetReason::ConnectionTermination => {
                ResponseFlags::UPSTREAM_CONNECTION_TERMINATION
            }
            StreamResetReason::Overflow => ResponseFlags::UPSTREAM_OVERFLOW,
            StreamResetReason::RemoteReset => ResponseFlags::UPSTREAM_REMOTE_RESET,
            StreamResetReason::LocalReset => ResponseFlags::UPSTREAM_LOCAL_RESET,
        }
    }
}
