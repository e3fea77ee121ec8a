//! The per-request active stream.
//!
//! An [`ActiveStream`] owns one downstream request/response cycle and binds
//! it to one (or, on retries, successive) upstream attempts. It is driven
//! entirely by callbacks: the downstream codec's decode events, upstream
//! events forwarded by [`crate::upstream::UpstreamRequest`], and timer
//! fires. All of them execute on the stream's `LocalSet` context, so the
//! state needs no locks.
//!
//! Terminal paths converge on `clean_stream`, which runs exactly once:
//! stats are balanced, timers stopped, the live upstream attempt reset,
//! filters destroyed, one access-log record emitted, and the stream removed
//! from the proxy's active set.

use crate::cluster::{ClusterSnapshot, ConnectionPool, LoadBalancerContext, UpstreamProtocol};
use crate::codec::{
    DecodeError, HijackCode, StreamDecoder, StreamEncoder, StreamEventListener, StreamResetReason,
    STATUS_HEADER,
};
use crate::filter::{FilterManager, FilterStatus, StreamDecoderFilter, StreamEncoderFilter};
use crate::headers::Headers;
use crate::metrics::Metrics;
use crate::proxy::Proxy;
use crate::request_info::{RequestInfo, ResponseFlags};
use crate::retry::{RetryState, RetryVerdict};
use crate::router::Route;
use crate::timeout::{ProxyTimeout, Timer};
use crate::upstream::UpstreamRequest;
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use tracing::{debug, error, warn};

/// Weak handle to a stream, used by timers, filters and upstream attempts.
pub type StreamHandle = Weak<RefCell<ActiveStream>>;

/// Kind of upstream failure surfaced to the reset path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamResetType {
    /// The overall deadline across all attempts expired. Never retried.
    GlobalTimeout,
    /// The deadline for a single attempt expired.
    PerTryTimeout,
    /// The upstream connection could not be established.
    ConnectionFailure,
    /// The upstream connection went away mid-stream.
    ConnectionTermination,
    /// The upstream stream itself was reset.
    StreamReset,
    /// The attempt was refused due to resource pressure.
    Overflow,
}

/// Which event kind a filter chain is currently paused on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FilterStage {
    Headers,
    Data,
    Trailers,
}

/// Bookkeeping for a paused filter chain.
#[derive(Clone, Copy, Debug)]
struct ChainPause {
    /// Index of the filter that stopped traversal.
    index: usize,
    /// Stage the withheld event belongs to.
    stage: FilterStage,
}

/// The per-request proxy state machine.
pub struct ActiveStream {
    stream_id: String,
    proxy: Weak<Proxy>,
    self_handle: StreamHandle,

    // ~~~ routing snapshot
    route: Option<Rc<dyn Route>>,
    cluster: Option<ClusterSnapshot>,

    // ~~~ flow control
    buffer_limit: u32,
    high_watermark_count: u32,

    // ~~~ control
    timeout: ProxyTimeout,
    retry_state: Option<RetryState>,
    per_try_timer: Option<Timer>,
    response_timer: Option<Timer>,

    request_info: RequestInfo,
    response_encoder: Option<Box<dyn StreamEncoder>>,
    upstream_request: Option<Rc<RefCell<UpstreamRequest>>>,

    // ~~~ downstream request buffers
    downstream_req_headers: Option<Headers>,
    downstream_req_data_buf: Option<BytesMut>,
    downstream_req_trailers: Option<Headers>,

    // ~~~ downstream response buffers
    downstream_resp_headers: Option<Headers>,

    // ~~~ filter chains
    decoder_filters: Vec<Box<dyn StreamDecoderFilter>>,
    encoder_filters: Vec<Box<dyn StreamEncoderFilter>>,

    decode_pause: Option<ChainPause>,
    pending_decode_headers: Option<(Headers, bool)>,
    buffered_decode_data: Option<(BytesMut, bool)>,
    pending_decode_trailers: Option<Headers>,

    encode_pause: Option<ChainPause>,
    pending_encode_headers: Option<(Headers, bool)>,
    buffered_encode_data: Option<(BytesMut, bool)>,
    pending_encode_trailers: Option<Headers>,

    // ~~~ state
    downstream_response_started: bool,
    upstream_request_sent: bool,
    downstream_recv_done: bool,
    local_process_done: bool,
    decoder_filters_streaming: bool,
    encoder_filters_streaming: bool,
    cleaned: bool,
}

impl ActiveStream {
    pub(crate) fn new(
        stream_id: String,
        proxy: Weak<Proxy>,
        self_handle: StreamHandle,
        response_encoder: Box<dyn StreamEncoder>,
        buffer_limit: u32,
    ) -> Self {
        Self {
            stream_id,
            proxy,
            self_handle,
            route: None,
            cluster: None,
            buffer_limit,
            high_watermark_count: 0,
            timeout: ProxyTimeout::default(),
            retry_state: None,
            per_try_timer: None,
            response_timer: None,
            request_info: RequestInfo::new(),
            response_encoder: Some(response_encoder),
            upstream_request: None,
            downstream_req_headers: None,
            downstream_req_data_buf: None,
            downstream_req_trailers: None,
            downstream_resp_headers: None,
            decoder_filters: Vec::new(),
            encoder_filters: Vec::new(),
            decode_pause: None,
            pending_decode_headers: None,
            buffered_decode_data: None,
            pending_decode_trailers: None,
            encode_pause: None,
            pending_encode_headers: None,
            buffered_encode_data: None,
            pending_encode_trailers: None,
            downstream_response_started: false,
            upstream_request_sent: false,
            downstream_recv_done: false,
            local_process_done: false,
            decoder_filters_streaming: false,
            encoder_filters_streaming: false,
            cleaned: false,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn request_info(&self) -> &RequestInfo {
        &self.request_info
    }

    /// True once the stream reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.cleaned
    }

    /// Records the downstream connection's addresses for logging.
    pub fn set_downstream_addresses(&mut self, local: SocketAddr, remote: SocketAddr) {
        self.request_info.set_downstream_local_address(local);
        self.request_info.set_downstream_remote_address(remote);
    }

    /// Declared by a decoder filter that injects data below the headers
    /// stage: subsequent chunks flow through the remainder of the chain as
    /// they arrive instead of being buffered behind the pause.
    pub fn set_decoder_filters_streaming(&mut self, streaming: bool) {
        self.decoder_filters_streaming = streaming;
    }

    /// Encoder-side dual of [`Self::set_decoder_filters_streaming`].
    pub fn set_encoder_filters_streaming(&mut self, streaming: bool) {
        self.encoder_filters_streaming = streaming;
    }

    // ~~~ decode path

    fn do_decode_headers(&mut self, from: Option<usize>, mut headers: Headers, end_stream: bool) {
        if self.decode_header_filters(from, &mut headers, end_stream) {
            if self.decode_pause.is_some() {
                self.pending_decode_headers = Some((headers, end_stream));
            }
            return;
        }

        let Some(proxy) = self.proxy.upgrade() else {
            return;
        };

        let Some(route) = proxy.router().route(&headers, 1) else {
            self.request_info
                .set_response_flag(ResponseFlags::NO_ROUTE_FOUND);
            self.send_hijack_reply(HijackCode::RouterUnavailable);
            return;
        };

        let rule = route.rule();
        let cluster_name = rule.cluster_name.clone();
        let retry_policy = rule.retry_policy.clone();
        let timeout_policy = rule.timeout_policy;
        self.request_info.set_route_name(rule.name.clone());
        self.route = Some(route);

        let Ok(pool) = self.initialize_upstream_connection_pool(&cluster_name) else {
            // the pool path already sent the hijack
            return;
        };

        self.timeout = ProxyTimeout::parse(&timeout_policy, &headers);
        self.retry_state = Some(RetryState::new(&retry_policy, &headers));

        self.downstream_req_headers = Some(headers.clone());

        let upstream = UpstreamRequest::new(self.self_handle.clone(), pool);
        self.upstream_request = Some(Rc::clone(&upstream));
        UpstreamRequest::encode_headers(&upstream, headers, end_stream);

        if end_stream {
            self.on_upstream_request_sent();
        }
    }

    fn do_decode_data(&mut self, from: Option<usize>, mut data: Bytes, end_stream: bool) {
        if self.local_process_done {
            return;
        }

        let effective_from = if from.is_none() {
            match self.decode_pause {
                Some(pause) if self.decoder_filters_streaming => Some(pause.index),
                Some(_) => {
                    self.stash_decode_data(data, end_stream);
                    return;
                }
                None => None,
            }
        } else {
            from
        };

        if self.decode_data_filters(effective_from, &mut data, end_stream) {
            if self.decode_pause.is_some() {
                self.stash_decode_data(data, end_stream);
            }
            return;
        }

        let should_buffer = self.retry_state.as_ref().is_some_and(|r| r.retry_on());

        if end_stream {
            self.on_upstream_request_sent();
        }

        let Some(upstream) = self.upstream_request.clone() else {
            return;
        };

        if should_buffer {
            let buffer = self.downstream_req_data_buf.get_or_insert_with(BytesMut::new);
            if self.buffer_limit > 0 && buffer.len() + data.len() > self.buffer_limit as usize {
                // body exceeds the replay budget: a retry can no longer
                // resend it, so stop holding the copy
                self.downstream_req_data_buf = None;
                if let Some(retry_state) = self.retry_state.as_mut() {
                    retry_state.reset();
                }
            } else {
                buffer.extend_from_slice(&data);
            }
        }

        UpstreamRequest::encode_data(&upstream, data, end_stream);
    }

    fn do_decode_trailers(&mut self, from: Option<usize>, mut trailers: Headers) {
        if self.local_process_done {
            return;
        }

        if from.is_none() && self.decode_pause.is_some() {
            self.pending_decode_trailers = Some(trailers);
            return;
        }

        if self.decode_trailers_filters(from, &mut trailers) {
            if self.decode_pause.is_some() {
                self.pending_decode_trailers = Some(trailers);
            }
            return;
        }

        self.downstream_req_trailers = Some(trailers.clone());
        self.on_upstream_request_sent();

        if let Some(upstream) = self.upstream_request.clone() {
            UpstreamRequest::encode_trailers(&upstream, trailers);
        }
    }

    fn stash_decode_data(&mut self, data: Bytes, end_stream: bool) {
        let (buffer, end) = self
            .buffered_decode_data
            .get_or_insert_with(|| (BytesMut::new(), false));
        buffer.extend_from_slice(&data);
        *end |= end_stream;
    }

    /// Resumes the decode chain after a filter paused it. Traversal
    /// restarts at the filter after the one that stopped.
    pub fn continue_decoding(&mut self) {
        let Some(pause) = self.decode_pause.take() else {
            return;
        };

        if let Some((headers, end_stream)) = self.pending_decode_headers.take() {
            self.do_decode_headers(Some(pause.index), headers, end_stream);
            if self.decode_pause.is_some() || self.local_process_done {
                return;
            }
        }

        if let Some((buffer, end_stream)) = self.buffered_decode_data.take() {
            let from = (pause.stage == FilterStage::Data).then_some(pause.index);
            self.do_decode_data(from, buffer.freeze(), end_stream);
            if self.decode_pause.is_some() || self.local_process_done {
                return;
            }
        }

        if let Some(trailers) = self.pending_decode_trailers.take() {
            let from = (pause.stage == FilterStage::Trailers).then_some(pause.index);
            self.do_decode_trailers(from, trailers);
        }
    }

    // ~~~ decode filter traversal

    fn decode_header_filters(
        &mut self,
        from: Option<usize>,
        headers: &mut Headers,
        end_stream: bool,
    ) -> bool {
        let start = from.map(|i| i + 1).unwrap_or(0);
        for index in start..self.decoder_filters.len() {
            let status = self.decoder_filters[index].on_headers(headers, end_stream);
            match status {
                FilterStatus::Continue => {}
                FilterStatus::StopIteration | FilterStatus::StopAndBuffer => {
                    self.decode_pause = Some(ChainPause {
                        index,
                        stage: FilterStage::Headers,
                    });
                    return true;
                }
                FilterStatus::Hijack(code) => {
                    self.send_hijack_reply(code);
                    return true;
                }
            }
        }
        false
    }

    fn decode_data_filters(
        &mut self,
        from: Option<usize>,
        data: &mut Bytes,
        end_stream: bool,
    ) -> bool {
        let start = from.map(|i| i + 1).unwrap_or(0);
        for index in start..self.decoder_filters.len() {
            let status = self.decoder_filters[index].on_data(data, end_stream);
            match status {
                FilterStatus::Continue => {}
                FilterStatus::StopIteration | FilterStatus::StopAndBuffer => {
                    self.decode_pause = Some(ChainPause {
                        index,
                        stage: FilterStage::Data,
                    });
                    return true;
                }
                FilterStatus::Hijack(code) => {
                    self.send_hijack_reply(code);
                    return true;
                }
            }
        }
        false
    }

    fn decode_trailers_filters(&mut self, from: Option<usize>, trailers: &mut Headers) -> bool {
        let start = from.map(|i| i + 1).unwrap_or(0);
        for index in start..self.decoder_filters.len() {
            let status = self.decoder_filters[index].on_trailers(trailers);
            match status {
                FilterStatus::Continue => {}
                FilterStatus::StopIteration | FilterStatus::StopAndBuffer => {
                    self.decode_pause = Some(ChainPause {
                        index,
                        stage: FilterStage::Trailers,
                    });
                    return true;
                }
                FilterStatus::Hijack(code) => {
                    self.send_hijack_reply(code);
                    return true;
                }
            }
        }
        false
    }

    // ~~~ pool acquisition

    fn initialize_upstream_connection_pool(
        &mut self,
        cluster_name: &str,
    ) -> Result<Rc<dyn ConnectionPool>, ()> {
        let Some(proxy) = self.proxy.upgrade() else {
            return Err(());
        };

        let Some(snapshot) = proxy.cluster_manager().get(cluster_name) else {
            error!(cluster = %cluster_name, "cluster snapshot is nil");
            self.request_info
                .set_response_flag(ResponseFlags::NO_ROUTE_FOUND);
            self.send_hijack_reply(HijackCode::RouterUnavailable);
            return Err(());
        };
        self.cluster = Some(snapshot);

        let pool = match proxy.upstream_protocol() {
            UpstreamProtocol::RpcFamily => proxy.cluster_manager().pool_for_cluster(
                cluster_name,
                UpstreamProtocol::RpcFamily,
                &*self,
            ),
            UpstreamProtocol::Http1 => {
                proxy
                    .cluster_manager()
                    .pool_for_cluster(cluster_name, UpstreamProtocol::Http1, &*self)
            }
            UpstreamProtocol::Http2 => {
                proxy
                    .cluster_manager()
                    .pool_for_cluster(cluster_name, UpstreamProtocol::Http2, &*self)
            }
        };

        let Some(pool) = pool else {
            warn!(cluster = %cluster_name, "no healthy upstream pool");
            self.request_info
                .set_response_flag(ResponseFlags::NO_HEALTHY_UPSTREAM);
            self.send_hijack_reply(HijackCode::NoHealthyUpstream);
            return Err(());
        };

        Ok(pool)
    }

    // ~~~ request-sent transition

    fn on_upstream_request_sent(&mut self) {
        self.upstream_request_sent = true;
        self.request_info.stamp_request_received();

        if self.upstream_request.is_some() {
            self.setup_per_try_timeout();

            if !self.timeout.global.is_zero() {
                if let Some(mut timer) = self.response_timer.take() {
                    timer.stop();
                }
                let handle = self.self_handle.clone();
                self.response_timer = Some(Timer::spawn(self.timeout.global, move || {
                    if let Some(stream) = handle.upgrade() {
                        stream.borrow_mut().on_response_timeout();
                    }
                }));
            }
        }
    }

    fn setup_per_try_timeout(&mut self) {
        if self.timeout.per_try.is_zero() {
            return;
        }
        if let Some(mut timer) = self.per_try_timer.take() {
            timer.stop();
        }
        let handle = self.self_handle.clone();
        self.per_try_timer = Some(Timer::spawn(self.timeout.per_try, move || {
            if let Some(stream) = handle.upgrade() {
                stream.borrow_mut().on_per_try_timeout();
            }
        }));
    }

    fn on_response_timeout(&mut self) {
        self.response_timer = None;
        if self.cleaned {
            return;
        }
        if let Some(cluster) = &self.cluster {
            Metrics::inc_upstream_timeout(&cluster.name);
        }
        if let Some(upstream) = self.upstream_request.as_ref() {
            upstream.borrow_mut().reset_stream();
        }
        self.on_upstream_reset(UpstreamResetType::GlobalTimeout, StreamResetReason::LocalReset);
    }

    fn on_per_try_timeout(&mut self) {
        self.per_try_timer = None;
        if self.cleaned {
            return;
        }
        if self.downstream_response_started {
            debug!(stream_id = %self.stream_id, "skip per-try timeout, upstream response in progress");
            return;
        }
        if let Some(cluster) = &self.cluster {
            Metrics::inc_upstream_timeout(&cluster.name);
        }
        if let Some(upstream) = self.upstream_request.as_ref() {
            upstream.borrow_mut().reset_stream();
        }
        self.request_info
            .set_response_flag(ResponseFlags::UPSTREAM_REQUEST_TIMEOUT);
        self.on_upstream_reset(UpstreamResetType::PerTryTimeout, StreamResetReason::LocalReset);
    }

    // ~~~ upstream events

    pub(crate) fn on_upstream_headers(&mut self, headers: Headers, end_stream: bool) {
        if self.local_process_done {
            return;
        }

        let handle = self.self_handle.clone();
        let verdict = self.retry_state.as_mut().map(|retry_state| {
            retry_state.retry(Some(&headers), None, move || {
                if let Some(stream) = handle.upgrade() {
                    stream.borrow_mut().do_retry();
                }
            })
        });

        if let Some(verdict) = verdict {
            match verdict {
                RetryVerdict::ShouldRetry => {
                    if self.setup_retry(end_stream) {
                        return;
                    }
                }
                RetryVerdict::RetryOverflow => {
                    self.request_info
                        .set_response_flag(ResponseFlags::UPSTREAM_OVERFLOW);
                }
                RetryVerdict::NoRetry => {}
            }

            if let Some(retry_state) = self.retry_state.as_mut() {
                retry_state.reset();
            }
        }

        self.request_info.stamp_response_received();
        self.downstream_response_started = true;

        if end_stream {
            self.on_upstream_response_recv_finished();
        }

        self.encode_headers(headers, end_stream);
    }

    pub(crate) fn on_upstream_data(&mut self, data: Bytes, end_stream: bool) {
        if self.local_process_done {
            return;
        }
        if end_stream {
            self.on_upstream_response_recv_finished();
        }
        self.encode_data(data, end_stream);
    }

    pub(crate) fn on_upstream_trailers(&mut self, trailers: Headers) {
        if self.local_process_done {
            return;
        }
        self.on_upstream_response_recv_finished();
        self.encode_trailers(trailers);
    }

    fn on_upstream_response_recv_finished(&mut self) {
        if !self.upstream_request_sent {
            // upstream closed before the request went out
            if let Some(upstream) = self.upstream_request.as_ref() {
                upstream.borrow_mut().reset_stream();
            }
        }
        self.clean_up();
    }

    pub(crate) fn on_upstream_reset(&mut self, kind: UpstreamResetType, reason: StreamResetReason) {
        if self.cleaned {
            return;
        }
        debug!(stream_id = %self.stream_id, ?kind, ?reason, "upstream reset");
        if let Some(cluster) = &self.cluster {
            Metrics::inc_upstream_failed(&cluster.name);
        }

        // see if a fresh attempt can absorb the failure
        let retry_eligible =
            kind != UpstreamResetType::GlobalTimeout && !self.downstream_response_started;
        let handle = self.self_handle.clone();
        let verdict = if retry_eligible {
            self.retry_state.as_mut().map(|retry_state| {
                retry_state.retry(None, Some(reason), move || {
                    if let Some(stream) = handle.upgrade() {
                        stream.borrow_mut().do_retry();
                    }
                })
            })
        } else {
            None
        };

        if let Some(verdict) = verdict {
            match verdict {
                RetryVerdict::ShouldRetry => {
                    if self.setup_retry(true) {
                        return;
                    }
                }
                RetryVerdict::RetryOverflow => {
                    self.request_info
                        .set_response_flag(ResponseFlags::UPSTREAM_OVERFLOW);
                }
                RetryVerdict::NoRetry => {}
            }
        }

        self.clean_up();

        if self.downstream_response_started {
            // headers already went out: the response can only be reset,
            // never rewritten
            self.reset_downstream(StreamResetReason::LocalReset);
        } else {
            match kind {
                UpstreamResetType::GlobalTimeout | UpstreamResetType::PerTryTimeout => {
                    self.request_info
                        .set_response_flag(ResponseFlags::UPSTREAM_REQUEST_TIMEOUT);
                    self.send_hijack_reply(HijackCode::TimeoutException);
                }
                _ => {
                    let flag = Proxy::reset_reason_to_flag(reason);
                    self.request_info.set_response_flag(flag);
                    self.send_hijack_reply(HijackCode::NoHealthyUpstream);
                }
            }
        }
    }

    // ~~~ retry machinery

    fn setup_retry(&mut self, end_stream: bool) -> bool {
        if !self.upstream_request_sent {
            return false;
        }

        if let Some(upstream) = self.upstream_request.take() {
            let mut upstream = upstream.borrow_mut();
            if !end_stream {
                upstream.reset_stream();
            } else {
                upstream.cancel();
            }
        }

        true
    }

    pub(crate) fn do_retry(&mut self) {
        if self.cleaned || self.local_process_done {
            return;
        }
        let Some(cluster_name) = self.cluster.as_ref().map(|c| c.name.clone()) else {
            return;
        };
        Metrics::inc_upstream_retry(&cluster_name);

        let Ok(pool) = self.initialize_upstream_connection_pool(&cluster_name) else {
            self.clean_up();
            return;
        };

        let Some(headers) = self.downstream_req_headers.clone() else {
            return;
        };

        let upstream = UpstreamRequest::new(self.self_handle.clone(), pool);
        self.upstream_request = Some(Rc::clone(&upstream));

        let headers_end =
            self.downstream_req_data_buf.is_none() && self.downstream_req_trailers.is_none();
        UpstreamRequest::encode_headers(&upstream, headers, headers_end);

        if let Some(buffer) = &self.downstream_req_data_buf {
            // replay a copy so a further retry still has the original
            let copied = Bytes::copy_from_slice(buffer);
            let data_end = self.downstream_req_trailers.is_none();
            UpstreamRequest::encode_data(&upstream, copied, data_end);
        }

        if let Some(trailers) = self.downstream_req_trailers.clone() {
            UpstreamRequest::encode_trailers(&upstream, trailers);
        }

        self.setup_per_try_timeout();
    }

    // ~~~ encode path

    pub(crate) fn encode_headers(&mut self, headers: Headers, end_stream: bool) {
        self.local_process_done = end_stream;
        self.do_encode_headers(None, headers, end_stream);
    }

    fn do_encode_headers(&mut self, from: Option<usize>, mut headers: Headers, end_stream: bool) {
        if self.encode_header_filters(from, &mut headers, end_stream) {
            if self.encode_pause.is_some() {
                self.pending_encode_headers = Some((headers, end_stream));
            }
            return;
        }

        self.downstream_resp_headers = Some(headers.clone());

        if let Some(encoder) = self.response_encoder.as_mut() {
            if let Err(e) = encoder.encode_headers(&headers, end_stream) {
                error!(stream_id = %self.stream_id, error = %e, "encode response headers failed");
            }
        }

        if end_stream {
            self.end_stream();
        }
    }

    pub(crate) fn encode_data(&mut self, data: Bytes, end_stream: bool) {
        self.local_process_done = end_stream;
        self.do_encode_data(None, data, end_stream);
    }

    fn do_encode_data(&mut self, from: Option<usize>, mut data: Bytes, end_stream: bool) {
        let effective_from = if from.is_none() {
            match self.encode_pause {
                Some(pause) if self.encoder_filters_streaming => Some(pause.index),
                Some(_) => {
                    self.stash_encode_data(data, end_stream);
                    return;
                }
                None => None,
            }
        } else {
            from
        };

        if self.encode_data_filters(effective_from, &mut data, end_stream) {
            if self.encode_pause.is_some() {
                self.stash_encode_data(data, end_stream);
            }
            return;
        }

        let len = data.len() as u64;
        if let Some(encoder) = self.response_encoder.as_mut() {
            if let Err(e) = encoder.encode_data(data, end_stream) {
                error!(stream_id = %self.stream_id, error = %e, "encode response data failed");
            }
        }
        self.request_info.add_bytes_sent(len);

        if end_stream {
            self.end_stream();
        }
    }

    pub(crate) fn encode_trailers(&mut self, trailers: Headers) {
        self.local_process_done = true;
        self.do_encode_trailers(None, trailers);
    }

    fn do_encode_trailers(&mut self, from: Option<usize>, mut trailers: Headers) {
        if from.is_none() && self.encode_pause.is_some() {
            self.pending_encode_trailers = Some(trailers);
            return;
        }

        if self.encode_trailers_filters(from, &mut trailers) {
            if self.encode_pause.is_some() {
                self.pending_encode_trailers = Some(trailers);
            }
            return;
        }

        if let Some(encoder) = self.response_encoder.as_mut() {
            if let Err(e) = encoder.encode_trailers(&trailers) {
                error!(stream_id = %self.stream_id, error = %e, "encode response trailers failed");
            }
        }

        self.end_stream();
    }

    fn stash_encode_data(&mut self, data: Bytes, end_stream: bool) {
        let (buffer, end) = self
            .buffered_encode_data
            .get_or_insert_with(|| (BytesMut::new(), false));
        buffer.extend_from_slice(&data);
        *end |= end_stream;
    }

    /// Resumes the encode chain after a filter paused it.
    pub fn continue_encoding(&mut self) {
        let Some(pause) = self.encode_pause.take() else {
            return;
        };

        if let Some((headers, end_stream)) = self.pending_encode_headers.take() {
            self.do_encode_headers(Some(pause.index), headers, end_stream);
            if self.encode_pause.is_some() || self.cleaned {
                return;
            }
        }

        if let Some((buffer, end_stream)) = self.buffered_encode_data.take() {
            let from = (pause.stage == FilterStage::Data).then_some(pause.index);
            self.do_encode_data(from, buffer.freeze(), end_stream);
            if self.encode_pause.is_some() || self.cleaned {
                return;
            }
        }

        if let Some(trailers) = self.pending_encode_trailers.take() {
            let from = (pause.stage == FilterStage::Trailers).then_some(pause.index);
            self.do_encode_trailers(from, trailers);
        }
    }

    // ~~~ encode filter traversal

    fn encode_header_filters(
        &mut self,
        from: Option<usize>,
        headers: &mut Headers,
        end_stream: bool,
    ) -> bool {
        let start = from.map(|i| i + 1).unwrap_or(0);
        for index in start..self.encoder_filters.len() {
            let status = self.encoder_filters[index].on_headers(headers, end_stream);
            match status {
                FilterStatus::Continue => {}
                FilterStatus::StopIteration | FilterStatus::StopAndBuffer => {
                    self.encode_pause = Some(ChainPause {
                        index,
                        stage: FilterStage::Headers,
                    });
                    return true;
                }
                FilterStatus::Hijack(_) => {
                    // hijacking from the encode chain would recurse into it
                    warn!(stream_id = %self.stream_id, "encoder filter hijack ignored");
                }
            }
        }
        false
    }

    fn encode_data_filters(
        &mut self,
        from: Option<usize>,
        data: &mut Bytes,
        end_stream: bool,
    ) -> bool {
        let start = from.map(|i| i + 1).unwrap_or(0);
        for index in start..self.encoder_filters.len() {
            let status = self.encoder_filters[index].on_data(data, end_stream);
            match status {
                FilterStatus::Continue => {}
                FilterStatus::StopIteration | FilterStatus::StopAndBuffer => {
                    self.encode_pause = Some(ChainPause {
                        index,
                        stage: FilterStage::Data,
                    });
                    return true;
                }
                FilterStatus::Hijack(_) => {
                    warn!(stream_id = %self.stream_id, "encoder filter hijack ignored");
                }
            }
        }
        false
    }

    fn encode_trailers_filters(&mut self, from: Option<usize>, trailers: &mut Headers) -> bool {
        let start = from.map(|i| i + 1).unwrap_or(0);
        for index in start..self.encoder_filters.len() {
            let status = self.encoder_filters[index].on_trailers(trailers);
            match status {
                FilterStatus::Continue => {}
                FilterStatus::StopIteration | FilterStatus::StopAndBuffer => {
                    self.encode_pause = Some(ChainPause {
                        index,
                        stage: FilterStage::Trailers,
                    });
                    return true;
                }
                FilterStatus::Hijack(_) => {
                    warn!(stream_id = %self.stream_id, "encoder filter hijack ignored");
                }
            }
        }
        false
    }

    // ~~~ hijack

    fn send_hijack_reply(&mut self, code: HijackCode) {
        if self.local_process_done {
            return;
        }
        Metrics::inc_hijack(code.as_u16());

        let mut headers = Headers::new();
        headers.set(STATUS_HEADER, code.as_u16().to_string());
        self.encode_headers(headers, true);
    }

    // ~~~ termination

    fn end_stream(&mut self) {
        let mut is_reset = false;
        if self.response_encoder.is_some() && (!self.downstream_recv_done || !self.local_process_done)
        {
            // request not fully received, or the response was cut short:
            // this end is abnormal
            self.local_process_done = true;
            self.reset_downstream(StreamResetReason::LocalReset);
            is_reset = true;
        }

        if !is_reset {
            self.clean_stream();
        }
    }

    fn reset_downstream(&mut self, reason: StreamResetReason) {
        if let Some(encoder) = self.response_encoder.as_mut() {
            encoder.reset_stream(reason);
        }
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.stats().inc_reset();
        }
        Metrics::inc_downstream_reset();
        self.clean_stream();
    }

    fn clean_stream(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        if let Some(proxy) = self.proxy.upgrade() {
            proxy.stats().dec_active();
        }
        Metrics::dec_downstream_active();

        // reset the corresponding upstream attempt
        if let Some(upstream) = self.upstream_request.take() {
            upstream.borrow_mut().reset_stream();
        }

        // stop all timers, release retry state
        self.clean_up();

        // tell filters it's time to destroy
        for filter in &mut self.encoder_filters {
            filter.on_destroy();
        }
        for filter in &mut self.decoder_filters {
            filter.on_destroy();
        }

        if let Some(proxy) = self.proxy.upgrade() {
            proxy.log_access(
                self.downstream_req_headers.as_ref(),
                self.downstream_resp_headers.as_ref(),
                &self.request_info,
            );
            proxy.remove_stream(&self.stream_id);
        }
    }

    /// Stops both timers and invalidates scheduled retry callbacks.
    /// Idempotent.
    fn clean_up(&mut self) {
        if let Some(retry_state) = self.retry_state.as_mut() {
            retry_state.reset();
        }
        if let Some(mut timer) = self.per_try_timer.take() {
            timer.stop();
        }
        if let Some(mut timer) = self.response_timer.take() {
            timer.stop();
        }
    }

    // ~~~ watermarks

    fn call_high_watermark_callbacks(&mut self) {
        if let Some(upstream) = self.upstream_request.as_ref() {
            upstream.borrow_mut().read_disable(true);
        }
        self.high_watermark_count += 1;
    }

    fn call_low_watermark_callbacks(&mut self) {
        if let Some(upstream) = self.upstream_request.as_ref() {
            upstream.borrow_mut().read_disable(false);
        }
        self.high_watermark_count = self.high_watermark_count.saturating_sub(1);
    }

    /// Nesting depth of downstream write-buffer back-pressure.
    pub fn high_watermark_count(&self) -> u32 {
        self.high_watermark_count
    }

    pub(crate) fn on_upstream_above_write_buffer_high_watermark(&mut self) {
        if let Some(encoder) = self.response_encoder.as_mut() {
            encoder.read_disable(true);
        }
    }

    pub(crate) fn on_upstream_below_write_buffer_low_watermark(&mut self) {
        if let Some(encoder) = self.response_encoder.as_mut() {
            encoder.read_disable(false);
        }
    }
}

// the downstream codec decodes the request into the stream
impl StreamDecoder for ActiveStream {
    fn on_decode_headers(&mut self, headers: Headers, end_stream: bool) {
        self.request_info
            .add_bytes_received(headers.byte_size() as u64);
        self.downstream_recv_done = end_stream;
        self.do_decode_headers(None, headers, end_stream);
    }

    fn on_decode_data(&mut self, data: Bytes, end_stream: bool) {
        self.request_info.add_bytes_received(data.len() as u64);
        if self.local_process_done {
            // the stream already finished its lifecycle locally
            return;
        }
        self.downstream_recv_done = end_stream;
        self.do_decode_data(None, data, end_stream);
    }

    fn on_decode_trailers(&mut self, trailers: Headers) {
        if self.local_process_done {
            return;
        }
        self.downstream_recv_done = true;
        self.do_decode_trailers(None, trailers);
    }

    fn on_decode_error(&mut self, error: DecodeError, _headers: Headers) {
        warn!(stream_id = %self.stream_id, ?error, "downstream decode error");
        // no upstream is ever attempted for a broken request
        self.send_hijack_reply(error.hijack_code());
    }
}

// the downstream codec reports stream lifecycle events
impl StreamEventListener for ActiveStream {
    fn on_reset_stream(&mut self, _reason: StreamResetReason) {
        if self.cleaned {
            return;
        }
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.stats().inc_reset();
        }
        Metrics::inc_downstream_reset();
        self.request_info
            .set_response_flag(ResponseFlags::DOWNSTREAM_REQUEST_RESET);
        self.clean_stream();
    }

    fn on_above_write_buffer_high_watermark(&mut self) {
        self.call_high_watermark_callbacks();
    }

    fn on_below_write_buffer_low_watermark(&mut self) {
        self.call_low_watermark_callbacks();
    }
}

impl FilterManager for ActiveStream {
    fn add_decoder_filter(&mut self, filter: Box<dyn StreamDecoderFilter>) {
        self.decoder_filters.push(filter);
    }

    fn add_encoder_filter(&mut self, filter: Box<dyn StreamEncoderFilter>) {
        self.encoder_filters.push(filter);
    }
}

impl LoadBalancerContext for ActiveStream {
    fn metadata_match_criteria(&self) -> Option<&HashMap<String, String>> {
        self.route.as_ref().map(|r| &r.rule().metadata_match)
    }

    fn downstream_headers(&self) -> Option<&Headers> {
        self.downstream_req_headers.as_ref()
    }
}
