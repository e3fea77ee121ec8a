//! One attempt against an upstream host.
//!
//! An [`UpstreamRequest`] binds a single try to a pooled encoder. Encode
//! calls arriving before the pool reports readiness are buffered and flushed
//! on `pool_ready`. Response events flow back to the owning stream through
//! the `deliver_*` entry points, which drop everything once the attempt has
//! been canceled, so a retried stream never sees output from an abandoned
//! attempt.

use crate::cluster::{ConnectionPool, HostInfo};
use crate::codec::{DecodeError, StreamDecoder, StreamEncoder, StreamResetReason};
use crate::downstream::{StreamHandle, UpstreamResetType};
use crate::headers::Headers;
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::warn;

pub struct UpstreamRequest {
    stream: StreamHandle,
    pool: Rc<dyn ConnectionPool>,
    encoder: Option<Box<dyn StreamEncoder>>,
    host: Option<HostInfo>,
    canceled: bool,
    connecting: bool,
    pending_headers: Option<(Headers, bool)>,
    pending_data: Vec<(Bytes, bool)>,
    pending_trailers: Option<Headers>,
}

impl UpstreamRequest {
    /// Creates an attempt bound to `stream`, drawing from `pool`.
    pub fn new(stream: StreamHandle, pool: Rc<dyn ConnectionPool>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            stream,
            pool,
            encoder: None,
            host: None,
            canceled: false,
            connecting: false,
            pending_headers: None,
            pending_data: Vec::new(),
            pending_trailers: None,
        }))
    }

    /// The host serving this attempt, once the pool reported ready.
    pub fn host(&self) -> Option<&HostInfo> {
        self.host.as_ref()
    }

    /// True once the attempt was abandoned.
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    // ~~~ engine-side request encoding

    /// Encodes the request header block, acquiring an upstream stream from
    /// the pool on first use.
    pub fn encode_headers(this: &Rc<RefCell<Self>>, headers: Headers, end_stream: bool) {
        let connect = {
            let mut request = this.borrow_mut();
            if request.canceled {
                return;
            }
            if let Some(encoder) = request.encoder.as_mut() {
                if let Err(e) = encoder.encode_headers(&headers, end_stream) {
                    warn!(error = %e, "upstream encode headers failed");
                }
                None
            } else {
                request.pending_headers = Some((headers, end_stream));
                if request.connecting {
                    None
                } else {
                    request.connecting = true;
                    Some(Rc::clone(&request.pool))
                }
            }
        };

        if let Some(pool) = connect {
            pool.new_stream(Rc::clone(this));
        }
    }

    /// Encodes a request data chunk.
    pub fn encode_data(this: &Rc<RefCell<Self>>, data: Bytes, end_stream: bool) {
        let mut request = this.borrow_mut();
        if request.canceled {
            return;
        }
        if let Some(encoder) = request.encoder.as_mut() {
            if let Err(e) = encoder.encode_data(data, end_stream) {
                warn!(error = %e, "upstream encode data failed");
            }
        } else {
            request.pending_data.push((data, end_stream));
        }
    }

    /// Encodes request trailers.
    pub fn encode_trailers(this: &Rc<RefCell<Self>>, trailers: Headers) {
        let mut request = this.borrow_mut();
        if request.canceled {
            return;
        }
        if let Some(encoder) = request.encoder.as_mut() {
            if let Err(e) = encoder.encode_trailers(&trailers) {
                warn!(error = %e, "upstream encode trailers failed");
            }
        } else {
            request.pending_trailers = Some(trailers);
        }
    }

    // ~~~ pool callbacks

    /// The pool bound this attempt to a host. Flushes any buffered request
    /// events through the new encoder.
    pub fn pool_ready(this: &Rc<RefCell<Self>>, mut encoder: Box<dyn StreamEncoder>, host: HostInfo) {
        let mut request = this.borrow_mut();
        if request.canceled {
            encoder.reset_stream(StreamResetReason::LocalReset);
            return;
        }
        request.host = Some(host);
        request.encoder = Some(encoder);
        request.flush_pending();
    }

    /// The pool could not produce a stream; surfaces an upstream reset.
    pub fn pool_failure(this: &Rc<RefCell<Self>>, reason: StreamResetReason, host: Option<HostInfo>) {
        let stream = {
            let mut request = this.borrow_mut();
            if request.canceled {
                return;
            }
            request.canceled = true;
            request.host = host;
            request.stream.clone()
        };
        if let Some(stream) = stream.upgrade() {
            stream
                .borrow_mut()
                .on_upstream_reset(UpstreamResetType::ConnectionFailure, reason);
        }
    }

    fn flush_pending(&mut self) {
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };
        if let Some((headers, end_stream)) = self.pending_headers.take() {
            if let Err(e) = encoder.encode_headers(&headers, end_stream) {
                warn!(error = %e, "upstream encode headers failed");
            }
        }
        for (data, end_stream) in self.pending_data.drain(..) {
            if let Err(e) = encoder.encode_data(data, end_stream) {
                warn!(error = %e, "upstream encode data failed");
            }
        }
        if let Some(trailers) = self.pending_trailers.take() {
            if let Err(e) = encoder.encode_trailers(&trailers) {
                warn!(error = %e, "upstream encode trailers failed");
            }
        }
    }

    // ~~~ upstream response events, posted by the upstream codec

    /// Forwards upstream response headers to the owning stream.
    pub fn deliver_headers(this: &Rc<RefCell<Self>>, headers: Headers, end_stream: bool) {
        let stream = {
            let request = this.borrow();
            if request.canceled {
                return;
            }
            request.stream.clone()
        };
        if let Some(stream) = stream.upgrade() {
            stream.borrow_mut().on_upstream_headers(headers, end_stream);
        }
    }

    /// Forwards an upstream response data chunk to the owning stream.
    pub fn deliver_data(this: &Rc<RefCell<Self>>, data: Bytes, end_stream: bool) {
        let stream = {
            let request = this.borrow();
            if request.canceled {
                return;
            }
            request.stream.clone()
        };
        if let Some(stream) = stream.upgrade() {
            stream.borrow_mut().on_upstream_data(data, end_stream);
        }
    }

    /// Forwards upstream response trailers to the owning stream.
    pub fn deliver_trailers(this: &Rc<RefCell<Self>>, trailers: Headers) {
        let stream = {
            let request = this.borrow();
            if request.canceled {
                return;
            }
            request.stream.clone()
        };
        if let Some(stream) = stream.upgrade() {
            stream.borrow_mut().on_upstream_trailers(trailers);
        }
    }

    /// Surfaces upstream write-buffer back-pressure to the owning stream,
    /// which pauses reads on the downstream side.
    pub fn deliver_above_high_watermark(this: &Rc<RefCell<Self>>) {
        let stream = {
            let request = this.borrow();
            if request.canceled {
                return;
            }
            request.stream.clone()
        };
        if let Some(stream) = stream.upgrade() {
            stream
                .borrow_mut()
                .on_upstream_above_write_buffer_high_watermark();
        }
    }

    /// Dual of [`Self::deliver_above_high_watermark`].
    pub fn deliver_below_low_watermark(this: &Rc<RefCell<Self>>) {
        let stream = {
            let request = this.borrow();
            if request.canceled {
                return;
            }
            request.stream.clone()
        };
        if let Some(stream) = stream.upgrade() {
            stream
                .borrow_mut()
                .on_upstream_below_write_buffer_low_watermark();
        }
    }

    /// Surfaces an upstream stream reset to the owning stream.
    pub fn deliver_reset(this: &Rc<RefCell<Self>>, reason: StreamResetReason) {
        let stream = {
            let mut request = this.borrow_mut();
            if request.canceled {
                return;
            }
            request.canceled = true;
            request.encoder = None;
            request.stream.clone()
        };

        let kind = match reason {
            StreamResetReason::ConnectionFailure => UpstreamResetType::ConnectionFailure,
            StreamResetReason::ConnectionTermination => UpstreamResetType::ConnectionTermination,
            StreamResetReason::Overflow => UpstreamResetType::Overflow,
            StreamResetReason::LocalReset | StreamResetReason::RemoteReset => {
                UpstreamResetType::StreamReset
            }
        };
        if let Some(stream) = stream.upgrade() {
            stream.borrow_mut().on_upstream_reset(kind, reason);
        }
    }

    // ~~~ teardown

    /// Abandons the attempt and resets the pooled encoder.
    pub fn reset_stream(&mut self) {
        self.canceled = true;
        self.pending_headers = None;
        self.pending_data.clear();
        self.pending_trailers = None;
        if let Some(mut encoder) = self.encoder.take() {
            encoder.reset_stream(StreamResetReason::LocalReset);
        }
    }

    /// Abandons the attempt without resetting the (already finished) stream.
    pub fn cancel(&mut self) {
        self.canceled = true;
        self.encoder = None;
    }

    /// Propagates back-pressure to the upstream encoder.
    pub fn read_disable(&mut self, disable: bool) {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.read_disable(disable);
        }
    }
}

/// Decoder half handed to upstream codecs.
///
/// Implements [`StreamDecoder`] by forwarding response events to the owning
/// stream through the attempt, honoring the cancellation guard.
pub struct UpstreamResponseDecoder {
    request: Rc<RefCell<UpstreamRequest>>,
}

impl UpstreamResponseDecoder {
    pub fn new(request: Rc<RefCell<UpstreamRequest>>) -> Self {
        Self { request }
    }
}

impl StreamDecoder for UpstreamResponseDecoder {
    fn on_decode_headers(&mut self, headers: Headers, end_stream: bool) {
        UpstreamRequest::deliver_headers(&self.request, headers, end_stream);
    }

    fn on_decode_data(&mut self, data: Bytes, end_stream: bool) {
        UpstreamRequest::deliver_data(&self.request, data, end_stream);
    }

    fn on_decode_trailers(&mut self, trailers: Headers) {
        UpstreamRequest::deliver_trailers(&self.request, trailers);
    }

    fn on_decode_error(&mut self, _error: DecodeError, _headers: Headers) {
        UpstreamRequest::deliver_reset(&self.request, StreamResetReason::RemoteReset);
    }
}
