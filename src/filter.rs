//! Stream filter chains.
//!
//! Filters are ordered interceptors woven into the decode (request) and
//! encode (response) paths of a stream. Each callback returns a
//! [`FilterStatus`] telling the engine whether to keep traversing, pause the
//! chain, or short-circuit with a hijack reply. A paused filter resumes the
//! chain later through [`crate::downstream::ActiveStream::continue_decoding`]
//! or [`continue_encoding`](crate::downstream::ActiveStream::continue_encoding);
//! traversal restarts at the *next* filter, never the same one.

use crate::codec::HijackCode;
use crate::downstream::StreamHandle;
use crate::headers::Headers;
use bytes::Bytes;

/// Outcome of one filter callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Proceed to the next filter, or to the post-chain sink if none remain.
    Continue,
    /// Stop traversal; the filter will resume the chain later.
    StopIteration,
    /// Stop traversal and let the engine buffer subsequent data until the
    /// filter resumes.
    StopAndBuffer,
    /// Short-circuit both chains with a synthetic reply.
    Hijack(HijackCode),
}

/// Interceptor on the decode (downstream request) path.
pub trait StreamDecoderFilter {
    fn on_headers(&mut self, headers: &mut Headers, end_stream: bool) -> FilterStatus;

    fn on_data(&mut self, data: &mut Bytes, end_stream: bool) -> FilterStatus;

    fn on_trailers(&mut self, trailers: &mut Headers) -> FilterStatus;

    /// Called exactly once when the stream reaches its terminal state.
    fn on_destroy(&mut self) {}
}

/// Interceptor on the encode (downstream response) path.
pub trait StreamEncoderFilter {
    fn on_headers(&mut self, headers: &mut Headers, end_stream: bool) -> FilterStatus;

    fn on_data(&mut self, data: &mut Bytes, end_stream: bool) -> FilterStatus;

    fn on_trailers(&mut self, trailers: &mut Headers) -> FilterStatus;

    /// Called exactly once when the stream reaches its terminal state.
    fn on_destroy(&mut self) {}
}

/// Registration surface handed to a [`FilterChainFactory`].
pub trait FilterManager {
    fn add_decoder_filter(&mut self, filter: Box<dyn StreamDecoderFilter>);

    fn add_encoder_filter(&mut self, filter: Box<dyn StreamEncoderFilter>);
}

/// Installs user filters on each new stream.
///
/// The factory receives a weak handle to the stream so that filters doing
/// async work can resume the chain after their callback returned.
pub trait FilterChainFactory {
    fn create_filter_chain(&self, stream: StreamHandle, manager: &mut dyn FilterManager);
}

/// A pass-through filter, useful as a chain placeholder.
#[derive(Debug, Default)]
pub struct IdentityFilter;

impl StreamDecoderFilter for IdentityFilter {
    fn on_headers(&mut self, _headers: &mut Headers, _end_stream: bool) -> FilterStatus {
        FilterStatus::Continue
    }

    fn on_data(&mut self, _data: &mut Bytes, _end_stream: bool) -> FilterStatus {
        FilterStatus::Continue
    }

    fn on_trailers(&mut self, _trailers: &mut Headers) -> FilterStatus {
        FilterStatus::Continue
    }
}

impl StreamEncoderFilter for IdentityFilter {
    fn on_headers(&mut self, _headers: &mut Headers, _end_stream: bool) -> FilterStatus {
        FilterStatus::Continue
    }

    fn on_data(&mut self, _data: &mut Bytes, _end_stream: bool) -> FilterStatus {
        FilterStatus::Continue
    }

    fn on_trailers(&mut self, _trailers: &mut Headers) -> FilterStatus {
        FilterStatus::Continue
    }
}
