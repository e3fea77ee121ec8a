//! Abstract stream codec contract.
//!
//! The engine never parses bytes off the wire. A downstream codec decodes
//! client requests and drives [`crate::downstream::ActiveStream`] through its
//! `on_decode_*` entry points; the engine writes the response back through a
//! [`StreamEncoder`] the codec supplied at stream creation. The upstream
//! direction is the dual, driven through [`crate::upstream::UpstreamRequest`].
//!
//! # Delivery contract
//!
//! Every stream lives on one cooperative execution context. Codec and pool
//! implementations must not invoke engine callbacks re-entrantly from within
//! an engine-initiated call (`encode_*`, `reset_stream`,
//! `ConnectionPool::new_stream`): events are posted and delivered after the
//! current callback returns, normally via `tokio::task::spawn_local`. A
//! `reset_stream` issued *by* the engine is likewise not echoed back to the
//! stream's event listener.

use crate::error::Result;
use crate::headers::Headers;
use bytes::Bytes;

/// Name of the synthetic status header written by hijack replies and read
/// back by codecs when rendering a response.
pub const STATUS_HEADER: &str = ":status";

/// Tagged cause of a stream abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamResetReason {
    /// Reset initiated by this proxy.
    LocalReset,
    /// Reset initiated by the peer.
    RemoteReset,
    /// The underlying connection could not be established.
    ConnectionFailure,
    /// The underlying connection went away mid-stream.
    ConnectionTermination,
    /// The stream was refused due to resource pressure.
    Overflow,
}

/// Synthetic response statuses used by hijack replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HijackCode {
    /// No route or no known cluster for the request.
    RouterUnavailable,
    /// No pool, or an unrecoverable upstream reset.
    NoHealthyUpstream,
    /// The downstream codec reported a framing error.
    CodecException,
    /// The downstream codec reported a deserialization error.
    DeserializeException,
    /// Any other decode failure.
    Unknown,
    /// A per-try or global timeout expired before a response started.
    TimeoutException,
}

impl HijackCode {
    /// Numeric status written into [`STATUS_HEADER`].
    pub fn as_u16(self) -> u16 {
        match self {
            HijackCode::RouterUnavailable => 404,
            HijackCode::NoHealthyUpstream => 502,
            HijackCode::CodecException => 400,
            HijackCode::DeserializeException => 422,
            HijackCode::Unknown => 500,
            HijackCode::TimeoutException => 504,
        }
    }
}

/// Decode failures surfaced by a downstream codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Protocol framing violated.
    Codec(String),
    /// Frame parsed but the payload could not be deserialized.
    Deserialize(String),
    /// Anything else.
    Other(String),
}

impl DecodeError {
    /// The hijack status a stream replies with for this error.
    pub fn hijack_code(&self) -> HijackCode {
        match self {
            DecodeError::Codec(_) => HijackCode::CodecException,
            DecodeError::Deserialize(_) => HijackCode::DeserializeException,
            DecodeError::Other(_) => HijackCode::Unknown,
        }
    }
}

/// Write half of a stream, implemented by codecs.
///
/// The downstream codec's encoder renders the response to the client; an
/// upstream pool's encoder renders the request to the chosen host.
pub trait StreamEncoder {
    /// Encodes the header block. `end_stream` marks the message complete.
    fn encode_headers(&mut self, headers: &Headers, end_stream: bool) -> Result<()>;

    /// Encodes a data chunk.
    fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<()>;

    /// Encodes trailers; always ends the message.
    fn encode_trailers(&mut self, trailers: &Headers) -> Result<()>;

    /// Aborts the stream. Must not re-invoke the stream's event listener.
    fn reset_stream(&mut self, reason: StreamResetReason);

    /// Enables or disables reads on the paired stream (back-pressure).
    fn read_disable(&mut self, _disable: bool) {}
}

/// Read half of a stream: the sink a codec decodes into.
///
/// [`crate::downstream::ActiveStream`] implements this for the downstream
/// request; [`crate::upstream::UpstreamRequest`] implements it for the
/// upstream response.
pub trait StreamDecoder {
    /// First event of a message.
    fn on_decode_headers(&mut self, headers: Headers, end_stream: bool);

    /// A body chunk.
    fn on_decode_data(&mut self, data: Bytes, end_stream: bool);

    /// Trailers; always the last event.
    fn on_decode_trailers(&mut self, trailers: Headers);

    /// A decode failure. No further events follow.
    fn on_decode_error(&mut self, error: DecodeError, headers: Headers);
}

/// Stream lifecycle events delivered by a codec to interested parties.
pub trait StreamEventListener {
    /// The stream was aborted by the peer or the transport.
    fn on_reset_stream(&mut self, reason: StreamResetReason);

    /// The write buffer crossed its high watermark.
    fn on_above_write_buffer_high_watermark(&mut self) {}

    /// The write buffer drained below its low watermark.
    fn on_below_write_buffer_low_watermark(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hijack_code_values() {
        assert_eq!(HijackCode::RouterUnavailable.as_u16(), 404);
        assert_eq!(HijackCode::NoHealthyUpstream.as_u16(), 502);
        assert_eq!(HijackCode::TimeoutException.as_u16(), 504);
    }

    #[test]
    fn test_decode_error_mapping() {
        assert_eq!(
            DecodeError::Codec("bad frame".into()).hijack_code(),
            HijackCode::CodecException
        );
        assert_eq!(
            DecodeError::Deserialize("bad payload".into()).hijack_code(),
            HijackCode::DeserializeException
        );
        assert_eq!(
            DecodeError::Other("??".into()).hijack_code(),
            HijackCode::Unknown
        );
    }
}
