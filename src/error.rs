// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types and result type aliases for the dispatch core.
//!
//! Mirrors the shape of a small, focused `thiserror` enum: one variant per
//! distinguishable failure in spec §7, wrapping `tokio::io::Error` where the
//! failure originates from the transport.

use crate::record::RequestType;

/// Result type alias used throughout the crate.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors the dispatch core can surface.
///
/// Several rows of the spec's error table (short read, buffer-alloc-pending,
/// outgoing-buffer-full) are not represented here: they are recoverable
/// control flow and show up as `Poll::Pending`/retry rather than as an
/// `Err`. This enum covers the non-recoverable and stream-local cases.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Transport I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A record referenced a stream id that is not known to the connection.
    #[error("record referenced unknown stream id `{id}`")]
    UnknownStream {
        /// The stream id found in the record header.
        id: u16,
    },

    /// A record type appeared that this core does not expect to receive.
    #[error("unexpected record type `{request_type}` received from application")]
    UnexpectedRequestType {
        /// The unexpected record type.
        request_type: RequestType,
    },

    /// The peer's `GET_VALUES_RESULT` was malformed or exceeded the demux
    /// buffer; this is a protocol error and closes the connection.
    #[error("GET_VALUES_RESULT record is malformed or exceeds the demux buffer")]
    BadGetValuesResult,

    /// `END_REQUEST` carried a body of a length other than 8.
    #[error("END_REQUEST body length `{len}` is not 8")]
    BadEndRequestLength {
        /// The length actually observed.
        len: usize,
    },

    /// The peer does not support multiplexing and a second stream was
    /// attempted on a connection whose `streams_limit` is 1.
    #[error("no stream slots available on this connection")]
    NoStreamsAvailable,

    /// All odd stream ids up to `0x7FFF` have been handed out on this
    /// connection.
    #[error("stream id space exhausted on this connection")]
    StreamIdExhausted,

    /// The application returned a protocol status other than
    /// `REQUEST_COMPLETE`.
    #[error("application can't multiplex connections [FCGI_CANT_MPX_CONN]; app_status={app_status}")]
    EndRequestCantMpxConn {
        /// The application status code carried alongside the protocol status.
        app_status: u32,
    },

    /// See [`DispatchError::EndRequestCantMpxConn`].
    #[error("application overloaded [FCGI_OVERLOADED]; app_status={app_status}")]
    EndRequestOverloaded {
        /// The application status code carried alongside the protocol status.
        app_status: u32,
    },

    /// See [`DispatchError::EndRequestCantMpxConn`].
    #[error("application does not know this role [FCGI_UNKNOWN_ROLE]; app_status={app_status}")]
    EndRequestUnknownRole {
        /// The application status code carried alongside the protocol status.
        app_status: u32,
    },

    /// The decoded path contained a NUL or LF byte, or the configured
    /// path-info regex did not match.
    #[error("path-info rejected before BEGIN_REQUEST: {reason}")]
    PathInfoRejected {
        /// Human-readable rejection reason.
        reason: &'static str,
    },

    /// The peer closed the transport (`read0`) while streams were still
    /// awaiting `end-of-stdout`.
    #[error("peer closed the connection with requests still in flight")]
    PeerClosedEarly,

    /// The connection's idle or shutdown timeout elapsed.
    #[error("connection timed out")]
    Timeout,

    /// A memory/queue-capacity failure (the only failure mode of enqueue).
    #[error("out of memory enqueuing pending connection")]
    OutOfMemory,
}

impl DispatchError {
    /// Builds the appropriate `EndRequest*` error from a protocol status and
    /// application status, mirroring
    /// `ProtocolStatus::convert_to_client_result` in the teacher crate.
    pub(crate) fn from_protocol_status(
        status: crate::record::ProtocolStatus, app_status: u32,
    ) -> Option<Self> {
        use crate::record::ProtocolStatus::*;
        match status {
            RequestComplete => None,
            CantMpxConn => Some(Self::EndRequestCantMpxConn { app_status }),
            Overloaded => Some(Self::EndRequestOverloaded { app_status }),
            UnknownRole => Some(Self::EndRequestUnknownRole { app_status }),
        }
    }
}
