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

//! FastCGI wire protocol: record headers, fixed-body records, and the
//! name/value parameter encoding (spec §4.3).
//!
//! An 8-byte header precedes every record: version, type, stream id
//! (big-endian), content length (big-endian), padding length, and a
//! reserved byte. Content follows, then 0-255 bytes of padding whose
//! contents are ignored on read.

mod params;

pub use params::{decode_params, encode_params, ParamLength};

use std::fmt;

/// FastCGI protocol version 1, the only version this core speaks.
pub const VERSION_1: u8 = 1;

/// Maximum content length of a single record (content length is a u16).
pub const MAX_CONTENT_LENGTH: usize = 0xffff;

/// Size in bytes of a FastCGI record header.
pub const HEADER_LEN: usize = 8;

/// FastCGI record types used by this core (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    /// Begin a request. Sent to the application.
    BeginRequest = 1,
    /// Cancel a request. Sent to the application.
    AbortRequest = 2,
    /// End of a request's lifecycle. Received from the application.
    EndRequest = 3,
    /// Request parameters (CGI-style name/value pairs). Sent to the application.
    Params = 4,
    /// Request body bytes. Sent to the application.
    Stdin = 5,
    /// Response bytes. Received from the application.
    Stdout = 6,
    /// Application log bytes. Received from the application.
    Stderr = 7,
    /// Filter-role secondary input. Unused by the RESPONDER role this core drives.
    Data = 8,
    /// Query application capabilities. Sent to the application.
    GetValues = 9,
    /// Reply to `GetValues`. Received from the application.
    GetValuesResult = 10,
    /// Reply to an unsupported management record type. Received from the application.
    UnknownType = 11,
}

impl RequestType {
    /// Decodes a raw type byte, mapping anything unrecognized to
    /// `UnknownType` the way the wire protocol requires (unknown management
    /// types must still be replied to, not rejected outright).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            _ => Self::UnknownType,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// FastCGI application roles. This core only ever requests `Responder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    /// Respond to a request (the only role an HTTP reverse proxy needs).
    Responder = 1,
    /// Authorize a request. Unused.
    Authorizer = 2,
    /// Filter a request. Unused.
    Filter = 3,
}

/// Protocol status carried in `END_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// The request ran to completion.
    RequestComplete = 0,
    /// The application can't multiplex connections.
    CantMpxConn = 1,
    /// The application is too busy.
    Overloaded = 2,
    /// The application doesn't support the requested role.
    UnknownRole = 3,
}

impl ProtocolStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::RequestComplete,
            1 => Self::CantMpxConn,
            2 => Self::Overloaded,
            _ => Self::UnknownRole,
        }
    }
}

/// A decoded (or about-to-be-encoded) FastCGI record header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Protocol version. Always [`VERSION_1`] for records we emit.
    pub version: u8,
    /// Record type.
    pub r#type: RequestType,
    /// Stream (request) id this record belongs to. 0 is the management
    /// pseudo-stream.
    pub request_id: u16,
    /// Length of the content that follows the header.
    pub content_length: u16,
    /// Length of the padding that follows the content.
    pub padding_length: u8,
}

impl Header {
    /// Builds a header for `content`, choosing padding to round the record
    /// up to a multiple of 8 bytes the way the reference implementation
    /// does, purely as a minor efficiency for the receiving application; not
    /// required by the protocol.
    pub fn new(r#type: RequestType, request_id: u16, content_len: usize) -> Self {
        let content_length = content_len.min(MAX_CONTENT_LENGTH) as u16;
        let padding_length = (-(content_length as i16) & 7) as u8;
        Self {
            version: VERSION_1,
            r#type,
            request_id,
            content_length,
            padding_length,
        }
    }

    /// Encodes the header to its 8-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.version;
        buf[1] = self.r#type as u8;
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf[7] = 0; // reserved
        buf
    }

    /// Decodes a header from an exact 8-byte slice.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: buf[0],
            r#type: RequestType::from_u8(buf[1]),
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }
}

/// `BEGIN_REQUEST` body: role (2, BE), flags (1, bit 0 = keep-conn), 5
/// reserved bytes.
#[derive(Debug, Clone, Copy)]
pub struct BeginRequestBody {
    /// Application role requested.
    pub role: Role,
    /// Whether the application should keep the connection alive once this
    /// request ends.
    pub keep_conn: bool,
}

impl BeginRequestBody {
    /// Encodes the 8-byte body.
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&(self.role as u16).to_be_bytes());
        buf[2] = self.keep_conn as u8;
        buf
    }
}

/// `END_REQUEST` body: app status (4, BE), protocol status (1), 3 reserved
/// bytes.
#[derive(Debug, Clone, Copy)]
pub struct EndRequestBody {
    /// Application-defined exit/status code.
    pub app_status: u32,
    /// Protocol-level completion status.
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    /// Decodes an 8-byte `END_REQUEST` body.
    ///
    /// Returns `None` if `buf` is not exactly 8 bytes (spec §7: a bad
    /// `END_REQUEST` length is a protocol error).
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != 8 {
            return None;
        }
        Some(Self {
            app_status: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            protocol_status: ProtocolStatus::from_u8(buf[4]),
        })
    }
}

/// Encodes a complete record (header + content + padding) into `out`.
pub fn encode_record(out: &mut Vec<u8>, r#type: RequestType, request_id: u16, content: &[u8]) {
    let header = Header::new(r#type, request_id, content.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(content);
    out.resize(out.len() + header.padding_length as usize, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = Header::new(RequestType::Stdout, 7, 300);
        let encoded = h.encode();
        let decoded = Header::decode(&encoded);
        assert_eq!(decoded.encode(), encoded);
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.content_length, 300);
        assert!(matches!(decoded.r#type, RequestType::Stdout));
    }

    #[test]
    fn header_padding_covers_0_through_255() {
        // Exercise every possible padding remainder, not just the boundary.
        for content_len in 0..=16usize {
            let h = Header::new(RequestType::Stdin, 1, content_len);
            assert!(h.padding_length <= 7);
            assert_eq!((content_len + h.padding_length as usize) % 8, 0);
        }
    }

    #[test]
    fn end_request_body_rejects_wrong_length() {
        assert!(EndRequestBody::decode(&[0u8; 7]).is_none());
        assert!(EndRequestBody::decode(&[0u8; 9]).is_none());
        let body = EndRequestBody::decode(&[0, 0, 0, 42, 0, 0, 0, 0]).unwrap();
        assert_eq!(body.app_status, 42);
        assert!(matches!(body.protocol_status, ProtocolStatus::RequestComplete));
    }

    #[test]
    fn unknown_request_type_maps_to_unknown_type() {
        assert!(matches!(RequestType::from_u8(200), RequestType::UnknownType));
    }
}
