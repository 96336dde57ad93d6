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

//! FastCGI stream: one request/response exchange multiplexed over a
//! connection (spec §3 "FCGI stream", §4.4 "Stream states and
//! transitions").

use bytes::BytesMut;

use crate::htx::Htx;
use crate::http1::Http1Response;
use crate::record::ProtocolStatus;

/// A stream's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Freshly created, nothing sent yet.
    Idle,
    /// `BEGIN_REQUEST` sent, exchange in progress.
    Open,
    /// Half-closed: this side is done sending (`STDIN` terminated).
    Hloc,
    /// Half-closed: the peer is done sending (empty `STDOUT` or
    /// `END_REQUEST` seen).
    Hrem,
    /// A protocol or transport error occurred.
    Error,
    /// Both directions closed; terminal.
    Closed,
}

/// Per-stream flag bits (spec §3 "FCGI stream", attributes).
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamFlags {
    /// `BEGIN_REQUEST` has been emitted.
    pub begin_sent: bool,
    /// The empty `PARAMS` record (end-of-params) has been emitted.
    pub empty_params_sent: bool,
    /// The empty `STDIN` record (end-of-stdin) has been emitted.
    pub end_of_stdin_sent: bool,
    /// `ABORT_REQUEST` has been emitted.
    pub abort_sent: bool,
    /// An empty `STDOUT` (end-of-response) has been received.
    pub end_of_stdout_received: bool,
    /// The upper layer asked to shut down the read side.
    pub want_shutr: bool,
    /// The upper layer asked to shut down the write side.
    pub want_shutw: bool,
    /// Send is blocked on mux buffer room or a busy ring slot.
    pub mux_blocked: bool,
    /// Already woken this mux pass; skip re-notifying.
    pub notified: bool,
}

/// One request/response exchange.
#[derive(Debug)]
pub struct Stream {
    /// Wire id; 0 until the first record is ready to be emitted.
    pub id: u16,
    /// Lifecycle state.
    pub state: StreamState,
    /// Flag bits.
    pub flags: StreamFlags,
    /// Bytes received from the application (raw `STDOUT` payload), fed into
    /// `response`.
    pub recv_buf: BytesMut,
    /// Reused HTTP/1 response parser state for this stream's `STDOUT`.
    pub response: Http1Response,
    /// Outgoing message blocks not yet fully sent.
    pub outgoing: Htx,
    /// Final protocol status from `END_REQUEST`, once closed.
    pub protocol_status: Option<ProtocolStatus>,
    /// Final application status from `END_REQUEST`, once closed.
    pub app_status: Option<u32>,
    /// Whether this stream is linked into the connection's send list.
    pub in_send_list: bool,
}

impl Stream {
    /// A fresh, unsent stream.
    pub fn new() -> Self {
        Self {
            id: 0,
            state: StreamState::Idle,
            flags: StreamFlags::default(),
            recv_buf: BytesMut::new(),
            response: Http1Response::new(),
            outgoing: Htx::new(),
            protocol_status: None,
            app_status: None,
            in_send_list: false,
        }
    }

    /// Whether the stream has reached a state that no longer accepts
    /// incoming record payload (closed or errored).
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Error)
    }

    /// Records receipt of empty `STDOUT`: authoritative end of response
    /// (spec §4.4 "A peer's end-of-stdout ... is the authoritative end of
    /// response").
    pub fn mark_end_of_stdout(&mut self) {
        self.flags.end_of_stdout_received = true;
        if self.state == StreamState::Open {
            self.state = StreamState::Hrem;
        }
    }

    /// Applies an incoming `END_REQUEST`: moves to `CLOSED` regardless of
    /// prior state (spec §4.4).
    pub fn mark_end_request(&mut self, app_status: u32, protocol_status: ProtocolStatus) {
        self.app_status = Some(app_status);
        self.protocol_status = Some(protocol_status);
        self.flags.end_of_stdout_received = true;
        self.state = StreamState::Closed;
    }

    /// Marks the stream errored, e.g. on a protocol violation or transport
    /// failure.
    pub fn mark_error(&mut self) {
        self.state = StreamState::Error;
    }

    /// Feeds newly arrived `STDOUT` bytes through the HTTP/1 response
    /// parser, draining `recv_buf` as the parser consumes it (spec §6
    /// "HTTP/1 response parser").
    pub fn pump_response_parser(&mut self) -> Result<(), crate::http1::Http1Error> {
        loop {
            let before = self.recv_buf.len();
            let consumed = match self.response.state {
                crate::http1::State::Start | crate::http1::State::First | crate::http1::State::Headers => {
                    self.response.parse_headers(&self.recv_buf, 0, self.recv_buf.len())?
                }
                crate::http1::State::Trailers => self.response.parse_trailers(&self.recv_buf, 0, self.recv_buf.len())?,
                crate::http1::State::Done => 0,
                _ => self.response.parse_data(&self.recv_buf, 0, self.recv_buf.len())?,
            };
            if consumed > 0 {
                let _ = self.recv_buf.split_to(consumed);
            }
            if consumed == 0 || before == 0 {
                return Ok(());
            }
        }
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}
