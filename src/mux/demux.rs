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

//! The demultiplexer algorithm (spec §4.4 "Demultiplexer algorithm
//! (`process_demux`)").

use tracing::{error, trace, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::mux::muxer::{ConnState, Connection};
use crate::mux::stream::StreamState;
use crate::record::{self, EndRequestBody, Header, RequestType, HEADER_LEN};
use crate::transport::Transport;

/// Reserved pseudo stream id for management records (`GET_VALUES_RESULT`,
/// `UNKNOWN_TYPE`).
const MANAGEMENT_STREAM: u16 = 0;

impl<T: Transport> Connection<T> {
    /// Runs the demux state machine over whatever is currently buffered,
    /// mirroring spec §4.4's `process_demux` loop: "while the demux buffer
    /// has data and state ≠ CLOSED".
    pub(crate) fn process_demux(&mut self) -> DispatchResult<()> {
        loop {
            match self.state {
                ConnState::Closed | ConnState::Init => return Ok(()),
                ConnState::Settings => {
                    let Some(header) = self.try_decode_header() else { return Ok(()) };
                    if header.request_id != 0 || header.r#type != RequestType::GetValuesResult {
                        self.state = ConnState::Closed;
                        return Err(DispatchError::BadGetValuesResult);
                    }
                    self.load_demux_cursor(header);
                    self.state = ConnState::RecordD;
                }
                ConnState::RecordH => {
                    let Some(header) = self.try_decode_header() else { return Ok(()) };
                    trace!(stream_id = header.request_id, r#type = %header.r#type, len = header.content_length, "demux header");
                    self.load_demux_cursor(header);
                    self.state = ConnState::RecordD;
                }
                ConnState::RecordD => self.step_record_data()?,
                ConnState::RecordP => {
                    if !self.drain_padding() {
                        return Ok(());
                    }
                    self.state = ConnState::RecordH;
                }
            }
        }
    }

    fn try_decode_header(&mut self) -> Option<Header> {
        if self.demux_buf.len() < HEADER_LEN {
            self.flags.dem_short_read = true;
            return None;
        }
        self.flags.dem_short_read = false;
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&self.demux_buf[..HEADER_LEN]);
        let _ = self.demux_buf.split_to(HEADER_LEN);
        Some(Header::decode(&raw))
    }

    fn load_demux_cursor(&mut self, header: Header) {
        self.demux.stream_id = header.request_id;
        self.demux.record_type = header.r#type as u8;
        self.demux.remaining_payload = header.content_length as usize;
        self.demux.remaining_padding = header.padding_length as usize;
    }

    fn drain_padding(&mut self) -> bool {
        let n = self.demux.remaining_padding.min(self.demux_buf.len());
        let _ = self.demux_buf.split_to(n);
        self.demux.remaining_padding -= n;
        self.demux.remaining_padding == 0
    }

    fn step_record_data(&mut self) -> DispatchResult<()> {
        let dsi = self.demux.stream_id;
        let drt = RequestType::from_u8(self.demux.record_type);

        let stream_absent = dsi != MANAGEMENT_STREAM && (dsi as i32 > self.max_id || !self.streams.contains_key(&dsi));
        let stream_closed = self
            .streams
            .get(&dsi)
            .map(|s| s.state == StreamState::Closed)
            .unwrap_or(false);

        if dsi != MANAGEMENT_STREAM && (stream_absent || stream_closed) {
            if !self.drain_record_body() {
                return Ok(());
            }
            self.state = ConnState::RecordH;
            return Ok(());
        }

        match drt {
            RequestType::GetValuesResult => self.handle_get_values_result()?,
            RequestType::Stdout if self.demux.remaining_payload > 0 => self.handle_stdout_chunk(dsi)?,
            RequestType::Stdout => {
                if let Some(stream) = self.streams.get_mut(&dsi) {
                    stream.mark_end_of_stdout();
                }
                if !self.drain_padding_only() {
                    return Ok(());
                }
                self.state = ConnState::RecordH;
            }
            RequestType::Stderr => self.handle_stderr(dsi)?,
            RequestType::EndRequest => self.handle_end_request(dsi)?,
            RequestType::UnknownType => {
                if !self.drain_record_body() {
                    return Ok(());
                }
                self.state = ConnState::RecordH;
            }
            _ => {
                warn!(r#type = %drt, "unexpected record type from application");
                if !self.drain_record_body() {
                    return Ok(());
                }
                self.state = ConnState::RecordH;
            }
        }
        Ok(())
    }

    fn drain_record_body(&mut self) -> bool {
        let n = self.demux.remaining_payload.min(self.demux_buf.len());
        let _ = self.demux_buf.split_to(n);
        self.demux.remaining_payload -= n;
        if self.demux.remaining_payload > 0 {
            return false;
        }
        self.drain_padding_only()
    }

    fn drain_padding_only(&mut self) -> bool {
        if self.demux.remaining_padding == 0 {
            return true;
        }
        self.state = ConnState::RecordP;
        self.drain_padding()
    }

    fn handle_stdout_chunk(&mut self, dsi: u16) -> DispatchResult<()> {
        let n = self.demux.remaining_payload.min(self.demux_buf.len());
        if n == 0 {
            self.flags.dem_short_read = true;
            return Ok(());
        }
        let chunk = self.demux_buf.split_to(n);
        self.demux.remaining_payload -= n;
        if let Some(stream) = self.streams.get_mut(&dsi) {
            stream.recv_buf.extend_from_slice(&chunk);
            let _ = stream.pump_response_parser();
        }
        if self.demux.remaining_payload == 0 {
            if !self.drain_padding_only() {
                return Ok(());
            }
            self.state = ConnState::RecordH;
        }
        Ok(())
    }

    fn handle_stderr(&mut self, dsi: u16) -> DispatchResult<()> {
        let n = self.demux.remaining_payload.min(self.demux_buf.len());
        let chunk = self.demux_buf.split_to(n);
        self.demux.remaining_payload -= n;
        if !chunk.is_empty() {
            error!(stream_id = dsi, "{}", String::from_utf8_lossy(&chunk));
        }
        if self.demux.remaining_payload == 0 {
            if !self.drain_padding_only() {
                return Ok(());
            }
            self.state = ConnState::RecordH;
        }
        Ok(())
    }

    fn handle_end_request(&mut self, dsi: u16) -> DispatchResult<()> {
        if self.demux_buf.len() < self.demux.remaining_payload {
            self.flags.dem_short_read = true;
            return Ok(());
        }
        let body = self.demux_buf.split_to(self.demux.remaining_payload);
        self.demux.remaining_payload = 0;
        let decoded = EndRequestBody::decode(&body).ok_or(DispatchError::BadEndRequestLength { len: body.len() })?;
        if let Some(stream) = self.streams.get_mut(&dsi) {
            stream.mark_end_request(decoded.app_status, decoded.protocol_status);
        }
        if !self.drain_padding_only() {
            return Ok(());
        }
        self.state = ConnState::RecordH;
        Ok(())
    }

    fn handle_get_values_result(&mut self) -> DispatchResult<()> {
        if self.demux_buf.len() < self.demux.remaining_payload {
            if self.gvr_buf.capacity() == 0 && self.demux.remaining_payload > self.demux_buf.capacity() {
                self.state = ConnState::Closed;
                return Err(DispatchError::BadGetValuesResult);
            }
            self.flags.dem_short_read = true;
            return Ok(());
        }
        let body = self.demux_buf.split_to(self.demux.remaining_payload);
        self.demux.remaining_payload = 0;
        let pairs = record::decode_params(&body).map_err(|_| DispatchError::BadGetValuesResult)?;
        self.apply_get_values_result(&pairs);
        if !self.drain_padding_only() {
            return Ok(());
        }
        self.state = ConnState::RecordH;
        Ok(())
    }
}
