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

//! The FastCGI connection: multiplexer state, stream table, and the send
//! path (spec §3 "FCGI connection", §4.4 "Multiplexer algorithm", "Per-
//! stream send path").

use std::collections::{BTreeMap, VecDeque};
use std::future::poll_fn;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::FcgiAppConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::htx::{Htx, HtxBlock};
use crate::mux::params_builder::{build_params, request_line_from_start_line};
use crate::mux::stream::{Stream, StreamState};
use crate::record::{encode_record, BeginRequestBody, RequestType, Role, MAX_CONTENT_LENGTH};
use crate::transport::Transport;

/// Number of outgoing buffers a connection's mux ring holds before a
/// sending stream must wait (spec §4.4 "Flow control & back-pressure").
pub const MAX_MUX_BUFFERS: usize = 32;

/// The highest odd stream id a connection may hand out (spec §3).
pub const MAX_STREAM_ID: u16 = 0x7FFF;

/// Connection lifecycle state (spec §3, §4.4 "Connection states").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Freshly attached; nothing transmitted yet.
    Init,
    /// `GET_VALUES` sent, awaiting `GET_VALUES_RESULT`.
    Settings,
    /// At a record boundary.
    RecordH,
    /// Within a record's payload.
    RecordD,
    /// Within a record's padding.
    RecordP,
    /// Terminal; only drains pending aborts.
    Closed,
}

/// Sticky blocking-reason bits (spec §4.4 "Flow control & back-pressure").
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnFlags {
    /// Demuxer short on readable bytes.
    pub dem_short_read: bool,
    /// Demuxer's receive-side buffer is full.
    pub dem_sfull: bool,
    /// Outgoing mux ring is full.
    pub mux_mfull: bool,
    /// Peer half-closed the transport.
    pub eos: bool,
    /// The transport entered an error state.
    pub error: bool,
    /// `KEEP_CONN` may be set on outgoing `BEGIN_REQUEST`s.
    pub keep_alive_allowed: bool,
    /// The peer supports multiplexed connections.
    pub mpx_allowed: bool,
    /// A `GET_VALUES` probe has been sent.
    pub get_values_requested: bool,
    /// `ABORT_REQUEST` best-effort pass has been attempted for this
    /// connection's closure.
    pub aborts_sent: bool,
    /// The abort pass above got stuck on a full mux ring.
    pub aborts_failed: bool,
}

/// In-progress demux cursor (spec §3 "demux state").
#[derive(Debug, Default)]
pub(crate) struct DemuxCursor {
    pub(crate) stream_id: u16,
    pub(crate) record_type: u8,
    pub(crate) remaining_payload: usize,
    pub(crate) remaining_padding: usize,
}

/// One FastCGI connection: owns its buffers, stream table, and timeout
/// bookkeeping (spec §3 "FCGI connection").
pub struct Connection<T: Transport> {
    pub(crate) transport: T,
    pub(crate) config: std::sync::Arc<FcgiAppConfig>,
    pub(crate) state: ConnState,
    pub(crate) flags: ConnFlags,
    pub(crate) demux_buf: BytesMut,
    pub(crate) demux: DemuxCursor,
    pub(crate) streams: BTreeMap<u16, Stream>,
    pub(crate) max_id: i32,
    pub(crate) streams_limit: u16,
    pub(crate) send_list: VecDeque<u16>,
    pub(crate) mux_ring: VecDeque<Bytes>,
    pub(crate) scratch_out: BytesMut,
    pub(crate) last_activity: Instant,
    pub(crate) idle_timeout: Duration,
    pub(crate) gvr_buf: BytesMut,
}

impl<T: Transport> Connection<T> {
    /// Builds a connection over `transport`, not yet having sent anything
    /// (spec §6 `init`).
    pub fn new(transport: T, config: std::sync::Arc<FcgiAppConfig>, idle_timeout: Duration) -> Self {
        Self {
            transport,
            state: ConnState::Init,
            flags: ConnFlags {
                keep_alive_allowed: config.keep_conn,
                mpx_allowed: config.mpxs_supported,
                ..ConnFlags::default()
            },
            config,
            demux_buf: BytesMut::new(),
            demux: DemuxCursor::default(),
            streams: BTreeMap::new(),
            max_id: -1,
            streams_limit: 1,
            send_list: VecDeque::new(),
            mux_ring: VecDeque::new(),
            scratch_out: BytesMut::new(),
            last_activity: Instant::now(),
            idle_timeout,
            gvr_buf: BytesMut::new(),
        }
    }

    /// Number of stream slots still available (spec §6 `avail_streams`).
    pub fn avail_streams(&self) -> u16 {
        self.streams_limit.saturating_sub(self.streams.len() as u16)
    }

    /// Number of streams currently tracked (spec §6 `used_streams`).
    pub fn used_streams(&self) -> usize {
        self.streams.len()
    }

    /// Attaches a new stream, failing if no slot is available (spec §6
    /// `attach`).
    pub fn attach(&mut self) -> DispatchResult<u16> {
        if self.state == ConnState::Closed {
            return Err(DispatchError::NoStreamsAvailable);
        }
        // Settings negotiation (spec §4.4 INIT: "first transmit must either
        // emit GET_VALUES ... and move to SETTINGS") must be queued before
        // any request records; run it now so the first stream's snd_buf
        // can't race ahead of it on the mux ring.
        if self.state == ConnState::Init {
            self.process_mux();
        }
        if self.avail_streams() == 0 {
            return Err(DispatchError::NoStreamsAvailable);
        }
        // Id 0 is a placeholder; the real id is assigned lazily on first send
        // (spec §4.4 "Per-stream send path"). We key provisional streams by a
        // temporary negative-space id to keep them out of `streams_by_id`
        // until `ensure_stream_id` runs; simplest correct approach here is to
        // assign eagerly, since this core has no reason to delay beyond the
        // real implementation's lazy-allocation optimization.
        let id = self.next_stream_id()?;
        self.streams.insert(id, Stream { id, ..Stream::new() });
        debug!(stream_id = id, "stream attached");
        Ok(id)
    }

    fn next_stream_id(&mut self) -> DispatchResult<u16> {
        let candidate = (self.max_id + 1) | 1;
        if candidate > MAX_STREAM_ID as i32 {
            return Err(DispatchError::StreamIdExhausted);
        }
        self.max_id = candidate;
        Ok(candidate as u16)
    }

    /// Detaches a stream, dropping its state (spec §3 "Ownership and
    /// lifetimes": an orphan persists only long enough to flush residual
    /// sends; this crate flushes eagerly on detach since it holds no
    /// separate orphan list).
    pub fn detach(&mut self, id: u16) {
        self.streams.remove(&id);
        self.send_list.retain(|&sid| sid != id);
        debug!(stream_id = id, "stream detached");
    }

    /// Whether every stream the connection still tracks has reached
    /// `CLOSED`/`ERROR`.
    pub fn all_streams_terminal(&self) -> bool {
        self.streams.values().all(Stream::is_terminal)
    }

    /// Feeds freshly read transport bytes into the demux buffer.
    pub(crate) fn feed_demux(&mut self, bytes: &[u8]) {
        self.demux_buf.extend_from_slice(bytes);
        self.last_activity = Instant::now();
    }

    /// Queues a fully-encoded record onto the mux ring, splitting oversized
    /// pushes across the capacity check (spec §4.4 "ring of up to 32
    /// outgoing buffers").
    pub(crate) fn push_outgoing(&mut self, bytes: Bytes) -> bool {
        if self.mux_ring.len() >= MAX_MUX_BUFFERS {
            self.flags.mux_mfull = true;
            return false;
        }
        self.mux_ring.push_back(bytes);
        self.flags.mux_mfull = self.mux_ring.len() >= MAX_MUX_BUFFERS;
        true
    }

    /// Drains the mux ring to the transport. Returns `Ok(true)` if further
    /// progress is possible (caller should re-poll), `Ok(false)` if the
    /// ring is empty or the transport is pending.
    pub(crate) fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<DispatchResult<bool>> {
        while let Some(front) = self.mux_ring.front() {
            match self.transport.poll_send(cx, front) {
                Poll::Ready(Ok(n)) if n == front.len() => {
                    self.mux_ring.pop_front();
                    self.flags.mux_mfull = false;
                }
                Poll::Ready(Ok(n)) => {
                    let remaining = front.slice(n..);
                    self.mux_ring[0] = remaining;
                }
                Poll::Ready(Err(e)) => {
                    self.flags.error = true;
                    return Poll::Ready(Err(e.into()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(false))
    }

    /// Reads available bytes from the transport into the demux buffer.
    pub(crate) fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<DispatchResult<bool>> {
        let mut buf = [0u8; 8192];
        match self.transport.poll_recv(cx, &mut buf) {
            Poll::Ready(Ok(0)) => {
                self.flags.eos = true;
                Poll::Ready(Ok(false))
            }
            Poll::Ready(Ok(n)) => {
                self.feed_demux(&buf[..n]);
                Poll::Ready(Ok(true))
            }
            Poll::Ready(Err(e)) => {
                self.flags.error = true;
                Poll::Ready(Err(e.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// One pass of the multiplexer algorithm: optionally emits `GET_VALUES`
    /// from `INIT`, then walks the send list (spec §4.4 "Multiplexer
    /// algorithm").
    pub(crate) fn process_mux(&mut self) {
        if self.state == ConnState::Init {
            if self.config.get_values_supported && !self.flags.get_values_requested {
                self.emit_get_values();
                self.state = ConnState::Settings;
            } else {
                self.state = ConnState::RecordH;
            }
        }

        if self.state == ConnState::Closed {
            self.abort_open_streams();
            return;
        }

        if (self.state as u8) < (ConnState::RecordH as u8) {
            return;
        }

        let pending: Vec<u16> = self.send_list.drain(..).collect();
        for id in pending {
            let Some(stream) = self.streams.get_mut(&id) else { continue };
            if stream.flags.notified {
                continue;
            }
            stream.flags.notified = true;
            trace!(stream_id = id, "mux woke stream for send");
        }
    }

    fn abort_open_streams(&mut self) {
        if self.flags.aborts_sent {
            return;
        }
        let ids: Vec<u16> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.is_terminal() && !s.flags.end_of_stdin_sent && !s.flags.abort_sent)
            .map(|(&id, _)| id)
            .collect();
        let mut stuck = false;
        for id in ids {
            let mut out = Vec::new();
            encode_record(&mut out, RequestType::AbortRequest, id, &[]);
            if self.push_outgoing(Bytes::from(out)) {
                self.streams.get_mut(&id).unwrap().flags.abort_sent = true;
            } else {
                stuck = true;
            }
        }
        self.flags.aborts_sent = true;
        self.flags.aborts_failed = stuck;
    }

    fn emit_get_values(&mut self) {
        let mut params = Vec::new();
        crate::record::encode_params(&mut params, [("FCGI_MAX_REQS", ""), ("FCGI_MPXS_CONNS", "")]);
        let mut out = Vec::new();
        encode_record(&mut out, RequestType::GetValues, 0, &params);
        self.push_outgoing(Bytes::from(out));
        self.flags.get_values_requested = true;
    }

    /// Applies a decoded `GET_VALUES_RESULT` (spec §4.4 `SETTINGS` state).
    pub(crate) fn apply_get_values_result(&mut self, pairs: &[(String, String)]) {
        for (k, v) in pairs {
            match k.as_str() {
                "FCGI_MAX_REQS" => {
                    if let Ok(n) = v.parse::<u16>() {
                        self.streams_limit = n.min(self.config.max_requests).max(1);
                    }
                }
                "FCGI_MPXS_CONNS" => {
                    self.flags.mpx_allowed = v.trim() == "1";
                }
                _ => warn!(param = %k, "ignoring unknown GET_VALUES_RESULT param"),
            }
        }
        if !self.flags.mpx_allowed {
            self.streams_limit = 1;
        }
        self.state = ConnState::RecordH;
    }

    /// Runs the cooperative I/O tasklet until neither direction can make
    /// further progress without blocking, mirroring spec §5's "a
    /// cooperative I/O tasklet runs its demux+mux on that thread until no
    /// progress is possible, then suspends by subscribing to transport
    /// events" — expressed here as an async loop since this crate drives
    /// the connection from a Tokio task rather than a manually scheduled
    /// tasklet.
    pub async fn drive_until_readable(&mut self) -> DispatchResult<()> {
        loop {
            self.process_mux();
            self.process_demux()?;
            let flushed = poll_fn(|cx| self.poll_flush(cx)).await?;

            if self.flags.eos || self.state == ConnState::Closed {
                return Ok(());
            }
            if flushed {
                continue;
            }
            if !poll_fn(|cx| self.poll_fill(cx)).await? {
                return Ok(());
            }
        }
    }

    /// Whether the connection's idle timeout has elapsed (spec §4.4
    /// "Timeout"). Callers are expected to poll this on a timer and call
    /// [`Self::handle_timeout`] when it returns `true`.
    pub fn is_idle_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= self.idle_timeout
    }

    /// Handles an idle-timeout expiry: best-effort `ABORT_REQUEST` for
    /// every live stream, then releases the connection (spec §4.4
    /// "Timeout").
    pub fn handle_timeout(&mut self) {
        warn!("connection idle timeout expired");
        self.abort_open_streams();
        self.state = ConnState::Closed;
    }

    /// Encodes and queues one request's outgoing records from its message
    /// blocks (spec §4.4 "Per-stream send path").
    pub fn snd_buf(&mut self, id: u16, remote_addr: &str, remote_port: u16, server_port: u16, is_tls: bool) -> DispatchResult<usize> {
        let config = self.config.clone();
        let keep_conn = self.flags.keep_alive_allowed;
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(DispatchError::UnknownStream { id });
        };

        let mut sent = 0usize;
        let mut out = Vec::new();

        if !stream.flags.begin_sent {
            let body = BeginRequestBody { role: Role::Responder, keep_conn };
            encode_record(&mut out, RequestType::BeginRequest, id, &body.encode());
            stream.flags.begin_sent = true;
            stream.state = StreamState::Open;
        }

        let mut request_line = None;
        let mut header_blocks = Vec::new();
        let mut body_params_done = false;

        while let Some(block) = stream.outgoing.head().cloned() {
            match block {
                HtxBlock::StartLine { method, target, version } => {
                    let rl = request_line_from_start_line(&method, &target, version);
                    stream.response.set_expect_no_body(rl.is_head);
                    request_line = Some(rl);
                    stream.outgoing.remove_head();
                }
                HtxBlock::Header { .. } => {
                    header_blocks.push(block);
                    stream.outgoing.remove_head();
                }
                HtxBlock::EndOfHeaders => {
                    stream.outgoing.remove_head();
                    if let Some(header_name) = &config.server_id_header {
                        out_params_single(&mut out, id, header_name, "");
                    }
                    if !stream.flags.empty_params_sent {
                        let rl = request_line.clone().unwrap_or_default_request_line();
                        let params = build_params(&config, &header_blocks, &rl, remote_addr, remote_port, server_port, is_tls)?;
                        let mut encoded = Vec::new();
                        crate::record::encode_params(&mut encoded, params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                        encode_record(&mut out, RequestType::Params, id, &encoded);
                        encode_record(&mut out, RequestType::Params, id, &[]);
                        stream.flags.empty_params_sent = true;
                    }
                    body_params_done = true;
                }
                HtxBlock::Data(_) => {
                    let Some(chunk) = stream.outgoing.cut_data(MAX_CONTENT_LENGTH) else { break };
                    encode_record(&mut out, RequestType::Stdin, id, &chunk);
                }
                HtxBlock::EndOfTrailers | HtxBlock::EndOfMessage => {
                    stream.outgoing.remove_head();
                    if !stream.flags.end_of_stdin_sent {
                        encode_record(&mut out, RequestType::Stdin, id, &[]);
                        stream.flags.end_of_stdin_sent = true;
                        stream.state = StreamState::Hloc;
                    }
                }
            }
        }
        let _ = body_params_done;

        sent += out.len();
        if !out.is_empty() && !self.push_outgoing(Bytes::from(out)) {
            stream.flags.mux_blocked = true;
        }
        Ok(sent)
    }
}

fn out_params_single(out: &mut Vec<u8>, id: u16, name: &str, value: &str) {
    let mut encoded = Vec::new();
    crate::record::encode_params(&mut encoded, [(name, value)]);
    encode_record(out, RequestType::Params, id, &encoded);
}

trait RequestLineOrDefault {
    fn unwrap_or_default_request_line(self) -> crate::mux::params_builder::RequestLine;
}

impl RequestLineOrDefault for Option<crate::mux::params_builder::RequestLine> {
    fn unwrap_or_default_request_line(self) -> crate::mux::params_builder::RequestLine {
        self.unwrap_or_else(|| crate::mux::params_builder::RequestLine {
            method: "GET".to_string(),
            uri: "/".to_string(),
            server_protocol: "HTTP/1.1".to_string(),
            is_head: false,
        })
    }
}
