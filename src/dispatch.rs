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

//! Ties the FWRR load balancer, the pending queue, and the FastCGI mux
//! together into the end-to-end request-dispatch path (spec §2 "System
//! overview": "a request arrives → a pending entry may be enqueued ... →
//! the FWRR selector picks a server ... → the request's stream attaches to
//! a FastCGI mux connection").
//!
//! This module is the thin composition layer the three hard subsystems
//! plug into; each subsystem ([`crate::queue`], [`crate::lb::fwrr`],
//! [`crate::mux`]) is independently complete and tested. When every server
//! is saturated this layer surfaces [`DispatchError::NoStreamsAvailable`]
//! rather than blocking the caller on the pending queue's async wakeup —
//! the queue's own blocking/fairness semantics are exercised directly in
//! `queue`'s tests, not replayed here (see `DESIGN.md`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::backend::Backend;
use crate::config::FcgiAppConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::htx::Htx;
use crate::lb::fwrr;
use crate::mux::{Connection, StreamState};
use crate::server::{dynamic_maxconn, ServerId};
use crate::transport::Transport;

/// A finished response, extracted from a stream's HTTP/1 parser state once
/// the exchange completes.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// HTTP reason phrase.
    pub reason: String,
    /// Response headers, in order, lowercased names.
    pub headers: Vec<(String, String)>,
    /// Response body bytes.
    pub body: Bytes,
}

/// Binds one [`Backend`] to a live connection per server and drives
/// requests through the full select → attach → send → receive path.
pub struct Dispatcher<T: Transport> {
    backend: Arc<Backend>,
    config: Arc<FcgiAppConfig>,
    connections: HashMap<usize, Connection<T>>,
    tgid: usize,
}

impl<T: Transport> Dispatcher<T> {
    /// Builds a dispatcher for `backend`, operating as thread-group `tgid`
    /// (spec §9's explicit `tgid`-threading decision; see `DESIGN.md`).
    pub fn new(backend: Arc<Backend>, config: Arc<FcgiAppConfig>, tgid: usize) -> Self {
        Self { backend, config, connections: HashMap::new(), tgid }
    }

    /// Registers the transport to use for `sid`'s connection. The
    /// connection pool that would normally supply this is out of scope
    /// (spec §1); callers wire one transport per server directly.
    pub fn register_connection(&mut self, sid: ServerId, transport: T, idle_timeout: Duration) {
        self.connections.insert(sid.0, Connection::new(transport, self.config.clone(), idle_timeout));
    }

    /// Selects a server via the FWRR selector and reserves a serving slot
    /// on it, retrying the selection if a concurrent reservation race is
    /// lost.
    fn acquire_server(&self, now: Instant) -> DispatchResult<ServerId> {
        for _ in 0..4 {
            let Some(sid) = fwrr::get_next_server(&self.backend, self.tgid, None, now) else {
                return Err(DispatchError::NoStreamsAvailable);
            };
            let srv = &self.backend.servers[sid.0];
            let maxconn = dynamic_maxconn(srv, self.backend.beconn(), self.backend.fullconn.load(std::sync::atomic::Ordering::Relaxed), now);
            if srv.try_reserve_slot(maxconn) {
                return Ok(sid);
            }
        }
        Err(DispatchError::NoStreamsAvailable)
    }

    /// Dispatches one request end to end: acquires a server, attaches a
    /// stream on its connection, sends `request`, and drives the
    /// connection until the response completes (spec §8 scenario 1,
    /// "Simple GET").
    pub async fn dispatch(
        &mut self, request: Htx, remote_addr: &str, remote_port: u16, server_port: u16, is_tls: bool,
    ) -> DispatchResult<Response> {
        let now = Instant::now();
        let sid = self.acquire_server(now)?;
        let release = |backend: &Backend| backend.servers[sid.0].release_slot();

        let result = self.dispatch_on(sid, request, remote_addr, remote_port, server_port, is_tls).await;
        release(&self.backend);
        result
    }

    async fn dispatch_on(
        &mut self, sid: ServerId, request: Htx, remote_addr: &str, remote_port: u16, server_port: u16, is_tls: bool,
    ) -> DispatchResult<Response> {
        let conn = self.connections.get_mut(&sid.0).ok_or(DispatchError::NoStreamsAvailable)?;
        let stream_id = conn.attach()?;
        conn.streams.get_mut(&stream_id).expect("just attached").outgoing = request;
        conn.snd_buf(stream_id, remote_addr, remote_port, server_port, is_tls)?;

        loop {
            conn.drive_until_readable().await?;
            let stream = conn.streams.get(&stream_id).ok_or(DispatchError::UnknownStream { id: stream_id })?;
            if stream.state == StreamState::Closed || stream.response.is_done() {
                break;
            }
            if conn.flags.eos {
                return Err(DispatchError::PeerClosedEarly);
            }
        }

        let stream = conn.streams.get(&stream_id).expect("stream still attached");
        if let (Some(status), Some(app_status)) = (stream.protocol_status, stream.app_status) {
            if let Some(err) = DispatchError::from_protocol_status(status, app_status) {
                conn.detach(stream_id);
                return Err(err);
            }
        }
        let response = Response {
            status: stream.response.status,
            reason: stream.response.reason.clone(),
            headers: stream.response.headers.clone(),
            body: stream.response.body_bytes(),
        };
        conn.detach(stream_id);
        Ok(response)
    }
}
