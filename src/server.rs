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

//! Server: a single backend endpoint and the bookkeeping the load balancer
//! and queue engine hang off it (spec §3 "Server").

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Effective-weight scale factor. User weights (0..256) are multiplied by
/// this to get the effective weight used in FWRR math, giving enough
/// resolution that integer rounding doesn't visibly skew the rotation.
pub const BE_WEIGHT_SCALE: u32 = 16;

/// Upper bound on an effective weight (`256 * BE_WEIGHT_SCALE`), used to
/// invert weights when building the "heaviest first" `init` tree key.
pub const SRV_EWGHT_MAX: u32 = 256 * BE_WEIGHT_SCALE;

/// Multiplier applied to `npos` when building a `curr`/`next` tree key, wide
/// enough that the rweight-derived low bits (which range `0..=256`) never
/// collide with the position term.
pub const SRV_UWGHT_RANGE: u32 = 1 << 16;

/// Opaque handle to a server within a [`crate::backend::Backend`].
///
/// Servers are owned by the backend; every other structure (queue trees,
/// FWRR trees, pending entries) refers to a server by this index rather
/// than by reference, avoiding the owner/stream/descriptor reference cycle
/// spec §9 calls out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(pub usize);

/// Administrative/health lifecycle of a server. Health-check plumbing
/// itself is out of scope (spec §1 Non-goals); this only tracks the state
/// that feeds weight math (slowstart) and up/down transitions driven
/// externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Fully up, counts its full effective weight.
    Up,
    /// Up but still inside its slowstart ramp.
    Starting,
    /// Administratively or health-check down; excluded from selection.
    Down,
}

/// Per-(server, thread-group) FWRR cursor state (spec §3 "Server",
/// per-thread-group attributes).
#[derive(Debug, Clone, Copy, Default)]
pub struct TgroupPosition {
    /// Position cursor, consumed as the group's window is walked.
    pub npos: i64,
    /// Last position cursor assigned (used to detect "first time" and by
    /// `update_server_weight`'s in-place repositioning).
    pub lpos: i64,
    /// Residual weight accumulator, `0..eweight-1`.
    pub rweight: u32,
}

/// Which physical tree (of a group's three) a server currently sits in, if
/// any. The logical `init`/`next` labels are resolved against the group's
/// swap flag; this records the physical slot directly so removal doesn't
/// need that resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSlot {
    /// The group's `curr` tree.
    Curr,
    /// The group's `t0` tree.
    T0,
    /// The group's `t1` tree.
    T1,
}

/// A server's placement within one thread-group's FWRR trees: which tree,
/// and the exact key it was inserted with (needed to remove it again
/// without a linear scan).
#[derive(Debug, Clone, Copy)]
pub struct TreeMembership {
    /// Which physical tree the server is parked in.
    pub slot: TreeSlot,
    /// The `(key, insertion sequence)` pair used as the tree's sort key.
    pub key: (u32, u64),
}

/// A configured backend endpoint.
#[derive(Debug)]
pub struct Server {
    /// Handle by which every other structure refers to this server.
    pub id: ServerId,
    /// Human-readable name, used only in logs.
    pub name: String,
    /// Operator-supplied weight, `0..=256`.
    pub uweight: u32,
    /// Whether this server is a backup server.
    pub backup: bool,
    /// Per-server connection cap; 0 means unlimited.
    pub maxconn: u32,
    /// Minimum connections to allow even under `fullconn` throttling.
    pub minconn: u32,
    /// Time this server's slowstart ramp began (state last changed to
    /// `Starting`).
    pub last_change: Instant,
    /// Duration of the slowstart ramp.
    pub slowstart: Duration,

    state: Mutex<ServerState>,
    cur_eweight: AtomicU32,
    next_eweight: AtomicU32,
    served: AtomicU32,
    queuelen: AtomicU32,
    /// Per-thread-group FWRR cursor state.
    positions: Vec<Mutex<TgroupPosition>>,
    /// Per-thread-group current tree membership, if queued.
    membership: Vec<Mutex<Option<TreeMembership>>>,
    /// Per-(server, thread-group) dequeuer coordination fields (spec
    /// §4.1 "Fairness & dequeuer coordination").
    pub dequeue_state: Vec<DequeueTgroupState>,
    /// Per-thread-group pending-request queue for this server.
    pub queues: Vec<crate::queue::Queue>,
}

/// Per-(server, thread-group) fairness bookkeeping for the dequeue engine.
#[derive(Debug, Default)]
pub struct DequeueTgroupState {
    /// `true` while some thread is draining this (server, thread-group)
    /// queue, enforced by CAS.
    pub dequeuing: AtomicBool,
    /// Count of consecutive self-thread-group dequeues so far this round,
    /// reset when a steal occurs.
    pub self_served: AtomicU32,
    /// The thread-group index last stolen from, round-robined.
    pub last_other_tgrp_served: AtomicU32,
}

impl Server {
    /// Builds a new, initially-down server with per-thread-group state for
    /// `tgroups` thread groups.
    pub fn new(id: ServerId, name: impl Into<String>, uweight: u32, backup: bool, tgroups: usize) -> Self {
        Self {
            id,
            name: name.into(),
            uweight,
            backup,
            maxconn: 0,
            minconn: 0,
            last_change: Instant::now(),
            slowstart: Duration::ZERO,
            state: Mutex::new(ServerState::Down),
            cur_eweight: AtomicU32::new(0),
            next_eweight: AtomicU32::new(Self::scale(uweight)),
            served: AtomicU32::new(0),
            queuelen: AtomicU32::new(0),
            positions: (0..tgroups).map(|_| Mutex::new(TgroupPosition::default())).collect(),
            membership: (0..tgroups).map(|_| Mutex::new(None)).collect(),
            dequeue_state: (0..tgroups).map(|_| DequeueTgroupState::default()).collect(),
            queues: (0..tgroups).map(|_| crate::queue::Queue::new()).collect(),
        }
    }

    fn scale(uweight: u32) -> u32 {
        uweight * BE_WEIGHT_SCALE
    }

    /// Current administrative/health state.
    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap()
    }

    /// Sets the administrative/health state directly. Callers wanting the
    /// load-balancer trees updated must go through
    /// [`crate::lb::fwrr::set_server_status_up`]/`down`, which call this.
    pub fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap() = state;
    }

    /// Whether the server currently counts towards selection (up, possibly
    /// still ramping).
    pub fn currently_usable(&self) -> bool {
        !matches!(self.state(), ServerState::Down) && self.cur_eweight.load(Ordering::Relaxed) > 0
    }

    /// `cur_eweight`, the effective weight used by `get_next_server`'s
    /// saturation check.
    pub fn cur_eweight(&self) -> u32 {
        self.cur_eweight.load(Ordering::Relaxed)
    }

    /// Sets `cur_eweight`, called when a weight change or status change
    /// commits.
    pub fn set_cur_eweight(&self, v: u32) {
        self.cur_eweight.store(v, Ordering::Relaxed);
    }

    /// `next_eweight`, the "will-be" effective weight.
    pub fn next_eweight(&self) -> u32 {
        self.next_eweight.load(Ordering::Relaxed)
    }

    /// Sets `next_eweight`, e.g. after an operator weight change.
    pub fn set_next_eweight(&self, v: u32) {
        self.next_eweight.store(v, Ordering::Relaxed);
    }

    /// Recomputes `next_eweight` from `uweight`.
    pub fn recompute_next_eweight(&mut self) {
        self.next_eweight.store(self.uweight * BE_WEIGHT_SCALE, Ordering::Relaxed);
    }

    /// Number of requests currently assigned to (being served by) this
    /// server.
    pub fn served(&self) -> u32 {
        self.served.load(Ordering::Relaxed)
    }

    /// Attempts to reserve one more concurrent slot, CAS-bounded by
    /// `max`. Returns `true` on success.
    pub fn try_reserve_slot(&self, max: u32) -> bool {
        let mut cur = self.served.load(Ordering::Relaxed);
        loop {
            if cur >= max {
                return false;
            }
            match self.served.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Releases a previously-reserved serving slot.
    pub fn release_slot(&self) {
        self.served.fetch_sub(1, Ordering::AcqRel);
    }

    /// Total queue length across every thread-group's queue for this
    /// server.
    pub fn queuelen(&self) -> u32 {
        self.queuelen.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_queuelen(&self) -> u32 {
        self.queuelen.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn dec_queuelen(&self, n: u32) {
        self.queuelen.fetch_sub(n, Ordering::AcqRel);
    }

    /// Locks and returns the thread-group's position cursor.
    pub fn position(&self, tgid: usize) -> std::sync::MutexGuard<'_, TgroupPosition> {
        self.positions[tgid].lock().unwrap()
    }

    /// Locks and returns the thread-group's current tree membership slot.
    pub fn membership(&self, tgid: usize) -> std::sync::MutexGuard<'_, Option<TreeMembership>> {
        self.membership[tgid].lock().unwrap()
    }
}

/// Mirrors `srv_dynamic_maxconn` in the original implementation (spec
/// §4.1 "Dynamic maxconn").
pub fn dynamic_maxconn(server: &Server, beconn: u32, fullconn: u32, now: Instant) -> u32 {
    let mut max = if fullconn == 0 || beconn >= fullconn || server.minconn == server.maxconn {
        server.maxconn
    } else {
        server.minconn.max(beconn.saturating_mul(server.maxconn) / fullconn)
    };

    if server.state() == ServerState::Starting && !server.slowstart.is_zero() {
        let elapsed = now.saturating_duration_since(server.last_change);
        if elapsed < server.slowstart {
            let ratio = (100 * elapsed.as_millis() as u64) / server.slowstart.as_millis().max(1) as u64;
            max = 1.max((max as u64 * ratio / 100) as u32);
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_maxconn_uses_static_limit_when_proxy_not_full() {
        let mut s = Server::new(ServerId(0), "s1", 10, false, 1);
        s.maxconn = 100;
        s.minconn = 100; // minconn == maxconn => static
        assert_eq!(dynamic_maxconn(&s, 5, 1000, Instant::now()), 100);
    }

    #[test]
    fn dynamic_maxconn_scales_with_backend_usage() {
        let mut s = Server::new(ServerId(0), "s1", 10, false, 1);
        s.maxconn = 100;
        s.minconn = 10;
        // beconn/fullconn = 50% => beconn*maxconn/fullconn = 50, above minconn.
        assert_eq!(dynamic_maxconn(&s, 500, 1000, Instant::now()), 50);
    }

    #[test]
    fn dynamic_maxconn_floors_at_one_during_slowstart() {
        let mut s = Server::new(ServerId(0), "s1", 10, false, 1);
        s.maxconn = 100;
        s.minconn = 100;
        s.slowstart = Duration::from_secs(10);
        s.set_state(ServerState::Starting);
        assert_eq!(dynamic_maxconn(&s, 0, 0, s.last_change), 1);
    }
}
