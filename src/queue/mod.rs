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

//! Priority queue with fairness dequeuing (spec §4.1).
//!
//! Grounded on `queue.c`: `pendconn_add`, `pendconn_first`,
//! `pendconn_process_next_strm`, `process_srv_queue`,
//! `pendconn_unlink`/`pendconn_dequeue`, `pendconn_redistribute`,
//! `srv_dynamic_maxconn`. The `eb32` index tree is emulated with a
//! `BTreeMap<(u32, u64), Arc<PendingEntry>>`, the `u64` being a per-queue
//! monotonic insertion sequence so entries sharing a composite key still
//! sort FIFO, matching the tree's documented "FIFO within class" behavior.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub use crate::server::dynamic_maxconn;
use crate::backend::Backend;
use crate::server::ServerId;

/// Bound on consecutive self-thread-group dequeues before a draining
/// thread must steal one entry from another thread-group (spec §4.1
/// "Fairness & dequeuer coordination").
pub const MAX_SELF_USE_QUEUE: u32 = 9;

/// Millisecond window (spec's `NOW_OFFSET_BOUNDARY` look-back) used to
/// decide whether a raw key offset should be treated as "in the future"
/// across the 20-bit wraparound.
const TIMER_LOOK_BACK_MS: u32 = 1 << 8;

const KEY_CLASS_MASK: u32 = 0xfff0_0000;
const KEY_OFFSET_MASK: u32 = 0x000f_ffff;
const FUTURE_WRAP: u32 = 0x10_0000;

fn make_key(class: i32, offset: i32, now_ms: u32) -> u32 {
    let class_bits = ((class + 0x7ff) as u32) << 20;
    let offset_bits = now_ms.wrapping_add(offset as u32) & KEY_OFFSET_MASK;
    class_bits | offset_bits
}

fn key_class(key: u32) -> u32 {
    key & KEY_CLASS_MASK
}

fn key_offset(key: u32) -> u32 {
    key & KEY_OFFSET_MASK
}

fn now_offset_boundary(now_ms: u32) -> u32 {
    now_ms.wrapping_sub(TIMER_LOOK_BACK_MS) & KEY_OFFSET_MASK
}

fn now_ms(now: Instant, epoch: Instant) -> u32 {
    now.saturating_duration_since(epoch).as_millis() as u32
}

/// One request waiting for a server slot (spec §3 "Pending entry").
#[derive(Debug)]
pub struct PendingEntry {
    key: (u32, u64),
    linked: AtomicBool,
    /// Target server, set once the dequeue engine assigns one.
    pub assigned: Mutex<Option<ServerId>>,
    /// `idx - 1` snapshot at insertion time, for position-delta logging.
    pub queue_idx: u64,
}

impl PendingEntry {
    /// Whether this entry still sits in its owning queue.
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }
}

/// Outcome of [`Queue::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueOutcome {
    /// The entry is still linked; the caller must keep waiting.
    StillQueued,
    /// The entry was already unlinked by the dequeue engine, with the
    /// server it was assigned to, if any.
    Dequeued(Option<ServerId>),
}

/// A per-(owner, thread-group) pending queue (spec §3 "Queue").
#[derive(Debug, Default)]
pub struct Queue {
    tree: Mutex<BTreeMap<(u32, u64), Arc<PendingEntry>>>,
    idx: AtomicU64,
    length: AtomicU32,
    seq: AtomicU64,
    max_observed: AtomicU32,
}

impl Queue {
    /// Builds an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of linked entries.
    pub fn len(&self) -> u32 {
        self.length.load(Ordering::Relaxed)
    }

    /// Whether the queue currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest `len()` ever observed, for observability.
    pub fn max_observed(&self) -> u32 {
        self.max_observed.load(Ordering::Relaxed)
    }

    /// Enqueues a new pending entry with priority `class`/`offset`,
    /// mirroring `pendconn_add`. Infallible in this port: allocation
    /// failure, `pendconn_add`'s only failure mode, is not something safe
    /// Rust code can model short of aborting, so the *out-of-memory* row
    /// of spec §7 has no reachable path here.
    pub fn add(&self, class: i32, offset: i32, now: Instant, epoch: Instant) -> Arc<PendingEntry> {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        let key = (make_key(class, offset, now_ms(now, epoch)), seq);
        let queue_idx = self.idx.load(Ordering::Relaxed).wrapping_sub(1);
        let entry = Arc::new(PendingEntry {
            key,
            linked: AtomicBool::new(true),
            assigned: Mutex::new(None),
            queue_idx,
        });
        self.tree.lock().unwrap().insert(key, entry.clone());
        let len = self.length.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_observed.fetch_max(len, Ordering::AcqRel);
        entry
    }

    /// Removes `entry` from this queue if it is still linked, mirroring
    /// `pendconn_unlink`. Returns whether it was actually removed.
    pub fn unlink(&self, entry: &Arc<PendingEntry>) -> bool {
        if !entry.linked.swap(false, Ordering::AcqRel) {
            return false;
        }
        let removed = self.tree.lock().unwrap().remove(&entry.key).is_some();
        if removed {
            self.length.fetch_sub(1, Ordering::AcqRel);
            self.idx.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    /// Reports whether `entry` is still queued or has been assigned,
    /// mirroring the stream-initiated `pendconn_dequeue`.
    pub fn dequeue(&self, entry: &Arc<PendingEntry>) -> DequeueOutcome {
        if entry.is_linked() {
            return DequeueOutcome::StillQueued;
        }
        DequeueOutcome::Dequeued(*entry.assigned.lock().unwrap())
    }

    /// Mirrors `pendconn_first`: the lowest class present, then the
    /// earliest offset within that class found via the wrap-aware
    /// boundary lookup, falling back to the class's raw-lowest key.
    fn first_eligible(&self, now: Instant, epoch: Instant) -> Option<Arc<PendingEntry>> {
        let tree = self.tree.lock().unwrap();
        let (&first_key, first_entry) = tree.iter().next()?;
        let boundary = key_class(first_key.0) | now_offset_boundary(now_ms(now, epoch));
        if let Some((k2, e2)) = tree.range((boundary, 0)..).next() {
            if key_class(k2.0) == key_class(first_key.0) {
                return Some(e2.clone());
            }
        }
        Some(first_entry.clone())
    }

    fn entries_snapshot(&self) -> Vec<Arc<PendingEntry>> {
        self.tree.lock().unwrap().values().cloned().collect()
    }
}

enum Winner {
    Server(Arc<PendingEntry>),
    Backend(Arc<PendingEntry>),
}

/// Breaks a tie between a server-local and a backend-local candidate of
/// equal priority class, comparing offsets with the future-wrap
/// adjustment (spec's supplemented `pendconn_process_next_strm` behavior).
fn pick_winner(p: Option<Arc<PendingEntry>>, pp: Option<Arc<PendingEntry>>, now: Instant, epoch: Instant) -> Winner {
    match (p, pp) {
        (Some(p), None) => Winner::Server(p),
        (None, Some(pp)) => Winner::Backend(pp),
        (Some(p), Some(pp)) => {
            let pc = key_class(p.key.0);
            let ppc = key_class(pp.key.0);
            if pc < ppc {
                return Winner::Server(p);
            }
            if ppc < pc {
                return Winner::Backend(pp);
            }
            let boundary = now_offset_boundary(now_ms(now, epoch));
            let mut pk = key_offset(p.key.0);
            let mut ppk = key_offset(pp.key.0);
            if pk < boundary {
                pk += FUTURE_WRAP;
            }
            if ppk < boundary {
                ppk += FUTURE_WRAP;
            }
            if pk <= ppk {
                Winner::Server(p)
            } else {
                Winner::Backend(pp)
            }
        }
        (None, None) => unreachable!("caller only invokes pick_winner when at least one side is present"),
    }
}

/// Attempts to dequeue and assign one pending request to `sid` from
/// thread-group `tgrp`, considering both the server's own queue and (if
/// `px_ok`) the backend's queue. Mirrors `pendconn_process_next_strm`.
fn process_next_strm(backend: &Backend, sid: ServerId, tgrp: usize, px_ok: bool, now: Instant, epoch: Instant) -> bool {
    let srv = &backend.servers[sid.0];
    let p = srv.queues[tgrp].first_eligible(now, epoch);
    let pp = if px_ok { backend.queues[tgrp].first_eligible(now, epoch) } else { None };
    if p.is_none() && pp.is_none() {
        return false;
    }

    let maxconn = dynamic_maxconn(srv, backend.beconn(), backend.fullconn.load(Ordering::Relaxed), now);
    if !srv.try_reserve_slot(maxconn) {
        return false;
    }

    match pick_winner(p, pp, now, epoch) {
        Winner::Server(entry) => {
            srv.queues[tgrp].unlink(&entry);
            *entry.assigned.lock().unwrap() = Some(sid);
            srv.dec_queuelen(1);
        }
        Winner::Backend(entry) => {
            backend.queues[tgrp].unlink(&entry);
            *entry.assigned.lock().unwrap() = Some(sid);
            backend.totpend.fetch_sub(1, Ordering::AcqRel);
        }
    }
    true
}

/// Drains as many pending entries as capacity allows for server `sid`,
/// called from thread-group `tgid`. Mirrors `process_srv_queue`'s fairness
/// loop: self-service up to [`MAX_SELF_USE_QUEUE`] rounds, then one steal
/// from the next non-empty thread-group, round-robined.
pub fn process_srv_queue(
    backend: &Backend, sid: ServerId, tgid: usize, maxpollevents: u32, now: Instant, epoch: Instant,
) -> u32 {
    let srv = &backend.servers[sid.0];
    let px_ok = !srv.backup
        || (backend.srv_act.load(Ordering::Relaxed) == 0
            && (*backend.fbck.lock().unwrap() == Some(sid) || backend.use_all_backups));

    let mut non_empty: Vec<bool> = (0..backend.tgroups)
        .map(|t| !backend.servers[sid.0].queues[t].is_empty() || !backend.queues[t].is_empty())
        .collect();
    let mut done = 0u32;

    while non_empty.iter().any(|&b| b) {
        let maxconn = dynamic_maxconn(srv, backend.beconn(), backend.fullconn.load(Ordering::Relaxed), now);
        if !(done < maxpollevents || srv.served() == 0) || srv.served() >= maxconn {
            break;
        }

        let self_served = srv.dequeue_state[tgid].self_served.load(Ordering::Relaxed) % (MAX_SELF_USE_QUEUE + 1);
        let only_self_non_empty = non_empty.iter().filter(|&&b| b).count() == 1 && non_empty[tgid];
        let (cur_tgrp, to_dequeue) = if (self_served == MAX_SELF_USE_QUEUE && !only_self_non_empty) || !non_empty[tgid] {
            let mut next = srv.dequeue_state[tgid].last_other_tgrp_served.load(Ordering::Relaxed) as usize;
            loop {
                next = (next + 1) % backend.tgroups;
                if next != tgid && non_empty[next] {
                    break;
                }
            }
            srv.dequeue_state[tgid].last_other_tgrp_served.store(next as u32, Ordering::Relaxed);
            (next, 1u32)
        } else {
            let self_served = if self_served == MAX_SELF_USE_QUEUE { 0 } else { self_served };
            (tgid, MAX_SELF_USE_QUEUE - self_served)
        };

        if srv.dequeue_state[cur_tgrp].dequeuing.swap(true, Ordering::AcqRel) {
            non_empty[cur_tgrp] = false;
            continue;
        }

        let mut dequeued_this_round = 0u32;
        while dequeued_this_round < to_dequeue && srv.served() < maxconn {
            if !process_next_strm(backend, sid, cur_tgrp, px_ok, now, epoch) {
                non_empty[cur_tgrp] = false;
                break;
            }
            dequeued_this_round += 1;
            if cur_tgrp == tgid {
                srv.dequeue_state[tgid].self_served.fetch_add(1, Ordering::Relaxed);
            }
            done += 1;
            if done >= maxpollevents {
                break;
            }
        }
        srv.dequeue_state[cur_tgrp].dequeuing.store(false, Ordering::Release);
    }

    if done > 0 {
        backend.totpend.fetch_sub(done, Ordering::AcqRel);
        backend.served.fetch_add(done, Ordering::AcqRel);
    }

    if srv.served() == 0 && backend.served.load(Ordering::Relaxed) == 0 {
        let mut ready = backend.ready_srv.lock().unwrap();
        if ready.is_none() {
            *ready = Some(sid);
            for tgid in 0..backend.tgroups {
                if process_next_strm(backend, sid, tgid, px_ok, now, epoch) {
                    backend.totpend.fetch_sub(1, Ordering::AcqRel);
                    backend.served.fetch_add(1, Ordering::AcqRel);
                    done += 1;
                    break;
                }
            }
        }
    }

    done
}

/// Adds a stream's request to the queue of `owner` (a specific server, or
/// the backend if `owner` is `None`), mirroring `pendconn_add`.
pub fn enqueue(
    backend: &Backend, owner: Option<ServerId>, class: i32, offset: i32, now: Instant, epoch: Instant,
) -> Arc<PendingEntry> {
    let entry = match owner {
        Some(sid) => {
            let srv = &backend.servers[sid.0];
            let tgid = 0; // caller's thread-group; see crate::lb module docs on explicit tgid threading.
            let entry = srv.queues[tgid].add(class, offset, now, epoch);
            srv.inc_queuelen();
            entry
        }
        None => backend.queues[0].add(class, offset, now, epoch),
    };
    backend.totpend.fetch_add(1, Ordering::AcqRel);
    entry
}

/// Redistributes every pending entry of a failed server across the rest
/// of the backend, mirroring `pendconn_redistribute`: unlinks every entry
/// queued against the server, and, if no usable weight remains anywhere in
/// the backend, every entry queued against the backend too. Returns the
/// number of entries unlinked.
pub fn redistribute(backend: &Backend, sid: ServerId) -> u32 {
    let srv = &backend.servers[sid.0];
    let mut n = 0u32;
    for tgid in 0..backend.tgroups {
        for entry in srv.queues[tgid].entries_snapshot() {
            if srv.queues[tgid].unlink(&entry) {
                n += 1;
            }
        }
    }
    srv.dec_queuelen(n);

    if backend.srv_act.load(Ordering::Relaxed) == 0 && backend.srv_bck.load(Ordering::Relaxed) == 0 {
        for tgid in 0..backend.tgroups {
            for entry in backend.queues[tgid].entries_snapshot() {
                if backend.queues[tgid].unlink(&entry) {
                    n += 1;
                }
            }
        }
    }
    if n > 0 {
        backend.totpend.fetch_sub(n, Ordering::AcqRel);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerState;

    fn backend_with_one_server(tgroups: usize) -> (Backend, ServerId) {
        let mut backend = Backend::new(tgroups, false);
        let sid = backend.add_server("s0", 10, false);
        backend.servers[sid.0].set_state(ServerState::Up);
        backend.servers[sid.0].set_cur_eweight(160);
        backend.servers[sid.0].maxconn = 100;
        backend.servers[sid.0].minconn = 100;
        backend.srv_act.store(1, Ordering::Relaxed);
        (backend, sid)
    }

    #[test]
    fn fifo_within_same_class() {
        let (backend, sid) = backend_with_one_server(1);
        let epoch = Instant::now();
        let now = epoch;
        let e1 = enqueue(&backend, Some(sid), 0, 0, now, epoch);
        let e2 = enqueue(&backend, Some(sid), 0, 1, now, epoch);
        assert!(process_next_strm(&backend, sid, 0, false, now, epoch));
        assert_eq!(*e1.assigned.lock().unwrap(), Some(sid));
        assert!(e2.is_linked());

        backend.servers[sid.0].release_slot();
        assert!(process_next_strm(&backend, sid, 0, false, now, epoch));
        assert_eq!(*e2.assigned.lock().unwrap(), Some(sid));

        let e3 = enqueue(&backend, Some(sid), 0, -1, now, epoch);
        backend.servers[sid.0].release_slot();
        assert!(process_next_strm(&backend, sid, 0, false, now, epoch));
        assert_eq!(*e3.assigned.lock().unwrap(), Some(sid));
    }

    #[test]
    fn dequeue_reports_still_queued_until_unlinked() {
        let (backend, sid) = backend_with_one_server(1);
        let queue = &backend.servers[sid.0].queues[0];
        let epoch = Instant::now();
        let entry = enqueue(&backend, Some(sid), 0, 0, epoch, epoch);
        assert_eq!(queue.dequeue(&entry), DequeueOutcome::StillQueued);
        queue.unlink(&entry);
        assert_eq!(queue.dequeue(&entry), DequeueOutcome::Dequeued(None));
    }

    #[test]
    fn fair_cross_group_dequeue_bounces_between_groups() {
        let mut backend = Backend::new(2, false);
        let sid = backend.add_server("s0", 10, false);
        backend.servers[sid.0].set_state(ServerState::Up);
        backend.servers[sid.0].set_cur_eweight(160);
        backend.servers[sid.0].maxconn = 1000;
        backend.servers[sid.0].minconn = 1000;
        backend.srv_act.store(1, Ordering::Relaxed);

        let epoch = Instant::now();
        for i in 0..10 {
            enqueue(&backend, Some(sid), 0, i, epoch, epoch);
        }
        let other = {
            // group 1's queue belongs to the same server, different tgid slot.
            let srv = &backend.servers[sid.0];
            for i in 0..10 {
                srv.queues[1].add(0, i, epoch, epoch);
            }
            srv.queues[1].len()
        };
        assert_eq!(other, 10);

        let done = process_srv_queue(&backend, sid, 0, 1000, epoch, epoch);
        assert_eq!(done, 20);
        assert_eq!(backend.servers[sid.0].queues[0].len(), 0);
        assert_eq!(backend.servers[sid.0].queues[1].len(), 0);
    }

    #[test]
    fn redistribute_unlinks_every_entry_for_a_failed_server() {
        let (backend, sid) = backend_with_one_server(1);
        let epoch = Instant::now();
        let e1 = enqueue(&backend, Some(sid), 0, 0, epoch, epoch);
        let e2 = enqueue(&backend, Some(sid), 1, 0, epoch, epoch);
        let n = redistribute(&backend, sid);
        assert_eq!(n, 2);
        assert!(!e1.is_linked());
        assert!(!e2.is_linked());
    }
}
