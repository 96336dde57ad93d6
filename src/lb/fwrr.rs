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

//! Fast Weighted Round-Robin server selection (spec §4.2).
//!
//! Grounded on `lb_fwrr.c`: `fwrr_get_next_server`, `fwrr_queue_srv`,
//! `fwrr_switch_trees`, `fwrr_set_server_status_{up,down}`,
//! `fwrr_update_server_weight`. The embedded binary trees (`eb32`) used
//! there are emulated here with `BTreeMap<(u32, u64), ServerId>`: the `u64`
//! is a monotonically increasing insertion sequence, giving FIFO order
//! among servers that land on the same composite key, which a duplicate-
//! key-tolerant binary tree gives for free.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::backend::{Backend, ServerClass};
use crate::server::{
    ServerId, ServerState, TreeMembership, TreeSlot, BE_WEIGHT_SCALE, SRV_EWGHT_MAX,
    SRV_UWGHT_RANGE,
};

type Tree = BTreeMap<(u32, u64), ServerId>;

/// Per-(backend, active-or-backup, thread-group) FWRR selection state.
#[derive(Debug, Default)]
pub struct FwrrGroup {
    curr: Tree,
    t0: Tree,
    t1: Tree,
    /// `true` when `t0` is currently the logical `init` tree.
    init_is_t0: bool,
    curr_weight: u32,
    curr_pos: i64,
    seq: u64,
}

impl FwrrGroup {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn init_slot(&self) -> TreeSlot {
        if self.init_is_t0 { TreeSlot::T0 } else { TreeSlot::T1 }
    }

    fn init_tree(&self) -> &Tree {
        if self.init_is_t0 { &self.t0 } else { &self.t1 }
    }

    fn tree_mut(&mut self, slot: TreeSlot) -> &mut Tree {
        match slot {
            TreeSlot::Curr => &mut self.curr,
            TreeSlot::T0 => &mut self.t0,
            TreeSlot::T1 => &mut self.t1,
        }
    }

    fn switch_trees(&mut self, next_weight: u32) {
        self.init_is_t0 = !self.init_is_t0;
        self.curr_weight = next_weight;
        self.curr_pos = next_weight as i64;
    }
}

fn init_key(next_eweight: u32) -> u32 {
    SRV_EWGHT_MAX.saturating_sub(next_eweight)
}

fn position_key(npos: i64, rweight: u32, eweight: u32) -> u32 {
    let npos = npos.max(0);
    let term = (SRV_EWGHT_MAX as i64 + rweight as i64 - eweight as i64) / BE_WEIGHT_SCALE as i64;
    (SRV_UWGHT_RANGE as i64 * npos + term.max(0)) as u32
}

/// Inserts `sid` into `group`'s init tree, keyed heaviest-first, mirroring
/// `fwrr_queue_by_weight(grp->init, ...)`.
fn queue_by_weight(backend: &Backend, group: &mut FwrrGroup, tgid: usize, sid: ServerId) {
    let srv = &backend.servers[sid.0];
    let key = init_key(srv.next_eweight());
    let seq = group.next_seq();
    let slot = group.init_slot();
    group.tree_mut(slot).insert((key, seq), sid);
    *srv.membership(tgid) = Some(TreeMembership { slot, key: (key, seq) });
}

/// Places `sid` into `curr` or `next` per its current `npos`, mirroring
/// `fwrr_queue_srv`.
fn queue_srv(backend: &Backend, group: &mut FwrrGroup, tgid: usize, next_weight: u32, sid: ServerId) {
    let srv = &backend.servers[sid.0];
    if !srv.currently_usable() {
        *srv.membership(tgid) = None;
        return;
    }
    let eweight = srv.next_eweight();
    let mut pos = srv.position(tgid);
    if pos.npos >= 2 * group.curr_weight as i64 || pos.npos >= (group.curr_weight + next_weight) as i64 {
        pos.npos -= group.curr_weight as i64;
        let key = position_key(pos.npos, pos.rweight, eweight);
        drop(pos);
        let seq = group.next_seq();
        let slot = if group.init_is_t0 { TreeSlot::T1 } else { TreeSlot::T0 };
        group.tree_mut(slot).insert((key, seq), sid);
        *srv.membership(tgid) = Some(TreeMembership { slot, key: (key, seq) });
    } else {
        let key = position_key(pos.npos, pos.rweight, eweight);
        drop(pos);
        let seq = group.next_seq();
        group.curr.insert((key, seq), sid);
        *srv.membership(tgid) = Some(TreeMembership { slot: TreeSlot::Curr, key: (key, seq) });
    }
}

fn dequeue_from_tree(backend: &Backend, group: &mut FwrrGroup, tgid: usize, sid: ServerId) {
    let srv = &backend.servers[sid.0];
    if let Some(m) = srv.membership(tgid).take() {
        group.tree_mut(m.slot).remove(&m.key);
    }
}

/// Mirrors `fwrr_get_server_from_group`: peeks (without removing) the
/// lowest-keyed eligible candidate from `curr`, falling back to the `init`
/// tree's heaviest server, resetting its position on the way out.
fn peek_candidate(backend: &Backend, group: &FwrrGroup, tgid: usize) -> Option<ServerId> {
    let s1 = group.curr.iter().next().map(|(_, &sid)| sid);
    if let Some(sid) = s1 {
        let srv = &backend.servers[sid.0];
        if srv.cur_eweight() != 0 && srv.position(tgid).npos <= group.curr_pos {
            return Some(sid);
        }
    }
    if let Some((_, &sid)) = group.init_tree().iter().next() {
        let srv = &backend.servers[sid.0];
        if srv.cur_eweight() != 0 {
            let mut pos = srv.position(tgid);
            pos.npos = 0;
            pos.rweight = 0;
            return Some(sid);
        }
    }
    s1
}

/// Mirrors `fwrr_update_position`.
fn update_position(backend: &Backend, group: &FwrrGroup, tgid: usize, next_weight: u32, sid: ServerId) {
    let srv = &backend.servers[sid.0];
    let eweight = srv.cur_eweight();
    if eweight == 0 {
        return;
    }
    let mut pos = srv.position(tgid);
    if pos.npos == 0 {
        pos.npos = group.curr_pos;
    }
    pos.lpos = pos.npos;
    pos.npos += (next_weight / eweight) as i64;
    pos.rweight += next_weight % eweight;
    if pos.rweight >= eweight {
        pos.rweight -= eweight;
        pos.npos += 1;
    }
}

fn is_saturated(backend: &Backend, sid: ServerId, now: Instant) -> bool {
    let srv = &backend.servers[sid.0];
    if srv.maxconn == 0 {
        return false;
    }
    if srv.queuelen() > 0 {
        return true;
    }
    let beconn = backend.beconn();
    let fullconn = backend.fullconn.load(Ordering::Relaxed);
    srv.served() >= crate::server::dynamic_maxconn(srv, beconn, fullconn, now)
}

/// Picks the next server to hand a request to, avoiding `avoid` when a
/// better candidate exists (spec §4.2 "Selection algorithm").
///
/// Mirrors `fwrr_get_next_server`: selects the active group if any active
/// server is usable, else the fixed single backup (`fbck`) if configured,
/// else the backup group, else `None`.
pub fn get_next_server(backend: &Backend, tgid: usize, avoid: Option<ServerId>, now: Instant) -> Option<ServerId> {
    if backend.srv_act.load(Ordering::Relaxed) > 0 {
        return select_from_group(backend, ServerClass::Active, tgid, avoid, now);
    }
    if let Some(fbck) = *backend.fbck.lock().unwrap() {
        return Some(fbck);
    }
    if backend.srv_bck.load(Ordering::Relaxed) > 0 {
        return select_from_group(backend, ServerClass::Backup, tgid, avoid, now);
    }
    None
}

fn select_from_group(
    backend: &Backend, class: ServerClass, tgid: usize, avoid: Option<ServerId>, now: Instant,
) -> Option<ServerId> {
    let mut group = backend.fwrr_group(class, tgid).lock().unwrap();
    let next_weight = backend.total_weight(class);

    let mut switched = false;
    let mut avoided: Option<ServerId> = None;
    let mut full: Vec<ServerId> = Vec::new();
    let mut chosen: Option<ServerId> = None;

    loop {
        if group.curr_weight == 0 {
            group.curr_weight = next_weight;
            group.curr_pos = next_weight as i64;
        }

        let candidate = loop {
            if let Some(sid) = peek_candidate(backend, &group, tgid) {
                break Some(sid);
            }
            if switched {
                break None;
            }
            switched = true;
            group.switch_trees(next_weight);
        };

        let sid = match candidate {
            Some(sid) => sid,
            None => {
                chosen = avoided;
                break;
            }
        };

        update_position(backend, &group, tgid, next_weight, sid);
        dequeue_from_tree(backend, &mut group, tgid, sid);
        group.curr_pos += 1;

        if !is_saturated(backend, sid, now) {
            if Some(sid) != avoid || avoided.is_some() {
                chosen = Some(sid);
                break;
            }
            avoided = Some(sid);
        }
        full.push(sid);
    }

    if let Some(sid) = chosen {
        queue_srv(backend, &mut group, tgid, next_weight, sid);
    }

    for sid in full {
        if Some(sid) == chosen {
            continue;
        }
        if switched {
            queue_by_weight(backend, &mut group, tgid, sid);
        } else {
            queue_srv(backend, &mut group, tgid, next_weight, sid);
        }
    }

    chosen
}

/// Marks a server up, mirroring `fwrr_set_server_status_up`: recomputes
/// backend weight totals and inserts the server into every thread-group's
/// `init` tree.
pub fn set_server_status_up(backend: &Backend, sid: ServerId) {
    let srv = &backend.servers[sid.0];
    srv.set_state(ServerState::Up);
    let eweight = srv.next_eweight();
    srv.set_cur_eweight(eweight);

    let (total, class) = if srv.backup {
        (backend.tot_wbck.fetch_add(eweight, Ordering::AcqRel) + eweight, ServerClass::Backup)
    } else {
        (backend.tot_wact.fetch_add(eweight, Ordering::AcqRel) + eweight, ServerClass::Active)
    };
    match class {
        ServerClass::Active => { backend.srv_act.fetch_add(1, Ordering::AcqRel); }
        ServerClass::Backup => {
            backend.srv_bck.fetch_add(1, Ordering::AcqRel);
            if !backend.use_all_backups {
                let mut fbck = backend.fbck.lock().unwrap();
                if fbck.is_none() {
                    *fbck = Some(sid);
                }
            }
        }
    }

    for tgid in 0..backend.tgroups {
        let mut group = backend.fwrr_group(class, tgid).lock().unwrap();
        let mut pos = srv.position(tgid);
        pos.npos = group.curr_pos + (total as i64 + group.curr_weight as i64 - group.curr_pos) / eweight.max(1) as i64;
        drop(pos);
        queue_srv(backend, &mut group, tgid, total, sid);
    }
}

/// Marks a server down, mirroring `fwrr_set_server_status_down`: removes it
/// from every thread-group tree and recomputes backend weight totals.
pub fn set_server_status_down(backend: &Backend, sid: ServerId) {
    let srv = &backend.servers[sid.0];
    let class = if srv.backup { ServerClass::Backup } else { ServerClass::Active };
    let was_usable = srv.currently_usable();
    srv.set_state(ServerState::Down);
    srv.set_cur_eweight(0);

    if !was_usable {
        return;
    }

    for tgid in 0..backend.tgroups {
        let mut group = backend.fwrr_group(class, tgid).lock().unwrap();
        dequeue_from_tree(backend, &mut group, tgid, sid);
    }

    let eweight = srv.next_eweight();
    match class {
        ServerClass::Active => {
            backend.tot_wact.fetch_sub(eweight, Ordering::AcqRel);
            backend.srv_act.fetch_sub(1, Ordering::AcqRel);
        }
        ServerClass::Backup => {
            backend.tot_wbck.fetch_sub(eweight, Ordering::AcqRel);
            backend.srv_bck.fetch_sub(1, Ordering::AcqRel);
            let mut fbck = backend.fbck.lock().unwrap();
            if *fbck == Some(sid) {
                *fbck = backend
                    .servers
                    .iter()
                    .find(|s| s.backup && s.id != sid && s.currently_usable())
                    .map(|s| s.id);
            }
        }
    }
}

/// Recomputes a server's placement after its weight changes, mirroring
/// `fwrr_update_server_weight`'s in-place re-placement branch (no status
/// change): re-place the server in the same group, recomputing its `npos`
/// from its last-known `lpos` and the new per-unit step, clamped so it
/// neither gains ground it hadn't earned nor falls behind the window
/// cursor.
pub fn update_server_weight(backend: &Backend, sid: ServerId, new_uweight: u32) {
    let srv = &backend.servers[sid.0];
    let was_usable = srv.currently_usable();
    let will_be_usable = new_uweight > 0 && srv.state() != ServerState::Down;
    srv.set_next_eweight(new_uweight * BE_WEIGHT_SCALE);

    if !was_usable && !will_be_usable {
        return;
    }
    if !was_usable && will_be_usable {
        set_server_status_up(backend, sid);
        return;
    }
    if was_usable && !will_be_usable {
        set_server_status_down(backend, sid);
        return;
    }

    let class = if srv.backup { ServerClass::Backup } else { ServerClass::Active };
    let old_eweight = srv.cur_eweight();
    let new_eweight = srv.next_eweight();
    let total = match class {
        ServerClass::Active => {
            (backend.tot_wact.fetch_add(new_eweight, Ordering::AcqRel) + new_eweight).saturating_sub(old_eweight)
        }
        ServerClass::Backup => {
            (backend.tot_wbck.fetch_add(new_eweight, Ordering::AcqRel) + new_eweight).saturating_sub(old_eweight)
        }
    };
    srv.set_cur_eweight(new_eweight);

    for tgid in 0..backend.tgroups {
        let mut group = backend.fwrr_group(class, tgid).lock().unwrap();
        let membership = *srv.membership(tgid);
        match membership {
            Some(m) if m.slot == group.init_slot() => {
                dequeue_from_tree(backend, &mut group, tgid, sid);
                queue_by_weight(backend, &mut group, tgid, sid);
            }
            None => {
                let mut pos = srv.position(tgid);
                pos.npos = group.curr_pos
                    + (total as i64 + group.curr_weight as i64 - group.curr_pos) / new_eweight.max(1) as i64;
                drop(pos);
                queue_srv(backend, &mut group, tgid, total, sid);
            }
            Some(_) => {
                let prev_next;
                {
                    let mut pos = srv.position(tgid);
                    prev_next = pos.npos;
                    if new_eweight > 0 {
                        let step = total as i64 / new_eweight as i64;
                        pos.npos = pos.lpos + step;
                        pos.rweight = 0;
                        if pos.npos > prev_next {
                            pos.npos = prev_next;
                        }
                        if pos.npos < group.curr_pos + 2 {
                            pos.npos = group.curr_pos + step;
                        }
                    } else {
                        pos.npos = group.curr_pos + group.curr_weight as i64;
                    }
                }
                dequeue_from_tree(backend, &mut group, tgid, sid);
                queue_srv(backend, &mut group, tgid, total, sid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with(weights: &[u32]) -> Backend {
        let mut backend = Backend::new(1, false);
        for (i, &w) in weights.iter().enumerate() {
            backend.add_server(format!("s{i}"), w, false);
        }
        for sid in (0..weights.len()).map(ServerId) {
            set_server_status_up(&backend, sid);
        }
        backend
    }

    #[test]
    fn equal_weights_round_robin_evenly() {
        let backend = backend_with(&[10, 10, 10]);
        let now = Instant::now();
        let mut counts = [0u32; 3];
        for _ in 0..300 {
            let sid = get_next_server(&backend, 0, None, now).expect("a server");
            counts[sid.0] += 1;
            backend.servers[sid.0].release_slot();
        }
        for c in counts {
            assert!((90..=110).contains(&c), "counts={counts:?}");
        }
    }

    #[test]
    fn heavier_server_gets_proportionally_more_picks() {
        let backend = backend_with(&[20, 10]);
        let now = Instant::now();
        let mut counts = [0u32; 2];
        for _ in 0..300 {
            let sid = get_next_server(&backend, 0, None, now).expect("a server");
            counts[sid.0] += 1;
        }
        assert!(counts[0] > counts[1]);
        let ratio = counts[0] as f64 / counts[1] as f64;
        assert!((1.6..=2.4).contains(&ratio), "ratio={ratio}");
    }

    #[test]
    fn down_server_is_never_selected() {
        let backend = backend_with(&[10, 10]);
        set_server_status_down(&backend, ServerId(1));
        let now = Instant::now();
        for _ in 0..50 {
            let sid = get_next_server(&backend, 0, None, now).expect("a server");
            assert_eq!(sid, ServerId(0));
        }
    }

    #[test]
    fn no_servers_up_returns_none() {
        let backend = Backend::new(1, false);
        assert!(get_next_server(&backend, 0, None, Instant::now()).is_none());
    }

    #[test]
    fn backup_used_only_when_no_active_servers() {
        let mut backend = Backend::new(1, false);
        backend.add_server("act", 10, false);
        backend.add_server("bck", 10, true);
        set_server_status_up(&backend, ServerId(0));
        set_server_status_up(&backend, ServerId(1));
        let now = Instant::now();
        assert_eq!(get_next_server(&backend, 0, None, now), Some(ServerId(0)));
        set_server_status_down(&backend, ServerId(0));
        assert_eq!(get_next_server(&backend, 0, None, now), Some(ServerId(1)));
    }
}
