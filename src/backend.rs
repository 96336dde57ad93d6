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

//! Backend (proxy): the set of servers behind one FastCGI application,
//! plus the per-thread-group load-balancer and queue state that hangs off
//! it (spec §3 "Backend (proxy)").

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::lb::fwrr::FwrrGroup;
use crate::queue::Queue;
use crate::server::{Server, ServerId};

/// Which of a backend's two weight classes a server belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerClass {
    /// Counts towards `tot_wact`/`srv_act`.
    Active,
    /// Counts towards `tot_wbck`/`srv_bck`.
    Backup,
}

/// A backend grouping of servers, load-balanced as a unit.
pub struct Backend {
    /// Servers, indexed by [`ServerId`].
    pub servers: Vec<Server>,
    /// Number of thread groups this backend's state is sharded over.
    pub tgroups: usize,
    /// Total effective weight of up, non-backup servers.
    pub tot_wact: AtomicU32,
    /// Total effective weight of up, backup servers.
    pub tot_wbck: AtomicU32,
    /// Count of usable active servers.
    pub srv_act: AtomicU32,
    /// Count of usable backup servers.
    pub srv_bck: AtomicU32,
    /// Whether every backup server should be used (vs. a single `fbck`).
    pub use_all_backups: bool,
    /// The one backup server to prefer when `!use_all_backups`.
    pub fbck: Mutex<Option<ServerId>>,
    /// Per-thread-group FWRR groups, one pair (active, backup) per group.
    pub fwrr: Vec<[Mutex<FwrrGroup>; 2]>,
    /// Per-thread-group backend-level pending queue (used when a request
    /// has no preassigned server).
    pub queues: Vec<Queue>,
    /// Hint: a server that just finished draining with nothing left to do,
    /// offered first to avoid a racing enqueue starving.
    pub ready_srv: Mutex<Option<ServerId>>,
    /// Count of requests currently assigned anywhere in this backend,
    /// mirrored by [`Server::served`] sums; used by the "both drained"
    /// `ready_srv` publication check.
    pub served: AtomicU32,
    /// Concurrent-connection high-water mark used by dynamic maxconn.
    pub fullconn: AtomicU32,
    /// Total pending entries across every server and backend queue.
    pub totpend: AtomicU32,
}

impl Backend {
    /// Builds an empty backend sharded over `tgroups` thread groups.
    pub fn new(tgroups: usize, use_all_backups: bool) -> Self {
        Self {
            servers: Vec::new(),
            tgroups,
            tot_wact: AtomicU32::new(0),
            tot_wbck: AtomicU32::new(0),
            srv_act: AtomicU32::new(0),
            srv_bck: AtomicU32::new(0),
            use_all_backups,
            fbck: Mutex::new(None),
            fwrr: (0..tgroups)
                .map(|_| [Mutex::new(FwrrGroup::default()), Mutex::new(FwrrGroup::default())])
                .collect(),
            queues: (0..tgroups).map(|_| Queue::new()).collect(),
            ready_srv: Mutex::new(None),
            served: AtomicU32::new(0),
            fullconn: AtomicU32::new(0),
            totpend: AtomicU32::new(0),
        }
    }

    /// Adds a server, returning its id. Must be called before the backend
    /// is shared across threads (mirrors configuration-time construction;
    /// spec §3 "Lifecycle: created at configuration").
    pub fn add_server(&mut self, name: impl Into<String>, uweight: u32, backup: bool) -> ServerId {
        let id = ServerId(self.servers.len());
        self.servers.push(Server::new(id, name, uweight, backup, self.tgroups));
        id
    }

    /// The FWRR group for `(class, tgid)`.
    pub fn fwrr_group(&self, class: ServerClass, tgid: usize) -> &Mutex<FwrrGroup> {
        let slot = match class {
            ServerClass::Active => 0,
            ServerClass::Backup => 1,
        };
        &self.fwrr[tgid][slot]
    }

    /// Current total usable weight for `class`, used to reset a group's
    /// `curr_weight` on phase switch.
    pub fn total_weight(&self, class: ServerClass) -> u32 {
        match class {
            ServerClass::Active => self.tot_wact.load(Ordering::Relaxed),
            ServerClass::Backup => self.tot_wbck.load(Ordering::Relaxed),
        }
    }

    /// Total currently-assigned request count across every server, used by
    /// the dynamic maxconn computation's `beconn` input.
    pub fn beconn(&self) -> u32 {
        self.servers.iter().map(|s| s.served()).sum()
    }
}
