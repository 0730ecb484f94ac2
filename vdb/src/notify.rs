// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Delta event fan out.
//!
//! Events are produced after their transaction commits, so two writers to the
//! same BGPVPN may finish in either order. Each event carries the BGPVPN's
//! sequence number from the commit, and events are released to watchers
//! strictly in sequence order per BGPVPN. Events for different BGPVPNs are not
//! ordered with respect to each other.

use crate::log::notify_log;
use crate::types::{ChangeKind, DeltaEvent, Entity};
use slog::Logger;
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, RwLock};
use uuid::Uuid;
use vpn_common::{lock, read_lock, write_lock};

/// How many out of order events may be held for one BGPVPN before they are
/// released regardless of gaps.
const MAX_HELD: usize = 64;

#[derive(Clone)]
struct Watcher {
    tag: String,
    sender: Sender<DeltaEvent>,
}

struct Sequencer {
    next: u64,
    held: BTreeMap<u64, DeltaEvent>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self {
            next: 1,
            held: BTreeMap::new(),
        }
    }
}

pub struct Notifier {
    watchers: RwLock<Vec<Watcher>>,
    order: Mutex<HashMap<Uuid, Sequencer>>,
    log: Logger,
}

impl Notifier {
    pub fn new(log: Logger) -> Self {
        Self {
            watchers: RwLock::new(Vec::new()),
            order: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn watch(&self, tag: String, sender: Sender<DeltaEvent>) {
        write_lock!(self.watchers).push(Watcher { tag, sender });
    }

    /// Record the last committed sequence number of an existing BGPVPN.
    pub fn seed(&self, bgpvpn_id: Uuid, sequence: u64) {
        lock!(self.order).insert(
            bgpvpn_id,
            Sequencer {
                next: sequence + 1,
                held: BTreeMap::new(),
            },
        );
    }

    pub fn emit(&self, event: DeltaEvent) {
        // The order lock is held through delivery so that releases from
        // different writer threads cannot interleave.
        let mut order = lock!(self.order);
        let bgpvpn_id = event.bgpvpn_id;
        let seq = order.entry(bgpvpn_id).or_default();

        let mut ready = Vec::new();
        if event.sequence < seq.next {
            notify_log!(self, warn,
                "stale event for bgpvpn {bgpvpn_id}";
                "sequence" => event.sequence,
                "expected" => seq.next
            );
            ready.push(event);
        } else {
            seq.held.insert(event.sequence, event);
        }

        while let Some(e) = seq.held.remove(&seq.next) {
            seq.next += 1;
            ready.push(e);
        }

        if seq.held.len() > MAX_HELD {
            notify_log!(self, warn,
                "releasing {} held events for bgpvpn {bgpvpn_id}",
                seq.held.len();
                "expected" => seq.next
            );
            let held = std::mem::take(&mut seq.held);
            for (sequence, e) in held {
                seq.next = sequence + 1;
                ready.push(e);
            }
        }

        let deleted = ready.iter().any(|e| {
            e.kind == ChangeKind::Deleted && e.entity == Entity::Bgpvpn
        });
        if deleted && seq.held.is_empty() {
            order.remove(&bgpvpn_id);
        }

        for e in ready {
            self.deliver(e);
        }
    }

    fn deliver(&self, event: DeltaEvent) {
        for Watcher { tag, sender } in read_lock!(self.watchers).iter() {
            if let Err(e) = sender.send(event.clone()) {
                notify_log!(self, error,
                    "failed to send notification to watcher '{tag}': {e}";
                    "bgpvpn" => event.bgpvpn_id.to_string()
                );
            }
        }
    }
}
