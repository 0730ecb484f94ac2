// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the agent synchronization loop.
#[derive(Default)]
pub struct LowerStats {
    pub attach_sent: AtomicU64,
    pub detach_sent: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub events_handled: AtomicU64,
    pub resyncs: AtomicU64,
}

/// A point in time copy of [`LowerStats`].
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct LowerStatsSnapshot {
    pub attach_sent: u64,
    pub detach_sent: u64,
    pub dispatch_failures: u64,
    pub events_handled: u64,
    pub resyncs: u64,
}

impl LowerStats {
    pub fn snapshot(&self) -> LowerStatsSnapshot {
        LowerStatsSnapshot {
            attach_sent: self.attach_sent.load(Ordering::Relaxed),
            detach_sent: self.detach_sent.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            events_handled: self.events_handled.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
