// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route target auto allocation.
//!
//! Targets take the form `<region_asn>:<n>` with `n` drawn from the
//! configured range. Candidates are picked outside of the write transaction,
//! and the transaction claims them in the allocation tree. A claim that
//! collides with a concurrent allocation fails the transaction, which is then
//! retried with fresh candidates.

use crate::config::TargetAllocation;
use crate::error::Error;
use crate::types::BgpvpnCreate;
use std::collections::BTreeSet;

/// Number of times a create is retried after losing an allocation race.
pub(crate) const MAX_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub route: Option<String>,
    pub import: Option<String>,
    pub export: Option<String>,
}

impl Allocation {
    pub fn targets(&self) -> impl Iterator<Item = &String> {
        self.route
            .iter()
            .chain(self.import.iter())
            .chain(self.export.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.targets().next().is_none()
    }
}

/// Choose targets for every enabled list the create request leaves empty.
pub(crate) fn plan(
    cfg: &TargetAllocation,
    used: &BTreeSet<String>,
    spec: &BgpvpnCreate,
) -> Result<Allocation, Error> {
    let mut result = Allocation::default();
    if !cfg.enabled() {
        return Ok(result);
    }
    let Some(asn) = &cfg.region_asn else {
        return Ok(result);
    };

    let empty = |l: &Option<Vec<String>>| l.as_ref().map_or(true, Vec::is_empty);
    let mut taken = used.clone();
    let mut next = || -> Result<String, Error> {
        let range = cfg.target_id_range;
        for n in range.low..=range.high {
            let target = format!("{asn}:{n}");
            if !taken.contains(&target) {
                taken.insert(target.clone());
                return Ok(target);
            }
        }
        Err(Error::Conflict(format!(
            "route target id range {range} is exhausted"
        )))
    };

    if cfg.route_target_auto_allocation && spec.route_targets.is_empty() {
        result.route = Some(next()?);
    }
    if cfg.import_target_auto_allocation && empty(&spec.import_targets) {
        result.import = Some(next()?);
    }
    if cfg.export_target_auto_allocation && empty(&spec.export_targets) {
        result.export = Some(next()?);
    }
    Ok(result)
}
