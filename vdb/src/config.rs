// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Store configuration, resolved once when the database is opened.

use crate::error::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Optional API extensions. These control which optional attributes appear
/// in decoded BGPVPN views.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct Capabilities {
    /// Expose the `vni` attribute.
    pub vni: bool,
    /// Expose the `local_pref` attribute.
    pub routes_control: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            vni: true,
            routes_control: true,
        }
    }
}

/// An inclusive range of numbers used for auto allocated targets.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct TargetIdRange {
    pub low: u32,
    pub high: u32,
}

impl Default for TargetIdRange {
    fn default() -> Self {
        Self {
            low: 300,
            high: 1000,
        }
    }
}

impl Display for TargetIdRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

impl FromStr for TargetIdRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (low, high) = s.split_once('-').ok_or_else(|| {
            Error::Validation(format!(
                "target id range '{s}' is not of the form LOW-HIGH"
            ))
        })?;
        let parse = |x: &str| {
            x.trim().parse::<u32>().map_err(|e| {
                Error::Validation(format!("target id range '{s}': {e}"))
            })
        };
        let range = Self {
            low: parse(low)?,
            high: parse(high)?,
        };
        if range.low > range.high {
            return Err(Error::Validation(format!(
                "target id range '{s}' is empty"
            )));
        }
        Ok(range)
    }
}

/// Automatic route target allocation for BGPVPNs created without targets.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct TargetAllocation {
    /// The region ASN allocated targets are formed from, as
    /// `<region_asn>:<n>`.
    pub region_asn: Option<String>,
    pub target_id_range: TargetIdRange,
    pub route_target_auto_allocation: bool,
    pub import_target_auto_allocation: bool,
    pub export_target_auto_allocation: bool,
}

impl TargetAllocation {
    pub fn enabled(&self) -> bool {
        self.route_target_auto_allocation
            || self.import_target_auto_allocation
            || self.export_target_auto_allocation
    }
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct StoreConfig {
    pub capabilities: Capabilities,
    pub allocation: TargetAllocation,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let alloc = &self.allocation;
        if alloc.enabled() && alloc.region_asn.is_none() {
            return Err(Error::Validation(
                "target auto allocation requires a region asn".into(),
            ));
        }
        if let Some(asn) = &alloc.region_asn {
            crate::rtrd::validate("region_asn", &[asn])?;
        }
        if alloc.target_id_range.low > alloc.target_id_range.high {
            return Err(Error::Validation(format!(
                "target id range {} is empty",
                alloc.target_id_range
            )));
        }
        Ok(())
    }
}
