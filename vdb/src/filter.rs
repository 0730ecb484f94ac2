// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attribute filters for list operations.
//!
//! A filter maps an attribute name to a set of accepted values. An item
//! matches when, for every filter with a non empty value set, at least one of
//! the item's values for that attribute is in the set. Scalar attributes have
//! a single value, list attributes match on any member.

use crate::error::Error;
use crate::types::{
    Bgpvpn, Filters, NetworkAssociation, PortAssociation, RouterAssociation,
};

pub trait Filterable {
    /// Attribute names that may be filtered on.
    const ATTRIBUTES: &'static [&'static str];

    /// The values of an attribute, rendered as strings.
    fn attribute(&self, name: &str) -> Vec<String>;
}

pub fn validate<T: Filterable>(filters: &Filters) -> Result<(), Error> {
    for name in filters.keys() {
        if !T::ATTRIBUTES.contains(&name.as_str()) {
            return Err(Error::Validation(format!(
                "unknown filter attribute '{name}'"
            )));
        }
    }
    Ok(())
}

pub fn matches<T: Filterable>(item: &T, filters: &Filters) -> bool {
    filters.iter().all(|(name, accepted)| {
        accepted.is_empty()
            || item.attribute(name).iter().any(|v| accepted.contains(v))
    })
}

pub fn apply<T: Filterable>(
    items: Vec<T>,
    filters: &Filters,
) -> Result<Vec<T>, Error> {
    validate::<T>(filters)?;
    Ok(items.into_iter().filter(|i| matches(i, filters)).collect())
}

impl Filterable for Bgpvpn {
    const ATTRIBUTES: &'static [&'static str] = &[
        "id",
        "tenant_id",
        "name",
        "type",
        "route_targets",
        "import_targets",
        "export_targets",
        "route_distinguishers",
        "vni",
        "local_pref",
        "networks",
        "routers",
        "ports",
        "shared",
    ];

    fn attribute(&self, name: &str) -> Vec<String> {
        match name {
            "id" => vec![self.id.to_string()],
            "tenant_id" => vec![self.tenant_id.clone()],
            "name" => vec![self.name.clone()],
            "type" => vec![self.vpn_type.to_string()],
            "route_targets" => self.route_targets.clone(),
            "import_targets" => self.import_targets.clone(),
            "export_targets" => self.export_targets.clone(),
            "route_distinguishers" => self.route_distinguishers.clone(),
            "vni" => self.vni.iter().map(|v| v.to_string()).collect(),
            "local_pref" => {
                self.local_pref.iter().map(|v| v.to_string()).collect()
            }
            "networks" => self.networks.clone(),
            "routers" => self.routers.clone(),
            "ports" => self.ports.clone(),
            "shared" => vec![self.shared.to_string()],
            _ => Vec::new(),
        }
    }
}

impl Filterable for NetworkAssociation {
    const ATTRIBUTES: &'static [&'static str] =
        &["id", "tenant_id", "bgpvpn_id", "network_id"];

    fn attribute(&self, name: &str) -> Vec<String> {
        match name {
            "id" => vec![self.id.to_string()],
            "tenant_id" => vec![self.tenant_id.clone()],
            "bgpvpn_id" => vec![self.bgpvpn_id.to_string()],
            "network_id" => vec![self.network_id.clone()],
            _ => Vec::new(),
        }
    }
}

impl Filterable for RouterAssociation {
    const ATTRIBUTES: &'static [&'static str] = &[
        "id",
        "tenant_id",
        "bgpvpn_id",
        "router_id",
        "advertise_extra_routes",
    ];

    fn attribute(&self, name: &str) -> Vec<String> {
        match name {
            "id" => vec![self.id.to_string()],
            "tenant_id" => vec![self.tenant_id.clone()],
            "bgpvpn_id" => vec![self.bgpvpn_id.to_string()],
            "router_id" => vec![self.router_id.clone()],
            "advertise_extra_routes" => {
                vec![self.advertise_extra_routes.to_string()]
            }
            _ => Vec::new(),
        }
    }
}

impl Filterable for PortAssociation {
    const ATTRIBUTES: &'static [&'static str] = &[
        "id",
        "tenant_id",
        "bgpvpn_id",
        "port_id",
        "advertise_fixed_ips",
    ];

    fn attribute(&self, name: &str) -> Vec<String> {
        match name {
            "id" => vec![self.id.to_string()],
            "tenant_id" => vec![self.tenant_id.clone()],
            "bgpvpn_id" => vec![self.bgpvpn_id.to_string()],
            "port_id" => vec![self.port_id.clone()],
            "advertise_fixed_ips" => {
                vec![self.advertise_fixed_ips.to_string()]
            }
            _ => Vec::new(),
        }
    }
}
