// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Port association route resolution.
//!
//! Routes arrive as loosely typed [`RouteSpec`] records and are resolved into
//! [`PortAssociationRoute`] rows. A `prefix` route carries only a prefix and a
//! `bgpvpn` route carries only a referenced BGPVPN. Anything else is rejected
//! before it reaches the store.

use crate::error::Error;
use crate::types::{PortAssociationRoute, RouteSpec, RouteTarget};
use oxnet::IpNet;
use uuid::Uuid;

pub const ROUTE_TYPE_PREFIX: &str = "prefix";
pub const ROUTE_TYPE_BGPVPN: &str = "bgpvpn";

/// Validate a single route and return what it points at.
pub fn resolve_target(spec: &RouteSpec) -> Result<RouteTarget, Error> {
    match spec.route_type.as_str() {
        ROUTE_TYPE_PREFIX => {
            if spec.bgpvpn_id.is_some() {
                return Err(Error::Validation(
                    "a prefix route must not reference a bgpvpn".into(),
                ));
            }
            let prefix = spec.prefix.as_ref().ok_or_else(|| {
                Error::Validation("a prefix route requires a prefix".into())
            })?;
            prefix.parse::<IpNet>().map_err(|e| {
                Error::Validation(format!("invalid route prefix {prefix}: {e}"))
            })?;
            Ok(RouteTarget::Prefix {
                prefix: prefix.clone(),
            })
        }
        ROUTE_TYPE_BGPVPN => {
            if spec.prefix.is_some() {
                return Err(Error::Validation(
                    "a bgpvpn route must not carry a prefix".into(),
                ));
            }
            let bgpvpn_id = spec.bgpvpn_id.ok_or_else(|| {
                Error::Validation("a bgpvpn route requires a bgpvpn_id".into())
            })?;
            Ok(RouteTarget::Bgpvpn { bgpvpn_id })
        }
        other => Err(Error::Validation(format!(
            "unsupported route type '{other}'"
        ))),
    }
}

/// Resolve a full route list for a port association, assigning fresh ids.
/// Either every route is valid or nothing is returned.
pub fn resolve_routes(
    port_association_id: Uuid,
    specs: &[RouteSpec],
) -> Result<Vec<PortAssociationRoute>, Error> {
    specs
        .iter()
        .map(|spec| {
            Ok(PortAssociationRoute {
                id: Uuid::new_v4(),
                port_association_id,
                local_pref: spec.local_pref,
                target: resolve_target(spec)?,
            })
        })
        .collect()
}
