// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted layout of the association store.
//!
//! Every logical table lives in its own sled tree and rows are stored as
//! JSON. Child rows are keyed by `<parent>/<id>` so that they sort next to
//! their siblings. A BGPVPN row records the keys of everything it owns, which
//! lets a single transaction cascade a delete without range scans.

use crate::error::Error;
use crate::types::{AssociationKind, Binding, StandardAttributes, VpnType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{
    abort, ConflictableTransactionResult, TransactionalTree,
};
use sled::Tree;
use uuid::Uuid;

/// BGPVPN rows keyed by id.
const BGPVPNS: &str = "bgpvpns";

/// RBAC grants keyed by `<bgpvpn>/<action>/<target project>`.
const BGPVPN_RBACS: &str = "bgpvpn_rbacs";

const NETWORK_ASSOCIATIONS: &str = "bgpvpn_network_associations";
const ROUTER_ASSOCIATIONS: &str = "bgpvpn_router_associations";
const PORT_ASSOCIATIONS: &str = "bgpvpn_port_associations";

/// Port association routes keyed by `<port association>/<route>`.
const PORT_ASSOCIATION_ROUTES: &str = "bgpvpn_port_association_routes";

/// `<kind>/<resource>/<bgpvpn>` to association id. Inserting into this tree is
/// the uniqueness constraint for associations, and scanning it answers which
/// BGPVPNs a resource is attached to.
const RESOURCE_INDEX: &str = "bgpvpn_resource_index";

/// Auto allocated route targets, mapped to the owning BGPVPN.
const ALLOCATED_TARGETS: &str = "bgpvpn_allocated_targets";

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, Error>;

#[derive(Clone)]
pub(crate) struct Trees {
    pub bgpvpn: Tree,
    pub rbac: Tree,
    pub network: Tree,
    pub router: Tree,
    pub port: Tree,
    pub route: Tree,
    pub index: Tree,
    pub alloc: Tree,
}

impl Trees {
    pub fn open(db: &sled::Db) -> Result<Self, Error> {
        Ok(Self {
            bgpvpn: db.open_tree(BGPVPNS)?,
            rbac: db.open_tree(BGPVPN_RBACS)?,
            network: db.open_tree(NETWORK_ASSOCIATIONS)?,
            router: db.open_tree(ROUTER_ASSOCIATIONS)?,
            port: db.open_tree(PORT_ASSOCIATIONS)?,
            route: db.open_tree(PORT_ASSOCIATION_ROUTES)?,
            index: db.open_tree(RESOURCE_INDEX)?,
            alloc: db.open_tree(ALLOCATED_TARGETS)?,
        })
    }

    pub fn association(&self, kind: AssociationKind) -> &Tree {
        match kind {
            AssociationKind::Network => &self.network,
            AssociationKind::Router => &self.router,
            AssociationKind::Port => &self.port,
        }
    }
}

/// The transactional view of every tree.
pub(crate) struct Tx<'a> {
    pub bgpvpn: &'a TransactionalTree,
    pub rbac: &'a TransactionalTree,
    pub network: &'a TransactionalTree,
    pub router: &'a TransactionalTree,
    pub port: &'a TransactionalTree,
    pub route: &'a TransactionalTree,
    pub index: &'a TransactionalTree,
    pub alloc: &'a TransactionalTree,
}

impl Tx<'_> {
    pub fn association(&self, kind: AssociationKind) -> &TransactionalTree {
        match kind {
            AssociationKind::Network => self.network,
            AssociationKind::Router => self.router,
            AssociationKind::Port => self.port,
        }
    }
}

pub(crate) fn get<T: DeserializeOwned>(
    tree: &TransactionalTree,
    key: &str,
) -> TxResult<Option<T>> {
    match tree.get(key)? {
        None => Ok(None),
        Some(value) => match serde_json::from_slice(&value) {
            Ok(row) => Ok(Some(row)),
            Err(e) => abort(Error::Serialization(e)),
        },
    }
}

pub(crate) fn put<T: Serialize>(
    tree: &TransactionalTree,
    key: &str,
    row: &T,
) -> TxResult<()> {
    let value = match serde_json::to_vec(row) {
        Ok(value) => value,
        Err(e) => return abort(Error::Serialization(e)),
    };
    tree.insert(key, value)?;
    Ok(())
}

pub(crate) fn bgpvpn_key(id: Uuid) -> String {
    id.to_string()
}

pub(crate) fn child_key(parent: Uuid, id: Uuid) -> String {
    format!("{parent}/{id}")
}

pub(crate) fn index_prefix(kind: AssociationKind, resource_id: &str) -> String {
    format!("{}/{resource_id}/", kind.as_str())
}

pub(crate) fn index_key(
    kind: AssociationKind,
    resource_id: &str,
    bgpvpn_id: Uuid,
) -> String {
    format!("{}{bgpvpn_id}", index_prefix(kind, resource_id))
}

/// Decode a resource index entry.
pub(crate) fn parse_binding(key: &[u8], value: &[u8]) -> Result<Binding, Error> {
    let key = String::from_utf8_lossy(key);
    let mut parts = key.splitn(3, '/');
    let (Some(kind), Some(resource_id), Some(bgpvpn_id)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::DbKey(format!("malformed index key {key}")));
    };
    let bgpvpn_id = bgpvpn_id
        .parse()
        .map_err(|e| Error::DbKey(format!("index key {key}: {e}")))?;
    let association_id = String::from_utf8_lossy(value)
        .parse()
        .map_err(|e| Error::DbValue(format!("index value {key}: {e}")))?;
    Ok(Binding {
        kind: kind.parse()?,
        resource_id: resource_id.to_string(),
        bgpvpn_id,
        association_id,
    })
}

/// Resource ids become part of index keys.
pub(crate) fn validate_resource_id(
    kind: AssociationKind,
    resource_id: &str,
) -> Result<(), Error> {
    if resource_id.is_empty() || resource_id.contains('/') {
        return Err(Error::Validation(format!(
            "invalid {kind} id '{resource_id}'"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AssociationRef {
    pub id: Uuid,
    pub resource_id: String,
}

/// Recorded on a BGPVPN row for each port association route of another
/// BGPVPN that references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RouteRef {
    pub bgpvpn_id: Uuid,
    pub port_association_id: Uuid,
    pub route_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BgpvpnRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub vpn_type: VpnType,
    pub route_targets: String,
    pub import_targets: Option<String>,
    pub export_targets: Option<String>,
    pub route_distinguishers: Option<String>,
    pub vni: Option<u32>,
    pub local_pref: Option<u64>,
    pub standard: StandardAttributes,
    pub sequence: u64,
    pub network_associations: Vec<AssociationRef>,
    pub router_associations: Vec<AssociationRef>,
    pub port_associations: Vec<AssociationRef>,
    pub rbac_entries: Vec<String>,
    pub route_references: Vec<RouteRef>,
    pub allocated_targets: Vec<String>,
}

impl BgpvpnRow {
    pub fn associations(&self, kind: AssociationKind) -> &Vec<AssociationRef> {
        match kind {
            AssociationKind::Network => &self.network_associations,
            AssociationKind::Router => &self.router_associations,
            AssociationKind::Port => &self.port_associations,
        }
    }

    pub fn associations_mut(
        &mut self,
        kind: AssociationKind,
    ) -> &mut Vec<AssociationRef> {
        match kind {
            AssociationKind::Network => &mut self.network_associations,
            AssociationKind::Router => &mut self.router_associations,
            AssociationKind::Port => &mut self.port_associations,
        }
    }

    /// Advance the commit counter. Every mutation that emits a delta event
    /// for this BGPVPN must call this exactly once.
    pub fn bump(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PortAssociationRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub bgpvpn_id: Uuid,
    pub port_id: String,
    pub advertise_fixed_ips: bool,
    pub routes: Vec<Uuid>,
    pub standard: StandardAttributes,
}
