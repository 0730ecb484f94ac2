// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Target project value granting access to every tenant.
pub const TARGET_ALL: &str = "*";

/// Attribute filters for collection queries. Each attribute name maps to the
/// set of values it may take.
pub type Filters = BTreeMap<String, BTreeSet<String>>;

/// The identity a store operation is performed on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Context {
    pub tenant_id: String,
    pub is_admin: bool,
}

impl Context {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            is_admin: false,
        }
    }

    /// An administrative context that sees every BGPVPN.
    pub fn admin() -> Self {
        Self {
            tenant_id: String::new(),
            is_admin: true,
        }
    }
}

#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum VpnType {
    L2,
    #[default]
    L3,
}

impl Display for VpnType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::L2 => write!(f, "l2"),
            Self::L3 => write!(f, "l3"),
        }
    }
}

impl FromStr for VpnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l2" => Ok(Self::L2),
            "l3" => Ok(Self::L3),
            other => Err(Error::Validation(format!(
                "invalid bgpvpn type '{other}', expected l2 or l3"
            ))),
        }
    }
}

/// The resource kinds a BGPVPN can be associated with.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum AssociationKind {
    Network,
    Router,
    Port,
}

impl AssociationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Router => "router",
            Self::Port => "port",
        }
    }

    pub fn entity(&self) -> Entity {
        match self {
            Self::Network => Entity::NetworkAssociation,
            Self::Router => Entity::RouterAssociation,
            Self::Port => Entity::PortAssociation,
        }
    }
}

impl Display for AssociationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AssociationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(Self::Network),
            "router" => Ok(Self::Router),
            "port" => Ok(Self::Port),
            other => Err(Error::Validation(format!(
                "unknown resource type '{other}'"
            ))),
        }
    }
}

/// Audit metadata carried by every BGPVPN and association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StandardAttributes {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub description: String,
    pub revision_number: u64,
}

impl StandardAttributes {
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            description: description.into(),
            revision_number: 0,
        }
    }

    /// Record a modification.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision_number += 1;
    }
}

/// The decoded view of a BGPVPN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Bgpvpn {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub vpn_type: VpnType,
    pub route_targets: Vec<String>,
    /// The stored import targets, or the route targets when none were ever
    /// set.
    pub import_targets: Vec<String>,
    /// The stored export targets, or the route targets when none were ever
    /// set.
    pub export_targets: Vec<String>,
    pub route_distinguishers: Vec<String>,
    pub vni: Option<u32>,
    pub local_pref: Option<u64>,
    pub networks: Vec<String>,
    pub routers: Vec<String>,
    pub ports: Vec<String>,
    /// Whether this BGPVPN is shared with the requesting tenant.
    pub shared: bool,
    /// Commit counter, incremented by every mutation of this BGPVPN or one of
    /// its associations.
    pub sequence: u64,
    #[serde(flatten)]
    pub standard: StandardAttributes,
}

impl Bgpvpn {
    /// Resources of the given kind associated with this BGPVPN.
    pub fn resources(&self, kind: AssociationKind) -> &[String] {
        match kind {
            AssociationKind::Network => &self.networks,
            AssociationKind::Router => &self.routers,
            AssociationKind::Port => &self.ports,
        }
    }

    /// True when the attributes pushed to the agent differ.
    pub fn forwarding_differs(&self, other: &Bgpvpn) -> bool {
        self.vpn_type != other.vpn_type
            || self.route_targets != other.route_targets
            || self.import_targets != other.import_targets
            || self.export_targets != other.export_targets
            || self.route_distinguishers != other.route_distinguishers
            || self.vni != other.vni
            || self.local_pref != other.local_pref
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BgpvpnCreate {
    pub name: String,
    #[serde(rename = "type", default)]
    pub vpn_type: VpnType,
    #[serde(default)]
    pub route_targets: Vec<String>,
    #[serde(default)]
    pub import_targets: Option<Vec<String>>,
    #[serde(default)]
    pub export_targets: Option<Vec<String>>,
    #[serde(default)]
    pub route_distinguishers: Vec<String>,
    #[serde(default)]
    pub vni: Option<u32>,
    #[serde(default)]
    pub local_pref: Option<u64>,
    #[serde(default)]
    pub description: String,
}

/// A partial BGPVPN update, only fields that are present are changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BgpvpnUpdate {
    pub name: Option<String>,
    pub route_targets: Option<Vec<String>>,
    pub import_targets: Option<Vec<String>>,
    pub export_targets: Option<Vec<String>>,
    pub route_distinguishers: Option<Vec<String>>,
    pub vni: Option<u32>,
    pub local_pref: Option<u64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkAssociation {
    pub id: Uuid,
    pub tenant_id: String,
    pub bgpvpn_id: Uuid,
    pub network_id: String,
    #[serde(flatten)]
    pub standard: StandardAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouterAssociation {
    pub id: Uuid,
    pub tenant_id: String,
    pub bgpvpn_id: Uuid,
    pub router_id: String,
    pub advertise_extra_routes: bool,
    #[serde(flatten)]
    pub standard: StandardAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PortAssociation {
    pub id: Uuid,
    pub tenant_id: String,
    pub bgpvpn_id: Uuid,
    pub port_id: String,
    pub advertise_fixed_ips: bool,
    pub routes: Vec<PortAssociationRoute>,
    #[serde(flatten)]
    pub standard: StandardAttributes,
}

/// What a port association route points at. Exactly one of a prefix or a
/// referenced BGPVPN is present, selected by the route type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RouteTarget {
    Prefix { prefix: String },
    Bgpvpn { bgpvpn_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PortAssociationRoute {
    pub id: Uuid,
    pub port_association_id: Uuid,
    pub local_pref: Option<u64>,
    #[serde(flatten)]
    pub target: RouteTarget,
}

/// A route as supplied by a caller, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouteSpec {
    #[serde(rename = "type")]
    pub route_type: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub bgpvpn_id: Option<Uuid>,
    #[serde(default)]
    pub local_pref: Option<u64>,
}

impl RouteSpec {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            route_type: "prefix".into(),
            prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn bgpvpn(bgpvpn_id: Uuid) -> Self {
        Self {
            route_type: "bgpvpn".into(),
            bgpvpn_id: Some(bgpvpn_id),
            ..Default::default()
        }
    }

    pub fn with_local_pref(mut self, local_pref: u64) -> Self {
        self.local_pref = Some(local_pref);
        self
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkAssociationCreate {
    pub tenant_id: String,
    pub network_id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouterAssociationCreate {
    pub tenant_id: String,
    pub router_id: String,
    #[serde(default = "default_true")]
    pub advertise_extra_routes: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PortAssociationCreate {
    pub tenant_id: String,
    pub port_id: String,
    #[serde(default = "default_true")]
    pub advertise_fixed_ips: bool,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub description: String,
}

impl NetworkAssociationCreate {
    pub fn new(tenant_id: impl Into<String>, network_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            network_id: network_id.into(),
            description: String::new(),
        }
    }
}

impl RouterAssociationCreate {
    pub fn new(tenant_id: impl Into<String>, router_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            router_id: router_id.into(),
            advertise_extra_routes: true,
            description: String::new(),
        }
    }
}

impl PortAssociationCreate {
    pub fn new(tenant_id: impl Into<String>, port_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            port_id: port_id.into(),
            advertise_fixed_ips: true,
            routes: Vec::new(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkAssociationUpdate {
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouterAssociationUpdate {
    pub advertise_extra_routes: Option<bool>,
    pub description: Option<String>,
}

/// A port association update. When `routes` is present it replaces the
/// whole route list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PortAssociationUpdate {
    pub advertise_fixed_ips: Option<bool>,
    pub routes: Option<Vec<RouteSpec>>,
    pub description: Option<String>,
}

#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum RbacAction {
    #[default]
    #[serde(rename = "access_as_shared")]
    Shared,
}

impl RbacAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "access_as_shared",
        }
    }
}

impl Display for RbacAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RbacGrant {
    pub id: Uuid,
    /// The project that created the grant.
    pub tenant_id: String,
    pub object_id: Uuid,
    pub target_project: String,
    pub action: RbacAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RbacGrantCreate {
    pub target_project: String,
    #[serde(default)]
    pub action: RbacAction,
}

impl RbacGrantCreate {
    pub fn shared_with(target_project: impl Into<String>) -> Self {
        Self {
            target_project: target_project.into(),
            action: RbacAction::Shared,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Entity {
    #[serde(rename = "bgpvpn")]
    Bgpvpn,
    #[serde(rename = "net_assoc")]
    NetworkAssociation,
    #[serde(rename = "router_assoc")]
    RouterAssociation,
    #[serde(rename = "port_assoc")]
    PortAssociation,
}

impl Entity {
    pub fn association_kind(&self) -> Option<AssociationKind> {
        match self {
            Self::Bgpvpn => None,
            Self::NetworkAssociation => Some(AssociationKind::Network),
            Self::RouterAssociation => Some(AssociationKind::Router),
            Self::PortAssociation => Some(AssociationKind::Port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "entity", content = "value", rename_all = "snake_case")]
pub enum Snapshot {
    Bgpvpn(Bgpvpn),
    Network(NetworkAssociation),
    Router(RouterAssociation),
    Port(PortAssociation),
}

impl Snapshot {
    /// The associated resource, if this is an association snapshot.
    pub fn resource(&self) -> Option<(AssociationKind, &str)> {
        match self {
            Self::Bgpvpn(_) => None,
            Self::Network(a) => Some((AssociationKind::Network, &a.network_id)),
            Self::Router(a) => Some((AssociationKind::Router, &a.router_id)),
            Self::Port(a) => Some((AssociationKind::Port, &a.port_id)),
        }
    }
}

/// An association seen from the associated resource.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Binding {
    pub kind: AssociationKind,
    pub resource_id: String,
    pub bgpvpn_id: Uuid,
    pub association_id: Uuid,
}

/// A notification describing one committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeltaEvent {
    pub kind: ChangeKind,
    pub entity: Entity,
    pub bgpvpn_id: Uuid,
    /// The owning BGPVPN's sequence number after the commit.
    pub sequence: u64,
    /// The owning BGPVPN as of the commit. For a BGPVPN deletion this is the
    /// state just before removal.
    pub bgpvpn: Bgpvpn,
    pub before: Option<Snapshot>,
    pub after: Option<Snapshot>,
}
