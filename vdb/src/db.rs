// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The BGPVPN association store.
//!
//! Every public operation runs as a single sled transaction over all store
//! trees, so each one either commits entirely or leaves nothing behind.
//! Mutations that affect forwarding produce exactly one [`DeltaEvent`] per
//! affected association or BGPVPN, published to watchers after the commit.

use crate::alloc::{self, Allocation};
use crate::config::{Capabilities, StoreConfig};
use crate::error::Error;
use crate::filter;
use crate::log::vdb_log;
use crate::notify::Notifier;
use crate::rbac;
use crate::route;
use crate::rtrd;
use crate::schema::{
    bgpvpn_key, child_key, get, index_key, index_prefix, parse_binding, put,
    validate_resource_id, AssociationRef, BgpvpnRow, PortAssociationRow,
    RouteRef, Trees, Tx, TxResult,
};
use crate::types::{
    AssociationKind, Bgpvpn, BgpvpnCreate, BgpvpnUpdate, Binding, ChangeKind,
    Context, DeltaEvent, Entity, Filters, NetworkAssociation,
    NetworkAssociationCreate, NetworkAssociationUpdate, PortAssociation,
    PortAssociationCreate, PortAssociationRoute, PortAssociationUpdate,
    RbacAction, RbacGrant, RbacGrantCreate, RouteTarget, RouterAssociation,
    RouterAssociationCreate, RouterAssociationUpdate, Snapshot,
    StandardAttributes,
};
use serde::de::DeserializeOwned;
use sled::transaction::abort;
use sled::Transactional;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use uuid::Uuid;

/// The central BGPVPN store. Cloning is cheap and clones share the same
/// underlying database and watchers.
#[derive(Clone)]
pub struct Db {
    /// A sled database handle where all store trees live.
    persistent: sled::Db,

    trees: Trees,

    /// Watchers notified of committed mutations.
    notifier: Arc<Notifier>,

    config: StoreConfig,

    log: Logger,
}

impl Db {
    /// Open the store at `path`, creating it if needed.
    pub fn new(
        path: &str,
        config: StoreConfig,
        log: Logger,
    ) -> Result<Self, Error> {
        config.validate()?;
        let persistent = sled::open(path)?;
        let trees = Trees::open(&persistent)?;
        let notifier = Notifier::new(log.clone());
        for entry in trees.bgpvpn.iter() {
            let (_, value) = entry?;
            let row: BgpvpnRow = serde_json::from_slice(&value)?;
            notifier.seed(row.id, row.sequence);
        }
        Ok(Self {
            persistent,
            trees,
            notifier: Arc::new(notifier),
            config,
            log,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.config.capabilities
    }

    /// Register a store watcher. Events committed after registration are
    /// delivered on `sender`.
    pub fn watch(&self, tag: String, sender: Sender<DeltaEvent>) {
        self.notifier.watch(tag, sender);
    }

    fn transaction<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: Fn(&Tx<'_>) -> TxResult<T>,
    {
        let t = &self.trees;
        let result = (
            &t.bgpvpn, &t.rbac, &t.network, &t.router, &t.port, &t.route,
            &t.index, &t.alloc,
        )
            .transaction(
                |(bgpvpn, rbac, network, router, port, route, index, alloc)| {
                    f(&Tx {
                        bgpvpn,
                        rbac,
                        network,
                        router,
                        port,
                        route,
                        index,
                        alloc,
                    })
                },
            );
        Ok(result?)
    }

    /// Run a read across the store trees as one consistent view. Sled has no
    /// read-only transaction mode; `f` must only read, so the transaction
    /// commits no writes.
    fn read<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: Fn(&Tx<'_>) -> TxResult<T>,
    {
        self.transaction(f)
    }

    /// Make committed writes durable.
    fn flush(&self) {
        if let Err(e) = self.persistent.flush() {
            vdb_log!(self, error, "flush failed: {e}";
                "error" => format!("{e}")
            );
        }
    }

    /// Make a commit durable, then hand its events to watchers.
    fn publish(&self, events: Vec<DeltaEvent>) {
        self.flush();
        for event in events {
            self.notifier.emit(event);
        }
    }

    fn log_duplicate<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e @ Error::AssociationAlreadyExists { .. }) = &result {
            vdb_log!(self, warn, "{e}");
        }
        result
    }

    fn bgpvpn_view(
        &self,
        tx: &Tx<'_>,
        row: &BgpvpnRow,
        ctx: &Context,
    ) -> TxResult<Bgpvpn> {
        let caps = self.config.capabilities;
        let resources = |refs: &Vec<AssociationRef>| -> Vec<String> {
            refs.iter().map(|a| a.resource_id.clone()).collect()
        };
        let route_targets = rtrd::decode(Some(row.route_targets.as_str()));
        // Unset import/export columns follow the route targets at read time.
        let or_route_targets = |column: &Option<String>| match column {
            Some(s) => rtrd::decode(Some(s.as_str())),
            None => route_targets.clone(),
        };
        Ok(Bgpvpn {
            id: row.id,
            tenant_id: row.tenant_id.clone(),
            name: row.name.clone(),
            vpn_type: row.vpn_type,
            import_targets: or_route_targets(&row.import_targets),
            export_targets: or_route_targets(&row.export_targets),
            route_targets,
            route_distinguishers: rtrd::decode(
                row.route_distinguishers.as_deref(),
            ),
            vni: row.vni.filter(|_| caps.vni),
            local_pref: row.local_pref.filter(|_| caps.routes_control),
            networks: resources(&row.network_associations),
            routers: resources(&row.router_associations),
            ports: resources(&row.port_associations),
            shared: rbac::is_shared(tx.rbac, row.id, ctx)?,
            sequence: row.sequence,
            standard: row.standard.clone(),
        })
    }

    /// Build the event for a committed association mutation. The BGPVPN view
    /// carried by events is not requester specific.
    fn event(
        &self,
        tx: &Tx<'_>,
        kind: ChangeKind,
        entity: Entity,
        parent: &BgpvpnRow,
        before: Option<Snapshot>,
        after: Option<Snapshot>,
    ) -> TxResult<DeltaEvent> {
        Ok(DeltaEvent {
            kind,
            entity,
            bgpvpn_id: parent.id,
            sequence: parent.sequence,
            bgpvpn: self.bgpvpn_view(tx, parent, &Context::admin())?,
            before,
            after,
        })
    }

    // BGPVPNs ================================================================

    pub fn create_bgpvpn(
        &self,
        ctx: &Context,
        spec: &BgpvpnCreate,
    ) -> Result<Bgpvpn, Error> {
        validate_targets(
            Some(&spec.route_targets),
            spec.import_targets.as_ref(),
            spec.export_targets.as_ref(),
            Some(&spec.route_distinguishers),
        )?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let used = self.allocated_targets()?;
            let allocation = alloc::plan(&self.config.allocation, &used, spec)?;
            let id = Uuid::new_v4();

            let result = self.transaction(|tx| {
                let owner = id.to_string();
                for target in allocation.targets() {
                    if tx
                        .alloc
                        .insert(target.as_str(), owner.as_str())?
                        .is_some()
                    {
                        return abort(Error::Conflict(format!(
                            "route target {target} is already allocated"
                        )));
                    }
                }
                let row = new_bgpvpn_row(id, ctx, spec, &allocation);
                put(tx.bgpvpn, &bgpvpn_key(id), &row)?;

                let view = self.bgpvpn_view(tx, &row, ctx)?;
                let admin = self.bgpvpn_view(tx, &row, &Context::admin())?;
                let event = DeltaEvent {
                    kind: ChangeKind::Created,
                    entity: Entity::Bgpvpn,
                    bgpvpn_id: id,
                    sequence: row.sequence,
                    bgpvpn: admin.clone(),
                    before: None,
                    after: Some(Snapshot::Bgpvpn(admin)),
                };
                Ok((view, event))
            });

            match result {
                Err(Error::Conflict(msg))
                    if !allocation.is_empty()
                        && attempt < alloc::MAX_ATTEMPTS =>
                {
                    vdb_log!(self, warn, "retrying bgpvpn create: {msg}";
                        "attempt" => attempt
                    );
                }
                Err(e) => return Err(e),
                Ok((view, event)) => {
                    vdb_log!(self, info, "created bgpvpn {}", view.id;
                        "tenant" => view.tenant_id.clone(),
                        "type" => view.vpn_type.to_string()
                    );
                    self.publish(vec![event]);
                    return Ok(view);
                }
            }
        }
    }

    pub fn get_bgpvpn(&self, ctx: &Context, id: Uuid) -> Result<Bgpvpn, Error> {
        self.read(|tx| {
            let row = require_bgpvpn(tx, id, ctx)?;
            self.bgpvpn_view(tx, &row, ctx)
        })
    }

    /// All BGPVPNs visible to the requester that match `filters`.
    pub fn list_bgpvpns(
        &self,
        ctx: &Context,
        filters: &Filters,
    ) -> Result<Vec<Bgpvpn>, Error> {
        filter::validate::<Bgpvpn>(filters)?;
        let ids = self.bgpvpn_ids()?;
        let views = self.read(|tx| {
            let mut views = Vec::new();
            for id in &ids {
                if let Some(row) = find_visible(tx, *id, ctx)? {
                    views.push(self.bgpvpn_view(tx, &row, ctx)?);
                }
            }
            Ok(views)
        })?;
        filter::apply(views, filters)
    }

    pub fn update_bgpvpn(
        &self,
        ctx: &Context,
        id: Uuid,
        update: &BgpvpnUpdate,
    ) -> Result<Bgpvpn, Error> {
        validate_targets(
            update.route_targets.as_ref(),
            update.import_targets.as_ref(),
            update.export_targets.as_ref(),
            update.route_distinguishers.as_ref(),
        )?;

        let (view, event) = self.transaction(|tx| {
            let mut row = require_bgpvpn(tx, id, ctx)?;
            let before = self.bgpvpn_view(tx, &row, &Context::admin())?;

            if let Some(name) = &update.name {
                row.name = name.clone();
            }
            if let Some(targets) = &update.route_targets {
                row.route_targets = rtrd::encode(targets);
            }
            if let Some(targets) = &update.import_targets {
                row.import_targets = Some(rtrd::encode(targets));
            }
            if let Some(targets) = &update.export_targets {
                row.export_targets = Some(rtrd::encode(targets));
            }
            if let Some(rds) = &update.route_distinguishers {
                row.route_distinguishers = Some(rtrd::encode(rds));
            }
            if let Some(vni) = update.vni {
                row.vni = Some(vni);
            }
            if let Some(local_pref) = update.local_pref {
                row.local_pref = Some(local_pref);
            }
            if let Some(description) = &update.description {
                row.standard.description = description.clone();
            }
            row.standard.touch();
            row.bump();
            put(tx.bgpvpn, &bgpvpn_key(id), &row)?;

            let after = self.bgpvpn_view(tx, &row, &Context::admin())?;
            let event = DeltaEvent {
                kind: ChangeKind::Updated,
                entity: Entity::Bgpvpn,
                bgpvpn_id: id,
                sequence: row.sequence,
                bgpvpn: after.clone(),
                before: Some(Snapshot::Bgpvpn(before)),
                after: Some(Snapshot::Bgpvpn(after)),
            };
            Ok((self.bgpvpn_view(tx, &row, ctx)?, event))
        })?;

        vdb_log!(self, info, "updated bgpvpn {id}";
            "sequence" => view.sequence
        );
        self.publish(vec![event]);
        Ok(view)
    }

    /// Delete a BGPVPN together with its associations, their routes, its
    /// grants, routes of other BGPVPNs that reference it and its allocated
    /// targets. Returns the BGPVPN as it was before deletion.
    pub fn delete_bgpvpn(
        &self,
        ctx: &Context,
        id: Uuid,
    ) -> Result<Bgpvpn, Error> {
        let (view, event) = self.transaction(|tx| {
            let row = require_bgpvpn(tx, id, ctx)?;
            let view = self.bgpvpn_view(tx, &row, ctx)?;
            let before = self.bgpvpn_view(tx, &row, &Context::admin())?;

            for kind in [AssociationKind::Network, AssociationKind::Router] {
                for a in row.associations(kind) {
                    tx.association(kind)
                        .remove(child_key(id, a.id).as_str())?;
                    tx.index
                        .remove(index_key(kind, &a.resource_id, id).as_str())?;
                }
            }
            for a in &row.port_associations {
                let key = child_key(id, a.id);
                if let Some(port) = get::<PortAssociationRow>(tx.port, &key)? {
                    detach_routes(tx, id, &port)?;
                    tx.port.remove(key.as_str())?;
                }
                tx.index.remove(
                    index_key(AssociationKind::Port, &a.resource_id, id)
                        .as_str(),
                )?;
            }
            for key in &row.rbac_entries {
                tx.rbac.remove(key.as_str())?;
            }
            for r in &row.route_references {
                tx.route
                    .remove(child_key(r.port_association_id, r.route_id).as_str())?;
                let key = child_key(r.bgpvpn_id, r.port_association_id);
                if let Some(mut port) = get::<PortAssociationRow>(tx.port, &key)?
                {
                    port.routes.retain(|route_id| *route_id != r.route_id);
                    put(tx.port, &key, &port)?;
                }
            }
            for target in &row.allocated_targets {
                tx.alloc.remove(target.as_str())?;
            }
            tx.bgpvpn.remove(bgpvpn_key(id).as_str())?;

            let event = DeltaEvent {
                kind: ChangeKind::Deleted,
                entity: Entity::Bgpvpn,
                bgpvpn_id: id,
                sequence: row.sequence + 1,
                bgpvpn: before.clone(),
                before: Some(Snapshot::Bgpvpn(before)),
                after: None,
            };
            Ok((view, event))
        })?;

        vdb_log!(self, info, "deleted bgpvpn {id}";
            "networks" => view.networks.len(),
            "routers" => view.routers.len(),
            "ports" => view.ports.len()
        );
        self.publish(vec![event]);
        Ok(view)
    }

    fn bgpvpn_ids(&self) -> Result<Vec<Uuid>, Error> {
        let mut ids = Vec::new();
        for key in self.trees.bgpvpn.iter().keys() {
            let key = key?;
            let key = String::from_utf8_lossy(&key);
            ids.push(key.parse().map_err(|e| {
                Error::DbKey(format!("bgpvpn key {key}: {e}"))
            })?);
        }
        Ok(ids)
    }

    fn allocated_targets(&self) -> Result<BTreeSet<String>, Error> {
        let mut used = BTreeSet::new();
        for key in self.trees.alloc.iter().keys() {
            used.insert(String::from_utf8_lossy(&key?).into_owned());
        }
        Ok(used)
    }

    // Network associations ===================================================

    pub fn create_network_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        spec: &NetworkAssociationCreate,
    ) -> Result<NetworkAssociation, Error> {
        let kind = AssociationKind::Network;
        validate_resource_id(kind, &spec.network_id)?;
        let id = Uuid::new_v4();

        let result = self.transaction(|tx| {
            let mut parent = require_bgpvpn(tx, bgpvpn_id, ctx)?;
            let assoc = NetworkAssociation {
                id,
                tenant_id: spec.tenant_id.clone(),
                bgpvpn_id,
                network_id: spec.network_id.clone(),
                standard: StandardAttributes::new(spec.description.clone()),
            };
            link_association(tx, &mut parent, kind, id, &assoc.network_id)?;
            put(tx.network, &child_key(bgpvpn_id, id), &assoc)?;
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;
            let event = self.event(
                tx,
                ChangeKind::Created,
                Entity::NetworkAssociation,
                &parent,
                None,
                Some(Snapshot::Network(assoc.clone())),
            )?;
            Ok((assoc, event))
        });
        let (assoc, event) = self.log_duplicate(result)?;

        vdb_log!(self, info,
            "associated network {} to bgpvpn {bgpvpn_id}", assoc.network_id;
            "association" => id.to_string()
        );
        self.publish(vec![event]);
        Ok(assoc)
    }

    pub fn get_network_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        id: Uuid,
    ) -> Result<NetworkAssociation, Error> {
        self.read(|tx| {
            let (_, assoc) = get_association(
                tx,
                ctx,
                AssociationKind::Network,
                bgpvpn_id,
                id,
            )?;
            Ok(assoc)
        })
    }

    pub fn list_network_associations(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        filters: &Filters,
    ) -> Result<Vec<NetworkAssociation>, Error> {
        filter::validate::<NetworkAssociation>(filters)?;
        let items = self.read(|tx| {
            list_associations(tx, ctx, AssociationKind::Network, bgpvpn_id)
        })?;
        filter::apply(items, filters)
    }

    pub fn update_network_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        id: Uuid,
        update: &NetworkAssociationUpdate,
    ) -> Result<NetworkAssociation, Error> {
        let (assoc, event) = self.transaction(|tx| {
            let (mut parent, before) = get_association::<NetworkAssociation>(
                tx,
                ctx,
                AssociationKind::Network,
                bgpvpn_id,
                id,
            )?;
            let mut after = before.clone();
            if let Some(description) = &update.description {
                after.standard.description = description.clone();
            }
            after.standard.touch();
            parent.bump();
            put(tx.network, &child_key(bgpvpn_id, id), &after)?;
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;
            let event = self.event(
                tx,
                ChangeKind::Updated,
                Entity::NetworkAssociation,
                &parent,
                Some(Snapshot::Network(before)),
                Some(Snapshot::Network(after.clone())),
            )?;
            Ok((after, event))
        })?;

        vdb_log!(self, info, "updated network association {id}";
            "bgpvpn" => bgpvpn_id.to_string()
        );
        self.publish(vec![event]);
        Ok(assoc)
    }

    pub fn delete_network_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        id: Uuid,
    ) -> Result<NetworkAssociation, Error> {
        let kind = AssociationKind::Network;
        let (assoc, event) = self.transaction(|tx| {
            let (mut parent, assoc) = get_association::<NetworkAssociation>(
                tx, ctx, kind, bgpvpn_id, id,
            )?;
            tx.network.remove(child_key(bgpvpn_id, id).as_str())?;
            unlink_association(tx, &mut parent, kind, id, &assoc.network_id)?;
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;
            let event = self.event(
                tx,
                ChangeKind::Deleted,
                Entity::NetworkAssociation,
                &parent,
                Some(Snapshot::Network(assoc.clone())),
                None,
            )?;
            Ok((assoc, event))
        })?;

        vdb_log!(self, info,
            "disassociated network {} from bgpvpn {bgpvpn_id}", assoc.network_id;
            "association" => id.to_string()
        );
        self.publish(vec![event]);
        Ok(assoc)
    }

    // Router associations ====================================================

    pub fn create_router_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        spec: &RouterAssociationCreate,
    ) -> Result<RouterAssociation, Error> {
        let kind = AssociationKind::Router;
        validate_resource_id(kind, &spec.router_id)?;
        let id = Uuid::new_v4();

        let result = self.transaction(|tx| {
            let mut parent = require_bgpvpn(tx, bgpvpn_id, ctx)?;
            let assoc = RouterAssociation {
                id,
                tenant_id: spec.tenant_id.clone(),
                bgpvpn_id,
                router_id: spec.router_id.clone(),
                advertise_extra_routes: spec.advertise_extra_routes,
                standard: StandardAttributes::new(spec.description.clone()),
            };
            link_association(tx, &mut parent, kind, id, &assoc.router_id)?;
            put(tx.router, &child_key(bgpvpn_id, id), &assoc)?;
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;
            let event = self.event(
                tx,
                ChangeKind::Created,
                Entity::RouterAssociation,
                &parent,
                None,
                Some(Snapshot::Router(assoc.clone())),
            )?;
            Ok((assoc, event))
        });
        let (assoc, event) = self.log_duplicate(result)?;

        vdb_log!(self, info,
            "associated router {} to bgpvpn {bgpvpn_id}", assoc.router_id;
            "association" => id.to_string()
        );
        self.publish(vec![event]);
        Ok(assoc)
    }

    pub fn get_router_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        id: Uuid,
    ) -> Result<RouterAssociation, Error> {
        self.read(|tx| {
            let (_, assoc) = get_association(
                tx,
                ctx,
                AssociationKind::Router,
                bgpvpn_id,
                id,
            )?;
            Ok(assoc)
        })
    }

    pub fn list_router_associations(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        filters: &Filters,
    ) -> Result<Vec<RouterAssociation>, Error> {
        filter::validate::<RouterAssociation>(filters)?;
        let items = self.read(|tx| {
            list_associations(tx, ctx, AssociationKind::Router, bgpvpn_id)
        })?;
        filter::apply(items, filters)
    }

    pub fn update_router_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        id: Uuid,
        update: &RouterAssociationUpdate,
    ) -> Result<RouterAssociation, Error> {
        let (assoc, event) = self.transaction(|tx| {
            let (mut parent, before) = get_association::<RouterAssociation>(
                tx,
                ctx,
                AssociationKind::Router,
                bgpvpn_id,
                id,
            )?;
            let mut after = before.clone();
            if let Some(advertise) = update.advertise_extra_routes {
                after.advertise_extra_routes = advertise;
            }
            if let Some(description) = &update.description {
                after.standard.description = description.clone();
            }
            after.standard.touch();
            parent.bump();
            put(tx.router, &child_key(bgpvpn_id, id), &after)?;
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;
            let event = self.event(
                tx,
                ChangeKind::Updated,
                Entity::RouterAssociation,
                &parent,
                Some(Snapshot::Router(before)),
                Some(Snapshot::Router(after.clone())),
            )?;
            Ok((after, event))
        })?;

        vdb_log!(self, info, "updated router association {id}";
            "bgpvpn" => bgpvpn_id.to_string(),
            "advertise_extra_routes" => assoc.advertise_extra_routes
        );
        self.publish(vec![event]);
        Ok(assoc)
    }

    pub fn delete_router_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        id: Uuid,
    ) -> Result<RouterAssociation, Error> {
        let kind = AssociationKind::Router;
        let (assoc, event) = self.transaction(|tx| {
            let (mut parent, assoc) = get_association::<RouterAssociation>(
                tx, ctx, kind, bgpvpn_id, id,
            )?;
            tx.router.remove(child_key(bgpvpn_id, id).as_str())?;
            unlink_association(tx, &mut parent, kind, id, &assoc.router_id)?;
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;
            let event = self.event(
                tx,
                ChangeKind::Deleted,
                Entity::RouterAssociation,
                &parent,
                Some(Snapshot::Router(assoc.clone())),
                None,
            )?;
            Ok((assoc, event))
        })?;

        vdb_log!(self, info,
            "disassociated router {} from bgpvpn {bgpvpn_id}", assoc.router_id;
            "association" => id.to_string()
        );
        self.publish(vec![event]);
        Ok(assoc)
    }

    // Port associations ======================================================

    /// Create a port association and its routes in one transaction.
    pub fn create_port_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        spec: &PortAssociationCreate,
    ) -> Result<PortAssociation, Error> {
        let kind = AssociationKind::Port;
        validate_resource_id(kind, &spec.port_id)?;
        let id = Uuid::new_v4();
        let routes = route::resolve_routes(id, &spec.routes)?;

        let result = self.transaction(|tx| {
            let mut parent = require_bgpvpn(tx, bgpvpn_id, ctx)?;
            let row = PortAssociationRow {
                id,
                tenant_id: spec.tenant_id.clone(),
                bgpvpn_id,
                port_id: spec.port_id.clone(),
                advertise_fixed_ips: spec.advertise_fixed_ips,
                routes: routes.iter().map(|r| r.id).collect(),
                standard: StandardAttributes::new(spec.description.clone()),
            };
            link_association(tx, &mut parent, kind, id, &row.port_id)?;
            attach_routes(tx, ctx, bgpvpn_id, &routes)?;
            put(tx.port, &child_key(bgpvpn_id, id), &row)?;
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;

            let assoc = port_view(&row, routes.clone());
            let event = self.event(
                tx,
                ChangeKind::Created,
                Entity::PortAssociation,
                &parent,
                None,
                Some(Snapshot::Port(assoc.clone())),
            )?;
            Ok((assoc, event))
        });
        let (assoc, event) = self.log_duplicate(result)?;

        vdb_log!(self, info,
            "associated port {} to bgpvpn {bgpvpn_id}", assoc.port_id;
            "association" => id.to_string(),
            "routes" => assoc.routes.len()
        );
        self.publish(vec![event]);
        Ok(assoc)
    }

    pub fn get_port_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        id: Uuid,
    ) -> Result<PortAssociation, Error> {
        self.read(|tx| {
            let (_, row) = get_association::<PortAssociationRow>(
                tx,
                ctx,
                AssociationKind::Port,
                bgpvpn_id,
                id,
            )?;
            load_port(tx, &row)
        })
    }

    pub fn list_port_associations(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        filters: &Filters,
    ) -> Result<Vec<PortAssociation>, Error> {
        filter::validate::<PortAssociation>(filters)?;
        let items: Vec<PortAssociation> = self.read(|tx| {
            let rows = list_associations::<PortAssociationRow>(
                tx,
                ctx,
                AssociationKind::Port,
                bgpvpn_id,
            )?;
            rows.iter().map(|row| load_port(tx, row)).collect()
        })?;
        filter::apply(items, filters)
    }

    /// Update a port association. A route list in the update replaces the
    /// existing routes entirely.
    pub fn update_port_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        id: Uuid,
        update: &PortAssociationUpdate,
    ) -> Result<PortAssociation, Error> {
        let replacement = update
            .routes
            .as_ref()
            .map(|specs| route::resolve_routes(id, specs))
            .transpose()?;

        let (assoc, event) = self.transaction(|tx| {
            let (mut parent, mut row) = get_association::<PortAssociationRow>(
                tx,
                ctx,
                AssociationKind::Port,
                bgpvpn_id,
                id,
            )?;
            let before = load_port(tx, &row)?;

            if let Some(advertise) = update.advertise_fixed_ips {
                row.advertise_fixed_ips = advertise;
            }
            if let Some(description) = &update.description {
                row.standard.description = description.clone();
            }
            let routes = match &replacement {
                Some(routes) => {
                    detach_routes(tx, bgpvpn_id, &row)?;
                    attach_routes(tx, ctx, bgpvpn_id, routes)?;
                    row.routes = routes.iter().map(|r| r.id).collect();
                    routes.clone()
                }
                None => before.routes.clone(),
            };
            row.standard.touch();
            parent.bump();
            put(tx.port, &child_key(bgpvpn_id, id), &row)?;
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;

            let after = port_view(&row, routes);
            let event = self.event(
                tx,
                ChangeKind::Updated,
                Entity::PortAssociation,
                &parent,
                Some(Snapshot::Port(before)),
                Some(Snapshot::Port(after.clone())),
            )?;
            Ok((after, event))
        })?;

        vdb_log!(self, info, "updated port association {id}";
            "bgpvpn" => bgpvpn_id.to_string(),
            "routes" => assoc.routes.len()
        );
        self.publish(vec![event]);
        Ok(assoc)
    }

    pub fn delete_port_association(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        id: Uuid,
    ) -> Result<PortAssociation, Error> {
        let kind = AssociationKind::Port;
        let (assoc, event) = self.transaction(|tx| {
            let (mut parent, row) = get_association::<PortAssociationRow>(
                tx, ctx, kind, bgpvpn_id, id,
            )?;
            let assoc = load_port(tx, &row)?;
            detach_routes(tx, bgpvpn_id, &row)?;
            tx.port.remove(child_key(bgpvpn_id, id).as_str())?;
            unlink_association(tx, &mut parent, kind, id, &row.port_id)?;
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;
            let event = self.event(
                tx,
                ChangeKind::Deleted,
                Entity::PortAssociation,
                &parent,
                Some(Snapshot::Port(assoc.clone())),
                None,
            )?;
            Ok((assoc, event))
        })?;

        vdb_log!(self, info,
            "disassociated port {} from bgpvpn {bgpvpn_id}", assoc.port_id;
            "association" => id.to_string()
        );
        self.publish(vec![event]);
        Ok(assoc)
    }

    // Resources ==============================================================

    /// Remove every association of a resource that no longer exists. One
    /// deleted event is produced per removed association. Returns the
    /// removed associations.
    pub fn delete_resource_associations(
        &self,
        kind: AssociationKind,
        resource_id: &str,
    ) -> Result<Vec<Snapshot>, Error> {
        validate_resource_id(kind, resource_id)?;
        let bindings = self.resource_bindings(kind, resource_id)?;
        if bindings.is_empty() {
            return Ok(Vec::new());
        }

        let events = self.transaction(|tx| {
            let mut events = Vec::new();
            for b in &bindings {
                let Some(mut parent) =
                    get::<BgpvpnRow>(tx.bgpvpn, &bgpvpn_key(b.bgpvpn_id))?
                else {
                    continue;
                };
                let key = child_key(b.bgpvpn_id, b.association_id);
                let before = match kind {
                    AssociationKind::Network => {
                        get(tx.network, &key)?.map(Snapshot::Network)
                    }
                    AssociationKind::Router => {
                        get(tx.router, &key)?.map(Snapshot::Router)
                    }
                    AssociationKind::Port => {
                        match get::<PortAssociationRow>(tx.port, &key)? {
                            Some(row) => {
                                let view = load_port(tx, &row)?;
                                detach_routes(tx, b.bgpvpn_id, &row)?;
                                Some(Snapshot::Port(view))
                            }
                            None => None,
                        }
                    }
                };
                let Some(before) = before else {
                    continue;
                };
                tx.association(kind).remove(key.as_str())?;
                unlink_association(
                    tx,
                    &mut parent,
                    kind,
                    b.association_id,
                    resource_id,
                )?;
                put(tx.bgpvpn, &bgpvpn_key(b.bgpvpn_id), &parent)?;
                events.push(self.event(
                    tx,
                    ChangeKind::Deleted,
                    kind.entity(),
                    &parent,
                    Some(before),
                    None,
                )?);
            }
            Ok(events)
        })?;

        vdb_log!(self, info,
            "removed {} associations of deleted {kind} {resource_id}",
            events.len()
        );
        let removed = events.iter().filter_map(|e| e.before.clone()).collect();
        self.publish(events);
        Ok(removed)
    }

    /// Associations of one resource.
    pub fn resource_bindings(
        &self,
        kind: AssociationKind,
        resource_id: &str,
    ) -> Result<Vec<Binding>, Error> {
        let mut result = Vec::new();
        let prefix = index_prefix(kind, resource_id);
        for entry in self.trees.index.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            result.push(parse_binding(&key, &value)?);
        }
        Ok(result)
    }

    /// Every association in the store, ordered by resource.
    pub fn bindings(&self) -> Result<Vec<Binding>, Error> {
        let mut result = Vec::new();
        for entry in self.trees.index.iter() {
            let (key, value) = entry?;
            result.push(parse_binding(&key, &value)?);
        }
        Ok(result)
    }

    /// The BGPVPNs a resource is attached to, answered from the store alone.
    pub fn current_attachments(
        &self,
        resource_id: &str,
    ) -> Result<BTreeSet<Uuid>, Error> {
        let mut result = BTreeSet::new();
        for kind in [
            AssociationKind::Network,
            AssociationKind::Router,
            AssociationKind::Port,
        ] {
            for b in self.resource_bindings(kind, resource_id)? {
                result.insert(b.bgpvpn_id);
            }
        }
        Ok(result)
    }

    // RBAC ===================================================================

    pub fn create_rbac_grant(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        spec: &RbacGrantCreate,
    ) -> Result<RbacGrant, Error> {
        if spec.target_project.is_empty() || spec.target_project.contains('/')
        {
            return Err(Error::Validation(format!(
                "invalid target project '{}'",
                spec.target_project
            )));
        }
        let id = Uuid::new_v4();
        let grant = self.transaction(|tx| {
            let mut parent = require_bgpvpn(tx, bgpvpn_id, ctx)?;
            let key =
                rbac::grant_key(bgpvpn_id, spec.action, &spec.target_project);
            if tx.rbac.get(key.as_str())?.is_some() {
                return abort(Error::RbacGrantAlreadyExists {
                    object_id: bgpvpn_id,
                    target_project: spec.target_project.clone(),
                });
            }
            let grant = RbacGrant {
                id,
                tenant_id: ctx.tenant_id.clone(),
                object_id: bgpvpn_id,
                target_project: spec.target_project.clone(),
                action: spec.action,
            };
            put(tx.rbac, &key, &grant)?;
            parent.rbac_entries.push(key);
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;
            Ok(grant)
        })?;

        vdb_log!(self, info,
            "shared bgpvpn {bgpvpn_id} with '{}'", grant.target_project;
            "action" => grant.action.to_string()
        );
        self.flush();
        Ok(grant)
    }

    pub fn delete_rbac_grant(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
        target_project: &str,
        action: RbacAction,
    ) -> Result<RbacGrant, Error> {
        let grant = self.transaction(|tx| {
            let mut parent = require_bgpvpn(tx, bgpvpn_id, ctx)?;
            let key = rbac::grant_key(bgpvpn_id, action, target_project);
            let Some(grant) = get::<RbacGrant>(tx.rbac, &key)? else {
                return abort(Error::RbacGrantNotFound {
                    object_id: bgpvpn_id,
                    target_project: target_project.to_string(),
                });
            };
            tx.rbac.remove(key.as_str())?;
            parent.rbac_entries.retain(|k| *k != key);
            put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &parent)?;
            Ok(grant)
        })?;

        vdb_log!(self, info,
            "unshared bgpvpn {bgpvpn_id} with '{target_project}'"
        );
        self.flush();
        Ok(grant)
    }

    pub fn list_rbac_grants(
        &self,
        ctx: &Context,
        bgpvpn_id: Uuid,
    ) -> Result<Vec<RbacGrant>, Error> {
        self.read(|tx| {
            let parent = require_bgpvpn(tx, bgpvpn_id, ctx)?;
            let mut grants = Vec::new();
            for key in &parent.rbac_entries {
                if let Some(grant) = get(tx.rbac, key)? {
                    grants.push(grant);
                }
            }
            Ok(grants)
        })
    }

    /// Whether the requester may see the BGPVPN. Absent BGPVPNs are not
    /// visible.
    pub fn is_visible(&self, ctx: &Context, id: Uuid) -> Result<bool, Error> {
        self.read(|tx| Ok(find_visible(tx, id, ctx)?.is_some()))
    }

    /// Whether the BGPVPN is shared with the requester, either directly or
    /// through a `*` grant.
    pub fn is_shared(&self, ctx: &Context, id: Uuid) -> Result<bool, Error> {
        self.read(|tx| {
            if tx.bgpvpn.get(bgpvpn_key(id).as_str())?.is_none() {
                return Ok(false);
            }
            rbac::is_shared(tx.rbac, id, ctx)
        })
    }
}

fn validate_targets(
    route_targets: Option<&Vec<String>>,
    import_targets: Option<&Vec<String>>,
    export_targets: Option<&Vec<String>>,
    route_distinguishers: Option<&Vec<String>>,
) -> Result<(), Error> {
    for (field, values) in [
        ("route_targets", route_targets),
        ("import_targets", import_targets),
        ("export_targets", export_targets),
        ("route_distinguishers", route_distinguishers),
    ] {
        if let Some(values) = values {
            rtrd::validate(field, values)?;
        }
    }
    Ok(())
}

fn new_bgpvpn_row(
    id: Uuid,
    ctx: &Context,
    spec: &BgpvpnCreate,
    allocation: &Allocation,
) -> BgpvpnRow {
    let route_targets = match &allocation.route {
        Some(target) => vec![target.clone()],
        None => spec.route_targets.clone(),
    };
    let import_targets = match &allocation.import {
        Some(target) => Some(vec![target.clone()]),
        None => spec.import_targets.clone(),
    };
    let export_targets = match &allocation.export {
        Some(target) => Some(vec![target.clone()]),
        None => spec.export_targets.clone(),
    };
    let route_distinguishers = if spec.route_distinguishers.is_empty() {
        None
    } else {
        Some(rtrd::encode(&spec.route_distinguishers))
    };

    BgpvpnRow {
        id,
        tenant_id: ctx.tenant_id.clone(),
        name: spec.name.clone(),
        vpn_type: spec.vpn_type,
        route_targets: rtrd::encode(&route_targets),
        import_targets: import_targets.map(|t| rtrd::encode(&t)),
        export_targets: export_targets.map(|t| rtrd::encode(&t)),
        route_distinguishers,
        vni: spec.vni,
        local_pref: spec.local_pref,
        standard: StandardAttributes::new(spec.description.clone()),
        sequence: 1,
        network_associations: Vec::new(),
        router_associations: Vec::new(),
        port_associations: Vec::new(),
        rbac_entries: Vec::new(),
        route_references: Vec::new(),
        allocated_targets: allocation.targets().cloned().collect(),
    }
}

/// Look up a BGPVPN, treating one the requester cannot see as absent.
fn find_visible(
    tx: &Tx<'_>,
    id: Uuid,
    ctx: &Context,
) -> TxResult<Option<BgpvpnRow>> {
    let Some(row) = get::<BgpvpnRow>(tx.bgpvpn, &bgpvpn_key(id))? else {
        return Ok(None);
    };
    if !rbac::is_visible(tx.rbac, row.id, &row.tenant_id, ctx)? {
        return Ok(None);
    }
    Ok(Some(row))
}

fn require_bgpvpn(tx: &Tx<'_>, id: Uuid, ctx: &Context) -> TxResult<BgpvpnRow> {
    match find_visible(tx, id, ctx)? {
        Some(row) => Ok(row),
        None => abort(Error::BgpvpnNotFound { id }),
    }
}

/// Fetch an association scoped by its BGPVPN, along with the BGPVPN row.
fn get_association<T: DeserializeOwned>(
    tx: &Tx<'_>,
    ctx: &Context,
    kind: AssociationKind,
    bgpvpn_id: Uuid,
    id: Uuid,
) -> TxResult<(BgpvpnRow, T)> {
    let not_found = || Error::AssociationNotFound {
        kind,
        id,
        bgpvpn_id,
    };
    let Some(parent) = find_visible(tx, bgpvpn_id, ctx)? else {
        return abort(not_found());
    };
    match get::<T>(tx.association(kind), &child_key(bgpvpn_id, id))? {
        Some(assoc) => Ok((parent, assoc)),
        None => abort(not_found()),
    }
}

fn list_associations<T: DeserializeOwned>(
    tx: &Tx<'_>,
    ctx: &Context,
    kind: AssociationKind,
    bgpvpn_id: Uuid,
) -> TxResult<Vec<T>> {
    let parent = require_bgpvpn(tx, bgpvpn_id, ctx)?;
    let mut result = Vec::new();
    for a in parent.associations(kind) {
        if let Some(assoc) =
            get::<T>(tx.association(kind), &child_key(bgpvpn_id, a.id))?
        {
            result.push(assoc);
        }
    }
    Ok(result)
}

/// Claim the (resource, BGPVPN) pair and record the association on its
/// BGPVPN. The index insert is the uniqueness constraint: a prior value means
/// the pair is already associated.
fn link_association(
    tx: &Tx<'_>,
    parent: &mut BgpvpnRow,
    kind: AssociationKind,
    id: Uuid,
    resource_id: &str,
) -> TxResult<()> {
    let key = index_key(kind, resource_id, parent.id);
    if tx
        .index
        .insert(key.as_str(), id.to_string().as_str())?
        .is_some()
    {
        return abort(Error::AssociationAlreadyExists {
            kind,
            bgpvpn_id: parent.id,
            resource_id: resource_id.to_string(),
        });
    }
    parent.associations_mut(kind).push(AssociationRef {
        id,
        resource_id: resource_id.to_string(),
    });
    parent.bump();
    Ok(())
}

fn unlink_association(
    tx: &Tx<'_>,
    parent: &mut BgpvpnRow,
    kind: AssociationKind,
    id: Uuid,
    resource_id: &str,
) -> TxResult<()> {
    tx.index
        .remove(index_key(kind, resource_id, parent.id).as_str())?;
    parent.associations_mut(kind).retain(|a| a.id != id);
    parent.bump();
    Ok(())
}

/// Persist routes for a port association of `owner`. Routes referencing
/// another BGPVPN are recorded on that BGPVPN, which must be visible to the
/// requester.
fn attach_routes(
    tx: &Tx<'_>,
    ctx: &Context,
    owner: Uuid,
    routes: &[PortAssociationRoute],
) -> TxResult<()> {
    for r in routes {
        if let RouteTarget::Bgpvpn { bgpvpn_id } = r.target {
            if bgpvpn_id != owner {
                let mut target = require_bgpvpn(tx, bgpvpn_id, ctx)?;
                target.route_references.push(RouteRef {
                    bgpvpn_id: owner,
                    port_association_id: r.port_association_id,
                    route_id: r.id,
                });
                put(tx.bgpvpn, &bgpvpn_key(bgpvpn_id), &target)?;
            }
        }
        put(tx.route, &child_key(r.port_association_id, r.id), r)?;
    }
    Ok(())
}

/// Remove all routes of a port association of `owner`.
fn detach_routes(
    tx: &Tx<'_>,
    owner: Uuid,
    port: &PortAssociationRow,
) -> TxResult<()> {
    for route_id in &port.routes {
        let key = child_key(port.id, *route_id);
        if let Some(r) = get::<PortAssociationRoute>(tx.route, &key)? {
            if let RouteTarget::Bgpvpn { bgpvpn_id } = r.target {
                let target_key = bgpvpn_key(bgpvpn_id);
                if bgpvpn_id != owner {
                    if let Some(mut target) =
                        get::<BgpvpnRow>(tx.bgpvpn, &target_key)?
                    {
                        target.route_references.retain(|x| x.route_id != r.id);
                        put(tx.bgpvpn, &target_key, &target)?;
                    }
                }
            }
        }
        tx.route.remove(key.as_str())?;
    }
    Ok(())
}

fn load_port(tx: &Tx<'_>, row: &PortAssociationRow) -> TxResult<PortAssociation> {
    let mut routes = Vec::new();
    for route_id in &row.routes {
        if let Some(r) = get(tx.route, &child_key(row.id, *route_id))? {
            routes.push(r);
        }
    }
    Ok(port_view(row, routes))
}

fn port_view(
    row: &PortAssociationRow,
    routes: Vec<PortAssociationRoute>,
) -> PortAssociation {
    PortAssociation {
        id: row.id,
        tenant_id: row.tenant_id.clone(),
        bgpvpn_id: row.bgpvpn_id,
        port_id: row.port_id.clone(),
        advertise_fixed_ips: row.advertise_fixed_ips,
        routes,
        standard: row.standard.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TargetIdRange;
    use crate::test::{get_test_db, get_test_db_with_config, TestDb};
    use crate::types::{RouteSpec, VpnType};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::mpsc::channel;

    fn owner() -> Context {
        Context::tenant("tenant-a")
    }

    fn other() -> Context {
        Context::tenant("tenant-b")
    }

    fn l3(db: &TestDb, ctx: &Context, rt: &str) -> Bgpvpn {
        db.create_bgpvpn(
            ctx,
            &BgpvpnCreate {
                name: "vpn".into(),
                vpn_type: VpnType::L3,
                route_targets: vec![rt.into()],
                ..Default::default()
            },
        )
        .expect("create bgpvpn")
    }

    fn filter(name: &str, values: &[&str]) -> Filters {
        let mut f = BTreeMap::new();
        f.insert(
            name.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        f
    }

    fn row_count(db: &TestDb) -> usize {
        let t = &db.trees;
        t.bgpvpn.len()
            + t.rbac.len()
            + t.network.len()
            + t.router.len()
            + t.port.len()
            + t.route.len()
            + t.index.len()
            + t.alloc.len()
    }

    fn stored_row(db: &TestDb, id: Uuid) -> BgpvpnRow {
        let raw = db
            .trees
            .bgpvpn
            .get(bgpvpn_key(id))
            .expect("read bgpvpn tree")
            .expect("bgpvpn row present");
        serde_json::from_slice(&raw).expect("decode bgpvpn row")
    }

    #[test]
    fn test_create_get_bgpvpn() {
        let db = get_test_db("vdb_create_get", vpn_common::test::logger())
            .expect("create db");
        let created = db
            .create_bgpvpn(
                &owner(),
                &BgpvpnCreate {
                    name: "blue".into(),
                    vpn_type: VpnType::L2,
                    route_targets: vec!["64512:1".into(), "64512:2".into()],
                    route_distinguishers: vec!["64512:100".into()],
                    vni: Some(1000),
                    ..Default::default()
                },
            )
            .expect("create bgpvpn");

        assert_eq!(created.tenant_id, "tenant-a");
        assert_eq!(created.vpn_type, VpnType::L2);
        assert_eq!(created.route_targets, vec!["64512:1", "64512:2"]);
        assert_eq!(created.import_targets, vec!["64512:1", "64512:2"]);
        assert_eq!(created.export_targets, vec!["64512:1", "64512:2"]);
        let row = stored_row(&db, created.id);
        assert_eq!(row.import_targets, None);
        assert_eq!(row.export_targets, None);
        assert_eq!(created.route_distinguishers, vec!["64512:100"]);
        assert_eq!(created.vni, Some(1000));
        assert_eq!(created.sequence, 1);
        assert!(!created.shared);

        let fetched = db.get_bgpvpn(&owner(), created.id).expect("get");
        assert_eq!(fetched, created);
    }

    #[test]
    fn test_invalid_targets_rejected() {
        let db = get_test_db("vdb_bad_targets", vpn_common::test::logger())
            .expect("create db");
        let result = db.create_bgpvpn(
            &owner(),
            &BgpvpnCreate {
                route_targets: vec!["64512:1,64512:2".into()],
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(row_count(&db), 0);
    }

    #[test]
    fn test_update_keeps_import_targets_unset() {
        let db = get_test_db("vdb_update", vpn_common::test::logger())
            .expect("create db");
        let vpn = l3(&db, &owner(), "64512:10");

        let updated = db
            .update_bgpvpn(
                &owner(),
                vpn.id,
                &BgpvpnUpdate {
                    route_targets: Some(vec!["64512:11".into()]),
                    ..Default::default()
                },
            )
            .expect("update");
        assert_eq!(updated.route_targets, vec!["64512:11"]);
        assert_eq!(updated.import_targets, vec!["64512:11"]);
        assert_eq!(updated.export_targets, vec!["64512:11"]);
        assert_eq!(stored_row(&db, vpn.id).import_targets, None);
        assert_eq!(updated.name, "vpn");
        assert_eq!(updated.sequence, 2);
        assert_eq!(updated.standard.revision_number, 1);

        let updated = db
            .update_bgpvpn(
                &owner(),
                vpn.id,
                &BgpvpnUpdate {
                    import_targets: Some(vec!["64512:99".into()]),
                    ..Default::default()
                },
            )
            .expect("update import targets");
        assert_eq!(updated.route_targets, vec!["64512:11"]);
        assert_eq!(updated.import_targets, vec!["64512:99"]);
        assert_eq!(updated.export_targets, vec!["64512:11"]);
        assert_eq!(
            stored_row(&db, vpn.id).import_targets,
            Some("64512:99".to_string())
        );

        let missing = db.update_bgpvpn(
            &owner(),
            Uuid::new_v4(),
            &BgpvpnUpdate::default(),
        );
        assert!(matches!(missing, Err(Error::BgpvpnNotFound { .. })));
    }

    #[test]
    fn test_capabilities_gate_optional_attributes() {
        let mut config = StoreConfig::default();
        config.capabilities.vni = false;
        let db = get_test_db_with_config(
            "vdb_capabilities",
            config,
            vpn_common::test::logger(),
        )
        .expect("create db");

        let vpn = db
            .create_bgpvpn(
                &owner(),
                &BgpvpnCreate {
                    vni: Some(42),
                    local_pref: Some(200),
                    ..Default::default()
                },
            )
            .expect("create bgpvpn");
        assert_eq!(vpn.vni, None);
        assert_eq!(vpn.local_pref, Some(200));
    }

    #[test]
    fn test_association_uniqueness() {
        let db = get_test_db("vdb_unique", vpn_common::test::logger())
            .expect("create db");
        let vpn = l3(&db, &owner(), "64512:10");
        let spec = NetworkAssociationCreate::new("tenant-a", "net1");

        db.create_network_association(&owner(), vpn.id, &spec)
            .expect("first association");
        let dup = db.create_network_association(&owner(), vpn.id, &spec);
        assert!(matches!(
            dup,
            Err(Error::AssociationAlreadyExists { kind: AssociationKind::Network, .. })
        ));
        assert!(dup.is_err_and(|e| e.is_already_exists()));

        // The same network may join a different BGPVPN.
        let vpn2 = l3(&db, &owner(), "64512:20");
        db.create_network_association(&owner(), vpn2.id, &spec)
            .expect("association to second bgpvpn");

        let vpn = db.get_bgpvpn(&owner(), vpn.id).expect("get");
        assert_eq!(vpn.networks, vec!["net1"]);
        assert_eq!(
            db.current_attachments("net1").expect("attachments"),
            [vpn.id, vpn2.id].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_concurrent_duplicate_associations() {
        let db = get_test_db("vdb_unique_race", vpn_common::test::logger())
            .expect("create db");
        let vpn = l3(&db, &owner(), "64512:10");

        let results: Vec<Result<RouterAssociation, Error>> =
            std::thread::scope(|s| {
                let handles: Vec<_> = (0..8)
                    .map(|_| {
                        s.spawn(|| {
                            db.create_router_association(
                                &owner(),
                                vpn.id,
                                &RouterAssociationCreate::new(
                                    "tenant-a", "router1",
                                ),
                            )
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("join"))
                    .collect()
            });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.is_already_exists()));
        assert_eq!(db.trees.router.len(), 1);
    }

    #[test]
    fn test_association_scoped_by_bgpvpn() {
        let db = get_test_db("vdb_scoped", vpn_common::test::logger())
            .expect("create db");
        let vpn1 = l3(&db, &owner(), "64512:10");
        let vpn2 = l3(&db, &owner(), "64512:20");
        let assoc = db
            .create_router_association(
                &owner(),
                vpn1.id,
                &RouterAssociationCreate::new("tenant-a", "router1"),
            )
            .expect("create association");

        let wrong = db.get_router_association(&owner(), vpn2.id, assoc.id);
        assert!(matches!(wrong, Err(Error::AssociationNotFound { .. })));
        let wrong = db.delete_router_association(&owner(), vpn2.id, assoc.id);
        assert!(matches!(wrong, Err(Error::AssociationNotFound { .. })));

        let updated = db
            .update_router_association(
                &owner(),
                vpn1.id,
                assoc.id,
                &RouterAssociationUpdate {
                    advertise_extra_routes: Some(false),
                    ..Default::default()
                },
            )
            .expect("update");
        assert!(!updated.advertise_extra_routes);
        assert_eq!(
            db.get_router_association(&owner(), vpn1.id, assoc.id)
                .expect("get"),
            updated
        );
    }

    #[test]
    fn test_cascade_delete_leaves_nothing() {
        let db = get_test_db("vdb_cascade", vpn_common::test::logger())
            .expect("create db");
        let ctx = owner();
        let vpn = l3(&db, &ctx, "64512:10");
        let id = vpn.id;

        db.create_network_association(
            &ctx,
            id,
            &NetworkAssociationCreate::new("tenant-a", "net1"),
        )
        .expect("network association");
        db.create_router_association(
            &ctx,
            id,
            &RouterAssociationCreate::new("tenant-a", "router1"),
        )
        .expect("router association");
        let mut port = PortAssociationCreate::new("tenant-a", "port1");
        port.routes = vec![
            RouteSpec::prefix("10.0.0.0/24"),
            RouteSpec::prefix("2001:db8::/64").with_local_pref(200),
        ];
        db.create_port_association(&ctx, id, &port)
            .expect("port association");
        db.create_rbac_grant(&ctx, id, &RbacGrantCreate::shared_with("*"))
            .expect("grant");
        assert!(row_count(&db) > 0);

        let before = db.delete_bgpvpn(&ctx, id).expect("delete");
        assert_eq!(before.networks, vec!["net1"]);
        assert_eq!(before.routers, vec!["router1"]);
        assert_eq!(before.ports, vec!["port1"]);

        assert_eq!(row_count(&db), 0);
        assert!(matches!(
            db.get_bgpvpn(&ctx, id),
            Err(Error::BgpvpnNotFound { .. })
        ));
        assert!(db.current_attachments("net1").expect("attachments").is_empty());
    }

    #[test]
    fn test_visibility() {
        let db = get_test_db("vdb_visibility", vpn_common::test::logger())
            .expect("create db");
        let vpn = l3(&db, &owner(), "64512:10");

        assert!(db.is_visible(&owner(), vpn.id).expect("visible"));
        assert!(db.is_visible(&Context::admin(), vpn.id).expect("visible"));
        assert!(!db.is_visible(&other(), vpn.id).expect("visible"));
        assert!(db.get_bgpvpn(&other(), vpn.id).is_err_and(|e| e.is_not_found()));
        assert!(db
            .list_bgpvpns(&other(), &Filters::new())
            .expect("list")
            .is_empty());

        // Associations of an invisible BGPVPN look absent.
        let assoc = db
            .create_network_association(
                &owner(),
                vpn.id,
                &NetworkAssociationCreate::new("tenant-a", "net1"),
            )
            .expect("association");
        assert!(matches!(
            db.get_network_association(&other(), vpn.id, assoc.id),
            Err(Error::AssociationNotFound { .. })
        ));
        assert!(matches!(
            db.create_network_association(
                &other(),
                vpn.id,
                &NetworkAssociationCreate::new("tenant-b", "net2"),
            ),
            Err(Error::BgpvpnNotFound { .. })
        ));

        db.create_rbac_grant(
            &owner(),
            vpn.id,
            &RbacGrantCreate::shared_with("*"),
        )
        .expect("grant");
        assert!(db.is_visible(&other(), vpn.id).expect("visible"));
        assert!(db.get_bgpvpn(&other(), vpn.id).expect("get").shared);
        assert_eq!(
            db.list_bgpvpns(&other(), &Filters::new()).expect("list").len(),
            1
        );
    }

    #[test]
    fn test_is_shared_is_requester_relative() {
        let db = get_test_db("vdb_shared", vpn_common::test::logger())
            .expect("create db");
        let vpn = l3(&db, &owner(), "64512:10");
        let third = Context::tenant("tenant-c");

        db.create_rbac_grant(
            &owner(),
            vpn.id,
            &RbacGrantCreate::shared_with("tenant-b"),
        )
        .expect("grant");

        assert!(db.is_shared(&other(), vpn.id).expect("shared"));
        assert!(!db.is_shared(&third, vpn.id).expect("shared"));
        assert!(!db.is_shared(&owner(), vpn.id).expect("shared"));
        assert!(!db.get_bgpvpn(&owner(), vpn.id).expect("get").shared);
        assert!(!db.is_visible(&third, vpn.id).expect("visible"));

        let dup = db.create_rbac_grant(
            &owner(),
            vpn.id,
            &RbacGrantCreate::shared_with("tenant-b"),
        );
        assert!(matches!(dup, Err(Error::RbacGrantAlreadyExists { .. })));

        let grants = db.list_rbac_grants(&owner(), vpn.id).expect("list");
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].target_project, "tenant-b");

        db.delete_rbac_grant(&owner(), vpn.id, "tenant-b", RbacAction::Shared)
            .expect("delete grant");
        assert!(!db.is_visible(&other(), vpn.id).expect("visible"));
        assert!(matches!(
            db.delete_rbac_grant(
                &owner(),
                vpn.id,
                "tenant-b",
                RbacAction::Shared
            ),
            Err(Error::RbacGrantNotFound { .. })
        ));
    }

    #[test]
    fn test_rbac_grants_emit_no_events() {
        let db = get_test_db("vdb_grant_events", vpn_common::test::logger())
            .expect("create db");
        let vpn = l3(&db, &owner(), "64512:10");
        let (tx, rx) = channel();
        db.watch("test".into(), tx);

        db.create_rbac_grant(
            &owner(),
            vpn.id,
            &RbacGrantCreate::shared_with("tenant-b"),
        )
        .expect("grant");
        db.delete_rbac_grant(&owner(), vpn.id, "tenant-b", RbacAction::Shared)
            .expect("delete grant");

        assert_eq!(rx.try_iter().count(), 0);
        assert_eq!(db.get_bgpvpn(&owner(), vpn.id).expect("get").sequence, 1);
    }

    #[test]
    fn test_reads_leave_store_unchanged() {
        let db = get_test_db("vdb_reads", vpn_common::test::logger())
            .expect("create db");
        let ctx = owner();
        let vpn = l3(&db, &ctx, "64512:10");
        let assoc = db
            .create_network_association(
                &ctx,
                vpn.id,
                &NetworkAssociationCreate::new("tenant-a", "net1"),
            )
            .expect("association");
        db.create_rbac_grant(&ctx, vpn.id, &RbacGrantCreate::shared_with("*"))
            .expect("grant");
        let (tx, rx) = channel();
        db.watch("test".into(), tx);
        let before = db.persistent.checksum().expect("checksum");

        db.get_bgpvpn(&other(), vpn.id).expect("get");
        db.list_bgpvpns(&Context::admin(), &Filters::new()).expect("list");
        db.get_network_association(&ctx, vpn.id, assoc.id)
            .expect("get association");
        db.list_network_associations(&ctx, vpn.id, &Filters::new())
            .expect("list associations");
        db.list_router_associations(&ctx, vpn.id, &Filters::new())
            .expect("list router associations");
        db.list_port_associations(&ctx, vpn.id, &Filters::new())
            .expect("list port associations");
        db.list_rbac_grants(&ctx, vpn.id).expect("list grants");
        assert!(db.is_visible(&other(), vpn.id).expect("visible"));
        assert!(db.is_shared(&other(), vpn.id).expect("shared"));

        assert_eq!(db.persistent.checksum().expect("checksum"), before);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_list_filters() {
        let db = get_test_db("vdb_filters", vpn_common::test::logger())
            .expect("create db");
        let ctx = owner();
        let blue = l3(&db, &ctx, "64512:10");
        let red = l3(&db, &ctx, "64512:20");
        db.create_network_association(
            &ctx,
            red.id,
            &NetworkAssociationCreate::new("tenant-a", "net1"),
        )
        .expect("association");

        let found = db
            .list_bgpvpns(&ctx, &filter("route_targets", &["64512:10"]))
            .expect("list");
        assert_eq!(found.iter().map(|v| v.id).collect::<Vec<_>>(), [blue.id]);

        let found = db
            .list_bgpvpns(&ctx, &filter("networks", &["net1"]))
            .expect("list");
        assert_eq!(found.iter().map(|v| v.id).collect::<Vec<_>>(), [red.id]);

        assert_eq!(
            db.list_bgpvpns(&ctx, &filter("type", &["l3"]))
                .expect("list")
                .len(),
            2
        );
        assert!(matches!(
            db.list_bgpvpns(&ctx, &filter("colour", &["red"])),
            Err(Error::Validation(_))
        ));

        let assocs = db
            .list_network_associations(
                &ctx,
                red.id,
                &filter("network_id", &["net1"]),
            )
            .expect("list associations");
        assert_eq!(assocs.len(), 1);
        assert!(db
            .list_network_associations(
                &ctx,
                red.id,
                &filter("network_id", &["net2"]),
            )
            .expect("list associations")
            .is_empty());
    }

    #[test]
    fn test_port_routes() {
        let db = get_test_db("vdb_port_routes", vpn_common::test::logger())
            .expect("create db");
        let ctx = owner();
        let vpn = l3(&db, &ctx, "64512:10");

        let mut bad = PortAssociationCreate::new("tenant-a", "port1");
        let mut route = RouteSpec::prefix("10.0.0.0/24");
        route.bgpvpn_id = Some(vpn.id);
        bad.routes = vec![route];
        assert!(matches!(
            db.create_port_association(&ctx, vpn.id, &bad),
            Err(Error::Validation(_))
        ));
        assert_eq!(db.trees.port.len(), 0);
        assert_eq!(db.trees.route.len(), 0);

        let mut spec = PortAssociationCreate::new("tenant-a", "port1");
        spec.routes = vec![
            RouteSpec::prefix("10.0.0.0/24"),
            RouteSpec::prefix("10.1.0.0/24"),
        ];
        let assoc = db
            .create_port_association(&ctx, vpn.id, &spec)
            .expect("create port association");
        assert_eq!(assoc.routes.len(), 2);

        let updated = db
            .update_port_association(
                &ctx,
                vpn.id,
                assoc.id,
                &PortAssociationUpdate {
                    routes: Some(vec![
                        RouteSpec::prefix("192.168.0.0/16").with_local_pref(50)
                    ]),
                    ..Default::default()
                },
            )
            .expect("replace routes");
        assert_eq!(updated.routes.len(), 1);
        assert_eq!(
            updated.routes[0].target,
            RouteTarget::Prefix {
                prefix: "192.168.0.0/16".into()
            }
        );
        assert_eq!(updated.routes[0].local_pref, Some(50));
        assert_eq!(db.trees.route.len(), 1);

        let fetched = db
            .get_port_association(&ctx, vpn.id, assoc.id)
            .expect("get");
        assert_eq!(fetched, updated);

        // Route replacement is all or nothing.
        let rejected = db.update_port_association(
            &ctx,
            vpn.id,
            assoc.id,
            &PortAssociationUpdate {
                routes: Some(vec![
                    RouteSpec::prefix("172.16.0.0/12"),
                    RouteSpec::bgpvpn(Uuid::new_v4()),
                ]),
                ..Default::default()
            },
        );
        assert!(matches!(rejected, Err(Error::BgpvpnNotFound { .. })));
        assert_eq!(
            db.get_port_association(&ctx, vpn.id, assoc.id)
                .expect("get")
                .routes,
            updated.routes
        );
    }

    #[test]
    fn test_referenced_bgpvpn_route_cascade() {
        let db = get_test_db("vdb_route_cascade", vpn_common::test::logger())
            .expect("create db");
        let ctx = owner();
        let vpn = l3(&db, &ctx, "64512:10");
        let referenced = l3(&db, &ctx, "64512:20");

        let mut spec = PortAssociationCreate::new("tenant-a", "port1");
        spec.routes = vec![
            RouteSpec::bgpvpn(referenced.id).with_local_pref(100),
            RouteSpec::prefix("10.0.0.0/24"),
        ];
        let assoc = db
            .create_port_association(&ctx, vpn.id, &spec)
            .expect("create port association");
        assert_eq!(assoc.routes.len(), 2);

        db.delete_bgpvpn(&ctx, referenced.id).expect("delete referenced");

        let assoc = db
            .get_port_association(&ctx, vpn.id, assoc.id)
            .expect("get");
        assert_eq!(assoc.routes.len(), 1);
        assert_eq!(
            assoc.routes[0].target,
            RouteTarget::Prefix {
                prefix: "10.0.0.0/24".into()
            }
        );
        assert_eq!(db.trees.route.len(), 1);
    }

    #[test]
    fn test_events_follow_commits() {
        let db = get_test_db("vdb_events", vpn_common::test::logger())
            .expect("create db");
        let (tx, rx) = channel();
        db.watch("test".into(), tx);

        let ctx = owner();
        let vpn = l3(&db, &ctx, "64512:10");
        let assoc = db
            .create_network_association(
                &ctx,
                vpn.id,
                &NetworkAssociationCreate::new("tenant-a", "net1"),
            )
            .expect("association");
        db.update_bgpvpn(
            &ctx,
            vpn.id,
            &BgpvpnUpdate {
                name: Some("renamed".into()),
                ..Default::default()
            },
        )
        .expect("update");
        db.delete_network_association(&ctx, vpn.id, assoc.id)
            .expect("delete association");
        db.delete_bgpvpn(&ctx, vpn.id).expect("delete bgpvpn");

        // A failed mutation emits nothing.
        assert!(db
            .delete_bgpvpn(&ctx, vpn.id)
            .is_err_and(|e| e.is_not_found()));

        let events: Vec<DeltaEvent> = rx.try_iter().collect();
        let summary: Vec<(ChangeKind, Entity, u64)> = events
            .iter()
            .map(|e| (e.kind, e.entity, e.sequence))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChangeKind::Created, Entity::Bgpvpn, 1),
                (ChangeKind::Created, Entity::NetworkAssociation, 2),
                (ChangeKind::Updated, Entity::Bgpvpn, 3),
                (ChangeKind::Deleted, Entity::NetworkAssociation, 4),
                (ChangeKind::Deleted, Entity::Bgpvpn, 5),
            ]
        );

        assert_eq!(events[1].bgpvpn.networks, vec!["net1"]);
        assert_eq!(
            events[1].after.as_ref().and_then(|s| s.resource()),
            Some((AssociationKind::Network, "net1"))
        );
        assert!(events[3].after.is_none());
        assert!(events[4].before.is_some());
    }

    #[test]
    fn test_delete_resource_associations() {
        let db = get_test_db("vdb_resource_delete", vpn_common::test::logger())
            .expect("create db");
        let (tx, rx) = channel();
        db.watch("test".into(), tx);

        let ctx = owner();
        let vpn1 = l3(&db, &ctx, "64512:10");
        let vpn2 = l3(&db, &ctx, "64512:20");
        for vpn in [&vpn1, &vpn2] {
            db.create_port_association(
                &ctx,
                vpn.id,
                &PortAssociationCreate::new("tenant-a", "port1"),
            )
            .expect("association");
        }
        db.create_port_association(
            &ctx,
            vpn1.id,
            &PortAssociationCreate::new("tenant-a", "port2"),
        )
        .expect("association");
        let _ = rx.try_iter().count();

        let removed = db
            .delete_resource_associations(AssociationKind::Port, "port1")
            .expect("delete resource");
        assert_eq!(removed.len(), 2);
        assert!(db.current_attachments("port1").expect("attachments").is_empty());
        assert_eq!(
            db.current_attachments("port2").expect("attachments"),
            [vpn1.id].into_iter().collect::<BTreeSet<_>>()
        );

        let events: Vec<DeltaEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == ChangeKind::Deleted
            && e.entity == Entity::PortAssociation));

        assert!(db
            .delete_resource_associations(AssociationKind::Port, "port1")
            .expect("delete again")
            .is_empty());
    }

    #[test]
    fn test_target_auto_allocation() {
        let mut config = StoreConfig::default();
        config.allocation.region_asn = Some("64512".into());
        config.allocation.target_id_range = TargetIdRange { low: 5, high: 6 };
        config.allocation.route_target_auto_allocation = true;
        let db = get_test_db_with_config(
            "vdb_alloc",
            config,
            vpn_common::test::logger(),
        )
        .expect("create db");
        let ctx = owner();

        let first = db
            .create_bgpvpn(&ctx, &BgpvpnCreate::default())
            .expect("create");
        assert_eq!(first.route_targets, vec!["64512:5"]);

        let explicit = l3(&db, &ctx, "65000:1");
        assert_eq!(explicit.route_targets, vec!["65000:1"]);

        let second = db
            .create_bgpvpn(&ctx, &BgpvpnCreate::default())
            .expect("create");
        assert_eq!(second.route_targets, vec!["64512:6"]);

        assert!(matches!(
            db.create_bgpvpn(&ctx, &BgpvpnCreate::default()),
            Err(Error::Conflict(_))
        ));

        db.delete_bgpvpn(&ctx, first.id).expect("delete");
        let third = db
            .create_bgpvpn(&ctx, &BgpvpnCreate::default())
            .expect("create after release");
        assert_eq!(third.route_targets, vec!["64512:5"]);
    }
}
