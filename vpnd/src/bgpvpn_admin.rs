// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Store mutations and queries for the API layer. Every request names the
//! identity it acts for in its query string.

use crate::error::Error;
use crate::log::dlog;
use crate::{admin::HandlerContext, register};
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseCreated,
    HttpResponseDeleted, HttpResponseOk, Path, Query, RequestContext,
    TypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use vdb::{
    AssociationKind, Bgpvpn, BgpvpnCreate, BgpvpnUpdate, Context, Filters,
    NetworkAssociation, NetworkAssociationCreate, NetworkAssociationUpdate,
    PortAssociation, PortAssociationCreate, PortAssociationUpdate, RbacAction,
    RbacGrant, RbacGrantCreate, RouterAssociation, RouterAssociationCreate,
    RouterAssociationUpdate, Snapshot,
};

pub(crate) fn api_description(api: &mut ApiDescription<Arc<HandlerContext>>) {
    register!(api, create_bgpvpn);
    register!(api, list_bgpvpns);
    register!(api, get_bgpvpn);
    register!(api, update_bgpvpn);
    register!(api, delete_bgpvpn);

    register!(api, create_network_association);
    register!(api, list_network_associations);
    register!(api, get_network_association);
    register!(api, update_network_association);
    register!(api, delete_network_association);

    register!(api, create_router_association);
    register!(api, list_router_associations);
    register!(api, get_router_association);
    register!(api, update_router_association);
    register!(api, delete_router_association);

    register!(api, create_port_association);
    register!(api, list_port_associations);
    register!(api, get_port_association);
    register!(api, update_port_association);
    register!(api, delete_port_association);

    register!(api, create_rbac_grant);
    register!(api, list_rbac_grants);
    register!(api, delete_rbac_grant);

    register!(api, delete_resource_associations);
}

/// The identity a request is performed on behalf of.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct Requester {
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub admin: bool,
}

impl Requester {
    pub fn context(&self) -> Result<Context, HttpError> {
        requester_context(self.tenant_id.as_deref(), self.admin)
    }
}

/// A requester plus attribute filters for list queries.
///
/// `filters` has the form `attr=v1,v2;attr2=v3`. A row matches when, for
/// every attribute, it carries any of the listed values.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListQuery {
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub admin: bool,
    pub filters: Option<String>,
}

impl ListQuery {
    pub fn context(&self) -> Result<Context, HttpError> {
        requester_context(self.tenant_id.as_deref(), self.admin)
    }

    pub fn filters(&self) -> Result<Filters, HttpError> {
        match &self.filters {
            Some(s) => parse_filters(s),
            None => Ok(Filters::new()),
        }
    }
}

fn requester_context(
    tenant_id: Option<&str>,
    admin: bool,
) -> Result<Context, HttpError> {
    match (tenant_id, admin) {
        (Some(tenant), true) => Ok(Context {
            tenant_id: tenant.to_string(),
            is_admin: true,
        }),
        (None, true) => Ok(Context::admin()),
        (Some(tenant), false) if !tenant.is_empty() => {
            Ok(Context::tenant(tenant))
        }
        _ => Err(HttpError::for_bad_request(
            None,
            "tenant_id is required for non-admin requests".into(),
        )),
    }
}

pub fn parse_filters(s: &str) -> Result<Filters, HttpError> {
    let mut filters = Filters::new();
    for clause in s.split(';').filter(|c| !c.is_empty()) {
        let Some((attr, values)) = clause.split_once('=') else {
            return Err(HttpError::for_bad_request(
                None,
                format!("malformed filter {clause:?}, expected attr=values"),
            ));
        };
        filters
            .entry(attr.to_string())
            .or_default()
            .extend(values.split(',').map(str::to_string));
    }
    Ok(filters)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BgpvpnPathParams {
    pub bgpvpn_id: Uuid,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AssociationPathParams {
    pub bgpvpn_id: Uuid,
    pub association_id: Uuid,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RbacPathParams {
    pub bgpvpn_id: Uuid,
    pub action: RbacAction,
    pub target_project: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResourcePathParams {
    pub kind: AssociationKind,
    pub resource_id: String,
}

// BGPVPNs ====================================================================

#[endpoint { method = POST, path = "/bgpvpns" }]
pub async fn create_bgpvpn(
    ctx: RequestContext<Arc<HandlerContext>>,
    query: Query<Requester>,
    request: TypedBody<BgpvpnCreate>,
) -> Result<HttpResponseCreated<Bgpvpn>, HttpError> {
    let requester = query.into_inner().context()?;
    let vpn = ctx
        .context()
        .db
        .create_bgpvpn(&requester, &request.into_inner())
        .map_err(Error::from)?;
    Ok(HttpResponseCreated(vpn))
}

#[endpoint { method = GET, path = "/bgpvpns" }]
pub async fn list_bgpvpns(
    ctx: RequestContext<Arc<HandlerContext>>,
    query: Query<ListQuery>,
) -> Result<HttpResponseOk<Vec<Bgpvpn>>, HttpError> {
    let query = query.into_inner();
    let vpns = ctx
        .context()
        .db
        .list_bgpvpns(&query.context()?, &query.filters()?)
        .map_err(Error::from)?;
    Ok(HttpResponseOk(vpns))
}

#[endpoint { method = GET, path = "/bgpvpns/{bgpvpn_id}" }]
pub async fn get_bgpvpn(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseOk<Bgpvpn>, HttpError> {
    let vpn = ctx
        .context()
        .db
        .get_bgpvpn(
            &query.into_inner().context()?,
            params.into_inner().bgpvpn_id,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(vpn))
}

#[endpoint { method = PUT, path = "/bgpvpns/{bgpvpn_id}" }]
pub async fn update_bgpvpn(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<Requester>,
    request: TypedBody<BgpvpnUpdate>,
) -> Result<HttpResponseOk<Bgpvpn>, HttpError> {
    let vpn = ctx
        .context()
        .db
        .update_bgpvpn(
            &query.into_inner().context()?,
            params.into_inner().bgpvpn_id,
            &request.into_inner(),
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(vpn))
}

#[endpoint { method = DELETE, path = "/bgpvpns/{bgpvpn_id}" }]
pub async fn delete_bgpvpn(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseDeleted, HttpError> {
    ctx.context()
        .db
        .delete_bgpvpn(
            &query.into_inner().context()?,
            params.into_inner().bgpvpn_id,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseDeleted())
}

// Network associations =======================================================

#[endpoint {
    method = POST,
    path = "/bgpvpns/{bgpvpn_id}/network_associations"
}]
pub async fn create_network_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<Requester>,
    request: TypedBody<NetworkAssociationCreate>,
) -> Result<HttpResponseCreated<NetworkAssociation>, HttpError> {
    let assoc = ctx
        .context()
        .db
        .create_network_association(
            &query.into_inner().context()?,
            params.into_inner().bgpvpn_id,
            &request.into_inner(),
        )
        .map_err(Error::from)?;
    Ok(HttpResponseCreated(assoc))
}

#[endpoint {
    method = GET,
    path = "/bgpvpns/{bgpvpn_id}/network_associations"
}]
pub async fn list_network_associations(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<ListQuery>,
) -> Result<HttpResponseOk<Vec<NetworkAssociation>>, HttpError> {
    let query = query.into_inner();
    let items = ctx
        .context()
        .db
        .list_network_associations(
            &query.context()?,
            params.into_inner().bgpvpn_id,
            &query.filters()?,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(items))
}

#[endpoint {
    method = GET,
    path = "/bgpvpns/{bgpvpn_id}/network_associations/{association_id}"
}]
pub async fn get_network_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<AssociationPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseOk<NetworkAssociation>, HttpError> {
    let params = params.into_inner();
    let assoc = ctx
        .context()
        .db
        .get_network_association(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            params.association_id,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(assoc))
}

#[endpoint {
    method = PUT,
    path = "/bgpvpns/{bgpvpn_id}/network_associations/{association_id}"
}]
pub async fn update_network_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<AssociationPathParams>,
    query: Query<Requester>,
    request: TypedBody<NetworkAssociationUpdate>,
) -> Result<HttpResponseOk<NetworkAssociation>, HttpError> {
    let params = params.into_inner();
    let assoc = ctx
        .context()
        .db
        .update_network_association(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            params.association_id,
            &request.into_inner(),
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(assoc))
}

#[endpoint {
    method = DELETE,
    path = "/bgpvpns/{bgpvpn_id}/network_associations/{association_id}"
}]
pub async fn delete_network_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<AssociationPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseDeleted, HttpError> {
    let params = params.into_inner();
    ctx.context()
        .db
        .delete_network_association(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            params.association_id,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseDeleted())
}

// Router associations ========================================================

#[endpoint {
    method = POST,
    path = "/bgpvpns/{bgpvpn_id}/router_associations"
}]
pub async fn create_router_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<Requester>,
    request: TypedBody<RouterAssociationCreate>,
) -> Result<HttpResponseCreated<RouterAssociation>, HttpError> {
    let assoc = ctx
        .context()
        .db
        .create_router_association(
            &query.into_inner().context()?,
            params.into_inner().bgpvpn_id,
            &request.into_inner(),
        )
        .map_err(Error::from)?;
    Ok(HttpResponseCreated(assoc))
}

#[endpoint {
    method = GET,
    path = "/bgpvpns/{bgpvpn_id}/router_associations"
}]
pub async fn list_router_associations(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<ListQuery>,
) -> Result<HttpResponseOk<Vec<RouterAssociation>>, HttpError> {
    let query = query.into_inner();
    let items = ctx
        .context()
        .db
        .list_router_associations(
            &query.context()?,
            params.into_inner().bgpvpn_id,
            &query.filters()?,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(items))
}

#[endpoint {
    method = GET,
    path = "/bgpvpns/{bgpvpn_id}/router_associations/{association_id}"
}]
pub async fn get_router_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<AssociationPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseOk<RouterAssociation>, HttpError> {
    let params = params.into_inner();
    let assoc = ctx
        .context()
        .db
        .get_router_association(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            params.association_id,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(assoc))
}

#[endpoint {
    method = PUT,
    path = "/bgpvpns/{bgpvpn_id}/router_associations/{association_id}"
}]
pub async fn update_router_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<AssociationPathParams>,
    query: Query<Requester>,
    request: TypedBody<RouterAssociationUpdate>,
) -> Result<HttpResponseOk<RouterAssociation>, HttpError> {
    let params = params.into_inner();
    let assoc = ctx
        .context()
        .db
        .update_router_association(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            params.association_id,
            &request.into_inner(),
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(assoc))
}

#[endpoint {
    method = DELETE,
    path = "/bgpvpns/{bgpvpn_id}/router_associations/{association_id}"
}]
pub async fn delete_router_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<AssociationPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseDeleted, HttpError> {
    let params = params.into_inner();
    ctx.context()
        .db
        .delete_router_association(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            params.association_id,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseDeleted())
}

// Port associations ==========================================================

#[endpoint {
    method = POST,
    path = "/bgpvpns/{bgpvpn_id}/port_associations"
}]
pub async fn create_port_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<Requester>,
    request: TypedBody<PortAssociationCreate>,
) -> Result<HttpResponseCreated<PortAssociation>, HttpError> {
    let assoc = ctx
        .context()
        .db
        .create_port_association(
            &query.into_inner().context()?,
            params.into_inner().bgpvpn_id,
            &request.into_inner(),
        )
        .map_err(Error::from)?;
    Ok(HttpResponseCreated(assoc))
}

#[endpoint {
    method = GET,
    path = "/bgpvpns/{bgpvpn_id}/port_associations"
}]
pub async fn list_port_associations(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<ListQuery>,
) -> Result<HttpResponseOk<Vec<PortAssociation>>, HttpError> {
    let query = query.into_inner();
    let items = ctx
        .context()
        .db
        .list_port_associations(
            &query.context()?,
            params.into_inner().bgpvpn_id,
            &query.filters()?,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(items))
}

#[endpoint {
    method = GET,
    path = "/bgpvpns/{bgpvpn_id}/port_associations/{association_id}"
}]
pub async fn get_port_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<AssociationPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseOk<PortAssociation>, HttpError> {
    let params = params.into_inner();
    let assoc = ctx
        .context()
        .db
        .get_port_association(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            params.association_id,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(assoc))
}

#[endpoint {
    method = PUT,
    path = "/bgpvpns/{bgpvpn_id}/port_associations/{association_id}"
}]
pub async fn update_port_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<AssociationPathParams>,
    query: Query<Requester>,
    request: TypedBody<PortAssociationUpdate>,
) -> Result<HttpResponseOk<PortAssociation>, HttpError> {
    let params = params.into_inner();
    let assoc = ctx
        .context()
        .db
        .update_port_association(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            params.association_id,
            &request.into_inner(),
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(assoc))
}

#[endpoint {
    method = DELETE,
    path = "/bgpvpns/{bgpvpn_id}/port_associations/{association_id}"
}]
pub async fn delete_port_association(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<AssociationPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseDeleted, HttpError> {
    let params = params.into_inner();
    ctx.context()
        .db
        .delete_port_association(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            params.association_id,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseDeleted())
}

// RBAC =======================================================================

#[endpoint { method = POST, path = "/bgpvpns/{bgpvpn_id}/rbac" }]
pub async fn create_rbac_grant(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<Requester>,
    request: TypedBody<RbacGrantCreate>,
) -> Result<HttpResponseCreated<RbacGrant>, HttpError> {
    let grant = ctx
        .context()
        .db
        .create_rbac_grant(
            &query.into_inner().context()?,
            params.into_inner().bgpvpn_id,
            &request.into_inner(),
        )
        .map_err(Error::from)?;
    Ok(HttpResponseCreated(grant))
}

#[endpoint { method = GET, path = "/bgpvpns/{bgpvpn_id}/rbac" }]
pub async fn list_rbac_grants(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<BgpvpnPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseOk<Vec<RbacGrant>>, HttpError> {
    let grants = ctx
        .context()
        .db
        .list_rbac_grants(
            &query.into_inner().context()?,
            params.into_inner().bgpvpn_id,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseOk(grants))
}

#[endpoint {
    method = DELETE,
    path = "/bgpvpns/{bgpvpn_id}/rbac/{action}/{target_project}"
}]
pub async fn delete_rbac_grant(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<RbacPathParams>,
    query: Query<Requester>,
) -> Result<HttpResponseDeleted, HttpError> {
    let params = params.into_inner();
    ctx.context()
        .db
        .delete_rbac_grant(
            &query.into_inner().context()?,
            params.bgpvpn_id,
            &params.target_project,
            params.action,
        )
        .map_err(Error::from)?;
    Ok(HttpResponseDeleted())
}

// Resource cleanup ===========================================================

/// Remove every association of a resource that is being deleted, returning
/// what was removed.
#[endpoint {
    method = DELETE,
    path = "/resources/{kind}/{resource_id}/associations"
}]
pub async fn delete_resource_associations(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<ResourcePathParams>,
) -> Result<HttpResponseOk<Vec<Snapshot>>, HttpError> {
    let ctx = ctx.context();
    let params = params.into_inner();
    let removed = ctx
        .db
        .delete_resource_associations(params.kind, &params.resource_id)
        .map_err(Error::from)?;
    dlog!(ctx.log, info, "removed associations of {} {}",
        params.kind, params.resource_id;
        "count" => removed.len()
    );
    Ok(HttpResponseOk(removed))
}
