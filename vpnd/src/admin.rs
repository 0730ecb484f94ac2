// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bgpvpn_admin;
use crate::error::Error;
use crate::log::dlog;
use dropshot::{
    endpoint, ApiDescription, ConfigDropshot, HttpError, HttpResponseOk,
    HttpResponseUpdatedNoContent, HttpServerStarter, Path, RequestContext,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::o;
use slog::{error, info, warn, Logger};
use std::collections::BTreeSet;
use std::fs::File;
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;
use vdb::{Binding, Capabilities, Db};
use vpn_common::lock;
use vpn_common::stats::{LowerStats, LowerStatsSnapshot};
use vpn_lower::SyncRequest;

pub struct HandlerContext {
    pub log: Logger,
    pub db: Db,
    pub lower_stats: Arc<LowerStats>,
    pub sync: Mutex<Sender<SyncRequest>>,
}

impl HandlerContext {
    /// Ask the sync loop for a full reconciliation.
    pub fn request_resync(&self) -> Result<(), Error> {
        lock!(self.sync).send(SyncRequest::Resync).map_err(|e| {
            Error::InternalCommunicationError(format!("sync loop gone: {e}"))
        })
    }
}

pub fn start_server(
    log: Logger,
    addr: IpAddr,
    port: u16,
    context: Arc<HandlerContext>,
) -> Result<JoinHandle<()>, String> {
    let sa = SocketAddr::new(addr, port);
    let ds_config = ConfigDropshot {
        bind_address: sa,
        ..Default::default()
    };

    let ds_log = log.new(o!("unit" => "api-server"));

    let api = api_description();

    let server = HttpServerStarter::new(&ds_config, api, context, &ds_log)
        .map_err(|e| format!("new admin dropshot: {}", e))?;

    info!(log, "admin: listening on {}", sa);

    Ok(tokio::spawn(async move {
        match server.start().await {
            Ok(_) => warn!(log, "admin: unexpected server exit"),
            Err(e) => error!(log, "admin: server start error {:?}", e),
        }
    }))
}

#[macro_export]
macro_rules! register {
    ($api:expr, $endpoint:expr) => {
        $api.register($endpoint).expect(stringify!($endpoint))
    };
}

pub fn api_description() -> ApiDescription<Arc<HandlerContext>> {
    let mut api = ApiDescription::new();
    register!(api, get_attachments);
    register!(api, get_bindings);
    register!(api, resync);
    register!(api, get_stats);
    register!(api, get_capabilities);
    bgpvpn_admin::api_description(&mut api);
    api
}

pub fn apigen() {
    let api = api_description();
    let openapi = api.openapi("BGPVPN Admin", "0.1.0");
    let mut out =
        File::create("vpn-admin.json").expect("create json api file");
    openapi.write(&mut out).expect("write json api file");
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResourcePathParams {
    pub resource_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct Attachments {
    pub resource_id: String,
    pub bgpvpns: BTreeSet<Uuid>,
}

/// The BGPVPNs a resource is attached to, answered from the store.
#[endpoint { method = GET, path = "/attachments/{resource_id}" }]
pub async fn get_attachments(
    ctx: RequestContext<Arc<HandlerContext>>,
    params: Path<ResourcePathParams>,
) -> Result<HttpResponseOk<Attachments>, HttpError> {
    let resource_id = params.into_inner().resource_id;
    let bgpvpns = ctx
        .context()
        .db
        .current_attachments(&resource_id)
        .map_err(Error::from)?;
    Ok(HttpResponseOk(Attachments {
        resource_id,
        bgpvpns,
    }))
}

#[endpoint { method = GET, path = "/bindings" }]
pub async fn get_bindings(
    ctx: RequestContext<Arc<HandlerContext>>,
) -> Result<HttpResponseOk<Vec<Binding>>, HttpError> {
    let bindings = ctx.context().db.bindings().map_err(Error::from)?;
    Ok(HttpResponseOk(bindings))
}

#[endpoint { method = POST, path = "/resync" }]
pub async fn resync(
    ctx: RequestContext<Arc<HandlerContext>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = ctx.context();
    ctx.request_resync()?;
    dlog!(ctx.log, info, "resync requested");
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint { method = GET, path = "/stats" }]
pub async fn get_stats(
    ctx: RequestContext<Arc<HandlerContext>>,
) -> Result<HttpResponseOk<LowerStatsSnapshot>, HttpError> {
    Ok(HttpResponseOk(ctx.context().lower_stats.snapshot()))
}

#[endpoint { method = GET, path = "/capabilities" }]
pub async fn get_capabilities(
    ctx: RequestContext<Arc<HandlerContext>>,
) -> Result<HttpResponseOk<Capabilities>, HttpError> {
    Ok(HttpResponseOk(ctx.context().db.capabilities()))
}
