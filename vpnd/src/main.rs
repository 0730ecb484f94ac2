// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::admin::HandlerContext;
use crate::log::dlog;
use anyhow::{anyhow, Context as _};
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use vdb::{Capabilities, Db, StoreConfig, TargetAllocation, TargetIdRange};
use vpn_common::log::{init_file_logger, init_logger};
use vpn_common::stats::LowerStats;
use vpn_lower::agent::HttpAgent;

mod admin;
mod bgpvpn_admin;
mod error;
mod log;
mod signal;

const COMPONENT_VPND: &str = "vpnd";
const MOD_ADMIN: &str = "admin";
const UNIT_DAEMON: &str = "daemon";
const UNIT_SIG: &str = "signal";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the BGPVPN association daemon.
    Run(RunArgs),
    /// Generate the OpenAPI spec for the admin interface.
    Apigen,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory holding the association store.
    #[arg(long, env = "VPND_DATA_DIR", default_value = "/var/run/vpnd")]
    data_dir: String,

    /// Address to listen on for the admin API.
    #[arg(long, env = "VPND_ADMIN_ADDR", default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED))]
    admin_addr: IpAddr,

    /// Port to listen on for the admin API.
    #[arg(long, env = "VPND_ADMIN_PORT", default_value_t = 4680)]
    admin_port: u16,

    /// Base URL of the forwarding agent.
    #[arg(long, env = "VPND_AGENT_URL", default_value = "http://localhost:4681")]
    agent_url: String,

    /// Timeout for each agent request.
    #[arg(long, env = "VPND_AGENT_TIMEOUT", default_value = "5s")]
    agent_timeout: humantime::Duration,

    /// Expose the vni attribute.
    #[arg(long, env = "VPND_VNI", default_value_t = true, action = clap::ArgAction::Set)]
    vni: bool,

    /// Expose the local_pref attribute.
    #[arg(long, env = "VPND_ROUTES_CONTROL", default_value_t = true, action = clap::ArgAction::Set)]
    routes_control: bool,

    /// ASN used for auto allocated route targets.
    #[arg(long, env = "VPND_REGION_ASN")]
    region_asn: Option<String>,

    /// Numbers available for auto allocated route targets, as LOW-HIGH.
    #[arg(long, env = "VPND_TARGET_ID_RANGE", default_value = "300-1000")]
    target_id_range: TargetIdRange,

    /// Allocate route targets for BGPVPNs created without any.
    #[arg(long, env = "VPND_ROUTE_TARGET_AUTO_ALLOCATION")]
    route_target_auto_allocation: bool,

    /// Allocate import targets for BGPVPNs created without any.
    #[arg(long, env = "VPND_IMPORT_TARGET_AUTO_ALLOCATION")]
    import_target_auto_allocation: bool,

    /// Allocate export targets for BGPVPNs created without any.
    #[arg(long, env = "VPND_EXPORT_TARGET_AUTO_ALLOCATION")]
    export_target_auto_allocation: bool,

    /// Write logs to this file instead of stdout.
    #[arg(long, env = "VPND_LOG_FILE")]
    log_file: Option<String>,
}

impl RunArgs {
    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            capabilities: Capabilities {
                vni: self.vni,
                routes_control: self.routes_control,
            },
            allocation: TargetAllocation {
                region_asn: self.region_asn.clone(),
                target_id_range: self.target_id_range,
                route_target_auto_allocation: self
                    .route_target_auto_allocation,
                import_target_auto_allocation: self
                    .import_target_auto_allocation,
                export_target_auto_allocation: self
                    .export_target_auto_allocation,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    match args.command {
        Commands::Run(run_args) => run(run_args).await,
        Commands::Apigen => {
            admin::apigen();
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let log = match &args.log_file {
        Some(path) => init_file_logger(path),
        None => init_logger(),
    };

    let db_path = format!("{}/vdb", args.data_dir);
    let db = Db::new(&db_path, args.store_config(), log.clone())
        .with_context(|| format!("open store at {db_path}"))?;
    dlog!(log, info, "store opened";
        "path" => &db_path,
        "capabilities" => format!("{:?}", db.capabilities())
    );

    let agent = HttpAgent::new(&args.agent_url, args.agent_timeout.into())
        .context("build agent client")?;
    let stats = Arc::new(LowerStats::default());
    let (tx, rx) = channel();

    {
        let db = db.clone();
        let log = log.clone();
        let stats = stats.clone();
        let tx = tx.clone();
        let rt = Arc::new(tokio::runtime::Handle::current());
        std::thread::Builder::new()
            .name("vpn-lower".into())
            .spawn(move || vpn_lower::run(db, agent, log, rt, stats, tx, rx))
            .context("spawn sync thread")?;
    }

    let context = Arc::new(HandlerContext {
        log: log.clone(),
        db,
        lower_stats: stats,
        sync: Mutex::new(tx),
    });

    signal::handle_signals(context.clone(), log.clone()).await?;

    let server = admin::start_server(
        log.clone(),
        args.admin_addr,
        args.admin_port,
        context,
    )
    .map_err(|e| anyhow!(e))?;
    server.await.context("admin server task")?;

    Ok(())
}
