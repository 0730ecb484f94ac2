// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keeps the forwarding agent's bindings in line with the association store.
//!
//! The sync loop registers a store watcher, reconciles the agent against a
//! full store snapshot and then translates each delta event into attach and
//! detach commands. Events carry a per-BGPVPN sequence number; a gap in that
//! sequence means an event was missed and triggers another reconciliation.

use crate::agent::{Agent, AttachCommand, BindingKey, Command, DetachCommand};
use crate::log::{agent_log, sync_log};
use slog::Logger;
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use uuid::Uuid;
use vdb::{
    AssociationKind, Bgpvpn, ChangeKind, Context, Db, DeltaEvent, Entity,
    Filters, Snapshot,
};
use vpn_common::stats::LowerStats;

pub mod agent;
pub mod error;
mod log;


pub use error::Error;

pub const COMPONENT_VPN_LOWER: &str = "vpn_lower";
pub const MOD_SYNC: &str = "sync";
const UNIT_AGENT: &str = "agent";
const UNIT_EVENT_LOOP: &str = "event_loop";

const WATCHER_TAG: &str = "vpn-lower";

const KINDS: [AssociationKind; 3] = [
    AssociationKind::Network,
    AssociationKind::Router,
    AssociationKind::Port,
];

/// Work for the sync loop.
#[derive(Debug, Clone)]
pub enum SyncRequest {
    Change(Box<DeltaEvent>),
    /// Reconcile the agent against the store regardless of sequence state.
    Resync,
}

/// The last sequence number applied for each BGPVPN.
pub type Sequences = HashMap<Uuid, u64>;

/// Run the sync loop. Requests arrive on `rx`; `tx` is the sending half of
/// the same channel and is used to forward store events into it.
pub fn run<A: Agent>(
    db: Db,
    agent: A,
    log: Logger,
    rt: Arc<tokio::runtime::Handle>,
    stats: Arc<LowerStats>,
    tx: Sender<SyncRequest>,
    rx: Receiver<SyncRequest>,
) {
    // start the db watcher first so we catch any changes that may occur while
    // we're initializing
    let (etx, erx) = channel();
    db.watch(WATCHER_TAG.into(), etx);
    std::thread::spawn(move || {
        for event in erx {
            if tx.send(SyncRequest::Change(Box::new(event))).is_err() {
                break;
            }
        }
    });

    let mut sequences = initialize_or_empty(&db, &agent, &log, &rt, &stats);

    loop {
        match rx.recv() {
            Ok(SyncRequest::Change(event)) => {
                handle_change(
                    &db,
                    &agent,
                    &event,
                    &mut sequences,
                    &log,
                    &rt,
                    &stats,
                );
            }
            Ok(SyncRequest::Resync) => {
                sequences =
                    initialize_or_empty(&db, &agent, &log, &rt, &stats);
            }
            Err(e) => {
                sync_log!(log, error, "vpn-lower request rx: {e}");
                return;
            }
        }
    }
}

fn initialize_or_empty<A: Agent>(
    db: &Db,
    agent: &A,
    log: &Logger,
    rt: &tokio::runtime::Handle,
    stats: &LowerStats,
) -> Sequences {
    match initialize(db, agent, log, rt, stats) {
        Ok(sequences) => sequences,
        Err(e) => {
            // Any later event then looks like a gap and retries this.
            sync_log!(log, error, "reconcile failed: {e}");
            Sequences::new()
        }
    }
}

/// Bring the agent in line with the store: attach bindings that are missing
/// or whose forwarding attributes differ, and detach bindings the store does
/// not hold. Returns the sequence numbers the snapshot reflects.
pub fn initialize<A: Agent>(
    db: &Db,
    agent: &A,
    log: &Logger,
    rt: &tokio::runtime::Handle,
    stats: &LowerStats,
) -> Result<Sequences, Error> {
    LowerStats::bump(&stats.resyncs);

    // One store transaction, so attachments and sequences agree.
    let bgpvpns = db.list_bgpvpns(&Context::admin(), &Filters::default())?;
    let sequences: Sequences =
        bgpvpns.iter().map(|b| (b.id, b.sequence)).collect();

    let desired: BTreeMap<BindingKey, AttachCommand> = bgpvpns
        .iter()
        .flat_map(attach_all)
        .map(|cmd| (cmd.key(), cmd))
        .collect();

    let active: Option<BTreeMap<BindingKey, AttachCommand>> =
        match rt.block_on(agent.list()) {
            Ok(list) => Some(list.into_iter().map(|c| (c.key(), c)).collect()),
            Err(e) => {
                agent_log!(log, warn,
                    "listing agent bindings failed, attaching everything: {e}");
                None
            }
        };

    let mut commands = Vec::new();
    for (key, cmd) in &desired {
        let current = active.as_ref().and_then(|a| a.get(key));
        if current != Some(cmd) {
            commands.push(Command::Attach(cmd.clone()));
        }
    }
    if let Some(active) = active {
        for key in active.into_keys() {
            if !desired.contains_key(&key) {
                commands.push(Command::Detach(key.into()));
            }
        }
    }

    sync_log!(log, info, "reconciling agent";
        "bgpvpns" => sequences.len(),
        "bindings" => desired.len(),
        "commands" => commands.len()
    );
    dispatch(agent, &commands, log, rt, stats);

    Ok(sequences)
}

/// Apply one delta event. Events already reflected in `sequences` are
/// skipped; a sequence gap falls back to a full reconciliation.
pub fn handle_change<A: Agent>(
    db: &Db,
    agent: &A,
    event: &DeltaEvent,
    sequences: &mut Sequences,
    log: &Logger,
    rt: &tokio::runtime::Handle,
    stats: &LowerStats,
) {
    LowerStats::bump(&stats.events_handled);

    let last = sequences.get(&event.bgpvpn_id).copied().unwrap_or(0);
    if event.sequence <= last {
        sync_log!(log, debug, "skipping applied event";
            "bgpvpn" => event.bgpvpn_id.to_string(),
            "sequence" => event.sequence,
            "applied" => last
        );
        return;
    }
    if event.sequence > last + 1 {
        sync_log!(log, warn, "event sequence gap, reconciling";
            "bgpvpn" => event.bgpvpn_id.to_string(),
            "sequence" => event.sequence,
            "applied" => last
        );
        *sequences = initialize_or_empty(db, agent, log, rt, stats);
        return;
    }

    dispatch(agent, &translate(event), log, rt, stats);

    if event.entity == Entity::Bgpvpn && event.kind == ChangeKind::Deleted {
        sequences.remove(&event.bgpvpn_id);
    } else {
        sequences.insert(event.bgpvpn_id, event.sequence);
    }
}

/// The agent commands that carry out one delta event.
pub fn translate(event: &DeltaEvent) -> Vec<Command> {
    match (event.entity.association_kind(), event.kind) {
        (Some(_), ChangeKind::Created | ChangeKind::Updated) => event
            .after
            .as_ref()
            .and_then(Snapshot::resource)
            .map(|(kind, resource)| {
                Command::Attach(AttachCommand::new(
                    kind,
                    resource,
                    &event.bgpvpn,
                ))
            })
            .into_iter()
            .collect(),
        (Some(_), ChangeKind::Deleted) => event
            .before
            .as_ref()
            .and_then(Snapshot::resource)
            .map(|(kind, resource)| {
                Command::Detach(DetachCommand {
                    resource_id: resource.to_string(),
                    resource_type: kind,
                    bgpvpn_id: event.bgpvpn_id,
                })
            })
            .into_iter()
            .collect(),
        (None, ChangeKind::Created) => Vec::new(),
        (None, ChangeKind::Updated) => {
            let changed = match (&event.before, &event.after) {
                (Some(Snapshot::Bgpvpn(b)), Some(Snapshot::Bgpvpn(a))) => {
                    a.forwarding_differs(b)
                }
                _ => true,
            };
            if !changed {
                return Vec::new();
            }
            attach_all(&event.bgpvpn).map(Command::Attach).collect()
        }
        (None, ChangeKind::Deleted) => KINDS
            .iter()
            .flat_map(|kind| {
                event.bgpvpn.resources(*kind).iter().map(|resource| {
                    Command::Detach(DetachCommand {
                        resource_id: resource.clone(),
                        resource_type: *kind,
                        bgpvpn_id: event.bgpvpn_id,
                    })
                })
            })
            .collect(),
    }
}

fn attach_all(bgpvpn: &Bgpvpn) -> impl Iterator<Item = AttachCommand> + '_ {
    KINDS.iter().flat_map(move |kind| {
        bgpvpn
            .resources(*kind)
            .iter()
            .map(move |resource| AttachCommand::new(*kind, resource, bgpvpn))
    })
}

fn dispatch<A: Agent>(
    agent: &A,
    commands: &[Command],
    log: &Logger,
    rt: &tokio::runtime::Handle,
    stats: &LowerStats,
) {
    for command in commands {
        match command {
            Command::Attach(cmd) => {
                LowerStats::bump(&stats.attach_sent);
                if let Err(e) = rt.block_on(agent.attach(cmd)) {
                    LowerStats::bump(&stats.dispatch_failures);
                    agent_log!(log, error, "attach failed: {e}";
                        "resource" => &cmd.resource_id,
                        "resource_type" => cmd.resource_type.as_str(),
                        "bgpvpn" => cmd.bgpvpn_id.to_string()
                    );
                }
            }
            Command::Detach(cmd) => {
                LowerStats::bump(&stats.detach_sent);
                if let Err(e) = rt.block_on(agent.detach(cmd)) {
                    LowerStats::bump(&stats.dispatch_failures);
                    agent_log!(log, error, "detach failed: {e}";
                        "resource" => &cmd.resource_id,
                        "resource_type" => cmd.resource_type.as_str(),
                        "bgpvpn" => cmd.bgpvpn_id.to_string()
                    );
                }
            }
        }
    }
}
