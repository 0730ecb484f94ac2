// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod notify;
pub mod route;
pub mod rtrd;
pub mod types;

mod alloc;
mod log;
mod rbac;
mod schema;

pub use config::{Capabilities, StoreConfig, TargetAllocation, TargetIdRange};
pub use db::Db;
pub use types::*;

#[cfg(test)]
mod proptest;

pub const COMPONENT_VDB: &str = "vdb";
pub const MOD_DB: &str = "database";
pub const MOD_NOTIFY: &str = "notify";
