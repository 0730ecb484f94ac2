// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BGPVPN visibility.
//!
//! A BGPVPN is visible to its owner, to administrators, and to any tenant
//! holding a `shared` grant either for itself or for `*`. Whether a BGPVPN is
//! reported as shared depends on who is asking: only grants targeting `*` or
//! the requester count, not grants held by other tenants.

use crate::schema::TxResult;
use crate::types::{Context, RbacAction, TARGET_ALL};
use sled::transaction::TransactionalTree;
use uuid::Uuid;

pub(crate) fn grant_key(
    object_id: Uuid,
    action: RbacAction,
    target_project: &str,
) -> String {
    format!("{object_id}/{}/{target_project}", action.as_str())
}

pub(crate) fn is_shared(
    rbac: &TransactionalTree,
    object_id: Uuid,
    ctx: &Context,
) -> TxResult<bool> {
    for target in [TARGET_ALL, ctx.tenant_id.as_str()] {
        if target.is_empty() {
            continue;
        }
        let key = grant_key(object_id, RbacAction::Shared, target);
        if rbac.get(key.as_str())?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn is_visible(
    rbac: &TransactionalTree,
    object_id: Uuid,
    owner: &str,
    ctx: &Context,
) -> TxResult<bool> {
    if ctx.is_admin || owner == ctx.tenant_id {
        return Ok(true);
    }
    is_shared(rbac, object_id, ctx)
}
