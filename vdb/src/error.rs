// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::AssociationKind;
use sled::transaction::TransactionError;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("datastore error {0}")]
    DataStore(#[from] sled::Error),

    #[error("serialization error {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("db key error {0}")]
    DbKey(String),

    #[error("db value error {0}")]
    DbValue(String),

    #[error("bgpvpn {id} could not be found")]
    BgpvpnNotFound { id: Uuid },

    #[error("{kind} association {id} could not be found for bgpvpn {bgpvpn_id}")]
    AssociationNotFound {
        kind: AssociationKind,
        id: Uuid,
        bgpvpn_id: Uuid,
    },

    #[error("{kind} {resource_id} is already associated to bgpvpn {bgpvpn_id}")]
    AssociationAlreadyExists {
        kind: AssociationKind,
        bgpvpn_id: Uuid,
        resource_id: String,
    },

    #[error("rbac grant for '{target_project}' on bgpvpn {object_id} could not be found")]
    RbacGrantNotFound {
        object_id: Uuid,
        target_project: String,
    },

    #[error("bgpvpn {object_id} is already shared with '{target_project}'")]
    RbacGrantAlreadyExists {
        object_id: Uuid,
        target_project: String,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// The referenced object does not exist or is not visible to the
    /// requester. Callers cannot tell these apart.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BgpvpnNotFound { .. }
                | Self::AssociationNotFound { .. }
                | Self::RbacGrantNotFound { .. }
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::AssociationAlreadyExists { .. }
                | Self::RbacGrantAlreadyExists { .. }
        )
    }
}

impl From<TransactionError<Error>> for Error {
    fn from(value: TransactionError<Error>) -> Self {
        match value {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => Self::DataStore(e),
        }
    }
}
