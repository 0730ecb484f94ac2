// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use dropshot::HttpError;
use http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database error {0}")]
    Db(#[from] vdb::error::Error),

    #[error("internal communication error: {0}")]
    InternalCommunicationError(String),
}

impl From<Error> for HttpError {
    fn from(value: Error) -> Self {
        match value {
            Error::Db(ref err) if err.is_not_found() => {
                Self::for_not_found(None, value.to_string())
            }
            Error::Db(ref err) if err.is_already_exists() => {
                Self::for_status(Some(value.to_string()), StatusCode::CONFLICT)
            }
            Error::Db(vdb::error::Error::Conflict(_)) => {
                Self::for_status(Some(value.to_string()), StatusCode::CONFLICT)
            }
            Error::Db(vdb::error::Error::Validation(_)) => {
                Self::for_bad_request(None, value.to_string())
            }
            Error::Db(_) | Error::InternalCommunicationError(_) => {
                Self::for_internal_error(value.to_string())
            }
        }
    }
}
