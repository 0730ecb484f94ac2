// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("agent transport error {0}")]
    Transport(#[from] reqwest::Error),

    #[error("agent returned {status}: {body}")]
    AgentStatus { status: u16, body: String },

    #[error("store error {0}")]
    Store(#[from] vdb::error::Error),
}
