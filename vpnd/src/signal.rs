// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::admin::HandlerContext;
use crate::log::sig_log;
use slog::Logger;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

/// Reconcile the agent on SIGUSR1.
pub(crate) async fn handle_signals(
    ctx: Arc<HandlerContext>,
    log: Logger,
) -> anyhow::Result<()> {
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        loop {
            sigusr1.recv().await;
            sig_log!(log, info, "resync on sigusr1");
            if let Err(e) = ctx.request_resync() {
                sig_log!(log, error, "resync on sigusr1 failed";
                    "error" => format!("{e}")
                );
            }
        }
    });
    Ok(())
}
