// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

macro_rules! agent_log {
    ($log:ident, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_VPN_LOWER,
            "module" => crate::MOD_SYNC,
            "unit" => crate::UNIT_AGENT,
            $($key => $value),*
        )
    };
    ($log:ident, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPN_LOWER,
            "module" => crate::MOD_SYNC,
            "unit" => crate::UNIT_AGENT,
            $($key => $value),*
        )
    };
    ($log:ident, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPN_LOWER,
            "module" => crate::MOD_SYNC,
            "unit" => crate::UNIT_AGENT
        )
    };
    ($log:ident, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_VPN_LOWER,
            "module" => crate::MOD_SYNC,
            "unit" => crate::UNIT_AGENT,
        )
    };
}

macro_rules! sync_log {
    ($log:ident, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_VPN_LOWER,
            "module" => crate::MOD_SYNC,
            "unit" => crate::UNIT_EVENT_LOOP,
            $($key => $value),*
        )
    };
    ($log:ident, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPN_LOWER,
            "module" => crate::MOD_SYNC,
            "unit" => crate::UNIT_EVENT_LOOP,
            $($key => $value),*
        )
    };
    ($log:ident, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPN_LOWER,
            "module" => crate::MOD_SYNC,
            "unit" => crate::UNIT_EVENT_LOOP
        )
    };
    ($log:ident, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_VPN_LOWER,
            "module" => crate::MOD_SYNC,
            "unit" => crate::UNIT_EVENT_LOOP,
        )
    };
}

pub(crate) use {agent_log, sync_log};
