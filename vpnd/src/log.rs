// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// daemon
macro_rules! dlog {
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_VPND,
            "module" => crate::MOD_ADMIN,
            "unit" => crate::UNIT_DAEMON,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPND,
            "module" => crate::MOD_ADMIN,
            "unit" => crate::UNIT_DAEMON,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPND,
            "module" => crate::MOD_ADMIN,
            "unit" => crate::UNIT_DAEMON
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_VPND,
            "module" => crate::MOD_ADMIN,
            "unit" => crate::UNIT_DAEMON,
        )
    };
}

macro_rules! sig_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPND,
            "module" => crate::MOD_ADMIN,
            "unit" => crate::UNIT_SIG,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_VPND,
            "module" => crate::MOD_ADMIN,
            "unit" => crate::UNIT_SIG
        )
    };
}

pub(crate) use {dlog, sig_log};
