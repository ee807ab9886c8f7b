/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

#![allow(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(clippy::undocumented_unsafe_blocks)]

use strutil::trim_prefix_str;

pub mod cond;
pub mod eval;
pub mod file_cache;
pub mod fileutil;
pub mod flags;
pub mod func;
pub mod globals;
pub mod handler;
pub mod loc;
pub mod parser;
pub mod proitem;
pub mod stats;
pub mod strutil;
pub mod vfs;

#[macro_export]
macro_rules! log {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        log::trace!($fmt, $($($arg)*)?)
    };
}

#[macro_export]
macro_rules! log_stat {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        if $crate::flags::FLAGS.enable_stat_logs {
            eprintln!("*proeval*: {}", format!($fmt, $($($arg)*)?))
        }
    };
}

#[macro_export]
macro_rules! warn_loc {
    ($loc:expr, $fmt:expr $(, $($arg:tt)*)?) => {
        $crate::color_warn_log($loc, format!($fmt, $($($arg)*)?))
    };
}

const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";
const MAGENTA: &str = "\x1b[35m";
const RED: &str = "\x1b[31m";

fn error_log(loc: Option<&crate::loc::Loc>, msg: &str) {
    let Some(loc) = loc else {
        eprintln!("{msg}");
        return;
    };

    if crate::flags::FLAGS.color_warnings {
        let filtered = trim_prefix_str(msg, "error: ");
        eprintln!("{BOLD}{loc}: {RED}error: {RESET}{BOLD}{filtered}{RESET}")
    } else {
        eprintln!("{loc}: {msg}")
    }
}

fn color_warn_log(loc: Option<&crate::loc::Loc>, msg: String) {
    let Some(loc) = loc else {
        eprintln!("{msg}");
        return;
    };

    if crate::flags::FLAGS.color_warnings {
        let filtered = trim_prefix_str(&msg, "warning: ");
        eprintln!("{BOLD}{loc}: {MAGENTA}warning: {RESET}{BOLD}{filtered}{RESET}")
    } else {
        eprintln!("{loc}: {msg}")
    }
}
