// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Multi-call libexec helper binary.
//!
//! `cadenza-libexec <helper> <errfd> [args…]` — see
//! `cadenza_daemon::helpers` for the calling convention. The individual
//! helpers are merged into one binary; the first argument selects the
//! implementation.

use cadenza_daemon::helpers::implementations as imp;
use cadenza_daemon::helpers::EXIT_BAD_ARGV;

fn main() -> ! {
    let helper = std::env::args().nth(1).unwrap_or_default();
    match helper.as_str() {
        "check-namespace-support" => imp::helper_main(0, imp::check_namespace_support),
        "kill-user" => imp::helper_main(1, |args, _emit| imp::kill_user(args)),
        "run-build-hook" => imp::helper_main(1, |args, _emit| imp::run_build_hook(args)),
        "run-diff-hook" => imp::helper_main(3, |args, _emit| imp::run_diff_hook(args)),
        "unix-bind-connect" => imp::helper_main(4, |args, _emit| imp::unix_bind_connect(args)),
        _ => std::process::exit(EXIT_BAD_ARGV),
    }
}
