// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cleanup;
mod cmds;
mod detector;
mod hls;
mod motion;
mod process;
mod processing;
mod push;
mod streamer;
mod supervisor;

const DEFAULT_DB_DIR: &str = "./mydb";

/// Vigil NVR: motion-aware network video recorder supervisor.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the respective subcommands.
    AddCamera(#[bpaf(external(cmds::add_camera::args))] cmds::add_camera::Args),
    Init(#[bpaf(external(cmds::init::args))] cmds::init::Args),
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
    Settings(#[bpaf(external(cmds::settings::args))] cmds::settings::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::AddCamera(a) => cmds::add_camera::run(a),
            Args::Init(a) => cmds::init::run(a),
            Args::Run(a) => cmds::run::run(a),
            Args::Settings(a) => cmds::settings::run(a),
        }
    }
}

/// `--db-dir`, falling back to `$DBPATH`, then `./mydb`.
pub(crate) fn parse_db_dir() -> impl Parser<PathBuf> {
    bpaf::long("db-dir")
        .help("Directory holding the SQLite database; defaults to $DBPATH, then ./mydb.")
        .argument::<PathBuf>("PATH")
        .fallback_with(|| -> Result<PathBuf, String> {
            Ok(std::env::var_os("DBPATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| DEFAULT_DB_DIR.into()))
        })
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as `target/debug/vigil-nvr`:
    // `vigil-nvr`), falling back to the crate name if conversion to a
    // path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("Parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            ::std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
