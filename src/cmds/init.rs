// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{bail_t, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes a database directory.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    #[bpaf(external(crate::parse_db_dir))]
    db_dir: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let (_db_lock, mut conn) = super::open_conn(&args.db_dir, super::OpenMode::Create)?;
    let tables: i64 = conn
        .query_row(
            "select count(*) from sqlite_master where type = 'table'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
    if tables > 0 {
        bail_t!(
            AlreadyExists,
            "database at {} is already initialized",
            args.db_dir.display()
        );
    }
    db::init(&mut conn)?;
    info!("Database initialized at {}", args.db_dir.display());
    Ok(0)
}
