// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{Error, ErrorKind, ResultExt as _};
use nix::fcntl::FlockArg;
use std::os::fd::AsRawFd as _;
use std::path::Path;
use tracing::info;

pub mod add_camera;
pub mod init;
pub mod run;
pub mod settings;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OpenMode {
    ReadOnly,
    ReadWrite,
    Create,
}

/// Holds the database directory open and flocked; keep it alive as long as
/// the `Connection` is.
#[derive(Debug)]
pub struct DirLock(std::fs::File);

/// Locks the directory without opening the database.
fn open_dir(db_dir: &Path, mode: OpenMode) -> Result<DirLock, Error> {
    if mode == OpenMode::Create {
        std::fs::create_dir_all(db_dir).map_err(|e| {
            Error::from(e).context(format!("unable to create db dir {}", db_dir.display()))
        })?;
    }
    let file = std::fs::File::open(db_dir).map_err(|e| {
        let hint = if e.kind() == std::io::ErrorKind::NotFound {
            "; try running vigil-nvr init"
        } else {
            ""
        };
        Error::from(e).context(format!("unable to open db dir {}{hint}", db_dir.display()))
    })?;
    let ro = mode == OpenMode::ReadOnly;
    #[allow(deprecated)]
    nix::fcntl::flock(
        file.as_raw_fd(),
        if ro {
            FlockArg::LockSharedNonblock
        } else {
            FlockArg::LockExclusiveNonblock
        },
    )
    .err_kind(ErrorKind::Unavailable)
    .map_err(|e| {
        e.context(format!(
            "unable to get {} lock on db dir {}",
            if ro { "shared" } else { "exclusive" },
            db_dir.display()
        ))
    })?;
    Ok(DirLock(file))
}

/// Locks and opens the database.
/// The returned `DirLock` holds the lock and should be kept open as long as
/// the `Connection` is.
fn open_conn(db_dir: &Path, mode: OpenMode) -> Result<(DirLock, rusqlite::Connection), Error> {
    let lock = open_dir(db_dir, mode)?;
    let db_path = db_dir.join("db");
    info!(
        "Opening {} in {:?} mode with SQLite version {}",
        db_path.display(),
        mode,
        rusqlite::version()
    );
    let conn = rusqlite::Connection::open_with_flags(
        db_path,
        match mode {
            OpenMode::ReadOnly => rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
            OpenMode::ReadWrite => rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::Create => {
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            }
        } |
        // rusqlite::Connection is not Sync, so there's no reason to tell
        // SQLite3 to use the serialized threading mode.
        rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .err_kind(ErrorKind::Unavailable)?;
    Ok((lock, conn))
}
