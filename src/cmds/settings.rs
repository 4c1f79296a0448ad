// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{Error, ErrorKind, ResultExt as _};
use bpaf::Bpaf;
use std::path::PathBuf;

/// Prints the settings record, applying any given updates first.
#[derive(Bpaf, Debug)]
#[bpaf(command("settings"))]
pub struct Args {
    #[bpaf(external(crate::parse_db_dir))]
    db_dir: PathBuf,

    /// Base directory for detection frames and disk accounting.
    #[bpaf(long, argument("PATH"))]
    base_dir: Option<PathBuf>,

    /// Enable or disable the object-detection worker.
    #[bpaf(long, argument("BOOL"))]
    enable_detection: Option<bool>,

    /// Model name passed to the detection worker.
    #[bpaf(long, argument("MODEL"))]
    detection_model: Option<String>,

    /// Subdirectory of the base directory for playlists and frames.
    #[bpaf(long, argument("DIR"))]
    detection_frames_path: Option<String>,

    /// Daily detector restart time as HH:MM; an empty string disables.
    #[bpaf(long, argument("HH:MM"))]
    ml_restart_schedule: Option<String>,

    /// Disk-usage percentage that triggers cleanup.
    #[bpaf(long, argument("PCT"))]
    cleanup_capacity_pct: Option<u8>,

    /// Stream startup verification budget in milliseconds.
    #[bpaf(long, argument("MS"))]
    stream_verify_timeout_ms: Option<u64>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let (_db_lock, conn) = super::open_conn(&args.db_dir, super::OpenMode::ReadWrite)?;
    let db = db::Database::new(conn)?;
    let l = db.lock();
    let mut settings = l.get_settings()?;

    let mut changed = false;
    macro_rules! apply {
        ($field:ident) => {
            if let Some(v) = args.$field {
                settings.$field = v;
                changed = true;
            }
        };
    }
    apply!(base_dir);
    apply!(enable_detection);
    apply!(detection_model);
    apply!(ml_restart_schedule);
    apply!(cleanup_capacity_pct);
    apply!(stream_verify_timeout_ms);
    if let Some(p) = args.detection_frames_path {
        settings.detection_frames_path = if p.is_empty() { None } else { Some(p) };
        changed = true;
    }
    if changed {
        l.put_settings(&settings)?;
    }

    let json = serde_json::to_string_pretty(&settings).err_kind(ErrorKind::Internal)?;
    println!("{json}");
    Ok(0)
}
