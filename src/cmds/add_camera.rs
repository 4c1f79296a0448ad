// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::Bpaf;
use db::CameraRecord;
use std::path::PathBuf;
use tracing::info;

/// Adds a camera record to the database and prints its key.
#[derive(Bpaf, Debug)]
#[bpaf(command("add-camera"))]
pub struct Args {
    #[bpaf(external(crate::parse_db_dir))]
    db_dir: PathBuf,

    /// Display name of the camera.
    #[bpaf(long, argument("NAME"))]
    name: String,

    /// Disk root under which the live stream is written.
    #[bpaf(long, argument("PATH"))]
    disk: PathBuf,

    /// Subfolder of the disk root for this camera.
    #[bpaf(long, argument("DIR"))]
    folder: String,

    /// Stream source URL or file; omit to build the RTSP URL from --ip and
    /// --passwd.
    #[bpaf(long, argument("URL"))]
    stream_source: Option<String>,

    /// Camera address for the default RTSP and motion URLs.
    #[bpaf(long, argument("ADDR"))]
    ip: Option<String>,

    /// Camera password for the built-in admin account.
    #[bpaf(long, argument("PASSWD"))]
    passwd: Option<String>,

    /// Explicit motion API URL, overriding the Reolink-style default.
    #[bpaf(long, argument("URL"))]
    motion_url: Option<String>,

    /// Start the RTSP→HLS transcoder for this camera.
    #[bpaf(long)]
    enable_streaming: bool,

    /// Poll the motion API and record motion events.
    #[bpaf(long)]
    enable_movement: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let (_db_lock, conn) = super::open_conn(&args.db_dir, super::OpenMode::ReadWrite)?;
    let db = db::Database::new(conn)?;

    let key = db::camera_key(jiff::Timestamp::now().as_second());
    let record = CameraRecord {
        name: args.name,
        disk: args.disk,
        folder: args.folder,
        stream_source: args.stream_source,
        ip: args.ip,
        passwd: args.passwd,
        motion_url: args.motion_url,
        enable_streaming: args.enable_streaming,
        enable_movement: args.enable_movement,
        ..CameraRecord::default()
    };
    db.lock().put_camera(&key, &record)?;
    info!("Added camera {} as {key}", record.name);
    println!("{key}");
    Ok(0)
}
