// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! HLS plumbing: parsing the live manifest the transcoder maintains and
//! maintaining the bounded per-episode playlists.
//!
//! An episode playlist is an append-only log: opened with a fixed header,
//! extended with `#EXTINF` pairs as the episode grows, and finalized by
//! appending `#EXT-X-ENDLIST` exactly once.

use base::{Error, ErrorKind, ResultExt as _};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

pub const LIVE_MANIFEST: &str = "stream.m3u8";
const DEFAULT_TARGET_DURATION_SECS: u32 = 2;

/// Path of live segment `stream<index>.ts` under `<disk>/<folder>`.
pub fn segment_file(disk: &Path, folder: &str, index: u64) -> PathBuf {
    disk.join(folder).join(format!("stream{index}.ts"))
}

/// `mov<key>.m3u8`
pub fn event_playlist_name(movement_key: &str) -> String {
    format!("mov{movement_key}.m3u8")
}

/// `mov<key>_0001.jpg` etc; frame numbers are 1-based.
pub fn frame_file_name(movement_key: &str, frame: u64) -> String {
    format!("mov{movement_key}_{frame:04}.jpg")
}

/// The ffmpeg output pattern matching [`frame_file_name`].
pub fn frame_file_pattern(movement_key: &str) -> String {
    format!("mov{movement_key}_%04d.jpg")
}

/// Recovers the movement key embedded in a frame file name, the correlation
/// convention that ties detector results back to motion records.
pub fn movement_key_from_frame(file_name: &str) -> Option<String> {
    let rest = file_name.strip_prefix("mov")?;
    let end = rest.find('_')?;
    let key = &rest[..end];
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(key.to_owned())
}

/// The pieces of the live manifest the motion detector cares about.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LiveManifest {
    pub target_duration_secs: u32,
    /// Segment indices in manifest order.
    pub segments: Vec<u64>,
}

impl LiveManifest {
    pub fn last_segment(&self) -> Option<u64> {
        self.segments.last().copied()
    }
}

/// Parses the transcoder's sliding-window manifest. Unrecognized lines are
/// skipped; a missing target duration falls back to the 2 s the transcoder
/// is configured to produce.
pub fn parse_live_manifest(text: &str) -> LiveManifest {
    let mut manifest = LiveManifest {
        target_duration_secs: DEFAULT_TARGET_DURATION_SECS,
        segments: Vec::new(),
    };
    for line in text.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            if let Ok(secs) = value.trim().parse() {
                manifest.target_duration_secs = secs;
            }
        } else if !line.starts_with('#') && line.ends_with(".ts") {
            let name = line.rsplit('/').next().unwrap_or(line);
            if let Some(index) = name
                .strip_prefix("stream")
                .and_then(|r| r.strip_suffix(".ts"))
                .and_then(|digits| digits.parse().ok())
            {
                manifest.segments.push(index);
            }
        }
    }
    manifest
}

/// Absolute segment paths referenced by an episode playlist.
pub fn playlist_segment_paths(text: &str) -> Vec<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#') && l.ends_with(".ts"))
        .map(PathBuf::from)
        .collect()
}

fn extinf_pair(disk: &Path, folder: &str, target_secs: u32, index: u64) -> String {
    format!(
        "#EXTINF:{target_secs}.0,\n{}\n",
        segment_file(disk, folder, index).display()
    )
}

/// Writes a fresh bounded playlist covering `start..=last`.
pub fn write_event_playlist(
    path: &Path,
    disk: &Path,
    folder: &str,
    target_secs: u32,
    start: u64,
    last: u64,
) -> Result<(), Error> {
    let mut content = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{target_secs}\n\
         #EXT-X-MEDIA-SEQUENCE:{start}\n"
    );
    for index in start..=last {
        content.push_str(&extinf_pair(disk, folder, target_secs, index));
    }
    std::fs::write(path, content)
        .err_kind(ErrorKind::Internal)
        .map_err(|e| e.context(format!("writing event playlist {}", path.display())))
}

/// Appends `#EXTINF` pairs for the given segment indices.
pub fn append_event_segments(
    path: &Path,
    disk: &Path,
    folder: &str,
    target_secs: u32,
    indices: impl IntoIterator<Item = u64>,
) -> Result<(), Error> {
    let mut content = String::new();
    for index in indices {
        content.push_str(&extinf_pair(disk, folder, target_secs, index));
    }
    if content.is_empty() {
        return Ok(());
    }
    let mut f = OpenOptions::new()
        .append(true)
        .open(path)
        .err_kind(ErrorKind::Internal)?;
    f.write_all(content.as_bytes())
        .err_kind(ErrorKind::Internal)
}

/// Appends the `#EXT-X-ENDLIST` marker unless it is already present.
/// Returns true if this call appended it.
pub fn finalize_event_playlist(path: &Path) -> Result<bool, Error> {
    let existing = std::fs::read_to_string(path).err_kind(ErrorKind::Internal)?;
    if existing.contains("#EXT-X-ENDLIST") {
        return Ok(false);
    }
    let mut f = OpenOptions::new()
        .append(true)
        .open(path)
        .err_kind(ErrorKind::Internal)?;
    f.write_all(b"\n#EXT-X-ENDLIST\n")
        .err_kind(ErrorKind::Internal)?;
    Ok(true)
}
