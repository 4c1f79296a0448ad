// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-camera processing supervisor: an idempotent pointer-driven worker
//! that claims one pending motion episode at a time, extracts frames from
//! its bounded playlist with an ffmpeg child, and finalizes the record once
//! the detector has answered (or timed out on) every frame.
//!
//! At most one extractor runs per camera; cameras process in parallel. The
//! pointer (`last_processed_movement_key`) only advances at finalize, so
//! work is re-derived idempotently after a crash.

use crate::hls;
use crate::process::{self, ExitInfo};
use crate::push::{PushEvent, PushSink};
use crate::supervisor::Event;
use base::clock::Clocks;
use base::Error;
use db::{CameraRecord, Database, DetectionStatus, MotionRecord, ProcessingState};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Grace before SIGKILL when the extractor overruns its cap.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to keep tracking a killed extractor before abandoning its pid.
const ORPHAN_AFTER: Duration = Duration::from_secs(10);

/// How long after extractor exit to keep waiting for detector results.
const ML_RESULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Floor for the slot wall-time cap; the effective cap is
/// `max(this, max_single_movement_secs + 60 s)` so full-length episodes
/// extract completely.
const SLOT_CAP_FLOOR: Duration = Duration::from_secs(90);

pub fn slot_cap(camera: &CameraRecord) -> Duration {
    SLOT_CAP_FLOOR.max(Duration::from_secs(camera.max_single_movement_secs + 60))
}

/// The ffmpeg invocation reading a bounded event playlist and emitting
/// 640×640 letterboxed JPEG frames at 2 fps, with machine-readable progress
/// on stdout.
pub fn extractor_args(
    playlist: &Path,
    frames_dir: &Path,
    movement_key: &str,
    max_single_movement_secs: u64,
) -> Vec<String> {
    let read_timeout_us = (max_single_movement_secs + 30) * 1_000_000;
    let max_output_secs = max_single_movement_secs + 60;
    vec![
        "-y".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "hls".into(),
        "-live_start_index".into(),
        "0".into(),
        "-allowed_extensions".into(),
        "ALL".into(),
        "-rw_timeout".into(),
        read_timeout_us.to_string(),
        "-i".into(),
        playlist.to_string_lossy().into_owned(),
        "-t".into(),
        max_output_secs.to_string(),
        "-an".into(),
        "-vf".into(),
        "fps=2,scale=w=640:h=640:force_original_aspect_ratio=decrease,\
         pad=640:640:(ow-iw)/2:(oh-ih)/2"
            .into(),
        "-q:v".into(),
        "2".into(),
        "-progress".into(),
        "pipe:1".into(),
        frames_dir
            .join(hls::frame_file_pattern(movement_key))
            .to_string_lossy()
            .into_owned(),
    ]
}

/// Parses a `-progress pipe:1` line; only `frame=<n>` is interesting.
pub fn parse_progress_frame(line: &str) -> Option<u64> {
    line.trim().strip_prefix("frame=")?.trim().parse().ok()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PlaylistIssue {
    Missing,
    NoSegments,
    SegmentsDeleted,
}

impl PlaylistIssue {
    pub fn reason(self) -> &'static str {
        match self {
            PlaylistIssue::Missing => "Playlist file deleted by disk cleanup",
            PlaylistIssue::NoSegments => "Playlist contains no segments",
            PlaylistIssue::SegmentsDeleted => "Segment files deleted by disk cleanup",
        }
    }
}

/// Checks a claimed playlist still points at extractable media: the file
/// exists, references at least one segment, and the first segment is
/// accessible (disk cleanup may have raced us).
pub fn validate_playlist(playlist: &Path) -> Result<(), PlaylistIssue> {
    let text = std::fs::read_to_string(playlist).map_err(|_| PlaylistIssue::Missing)?;
    let segments = hls::playlist_segment_paths(&text);
    let first = segments.first().ok_or(PlaylistIssue::NoSegments)?;
    if !first.exists() {
        return Err(PlaylistIssue::SegmentsDeleted);
    }
    Ok(())
}

/// In-memory state of a held processing slot.
pub struct ProcessingSlot {
    pub movement_key: String,
    /// Monotonic time the slot was claimed.
    pub started_at: Duration,
    pub handle: Option<process::Handle>,
    pub frames_dir: PathBuf,
    pub killed_at: Option<Duration>,
    pub ffmpeg_exited: bool,
    pub ffmpeg_exited_at: Option<Duration>,
    pub exit: Option<ExitInfo>,
    /// Highest frame number the extractor reported producing.
    pub highest_frame: u64,
    pub frames_sent: u32,
    pub frames_received: u32,
    pub ml_total_ms: u64,
    pub ml_max_ms: u64,
    /// First stderr line that looks like an error, and the first line at all
    /// as a fallback.
    pub stderr_error: Option<String>,
    pub first_stderr: Option<String>,
    /// The timeout path already wrote a terminal record.
    pub finalized: bool,
}

pub struct Env<'e, C: Clocks> {
    pub clocks: &'e C,
    pub db: &'e Database,
    pub push: &'e dyn PushSink,
    pub events: &'e UnboundedSender<Event>,
}

pub struct Processor {
    camera_key: String,
    pub slot: Option<ProcessingSlot>,
}

impl Processor {
    pub fn new(camera_key: String) -> Self {
        Processor {
            camera_key,
            slot: None,
        }
    }

    pub fn slot_held(&self) -> bool {
        self.slot.is_some()
    }

    /// One pass: progress a held slot's timeout paths, or claim the
    /// next piece of pending work and spawn its extractor.
    pub fn tick<C: Clocks>(&mut self, env: &Env<'_, C>, camera: &CameraRecord) {
        let now = env.clocks.monotonic();
        if let Some(slot) = &mut self.slot {
            if let Some(killed_at) = slot.killed_at {
                if now.saturating_sub(killed_at) > ORPHAN_AFTER {
                    warn!(
                        "{}: extractor for {} ignored signals for {ORPHAN_AFTER:?}, \
                         abandoning pid tracking",
                        self.camera_key, slot.movement_key
                    );
                    self.slot = None;
                }
                return;
            }
            if !slot.ffmpeg_exited && now.saturating_sub(slot.started_at) > slot_cap(camera) {
                warn!(
                    "{}: extractor for {} exceeded {:?}, killing",
                    self.camera_key,
                    slot.movement_key,
                    slot_cap(camera)
                );
                if let Some(handle) = &slot.handle {
                    handle.kill_with_escalation(KILL_GRACE);
                }
                slot.killed_at = Some(now);
                slot.finalized = true;
                let key = slot.movement_key.clone();
                let error = format!(
                    "Extractor timed out after {}s",
                    now.saturating_sub(slot.started_at).as_secs()
                );
                let stats = (
                    slot.frames_sent,
                    slot.frames_received,
                    slot.ml_total_ms,
                    slot.ml_max_ms,
                );
                self.write_terminal(env, &key, ProcessingState::Failed, Some(error), 0, stats);
            }
            return;
        }

        match self.scan_pending(env, camera) {
            Ok(Some((key, record))) => self.claim(env, camera, key, record),
            Ok(None) => {}
            Err(e) => warn!("{}: pending scan failed: {}", self.camera_key, e.chain()),
        }
    }

    /// Finds the first claimable pending record above the camera's pointer,
    /// failing records whose playlists were reclaimed underneath them.
    fn scan_pending<C: Clocks>(
        &self,
        env: &Env<'_, C>,
        camera: &CameraRecord,
    ) -> Result<Option<(String, MotionRecord)>, Error> {
        let mut claimed = None;
        let mut invalid: Vec<(String, MotionRecord, PlaylistIssue)> = Vec::new();
        {
            let l = env.db.lock();
            l.list_motion_from(&camera.last_processed_movement_key, &mut |key, record| {
                if record.camera_key != self.camera_key
                    || record.processing_state != ProcessingState::Pending
                {
                    return Ok(true);
                }
                let Some(playlist) = record.playlist_path.clone() else {
                    return Ok(true);
                };
                match validate_playlist(&playlist) {
                    Ok(()) => {
                        claimed = Some((key.to_owned(), record));
                        Ok(false)
                    }
                    Err(issue) => {
                        invalid.push((key.to_owned(), record, issue));
                        Ok(true)
                    }
                }
            })?;
        }
        let now_ms = env.clocks.realtime_ms();
        for (key, mut record, issue) in invalid {
            info!(
                "{}: failing {} before processing: {}",
                self.camera_key,
                key,
                issue.reason()
            );
            record.processing_state = ProcessingState::Failed;
            record.processing_error = Some(issue.reason().to_owned());
            record.processing_completed_at = Some(now_ms);
            record.detection_status = Some(DetectionStatus::Failed);
            env.db.lock().put_motion(&key, &record)?;
            env.push.broadcast(PushEvent::MovementUpdate, &key, &record);
        }
        Ok(claimed)
    }

    /// Claims the per-camera slot and spawns the extractor.
    fn claim<C: Clocks>(
        &mut self,
        env: &Env<'_, C>,
        camera: &CameraRecord,
        key: String,
        mut record: MotionRecord,
    ) {
        let playlist = record
            .playlist_path
            .clone()
            .expect("claimed records have playlists");
        let frames_dir = playlist
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| camera.disk.join(&camera.folder));

        // Claim before spawning so nothing re-claims this key meanwhile.
        let now = env.clocks.monotonic();
        self.slot = Some(ProcessingSlot {
            movement_key: key.clone(),
            started_at: now,
            handle: None,
            frames_dir: frames_dir.clone(),
            killed_at: None,
            ffmpeg_exited: false,
            ffmpeg_exited_at: None,
            exit: None,
            highest_frame: 0,
            frames_sent: 0,
            frames_received: 0,
            ml_total_ms: 0,
            ml_max_ms: 0,
            stderr_error: None,
            first_stderr: None,
            finalized: false,
        });

        record.processing_state = ProcessingState::Processing;
        record.processing_started_at = Some(env.clocks.realtime_ms());
        record.detection_status = Some(DetectionStatus::Extracting);
        if let Err(e) = env.db.lock().put_motion(&key, &record) {
            warn!("{}: claiming {key} failed: {}", self.camera_key, e.chain());
            self.slot = None;
            return;
        }
        env.push.broadcast(PushEvent::MovementUpdate, &key, &record);

        let args = extractor_args(
            &playlist,
            &frames_dir,
            &key,
            camera.max_single_movement_secs,
        );
        let name = format!("extract-{}", self.camera_key);
        let mut opts = process::Spawn::new(&name, "ffmpeg", args);
        let events = env.events.clone();
        let camera_key = self.camera_key.clone();
        opts.on_stdout = Some(Box::new(move |line| {
            if let Some(frame) = parse_progress_frame(line) {
                let _ = events.send(Event::ExtractorFrame {
                    camera_key: camera_key.clone(),
                    frame,
                });
            }
        }));
        let events = env.events.clone();
        let camera_key = self.camera_key.clone();
        opts.on_stderr = Some(Box::new(move |line| {
            let _ = events.send(Event::ExtractorStderr {
                camera_key: camera_key.clone(),
                line: line.to_owned(),
            });
        }));
        let events = env.events.clone();
        let camera_key = self.camera_key.clone();
        opts.on_close = Some(Box::new(move |exit| {
            let _ = events.send(Event::ExtractorExit { camera_key, exit });
        }));

        match process::spawn(opts) {
            Ok(handle) => {
                info!(
                    "{}: extracting frames for {key} (pid {})",
                    self.camera_key,
                    handle.pid()
                );
                if let Some(slot) = &mut self.slot {
                    slot.handle = Some(handle);
                }
            }
            Err(e) => {
                warn!(
                    "{}: spawning extractor for {key} failed: {}",
                    self.camera_key,
                    e.chain()
                );
                let stats = (0, 0, 0, 0);
                self.write_terminal(
                    env,
                    &key,
                    ProcessingState::Failed,
                    Some(format!("Failed to spawn extractor: {e}")),
                    0,
                    stats,
                );
                self.release_and_advance(env, &key);
            }
        }
    }

    /// New frame numbers from the extractor's progress stream; returns the
    /// paths of frames not yet handed to the detector.
    pub fn frames_produced(&mut self, frame: u64) -> Vec<PathBuf> {
        let Some(slot) = &mut self.slot else {
            return Vec::new();
        };
        if frame <= slot.highest_frame {
            return Vec::new();
        }
        let new = (slot.highest_frame + 1..=frame)
            .map(|n| {
                slot.frames_dir
                    .join(hls::frame_file_name(&slot.movement_key, n))
            })
            .collect();
        slot.highest_frame = frame;
        new
    }

    pub fn note_frame_sent(&mut self) {
        if let Some(slot) = &mut self.slot {
            slot.frames_sent += 1;
        }
    }

    pub fn note_frame_received(&mut self, processing_ms: Option<u64>) {
        if let Some(slot) = &mut self.slot {
            slot.frames_received += 1;
            if let Some(ms) = processing_ms {
                slot.ml_total_ms += ms;
                slot.ml_max_ms = slot.ml_max_ms.max(ms);
            }
        }
    }

    pub fn stderr_line(&mut self, line: &str) {
        let Some(slot) = &mut self.slot else { return };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if slot.first_stderr.is_none() {
            slot.first_stderr = Some(trimmed.to_owned());
        }
        if slot.stderr_error.is_none() && trimmed.to_ascii_lowercase().contains("error") {
            slot.stderr_error = Some(trimmed.to_owned());
        }
    }

    pub fn extractor_exited<C: Clocks>(&mut self, env: &Env<'_, C>, exit: ExitInfo) {
        if let Some(slot) = &mut self.slot {
            slot.ffmpeg_exited = true;
            slot.ffmpeg_exited_at = Some(env.clocks.monotonic());
            slot.exit = Some(exit);
            debug!(
                "{}: extractor for {} exited (code {:?}, signal {:?}); \
                 {} frames sent, {} answered",
                self.camera_key,
                slot.movement_key,
                exit.code,
                exit.signal,
                slot.frames_sent,
                slot.frames_received
            );
        }
    }

    /// Fires the finalize once the extractor has exited and either every
    /// frame has been answered or the ML-result timeout has passed. Swept
    /// every tick so quiet cameras still progress.
    pub fn check_and_finalize<C: Clocks>(&mut self, env: &Env<'_, C>) {
        let Some(slot) = &self.slot else { return };
        if !slot.ffmpeg_exited {
            return;
        }
        let now = env.clocks.monotonic();
        let all_answered = slot.frames_sent == slot.frames_received;
        let timed_out = slot
            .ffmpeg_exited_at
            .is_some_and(|at| now.saturating_sub(at) > ML_RESULT_TIMEOUT);
        if !all_answered && !timed_out {
            return;
        }
        if !all_answered {
            warn!(
                "{}: finalizing {} with {}/{} detector answers after timeout",
                self.camera_key, slot.movement_key, slot.frames_received, slot.frames_sent
            );
        }

        let slot = self.slot.take().expect("slot checked above");
        let key = slot.movement_key.clone();
        if !slot.finalized {
            let total = slot.highest_frame;
            let clean = slot.exit.is_some_and(|e| e.clean());
            let (state, error) = if total > 0 && clean {
                (ProcessingState::Completed, None)
            } else {
                (ProcessingState::Failed, Some(failure_reason(&slot)))
            };
            let stats = (
                slot.frames_sent,
                slot.frames_received,
                slot.ml_total_ms,
                slot.ml_max_ms,
            );
            self.write_terminal(env, &key, state, error, total, stats);
        }
        self.release_and_advance(env, &key);
    }

    /// Writes the single final record, skipping records some other path
    /// already finalized.
    fn write_terminal<C: Clocks>(
        &self,
        env: &Env<'_, C>,
        key: &str,
        state: ProcessingState,
        error: Option<String>,
        total_frames: u64,
        (sent, received, ml_total_ms, ml_max_ms): (u32, u32, u64, u64),
    ) {
        let result = (|| -> Result<(), Error> {
            let l = env.db.lock();
            let Some(mut record) = l.get_motion(key)? else {
                warn!("{}: record {key} vanished before finalize", self.camera_key);
                return Ok(());
            };
            if record.processing_state.is_terminal() {
                debug!("{}: {key} already finalized", self.camera_key);
                return Ok(());
            }
            record.processing_state = state;
            record.processing_completed_at = Some(env.clocks.realtime_ms());
            record.processing_error = error;
            record.detection_status = Some(match state {
                ProcessingState::Completed => DetectionStatus::Complete,
                _ => DetectionStatus::Failed,
            });
            record.frames_sent_to_ml = sent;
            record.frames_received_from_ml = received;
            record.ml_total_processing_time_ms = ml_total_ms;
            record.ml_max_processing_time_ms = ml_max_ms;
            l.put_motion(key, &record)?;
            drop(l);
            info!(
                "{}: {key} {state:?} with {total_frames} frames ({sent} sent, {received} answered)",
                self.camera_key
            );
            env.push.broadcast(PushEvent::MovementUpdate, key, &record);
            Ok(())
        })();
        if let Err(e) = result {
            // The record may stay `processing`; the claim scan will retry it
            // idempotently after the pointer check.
            warn!("{}: finalize of {key} failed: {}", self.camera_key, e.chain());
        }
    }

    /// Releases the slot and advances the camera's processing pointer.
    fn release_and_advance<C: Clocks>(&mut self, env: &Env<'_, C>, key: &str) {
        self.slot = None;
        let result = (|| -> Result<(), Error> {
            let l = env.db.lock();
            let Some(mut camera) = l.get_camera(&self.camera_key)? else {
                return Ok(());
            };
            if camera.last_processed_movement_key.as_str() < key {
                camera.last_processed_movement_key = key.to_owned();
                l.put_camera(&self.camera_key, &camera)?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            warn!(
                "{}: pointer advance to {key} failed: {}",
                self.camera_key,
                e.chain()
            );
        }
    }
}

fn failure_reason(slot: &ProcessingSlot) -> String {
    if let Some(e) = &slot.stderr_error {
        return e.clone();
    }
    if slot.highest_frame == 0 {
        if let Some(first) = &slot.first_stderr {
            return first.clone();
        }
        return "No frames extracted".to_owned();
    }
    match slot.exit {
        Some(ExitInfo {
            code: Some(code), ..
        }) => format!("ffmpeg exited with code {code}"),
        Some(ExitInfo {
            signal: Some(signal),
            ..
        }) => format!("ffmpeg killed by signal {signal}"),
        _ => "ffmpeg exited abnormally".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::NullSink;
    use base::clock::SimulatedClocks;
    use db::testutil::{TestDb, TEST_CAMERA_KEY};
    use tokio::sync::mpsc;

    fn clocks() -> SimulatedClocks {
        SimulatedClocks::new("2026-03-01T00:00:00Z".parse().unwrap())
    }

    struct Fixture {
        t: TestDb,
        clocks: SimulatedClocks,
        events: UnboundedSender<Event>,
        _events_rx: mpsc::UnboundedReceiver<Event>,
    }

    impl Fixture {
        fn new() -> Self {
            let (events, rx) = mpsc::unbounded_channel();
            Fixture {
                t: TestDb::new(),
                clocks: clocks(),
                events,
                _events_rx: rx,
            }
        }

        fn env(&self) -> Env<'_, SimulatedClocks> {
            Env {
                clocks: &self.clocks,
                db: &self.t.db,
                push: &NullSink,
                events: &self.events,
            }
        }

        fn camera(&self) -> CameraRecord {
            self.t.db.lock().get_camera(TEST_CAMERA_KEY).unwrap().unwrap()
        }

        /// Inserts a finalized-pending episode whose playlist references one
        /// real segment file.
        fn insert_episode(&self, start_ms: i64, seg: u64) -> String {
            let key = self.t.insert_motion(start_ms, seg);
            let seg_file = self.t.stream_dir().join(format!("stream{seg}.ts"));
            std::fs::write(&seg_file, b"ts").unwrap();
            let playlist = self.t.stream_dir().join(hls::event_playlist_name(&key));
            hls::write_event_playlist(&playlist, self.t.tmpdir.path(), "cam", 2, seg, seg)
                .unwrap();
            let l = self.t.db.lock();
            let mut record = l.get_motion(&key).unwrap().unwrap();
            record.playlist_path = Some(playlist);
            record.playlist_last_segment = Some(seg);
            record.detection_ended_at = Some(start_ms + 4_000);
            l.put_motion(&key, &record).unwrap();
            key
        }
    }

    fn bare_slot(key: &str, frames_dir: PathBuf) -> ProcessingSlot {
        ProcessingSlot {
            movement_key: key.to_owned(),
            started_at: Duration::ZERO,
            handle: None,
            frames_dir,
            killed_at: None,
            ffmpeg_exited: false,
            ffmpeg_exited_at: None,
            exit: None,
            highest_frame: 0,
            frames_sent: 0,
            frames_received: 0,
            ml_total_ms: 0,
            ml_max_ms: 0,
            stderr_error: None,
            first_stderr: None,
            finalized: false,
        }
    }

    #[test]
    fn extractor_args_shape() {
        let args = extractor_args(
            Path::new("/frames/mov123.m3u8"),
            Path::new("/frames"),
            "123",
            600,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f hls -live_start_index 0"), "{joined}");
        assert!(joined.contains("-rw_timeout 630000000"), "{joined}");
        assert!(joined.contains("-t 660"), "{joined}");
        assert!(joined.contains("-progress pipe:1"), "{joined}");
        assert!(joined.ends_with("/frames/mov123_%04d.jpg"), "{joined}");
    }

    #[test]
    fn progress_parsing() {
        assert_eq!(parse_progress_frame("frame=12"), Some(12));
        assert_eq!(parse_progress_frame("frame=  7 "), Some(7));
        assert_eq!(parse_progress_frame("fps=2.0"), None);
        assert_eq!(parse_progress_frame("progress=end"), None);
    }

    #[test]
    fn slot_cap_respects_long_episodes() {
        let mut camera = CameraRecord::default();
        camera.max_single_movement_secs = 20;
        assert_eq!(slot_cap(&camera), Duration::from_secs(90));
        camera.max_single_movement_secs = 600;
        assert_eq!(slot_cap(&camera), Duration::from_secs(660));
    }

    #[test]
    fn scan_fails_gutted_playlists_and_claims_next() {
        let f = Fixture::new();
        // First episode's segment goes missing (disk cleanup).
        let key1 = f.insert_episode(1_000, 10);
        std::fs::remove_file(f.t.stream_dir().join("stream10.ts")).unwrap();
        // Second episode is intact.
        let key2 = f.insert_episode(2_000, 20);

        let p = Processor::new(TEST_CAMERA_KEY.to_owned());
        let env = f.env();
        let claimed = p.scan_pending(&env, &f.camera()).unwrap();
        assert_eq!(claimed.map(|(k, _)| k), Some(key2));

        let r1 = f.t.db.lock().get_motion(&key1).unwrap().unwrap();
        assert_eq!(r1.processing_state, ProcessingState::Failed);
        assert_eq!(
            r1.processing_error.as_deref(),
            Some("Segment files deleted by disk cleanup")
        );
    }

    #[test]
    fn scan_skips_other_cameras_and_records_below_pointer() {
        let f = Fixture::new();
        let key1 = f.insert_episode(1_000, 10);
        {
            let l = f.t.db.lock();
            let mut other = l.get_motion(&key1).unwrap().unwrap();
            other.camera_key = "C999".to_owned();
            l.put_motion(&db::motion_key(500), &other).unwrap();
        }
        let mut camera = f.camera();
        camera.last_processed_movement_key = key1.clone();

        let p = Processor::new(TEST_CAMERA_KEY.to_owned());
        let env = f.env();
        assert!(p.scan_pending(&env, &camera).unwrap().is_none());
    }

    #[test]
    fn finalize_completed_advances_pointer() {
        let f = Fixture::new();
        let key = f.insert_episode(1_000, 10);
        let mut p = Processor::new(TEST_CAMERA_KEY.to_owned());
        let mut slot = bare_slot(&key, f.t.stream_dir());
        slot.ffmpeg_exited = true;
        slot.ffmpeg_exited_at = Some(Duration::ZERO);
        slot.exit = Some(ExitInfo {
            code: Some(0),
            signal: None,
        });
        slot.highest_frame = 6;
        slot.frames_sent = 6;
        slot.frames_received = 6;
        slot.ml_total_ms = 120;
        slot.ml_max_ms = 40;
        p.slot = Some(slot);

        let env = f.env();
        p.check_and_finalize(&env);
        assert!(!p.slot_held());
        let record = f.t.db.lock().get_motion(&key).unwrap().unwrap();
        assert_eq!(record.processing_state, ProcessingState::Completed);
        assert_eq!(record.detection_status, Some(DetectionStatus::Complete));
        assert_eq!(record.frames_sent_to_ml, 6);
        assert_eq!(record.ml_max_processing_time_ms, 40);
        assert_eq!(f.camera().last_processed_movement_key, key);
    }

    #[test]
    fn finalize_zero_frames_is_failure() {
        let f = Fixture::new();
        let key = f.insert_episode(1_000, 10);
        let mut p = Processor::new(TEST_CAMERA_KEY.to_owned());
        let mut slot = bare_slot(&key, f.t.stream_dir());
        slot.ffmpeg_exited = true;
        slot.ffmpeg_exited_at = Some(Duration::ZERO);
        slot.exit = Some(ExitInfo {
            code: Some(0),
            signal: None,
        });
        p.slot = Some(slot);

        let env = f.env();
        p.check_and_finalize(&env);
        let record = f.t.db.lock().get_motion(&key).unwrap().unwrap();
        assert_eq!(record.processing_state, ProcessingState::Failed);
        assert_eq!(record.processing_error.as_deref(), Some("No frames extracted"));
    }

    #[test]
    fn ml_timeout_finalizes_with_unequal_counters() {
        let f = Fixture::new();
        let key = f.insert_episode(1_000, 10);
        let mut p = Processor::new(TEST_CAMERA_KEY.to_owned());
        let mut slot = bare_slot(&key, f.t.stream_dir());
        slot.ffmpeg_exited = true;
        slot.ffmpeg_exited_at = Some(f.clocks.monotonic());
        slot.exit = Some(ExitInfo {
            code: Some(0),
            signal: None,
        });
        slot.highest_frame = 4;
        slot.frames_sent = 4;
        slot.frames_received = 2;
        p.slot = Some(slot);

        let env = f.env();
        p.check_and_finalize(&env);
        assert!(p.slot_held(), "must wait for the ML timeout");

        f.clocks.advance(Duration::from_secs(31));
        let env = f.env();
        p.check_and_finalize(&env);
        assert!(!p.slot_held());
        let record = f.t.db.lock().get_motion(&key).unwrap().unwrap();
        assert_eq!(record.processing_state, ProcessingState::Completed);
        assert_eq!(record.frames_sent_to_ml, 4);
        assert_eq!(record.frames_received_from_ml, 2);
    }

    #[tokio::test]
    async fn wall_cap_kills_and_orphan_releases() {
        let f = Fixture::new();
        let key = f.insert_episode(1_000, 10);
        let mut p = Processor::new(TEST_CAMERA_KEY.to_owned());
        let handle = process::spawn(process::Spawn::new(
            "t",
            "sh",
            vec!["-c".into(), "sleep 30".into()],
        ))
        .unwrap();
        let mut slot = bare_slot(&key, f.t.stream_dir());
        slot.handle = Some(handle.clone());
        p.slot = Some(slot);
        {
            let l = f.t.db.lock();
            let mut r = l.get_motion(&key).unwrap().unwrap();
            r.processing_state = ProcessingState::Processing;
            l.put_motion(&key, &r).unwrap();
        }

        let camera = f.camera();
        f.clocks.advance(slot_cap(&camera) + Duration::from_secs(1));
        {
            let env = f.env();
            p.tick(&env, &camera);
        }
        let slot = p.slot.as_ref().unwrap();
        assert!(slot.killed_at.is_some());
        assert!(slot.finalized);
        let record = f.t.db.lock().get_motion(&key).unwrap().unwrap();
        assert_eq!(record.processing_state, ProcessingState::Failed);
        assert!(record
            .processing_error
            .as_deref()
            .unwrap()
            .contains("timed out"));

        // The kill ignored (simulated by time passing without an exit event)
        // eventually abandons the pid.
        f.clocks.advance(ORPHAN_AFTER + Duration::from_secs(1));
        {
            let env = f.env();
            p.tick(&env, &camera);
        }
        assert!(!p.slot_held());
        handle.kill(nix::sys::signal::Signal::SIGKILL);
    }

    #[test]
    fn frames_produced_are_monotonic() {
        let f = Fixture::new();
        let key = f.insert_episode(1_000, 10);
        let mut p = Processor::new(TEST_CAMERA_KEY.to_owned());
        p.slot = Some(bare_slot(&key, PathBuf::from("/frames")));

        let new = p.frames_produced(2);
        assert_eq!(
            new,
            vec![
                PathBuf::from(format!("/frames/mov{key}_0001.jpg")),
                PathBuf::from(format!("/frames/mov{key}_0002.jpg")),
            ]
        );
        assert!(p.frames_produced(2).is_empty());
        assert_eq!(p.frames_produced(3).len(), 1);
    }
}
