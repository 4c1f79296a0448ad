// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-camera motion detection: polls the camera's motion API and maintains
//! motion episodes and their bounded playlists.
//!
//! A poll runs as a background task (the HTTP round-trip must not stall the
//! tick); its result comes back through the supervisor's event channel and
//! the episode state machine runs there, on the actor. The `in_flight` flag
//! refuses re-entry while a poll is outstanding, and a failure arms a
//! backoff window before the next attempt.

use crate::push::{PushEvent, PushSink};
use crate::supervisor::Event;
use crate::{hls, streamer};
use async_trait::async_trait;
use base::clock::Clocks;
use base::strutil::redact_secrets;
use base::{bail_t, format_err_t, Error, ErrorKind};
use db::{motion_key, CameraRecord, Database, MotionRecord, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// End-to-end budget for one motion API poll.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff after a transport-level poll failure.
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(10);

/// Backoff after the camera API returned an `error` object.
const API_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MotionState {
    Movement,
    NoMovement,
}

/// The camera's motion API, injected so tests can script it.
#[async_trait]
pub trait MotionProbe: Send + Sync {
    async fn poll(&self, camera: &CameraRecord) -> Result<MotionState, Error>;
}

/// Polls the Reolink-style `GetMdState` endpoint, or the camera's explicit
/// `motion_url` when set.
pub struct ReolinkProbe {
    client: reqwest::Client,
}

impl ReolinkProbe {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .build()
            .map_err(|e| Error::wrap(ErrorKind::Internal, e))?;
        Ok(ReolinkProbe { client })
    }

    fn url_for(camera: &CameraRecord) -> Result<String, Error> {
        if let Some(url) = &camera.motion_url {
            if !url.is_empty() {
                return Ok(url.clone());
            }
        }
        let (Some(ip), Some(passwd)) = (&camera.ip, &camera.passwd) else {
            bail_t!(
                FailedPrecondition,
                "camera {:?} has neither a motion URL nor ip/passwd",
                camera.name
            );
        };
        Ok(format!(
            "http://{ip}/api.cgi?cmd=GetMdState&user=admin&password={passwd}"
        ))
    }
}

/// Reads `value.state` out of the camera's response envelope: a JSON array
/// whose first element is `{"value":{"state":0|1}}` or `{"error":{…}}`; a
/// bare object is tolerated.
pub fn parse_motion_envelope(body: &serde_json::Value) -> Result<MotionState, Error> {
    let first = match body {
        serde_json::Value::Array(items) => items
            .first()
            .ok_or_else(|| format_err_t!(Unavailable, "motion API returned an empty array"))?,
        other => other,
    };
    if let Some(error) = first.get("error") {
        // The camera answered but refused; this arms the longer backoff.
        bail_t!(FailedPrecondition, "motion API returned error: {error}");
    }
    match first.pointer("/value/state").and_then(|v| v.as_i64()) {
        Some(1) => Ok(MotionState::Movement),
        Some(_) => Ok(MotionState::NoMovement),
        None => Err(format_err_t!(
            Unavailable,
            "motion API response has no value.state"
        )),
    }
}

#[async_trait]
impl MotionProbe for ReolinkProbe {
    async fn poll(&self, camera: &CameraRecord) -> Result<MotionState, Error> {
        let url = Self::url_for(camera)?;
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Unavailable, e))?;
        let status = resp.status();
        if !status.is_success() {
            bail_t!(Unavailable, "motion API returned HTTP {status}");
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Unavailable, e))?;
        parse_motion_envelope(&body)
    }
}

/// In-memory motion status for one camera. Reset on supervisor start; the
/// open episode is re-derived from the store on first use.
#[derive(Default)]
pub struct MotionStatus {
    /// A poll task is outstanding; refuse re-entry.
    pub in_flight: bool,
    pub fail: bool,
    /// Monotonic instant before which polling stays suppressed.
    pub check_after: Option<Duration>,
    /// Monotonic instant the last poll started.
    pub last_poll: Option<Duration>,
    pub current_movement_key: Option<String>,
    pub last_error: Option<String>,
}

pub struct MotionDetector {
    camera_key: String,
    pub status: MotionStatus,
    /// Whether `current_movement_key` has been re-derived from the store.
    derived: bool,
}

impl MotionDetector {
    pub fn new(camera_key: String) -> Self {
        MotionDetector {
            camera_key,
            status: MotionStatus::default(),
            derived: false,
        }
    }

    /// Starts a poll task when all entry criteria hold: movement
    /// enabled, stream alive and confirmed, startup delay elapsed, poll
    /// frequency elapsed, no outstanding poll, not in backoff.
    pub fn maybe_start_poll(
        &mut self,
        now: Duration,
        camera: &CameraRecord,
        stream: &streamer::Streamer,
        probe: &Arc<dyn MotionProbe>,
        events: &UnboundedSender<Event>,
    ) {
        if !camera.enable_movement || !stream.child_alive() || !stream.is_confirmed() {
            return;
        }
        let Some(started_at) = stream.started_at() else {
            return;
        };
        let startup_delay = Duration::from_secs(camera.movement_startup_delay_secs);
        if now.saturating_sub(started_at) < startup_delay {
            return;
        }
        if self.status.in_flight {
            return;
        }
        if self.status.fail {
            match self.status.check_after {
                Some(after) if now < after => return,
                _ => {
                    self.status.fail = false;
                    self.status.check_after = None;
                    if let Some(e) = self.status.last_error.take() {
                        debug!("{}: retrying motion poll after: {e}", self.camera_key);
                    }
                }
            }
        }
        if let Some(last) = self.status.last_poll {
            if now.saturating_sub(last) < Duration::from_millis(camera.poll_frequency_ms) {
                return;
            }
        }

        self.status.in_flight = true;
        self.status.last_poll = Some(now);
        let camera = camera.clone();
        let camera_key = self.camera_key.clone();
        let probe = probe.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let result = probe.poll(&camera).await;
            let _ = events.send(Event::MotionPolled { camera_key, result });
        });
    }

    /// Runs the episode state machine on a poll result. Always clears the
    /// `in_flight` flag.
    pub fn handle_poll_result<C: Clocks>(
        &mut self,
        clocks: &C,
        db: &Database,
        settings: &Settings,
        camera: &CameraRecord,
        push: &dyn PushSink,
        result: Result<MotionState, Error>,
    ) {
        let outcome =
            result.and_then(|state| self.apply(clocks, db, settings, camera, push, state));
        if let Err(e) = outcome {
            self.record_failure(clocks.monotonic(), &e);
        }
        self.status.in_flight = false;
    }

    fn apply<C: Clocks>(
        &mut self,
        clocks: &C,
        db: &Database,
        settings: &Settings,
        camera: &CameraRecord,
        push: &dyn PushSink,
        state: MotionState,
    ) -> Result<(), Error> {
        if !self.derived {
            self.status.current_movement_key = db
                .lock()
                .open_motion_for(&self.camera_key)?
                .map(|(key, _)| key);
            self.derived = true;
        }
        match (state, self.status.current_movement_key.clone()) {
            (MotionState::Movement, None) => self.open_episode(clocks, db, settings, camera, push),
            (MotionState::Movement, Some(key)) => {
                self.extend_episode(clocks, db, camera, push, &key)
            }
            (MotionState::NoMovement, Some(key)) => {
                self.quiet_poll(clocks, db, camera, push, &key)
            }
            (MotionState::NoMovement, None) => {
                debug!("{}: no movement", self.camera_key);
                Ok(())
            }
        }
    }

    /// Where event playlists and extracted frames go for this camera.
    pub fn frames_dir(settings: &Settings, camera: &CameraRecord) -> PathBuf {
        match &settings.detection_frames_path {
            Some(p) if !p.as_str().is_empty() => settings.base_dir.join(p),
            _ => camera.disk.join(&camera.folder),
        }
    }

    fn read_live_manifest(camera: &CameraRecord) -> Result<hls::LiveManifest, Error> {
        let path = camera.disk.join(&camera.folder).join(hls::LIVE_MANIFEST);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::from(e).context(format!("reading {}", path.display())))?;
        Ok(hls::parse_live_manifest(&text))
    }

    fn open_episode<C: Clocks>(
        &mut self,
        clocks: &C,
        db: &Database,
        settings: &Settings,
        camera: &CameraRecord,
        push: &dyn PushSink,
    ) -> Result<(), Error> {
        let manifest = Self::read_live_manifest(camera)?;
        let last = manifest
            .last_segment()
            .ok_or_else(|| format_err_t!(FailedPrecondition, "live manifest has no segments"))?;
        let target_secs = manifest.target_duration_secs.max(1);

        // Cover the segments that were live while this poll interval elapsed.
        let look_back = camera
            .poll_frequency_ms
            .div_ceil(u64::from(target_secs) * 1000);
        let start_segment = last.saturating_sub(look_back);

        let frames_dir = Self::frames_dir(settings, camera);
        std::fs::create_dir_all(&frames_dir)
            .map_err(|e| Error::from(e).context(format!("creating {}", frames_dir.display())))?;

        let now_ms = clocks.realtime_ms();
        let key = motion_key(now_ms);
        let playlist_path = frames_dir.join(hls::event_playlist_name(&key));
        hls::write_event_playlist(
            &playlist_path,
            &camera.disk,
            &camera.folder,
            target_secs,
            start_segment,
            last,
        )?;

        let mut record = MotionRecord::new(self.camera_key.clone(), now_ms, start_segment);
        record.target_duration_secs = target_secs;
        record.playlist_path = Some(playlist_path);
        record.playlist_last_segment = Some(last);
        record.detection_started_at = Some(now_ms);
        db.lock().put_motion(&key, &record)?;

        info!(
            "{}: movement started, episode {key} covering segments {start_segment}..={last}",
            self.camera_key
        );
        self.status.current_movement_key = Some(key.clone());
        push.broadcast(PushEvent::MovementNew, &key, &record);
        Ok(())
    }

    fn extend_episode<C: Clocks>(
        &mut self,
        clocks: &C,
        db: &Database,
        camera: &CameraRecord,
        push: &dyn PushSink,
        key: &str,
    ) -> Result<(), Error> {
        let Some(mut record) = db.lock().get_motion(key)? else {
            // Reclaimed by disk cleanup while open.
            warn!("{}: open episode {key} vanished from the store", self.camera_key);
            self.status.current_movement_key = None;
            return Ok(());
        };

        let latest = self.append_new_segments(camera, &mut record)?;
        let elapsed = self.elapsed_secs(clocks, &record);
        if elapsed > camera.max_single_movement_secs {
            return self.finalize_episode(clocks, db, push, key, record, elapsed);
        }

        record.seconds = elapsed;
        record.poll_count += 1;
        record.consecutive_polls_without_movement = 0;
        record.playlist_last_segment = latest.or(record.playlist_last_segment);
        db.lock().put_motion(key, &record)?;
        push.broadcast(PushEvent::MovementUpdate, key, &record);
        Ok(())
    }

    fn quiet_poll<C: Clocks>(
        &mut self,
        clocks: &C,
        db: &Database,
        camera: &CameraRecord,
        push: &dyn PushSink,
        key: &str,
    ) -> Result<(), Error> {
        let Some(mut record) = db.lock().get_motion(key)? else {
            warn!("{}: open episode {key} vanished from the store", self.camera_key);
            self.status.current_movement_key = None;
            return Ok(());
        };

        record.consecutive_polls_without_movement += 1;
        let elapsed = self.elapsed_secs(clocks, &record);
        let ends = camera.polls_without_movement == 0
            || record.consecutive_polls_without_movement >= camera.polls_without_movement
            || elapsed > camera.max_single_movement_secs;
        if ends {
            return self.finalize_episode(clocks, db, push, key, record, elapsed);
        }

        record.seconds = elapsed;
        db.lock().put_motion(key, &record)?;
        push.broadcast(PushEvent::MovementUpdate, key, &record);
        Ok(())
    }

    /// Ends the episode on the detection side. The record stays
    /// `processing_state=pending`; the processing supervisor picks it up.
    fn finalize_episode<C: Clocks>(
        &mut self,
        clocks: &C,
        db: &Database,
        push: &dyn PushSink,
        key: &str,
        mut record: MotionRecord,
        elapsed: u64,
    ) -> Result<(), Error> {
        if let Some(playlist) = &record.playlist_path {
            hls::finalize_event_playlist(playlist)?;
        }
        record.seconds = elapsed;
        record.detection_ended_at = Some(clocks.realtime_ms());
        db.lock().put_motion(key, &record)?;
        self.status.current_movement_key = None;
        info!(
            "{}: movement complete, episode {key} after {elapsed}s and {} polls",
            self.camera_key, record.poll_count
        );
        push.broadcast(PushEvent::MovementComplete, key, &record);
        Ok(())
    }

    /// Appends any live segments newer than the playlist's last to the
    /// episode playlist; returns the new last segment, if any appeared.
    fn append_new_segments(
        &self,
        camera: &CameraRecord,
        record: &mut MotionRecord,
    ) -> Result<Option<u64>, Error> {
        let Some(playlist) = record.playlist_path.clone() else {
            return Ok(None);
        };
        let manifest = Self::read_live_manifest(camera)?;
        let after = record
            .playlist_last_segment
            .unwrap_or(record.start_segment);
        let new: Vec<u64> = manifest
            .segments
            .iter()
            .copied()
            .filter(|&i| i > after)
            .collect();
        let latest = new.last().copied();
        hls::append_event_segments(
            &playlist,
            &camera.disk,
            &camera.folder,
            record.target_duration_secs,
            new,
        )?;
        Ok(latest)
    }

    fn elapsed_secs<C: Clocks>(&self, clocks: &C, record: &MotionRecord) -> u64 {
        ((clocks.realtime_ms() - record.start_ms) / 1000).max(0) as u64
    }

    fn record_failure(&mut self, now: Duration, e: &Error) {
        let redacted = redact_secrets(&e.chain().to_string());
        warn!("{}: motion poll failed: {redacted}", self.camera_key);
        let backoff = if e.kind() == ErrorKind::FailedPrecondition {
            API_ERROR_BACKOFF
        } else {
            TRANSIENT_BACKOFF
        };
        self.status.fail = true;
        self.status.last_error = Some(redacted);
        self.status.check_after = Some(now + backoff);
        debug!(
            "{}: motion polling suppressed for {backoff:?}",
            self.camera_key
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::NullSink;
    use base::clock::SimulatedClocks;
    use db::testutil::{TestDb, TEST_CAMERA_KEY};
    use db::ProcessingState;
    use serde_json::json;

    fn clocks() -> SimulatedClocks {
        SimulatedClocks::new("2026-03-01T00:00:00Z".parse().unwrap())
    }

    fn write_live_manifest(t: &TestDb, first: u64, last: u64) {
        let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:2\n");
        for i in first..=last {
            text.push_str(&format!("#EXTINF:2.000000,\nstream{i}.ts\n"));
        }
        std::fs::write(t.stream_dir().join("stream.m3u8"), text).unwrap();
    }

    fn camera(t: &TestDb) -> CameraRecord {
        t.db.lock().get_camera(TEST_CAMERA_KEY).unwrap().unwrap()
    }

    fn apply(
        d: &mut MotionDetector,
        c: &SimulatedClocks,
        t: &TestDb,
        cam: &CameraRecord,
        state: MotionState,
    ) {
        let settings = t.db.lock().get_settings().unwrap();
        d.handle_poll_result(c, &t.db, &settings, cam, &NullSink, Ok(state));
    }

    #[test]
    fn envelope_parsing() {
        assert_eq!(
            parse_motion_envelope(&json!([{"value": {"state": 1}}])).unwrap(),
            MotionState::Movement
        );
        assert_eq!(
            parse_motion_envelope(&json!([{"value": {"state": 0}}])).unwrap(),
            MotionState::NoMovement
        );
        let e = parse_motion_envelope(&json!([{"error": {"detail": "no auth"}}])).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
        let e = parse_motion_envelope(&json!({"unexpected": true})).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn movement_opens_episode_with_lookback() {
        let t = TestDb::new();
        let c = clocks();
        write_live_manifest(&t, 100, 104);
        let cam = camera(&t);
        let mut d = MotionDetector::new(TEST_CAMERA_KEY.to_owned());

        apply(&mut d, &c, &t, &cam, MotionState::Movement);
        let key = d.status.current_movement_key.clone().expect("episode open");
        let record = t.db.lock().get_motion(&key).unwrap().unwrap();
        // poll_frequency_ms=1000, target=2s ⇒ look back ceil(1000/2000)=1.
        assert_eq!(record.start_segment, 103);
        assert_eq!(record.playlist_last_segment, Some(104));
        assert_eq!(record.processing_state, ProcessingState::Pending);
        assert!(record.detection_started_at.is_some());
        assert!(record.is_open());
        let playlist = record.playlist_path.clone().unwrap();
        let text = std::fs::read_to_string(&playlist).unwrap();
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:103"), "{text}");
        assert!(!text.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn at_most_one_open_episode() {
        let t = TestDb::new();
        let c = clocks();
        write_live_manifest(&t, 100, 104);
        let cam = camera(&t);
        let mut d = MotionDetector::new(TEST_CAMERA_KEY.to_owned());

        apply(&mut d, &c, &t, &cam, MotionState::Movement);
        c.advance(Duration::from_secs(2));
        write_live_manifest(&t, 102, 106);
        apply(&mut d, &c, &t, &cam, MotionState::Movement);

        let mut open = 0;
        t.db.lock()
            .list_motion_from("", &mut |_, m| {
                if m.is_open() {
                    open += 1;
                }
                Ok(true)
            })
            .unwrap();
        assert_eq!(open, 1);
    }

    #[test]
    fn extend_appends_segments_and_updates_counters() {
        let t = TestDb::new();
        let c = clocks();
        write_live_manifest(&t, 100, 104);
        let cam = camera(&t);
        let mut d = MotionDetector::new(TEST_CAMERA_KEY.to_owned());

        apply(&mut d, &c, &t, &cam, MotionState::Movement);
        let key = d.status.current_movement_key.clone().unwrap();

        c.advance(Duration::from_secs(3));
        write_live_manifest(&t, 102, 106);
        apply(&mut d, &c, &t, &cam, MotionState::Movement);

        let record = t.db.lock().get_motion(&key).unwrap().unwrap();
        assert_eq!(record.seconds, 3);
        assert_eq!(record.poll_count, 1);
        assert_eq!(record.playlist_last_segment, Some(106));
        let text = std::fs::read_to_string(record.playlist_path.unwrap()).unwrap();
        assert!(text.contains("stream106.ts"), "{text}");
        // Only the new segments were appended.
        assert_eq!(text.matches("stream104.ts").count(), 1);
    }

    #[test]
    fn quiet_polls_close_episode() {
        let t = TestDb::new();
        let c = clocks();
        write_live_manifest(&t, 100, 104);
        let mut cam = camera(&t);
        cam.polls_without_movement = 2;
        let mut d = MotionDetector::new(TEST_CAMERA_KEY.to_owned());

        apply(&mut d, &c, &t, &cam, MotionState::Movement);
        let key = d.status.current_movement_key.clone().unwrap();

        c.advance(Duration::from_secs(2));
        apply(&mut d, &c, &t, &cam, MotionState::NoMovement);
        assert!(d.status.current_movement_key.is_some(), "one quiet poll is not enough");

        c.advance(Duration::from_secs(2));
        apply(&mut d, &c, &t, &cam, MotionState::NoMovement);
        assert!(d.status.current_movement_key.is_none());

        let record = t.db.lock().get_motion(&key).unwrap().unwrap();
        assert!(!record.is_open());
        // Finalization is detection-side only; processing still pending.
        assert_eq!(record.processing_state, ProcessingState::Pending);
        let text = std::fs::read_to_string(record.playlist_path.unwrap()).unwrap();
        assert_eq!(text.matches("#EXT-X-ENDLIST").count(), 1);
    }

    #[test]
    fn long_episode_is_capped() {
        let t = TestDb::new();
        let c = clocks();
        write_live_manifest(&t, 100, 104);
        let mut cam = camera(&t);
        cam.max_single_movement_secs = 10;
        let mut d = MotionDetector::new(TEST_CAMERA_KEY.to_owned());

        apply(&mut d, &c, &t, &cam, MotionState::Movement);
        let key = d.status.current_movement_key.clone().unwrap();
        c.advance(Duration::from_secs(11));
        apply(&mut d, &c, &t, &cam, MotionState::Movement);

        assert!(d.status.current_movement_key.is_none());
        let record = t.db.lock().get_motion(&key).unwrap().unwrap();
        assert!(!record.is_open());
        assert_eq!(record.seconds, 11);
    }

    #[test]
    fn failures_arm_backoff_and_redact() {
        let t = TestDb::new();
        let c = clocks();
        let cam = camera(&t);
        let settings = t.db.lock().get_settings().unwrap();
        let mut d = MotionDetector::new(TEST_CAMERA_KEY.to_owned());

        let e = format_err_t!(Unavailable, "GET http://cam/?password=hunter2 timed out");
        d.handle_poll_result(&c, &t.db, &settings, &cam, &NullSink, Err(e));
        assert!(d.status.fail);
        assert!(!d.status.in_flight);
        assert_eq!(d.status.check_after, Some(TRANSIENT_BACKOFF));
        let err = d.status.last_error.clone().unwrap();
        assert!(!err.contains("hunter2"), "{err}");

        // API-returned error objects back off longer.
        let e = format_err_t!(FailedPrecondition, "motion API returned error");
        d.handle_poll_result(&c, &t.db, &settings, &cam, &NullSink, Err(e));
        assert_eq!(d.status.check_after, Some(API_ERROR_BACKOFF));
    }

    struct ScriptedProbe;

    #[async_trait]
    impl MotionProbe for ScriptedProbe {
        async fn poll(&self, _camera: &CameraRecord) -> Result<MotionState, Error> {
            Ok(MotionState::Movement)
        }
    }

    #[tokio::test]
    async fn poll_entry_criteria_and_task_wiring() {
        use std::sync::atomic::AtomicBool;

        let t = TestDb::new();
        write_live_manifest(&t, 100, 104);
        let mut cam = camera(&t);
        cam.movement_startup_delay_secs = 5;
        let c = clocks();
        let settings = t.db.lock().get_settings().unwrap();
        let (events, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let shutting_down = Arc::new(AtomicBool::new(false));
        let probe: Arc<dyn MotionProbe> = Arc::new(ScriptedProbe);
        let mut d = MotionDetector::new(TEST_CAMERA_KEY.to_owned());

        // No live stream: no poll.
        let mut stream = crate::streamer::Streamer::new(TEST_CAMERA_KEY.to_owned());
        d.maybe_start_poll(c.monotonic(), &cam, &stream, &probe, &events);
        assert!(!d.status.in_flight);

        let handle = crate::process::spawn(crate::process::Spawn::new(
            "t",
            "sh",
            vec!["-c".into(), "sleep 30".into()],
        ))
        .unwrap();
        stream.start_finished(&c, Some(handle.clone()));
        let senv = crate::streamer::Env {
            clocks: &c,
            settings: &settings,
            shutting_down: &shutting_down,
            events: &events,
        };
        assert_eq!(stream.confirm(&senv, &cam), crate::streamer::Confirm::Healthy);

        // Startup delay not yet elapsed.
        d.maybe_start_poll(c.monotonic(), &cam, &stream, &probe, &events);
        assert!(!d.status.in_flight);

        c.advance(Duration::from_secs(5));
        d.maybe_start_poll(c.monotonic(), &cam, &stream, &probe, &events);
        assert!(d.status.in_flight);
        match rx.recv().await.expect("poll task reports back") {
            Event::MotionPolled { camera_key, result } => {
                assert_eq!(camera_key, TEST_CAMERA_KEY);
                assert_eq!(result.unwrap(), MotionState::Movement);
            }
            _ => panic!("unexpected event"),
        }

        // Handling the result clears in-flight; the frequency gate then
        // suppresses an immediate re-poll.
        d.handle_poll_result(&c, &t.db, &settings, &cam, &NullSink, Ok(MotionState::NoMovement));
        assert!(!d.status.in_flight);
        d.maybe_start_poll(c.monotonic(), &cam, &stream, &probe, &events);
        assert!(!d.status.in_flight);
        c.advance(Duration::from_millis(1000));
        d.maybe_start_poll(c.monotonic(), &cam, &stream, &probe, &events);
        assert!(d.status.in_flight);

        handle.kill(nix::sys::signal::Signal::SIGKILL);
    }

    #[test]
    fn open_episode_rederived_after_restart() {
        let t = TestDb::new();
        let c = clocks();
        write_live_manifest(&t, 100, 104);
        let cam = camera(&t);

        let mut d = MotionDetector::new(TEST_CAMERA_KEY.to_owned());
        apply(&mut d, &c, &t, &cam, MotionState::Movement);
        let key = d.status.current_movement_key.clone().unwrap();

        // A fresh detector (supervisor restart) picks the open episode back
        // up from the store rather than opening a second one.
        let mut d2 = MotionDetector::new(TEST_CAMERA_KEY.to_owned());
        c.advance(Duration::from_secs(2));
        apply(&mut d2, &c, &t, &cam, MotionState::Movement);
        assert_eq!(d2.status.current_movement_key.as_deref(), Some(key.as_str()));
    }
}
