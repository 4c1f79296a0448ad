// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The singleton object-detection worker: one child process shared by every
//! camera's processing supervisor.
//!
//! Wire protocol: one absolute image path per line on stdin; one JSON object
//! per line on stdout, `{"image": <path>, "detections": [{"object","probability",
//! "box"}…], "error"?}`. Results correlate back to motion records through the
//! movement key embedded in the frame file name; no back-pointers exist.
//!
//! The worker restarts once per day at the configured time, but only after
//! draining: `restart_pending` makes new frame writes drop until the
//! in-flight map empties, then the worker is killed and the next tick
//! respawns it.

use crate::hls;
use crate::process::{self, ExitInfo};
use crate::push::{PushEvent, PushSink};
use crate::supervisor::Event;
use base::clock::Clocks;
use base::Error;
use db::{Database, MotionRecord, Settings, TagSummary};
use jiff::civil;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Grace before SIGKILL when stopping the worker.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A scheduled restart fires within this window after the configured time.
const RESTART_WINDOW_MINUTES: u32 = 30;

/// One stdout line from the worker.
#[derive(Debug, Deserialize)]
pub struct ResultLine {
    pub image: String,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Detection {
    pub object: String,
    pub probability: f64,
    // The per-detection bounding box also arrives on the wire; nothing on
    // the aggregation side consumes it.
}

/// Parses `HH:MM`; `None` for empty or malformed schedules.
pub fn parse_schedule(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some((h, m))
}

/// Whether a scheduled restart is due: the local time is within the
/// 30-minute window after `HH:MM` and no restart happened today.
pub fn restart_due(now: civil::DateTime, schedule: &str, last: Option<civil::Date>) -> bool {
    let Some((h, m)) = parse_schedule(schedule) else {
        return false;
    };
    if last == Some(now.date()) {
        return false;
    }
    let scheduled_min = h * 60 + m;
    let now_min = u32::from(now.hour().unsigned_abs()) * 60 + u32::from(now.minute().unsigned_abs());
    now_min >= scheduled_min && now_min - scheduled_min < RESTART_WINDOW_MINUTES
}

/// The worker invocation: the settings override (stub mode for tests), or
/// the stock worker run from the `ai/` directory next to the server.
pub fn worker_command(settings: &Settings) -> (String, Vec<String>, Option<PathBuf>) {
    if let Some(custom) = &settings.detector_command {
        if !custom.is_empty() {
            return (custom[0].clone(), custom[1..].to_vec(), None);
        }
    }
    let base = std::env::var("PWD")
        .map(PathBuf::from)
        .or_else(|_| std::env::current_dir())
        .unwrap_or_else(|_| PathBuf::from("."));
    (
        "python3".to_owned(),
        vec![
            "obj_detect.py".to_owned(),
            "--model".to_owned(),
            settings.detection_model.clone(),
            "--hardware".to_owned(),
            settings.target_hardware.clone(),
        ],
        Some(base.join("ai")),
    )
}

/// Merges one frame's detections onto the record's aggregated tags.
///
/// Each tag keeps its count across all frames, its highest probability
/// (rounded to 2 decimals, non-decreasing), and the frame that produced the
/// maximum. With a non-empty filter map, detections for unlisted tags or
/// below the per-tag minimum are discarded. Tags sort by max probability,
/// descending.
pub fn merge_detections(
    record: &mut MotionRecord,
    image_name: &str,
    detections: &[Detection],
    filters: &BTreeMap<String, f64>,
) {
    for d in detections {
        if !filters.is_empty() {
            match filters.get(&d.object) {
                Some(&min) if d.probability >= min => {}
                _ => continue,
            }
        }
        let probability = (d.probability * 100.0).round() / 100.0;
        let tags = &mut record.detection_output.tags;
        match tags.iter_mut().find(|t| t.tag == d.object) {
            Some(tag) => {
                tag.count += 1;
                if probability > tag.max_probability {
                    tag.max_probability = probability;
                    tag.max_probability_image = image_name.to_owned();
                }
            }
            None => tags.push(TagSummary {
                tag: d.object.clone(),
                max_probability: probability,
                count: 1,
                max_probability_image: image_name.to_owned(),
            }),
        }
    }
    record
        .detection_output
        .tags
        .sort_by(|a, b| {
            b.max_probability
                .partial_cmp(&a.max_probability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
}

/// A successfully merged result, so the caller can update the owning
/// camera's processing slot.
pub struct IngestOutcome {
    pub camera_key: String,
    pub movement_key: String,
    /// Wall time from stdin write to stdout answer, when the frame was in
    /// this supervisor's in-flight map.
    pub processing_ms: Option<u64>,
}

pub struct Env<'e, C: Clocks> {
    pub clocks: &'e C,
    pub settings: &'e Settings,
    pub events: &'e UnboundedSender<Event>,
    pub shutting_down: &'e Arc<AtomicBool>,
}

pub struct DetectorController {
    handle: Option<process::Handle>,
    restart_pending: bool,
    last_restart_date: Option<civil::Date>,
    /// Image path → monotonic send time.
    frames_in_flight: HashMap<String, Duration>,
}

impl DetectorController {
    pub fn new() -> Self {
        DetectorController {
            handle: None,
            restart_pending: false,
            last_restart_date: None,
            frames_in_flight: HashMap::new(),
        }
    }

    pub fn worker_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_alive())
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight.len()
    }

    /// One lifecycle pass: reconcile the worker with the detection settings
    /// and the restart schedule.
    pub fn lifecycle<C: Clocks>(&mut self, env: &Env<'_, C>) {
        if !env.settings.enable_detection {
            if let Some(handle) = self.handle.take() {
                if handle.is_alive() {
                    info!("detection disabled, stopping worker");
                    handle.kill_with_escalation(KILL_GRACE);
                }
            }
            self.frames_in_flight.clear();
            self.restart_pending = false;
            return;
        }

        if self.worker_alive() {
            if !self.restart_pending {
                let local = env
                    .clocks
                    .realtime()
                    .to_zoned(jiff::tz::TimeZone::system())
                    .datetime();
                if restart_due(local, &env.settings.ml_restart_schedule, self.last_restart_date) {
                    info!(
                        "scheduled worker restart due ({}); draining {} in-flight frames",
                        env.settings.ml_restart_schedule,
                        self.frames_in_flight.len()
                    );
                    self.restart_pending = true;
                }
            }
            if self.restart_pending {
                if self.frames_in_flight.is_empty() {
                    info!("drained; stopping worker for scheduled restart");
                    if let Some(handle) = self.handle.take() {
                        handle.kill_with_escalation(KILL_GRACE);
                    }
                }
                // Otherwise wait: new frames are dropped while pending.
            }
            return;
        }

        if env.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.spawn_worker(env);
    }

    fn spawn_worker<C: Clocks>(&mut self, env: &Env<'_, C>) {
        let (cmd, args, cwd) = worker_command(env.settings);
        let mut opts = process::Spawn::new("detector", &cmd, args);
        opts.cwd = cwd;
        opts.pipe_stdin = true;
        let events = env.events.clone();
        opts.on_stdout = Some(Box::new(move |line| {
            let _ = events.send(Event::DetectorLine {
                line: line.to_owned(),
            });
        }));
        opts.on_stderr = Some(Box::new(|line| {
            debug!("detector: {line}");
        }));
        let events = env.events.clone();
        opts.on_close = Some(Box::new(move |exit| {
            let _ = events.send(Event::DetectorExit { exit });
        }));
        match process::spawn(opts) {
            Ok(handle) => {
                info!("detection worker started ({cmd}, pid {})", handle.pid());
                self.handle = Some(handle);
                if self.restart_pending {
                    // This spawn completes a scheduled restart.
                    self.restart_pending = false;
                    self.last_restart_date = Some(
                        env.clocks
                            .realtime()
                            .to_zoned(jiff::tz::TimeZone::system())
                            .date(),
                    );
                }
            }
            Err(e) => warn!("detection worker failed to start: {}", e.chain()),
        }
    }

    /// Hands one frame path to the worker, best-effort:
    /// dropped while a restart is draining or the worker is unwritable.
    /// Returns whether the frame went out.
    pub async fn send_frame(&mut self, now: Duration, path: &Path) -> bool {
        if self.restart_pending {
            debug!("dropping frame {}: restart pending", path.display());
            return false;
        }
        let Some(handle) = &self.handle else {
            debug!("dropping frame {}: no worker", path.display());
            return false;
        };
        if !handle.is_alive() {
            debug!("dropping frame {}: worker dead", path.display());
            return false;
        }
        let line = path.to_string_lossy().into_owned();
        if !handle.write_line(&line).await {
            return false;
        }
        self.frames_in_flight.insert(line, now);
        true
    }

    /// Parses one worker stdout line, merges it onto the owning motion
    /// record, and broadcasts the update.
    pub fn ingest_line<C: Clocks>(
        &mut self,
        clocks: &C,
        db: &Database,
        push: &dyn PushSink,
        settings: &Settings,
        line: &str,
    ) -> Option<IngestOutcome> {
        let parsed: ResultLine = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                warn!("unparseable detector line ({e}): {line}");
                return None;
            }
        };
        let sent = self.frames_in_flight.remove(&parsed.image);
        let processing_ms =
            sent.map(|s| clocks.monotonic().saturating_sub(s).as_millis() as u64);

        let image_name = Path::new(&parsed.image).file_name()?.to_str()?.to_owned();
        let Some(movement_key) = hls::movement_key_from_frame(&image_name) else {
            warn!("detector result for uncorrelatable image {image_name}");
            return None;
        };
        if let Some(error) = &parsed.error {
            debug!("detector reported error for {image_name}: {error}");
        }

        let merged = (|| -> Result<Option<String>, Error> {
            let l = db.lock();
            let Some(mut record) = l.get_motion(&movement_key)? else {
                debug!("detector result for vanished record {movement_key}");
                return Ok(None);
            };
            merge_detections(&mut record, &image_name, &parsed.detections, &settings.tag_filters);
            record.detection_status = None;
            l.put_motion(&movement_key, &record)?;
            let camera_key = record.camera_key.clone();
            drop(l);
            push.broadcast(PushEvent::MovementUpdate, &movement_key, &record);
            Ok(Some(camera_key))
        })();

        match merged {
            Ok(Some(camera_key)) => Some(IngestOutcome {
                camera_key,
                movement_key,
                processing_ms,
            }),
            Ok(None) => None,
            Err(e) => {
                warn!("merging detector result for {movement_key} failed: {}", e.chain());
                None
            }
        }
    }

    /// Handles worker exit: in-flight frames will never be answered, so they
    /// clear here and their episodes finalize via the ML-result timeout.
    pub fn worker_exited(&mut self, exit: ExitInfo, shutting_down: bool) {
        self.handle = None;
        let dropped = self.frames_in_flight.len();
        self.frames_in_flight.clear();
        let unexpected = exit.code.is_some_and(|c| c != 0) && exit.signal.is_none() && !shutting_down;
        if unexpected {
            warn!(
                "detection worker exited unexpectedly with code {:?} ({dropped} frames in flight)",
                exit.code
            );
        } else {
            debug!(
                "detection worker closed (code {:?}, signal {:?}, {dropped} frames in flight)",
                exit.code, exit.signal
            );
        }
    }

    /// Kills the worker for graceful shutdown, returning its handle so the
    /// caller can await the exit.
    pub fn shutdown_kill(&mut self, grace: Duration) -> Option<process::Handle> {
        let handle = self.handle.take()?;
        if !handle.is_alive() {
            return None;
        }
        handle.kill_with_escalation(grace);
        Some(handle)
    }
}

impl Default for DetectorController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::NullSink;
    use base::clock::SimulatedClocks;
    use db::testutil::{TestDb, TEST_CAMERA_KEY};
    use serde_json::json;

    fn clocks() -> SimulatedClocks {
        SimulatedClocks::new("2026-03-01T00:00:00Z".parse().unwrap())
    }

    fn at(h: i8, m: i8) -> civil::DateTime {
        civil::date(2026, 3, 1).at(h, m, 0, 0)
    }

    #[test]
    fn schedule_parsing() {
        assert_eq!(parse_schedule("01:00"), Some((1, 0)));
        assert_eq!(parse_schedule("23:59"), Some((23, 59)));
        assert_eq!(parse_schedule(""), None);
        assert_eq!(parse_schedule("24:00"), None);
        assert_eq!(parse_schedule("1am"), None);
    }

    #[test]
    fn restart_window() {
        // Within the 30-minute window.
        assert!(restart_due(at(1, 0), "01:00", None));
        assert!(restart_due(at(1, 5), "01:00", None));
        assert!(restart_due(at(1, 29), "01:00", None));
        // Outside it.
        assert!(!restart_due(at(0, 59), "01:00", None));
        assert!(!restart_due(at(1, 30), "01:00", None));
        assert!(!restart_due(at(14, 0), "01:00", None));
        // Empty schedule disables.
        assert!(!restart_due(at(1, 5), "", None));
        // Once per calendar day.
        assert!(!restart_due(at(1, 5), "01:00", Some(civil::date(2026, 3, 1))));
        assert!(restart_due(at(1, 5), "01:00", Some(civil::date(2026, 2, 28))));
    }

    #[test]
    fn worker_command_stub_override() {
        let mut settings = Settings::default();
        settings.detector_command = Some(vec!["cat".to_owned()]);
        let (cmd, args, cwd) = worker_command(&settings);
        assert_eq!(cmd, "cat");
        assert!(args.is_empty());
        assert!(cwd.is_none());

        settings.detector_command = None;
        settings.detection_model = "yolo".to_owned();
        let (cmd, args, cwd) = worker_command(&settings);
        assert_eq!(cmd, "python3");
        assert!(args.contains(&"yolo".to_owned()));
        assert!(cwd.unwrap().ends_with("ai"));
    }

    fn person(probability: f64) -> Detection {
        Detection {
            object: "person".to_owned(),
            probability,
        }
    }

    #[test]
    fn merge_is_idempotent_except_count() {
        let mut record = MotionRecord::new("C100".to_owned(), 1_000, 0);
        let detections = vec![person(0.424), person(0.31)];
        merge_detections(&mut record, "mov1_0003.jpg", &detections, &BTreeMap::new());
        merge_detections(&mut record, "mov1_0003.jpg", &detections, &BTreeMap::new());

        let tags = &record.detection_output.tags;
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].count, 4);
        assert_eq!(tags[0].max_probability, 0.42);
        assert_eq!(tags[0].max_probability_image, "mov1_0003.jpg");
    }

    #[test]
    fn merge_keeps_max_and_sorts() {
        let mut record = MotionRecord::new("C100".to_owned(), 1_000, 0);
        merge_detections(&mut record, "a.jpg", &[person(0.3)], &BTreeMap::new());
        merge_detections(
            &mut record,
            "b.jpg",
            &[person(0.9), Detection {
                object: "cat".to_owned(),
                probability: 0.5,
            }],
            &BTreeMap::new(),
        );
        // A lower later probability must not regress the max.
        merge_detections(&mut record, "c.jpg", &[person(0.1)], &BTreeMap::new());

        let tags = &record.detection_output.tags;
        assert_eq!(tags[0].tag, "person");
        assert_eq!(tags[0].max_probability, 0.9);
        assert_eq!(tags[0].max_probability_image, "b.jpg");
        assert_eq!(tags[0].count, 3);
        assert_eq!(tags[1].tag, "cat");
    }

    #[test]
    fn merge_applies_tag_filters() {
        let mut record = MotionRecord::new("C100".to_owned(), 1_000, 0);
        let mut filters = BTreeMap::new();
        filters.insert("person".to_owned(), 0.5);
        merge_detections(
            &mut record,
            "a.jpg",
            &[person(0.4), person(0.6), Detection {
                object: "cat".to_owned(),
                probability: 0.99,
            }],
            &filters,
        );
        let tags = &record.detection_output.tags;
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].tag, "person");
        assert_eq!(tags[0].count, 1);
    }

    #[test]
    fn ingest_correlates_to_the_right_record() {
        let t = TestDb::new();
        let c = clocks();
        let key_a = t.insert_motion(1_000, 0);
        let key_b = t.insert_motion(2_000, 0);
        let settings = t.db.lock().get_settings().unwrap();

        let mut d = DetectorController::new();
        let line = json!({
            "image": format!("/frames/mov{key_a}_0003.jpg"),
            "detections": [{"object": "person", "probability": 0.42, "box": [0, 0, 1, 1]}],
        })
        .to_string();
        let outcome = d
            .ingest_line(&c, &t.db, &NullSink, &settings, &line)
            .expect("merge happens");
        assert_eq!(outcome.movement_key, key_a);
        assert_eq!(outcome.camera_key, TEST_CAMERA_KEY);
        assert_eq!(outcome.processing_ms, None, "frame was never in flight");

        let a = t.db.lock().get_motion(&key_a).unwrap().unwrap();
        assert_eq!(a.detection_output.tags.len(), 1);
        assert_eq!(a.detection_output.tags[0].max_probability, 0.42);
        assert!(a.detection_status.is_none());
        let b = t.db.lock().get_motion(&key_b).unwrap().unwrap();
        assert!(b.detection_output.tags.is_empty());
    }

    #[test]
    fn ingest_rejects_garbage() {
        let t = TestDb::new();
        let c = clocks();
        let settings = t.db.lock().get_settings().unwrap();
        let mut d = DetectorController::new();
        assert!(d
            .ingest_line(&c, &t.db, &NullSink, &settings, "not json")
            .is_none());
        let line = json!({"image": "/frames/unrelated.jpg", "detections": []}).to_string();
        assert!(d.ingest_line(&c, &t.db, &NullSink, &settings, &line).is_none());
    }

    #[tokio::test]
    async fn frames_drop_while_restart_pending() {
        let mut d = DetectorController::new();
        // No worker yet: drop.
        assert!(!d.send_frame(Duration::ZERO, Path::new("/frames/a.jpg")).await);

        let handle = process::spawn({
            let mut o = process::Spawn::new("stub", "cat", vec![]);
            o.pipe_stdin = true;
            o
        })
        .unwrap();
        d.handle = Some(handle.clone());

        assert!(d.send_frame(Duration::ZERO, Path::new("/frames/a.jpg")).await);
        assert_eq!(d.frames_in_flight(), 1);

        d.restart_pending = true;
        assert!(!d.send_frame(Duration::ZERO, Path::new("/frames/b.jpg")).await);
        assert_eq!(d.frames_in_flight(), 1, "dropped frame is not in flight");

        handle.kill(nix::sys::signal::Signal::SIGKILL);
    }

    #[test]
    fn exit_clears_in_flight() {
        let mut d = DetectorController::new();
        d.frames_in_flight
            .insert("/frames/a.jpg".to_owned(), Duration::ZERO);
        d.worker_exited(
            ExitInfo {
                code: Some(1),
                signal: None,
            },
            false,
        );
        assert_eq!(d.frames_in_flight(), 0);
        assert!(!d.worker_alive());
    }
}
