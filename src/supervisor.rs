// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The control-loop supervisor: reconciles the declared desired state
//! (cameras × settings in the store) with running transcoders, camera motion
//! APIs, per-camera extractors, and the shared detector worker.
//!
//! Everything runs on one actor task. A 1 Hz tick drives the detector
//! lifecycle and then, per non-deleted camera in key order, the stream
//! controller, stream confirmation, motion detector, and processing
//! supervisor. Child-process output and exits arrive as [`Event`]s on an
//! unbounded channel, so every mutation of supervisor state happens here.
//! At-least-once semantics: every handler tolerates replays and re-derives
//! in-memory state from the store after a restart.

use crate::detector::DetectorController;
use crate::motion::{MotionDetector, MotionProbe, MotionState};
use crate::process::{ExitInfo, Handle};
use crate::processing::Processor;
use crate::push::PushSink;
use crate::streamer::Streamer;
use crate::{detector, processing, streamer};
use base::clock::Clocks;
use base::Error;
use db::Database;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Grace per child before SIGKILL during shutdown.
const SHUTDOWN_KILL_GRACE: Duration = Duration::from_secs(5);

/// Budget for draining close events after the shutdown kills.
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// Ticks between SSE keep-alives.
const KEEP_ALIVE_TICKS: u64 = 30;

/// Everything the child tasks report back to the actor.
pub enum Event {
    StreamStarted {
        camera_key: String,
        handle: Handle,
    },
    StreamStartFailed {
        camera_key: String,
    },
    MotionPolled {
        camera_key: String,
        result: Result<MotionState, Error>,
    },
    ExtractorFrame {
        camera_key: String,
        frame: u64,
    },
    ExtractorStderr {
        camera_key: String,
        line: String,
    },
    ExtractorExit {
        camera_key: String,
        exit: ExitInfo,
    },
    DetectorLine {
        line: String,
    },
    DetectorExit {
        exit: ExitInfo,
    },
}

struct CameraState {
    streamer: Streamer,
    motion: MotionDetector,
    processor: Processor,
}

impl CameraState {
    fn new(camera_key: &str) -> Self {
        CameraState {
            streamer: Streamer::new(camera_key.to_owned()),
            motion: MotionDetector::new(camera_key.to_owned()),
            processor: Processor::new(camera_key.to_owned()),
        }
    }
}

pub struct Supervisor<C: Clocks> {
    clocks: C,
    db: Arc<Database>,
    push: Arc<dyn PushSink>,
    probe: Arc<dyn MotionProbe>,
    cameras: HashMap<String, CameraState>,
    detector: DetectorController,
    shutting_down: Arc<AtomicBool>,
    events_tx: UnboundedSender<Event>,
    tick_count: u64,
    logged_no_cameras: bool,
}

impl<C: Clocks> Supervisor<C> {
    pub fn new(
        clocks: C,
        db: Arc<Database>,
        push: Arc<dyn PushSink>,
        probe: Arc<dyn MotionProbe>,
    ) -> (Self, UnboundedReceiver<Event>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            clocks,
            db,
            push,
            probe,
            cameras: HashMap::new(),
            detector: DetectorController::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            events_tx,
            tick_count: 0,
            logged_no_cameras: false,
        };
        (supervisor, events_rx)
    }

    /// Runs until shutdown is requested, then tears children down.
    pub async fn run(
        &mut self,
        mut events_rx: UnboundedReceiver<Event>,
        mut shutdown_rx: base::shutdown::Receiver,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                Some(event) = events_rx.recv() => self.handle_event(event).await,
                _ = shutdown_rx.wait() => break,
            }
        }
        self.shutdown(&mut events_rx).await;
    }

    /// One reconciliation pass.
    pub async fn tick(&mut self) {
        self.tick_count += 1;
        let settings = match self.db.lock().get_settings() {
            Ok(s) => s,
            Err(e) => {
                warn!("tick skipped, cannot read settings: {}", e.chain());
                return;
            }
        };

        self.detector.lifecycle(&detector::Env {
            clocks: &self.clocks,
            settings: &settings,
            events: &self.events_tx,
            shutting_down: &self.shutting_down,
        });

        let cameras = match self.db.lock().list_cameras() {
            Ok(c) => c,
            Err(e) => {
                warn!("tick skipped, cannot list cameras: {}", e.chain());
                return;
            }
        };
        let active: Vec<_> = cameras.into_iter().filter(|(_, c)| !c.deleted).collect();
        if active.is_empty() {
            if !self.logged_no_cameras {
                info!("No cameras configured");
                self.logged_no_cameras = true;
            }
        } else {
            self.logged_no_cameras = false;
        }

        for (key, camera) in &active {
            let state = self
                .cameras
                .entry(key.clone())
                .or_insert_with(|| CameraState::new(key));
            let env = streamer::Env {
                clocks: &self.clocks,
                settings: &settings,
                shutting_down: &self.shutting_down,
                events: &self.events_tx,
            };
            state.streamer.tick(&env, camera);
            if state.streamer.child_alive() {
                // `ShouldRestart` already cleared the in-memory child; the
                // next tick respawns.
                let _ = state.streamer.confirm(&env, camera);
            }
            state.motion.maybe_start_poll(
                self.clocks.monotonic(),
                camera,
                &state.streamer,
                &self.probe,
                &self.events_tx,
            );
            let env = processing::Env {
                clocks: &self.clocks,
                db: &self.db,
                push: self.push.as_ref(),
                events: &self.events_tx,
            };
            state.processor.tick(&env, camera);
        }

        // The explicit sweep: progress the ML-timeout path for every held
        // slot even when its camera is otherwise quiet.
        for state in self.cameras.values_mut() {
            if state.processor.slot_held() {
                state.processor.check_and_finalize(&processing::Env {
                    clocks: &self.clocks,
                    db: &self.db,
                    push: self.push.as_ref(),
                    events: &self.events_tx,
                });
            }
        }

        if self.tick_count % KEEP_ALIVE_TICKS == 0 {
            self.push.keep_alive();
            debug!(
                "detector: alive={} restart_pending={} frames_in_flight={}",
                self.detector.worker_alive(),
                self.detector.restart_pending(),
                self.detector.frames_in_flight()
            );
        }
    }

    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::StreamStarted { camera_key, handle } => {
                if let Some(state) = self.cameras.get_mut(&camera_key) {
                    state.streamer.start_finished(&self.clocks, Some(handle));
                } else {
                    // The camera vanished while starting; don't leak the child.
                    handle.kill_with_escalation(SHUTDOWN_KILL_GRACE);
                }
            }
            Event::StreamStartFailed { camera_key } => {
                if let Some(state) = self.cameras.get_mut(&camera_key) {
                    state.streamer.start_finished(&self.clocks, None);
                }
            }
            Event::MotionPolled { camera_key, result } => {
                let camera = self
                    .db
                    .lock()
                    .get_camera(&camera_key)
                    .ok()
                    .flatten()
                    .filter(|c| !c.deleted);
                let settings = self.db.lock().get_settings().unwrap_or_default();
                let Some(state) = self.cameras.get_mut(&camera_key) else {
                    return;
                };
                match camera {
                    Some(camera) => state.motion.handle_poll_result(
                        &self.clocks,
                        &self.db,
                        &settings,
                        &camera,
                        self.push.as_ref(),
                        result,
                    ),
                    None => state.motion.status.in_flight = false,
                }
            }
            Event::ExtractorFrame { camera_key, frame } => {
                let now = self.clocks.monotonic();
                let Some(state) = self.cameras.get_mut(&camera_key) else {
                    return;
                };
                for path in state.processor.frames_produced(frame) {
                    if self.detector.send_frame(now, &path).await {
                        state.processor.note_frame_sent();
                    }
                }
            }
            Event::ExtractorStderr { camera_key, line } => {
                if let Some(state) = self.cameras.get_mut(&camera_key) {
                    state.processor.stderr_line(&line);
                }
            }
            Event::ExtractorExit { camera_key, exit } => {
                let env = processing::Env {
                    clocks: &self.clocks,
                    db: &self.db,
                    push: self.push.as_ref(),
                    events: &self.events_tx,
                };
                if let Some(state) = self.cameras.get_mut(&camera_key) {
                    state.processor.extractor_exited(&env, exit);
                    state.processor.check_and_finalize(&env);
                }
            }
            Event::DetectorLine { line } => {
                let settings = self.db.lock().get_settings().unwrap_or_default();
                let outcome = self.detector.ingest_line(
                    &self.clocks,
                    &self.db,
                    self.push.as_ref(),
                    &settings,
                    &line,
                );
                if let Some(outcome) = outcome {
                    let env = processing::Env {
                        clocks: &self.clocks,
                        db: &self.db,
                        push: self.push.as_ref(),
                        events: &self.events_tx,
                    };
                    if let Some(state) = self.cameras.get_mut(&outcome.camera_key) {
                        let owns = state
                            .processor
                            .slot
                            .as_ref()
                            .is_some_and(|s| s.movement_key == outcome.movement_key);
                        if owns {
                            state.processor.note_frame_received(outcome.processing_ms);
                            state.processor.check_and_finalize(&env);
                        }
                    }
                }
            }
            Event::DetectorExit { exit } => {
                self.detector
                    .worker_exited(exit, self.shutting_down.load(Ordering::SeqCst));
            }
        }
    }

    /// Ordered teardown: kill all children in parallel with a 5 s
    /// grace each, then drain close events (≤ 10 s) so in-flight finalizes
    /// complete. The store closes when the caller drops it.
    pub async fn shutdown(&mut self, events_rx: &mut UnboundedReceiver<Event>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("Shutting down: stopping child processes.");

        let mut children = Vec::new();
        for state in self.cameras.values_mut() {
            if let Some(handle) = state.streamer.shutdown_kill(SHUTDOWN_KILL_GRACE) {
                children.push(handle);
            }
            if let Some(slot) = &state.processor.slot {
                if let Some(handle) = &slot.handle {
                    if handle.is_alive() {
                        handle.kill_with_escalation(SHUTDOWN_KILL_GRACE);
                        children.push(handle.clone());
                    }
                }
            }
        }
        if let Some(handle) = self.detector.shutdown_kill(SHUTDOWN_KILL_GRACE) {
            children.push(handle);
        }
        info!("Waiting for {} children to exit.", children.len());

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_BUDGET;
        while children.iter().any(|c| c.is_alive()) {
            tokio::select! {
                Some(event) = events_rx.recv() => self.handle_event(event).await,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Shutdown drain budget elapsed with children still tracked.");
                    break;
                }
            }
        }
        // Give already-queued close events (extractor finalizes) a chance.
        while let Ok(event) = events_rx.try_recv() {
            self.handle_event(event).await;
        }
        info!("Shutdown complete.");
    }
}
