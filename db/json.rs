// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON types stored as values in the database. See references from the
//! schema in `lib.rs`.

use rusqlite::types::{FromSqlError, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

macro_rules! sql {
    ($l:ident) => {
        impl rusqlite::types::FromSql for $l {
            fn column_result(value: ValueRef) -> Result<Self, FromSqlError> {
                match value {
                    ValueRef::Text(t) => {
                        Ok(serde_json::from_slice(t)
                            .map_err(|e| FromSqlError::Other(Box::new(e)))?)
                    }
                    _ => Err(FromSqlError::InvalidType),
                }
            }
        }

        impl rusqlite::types::ToSql for $l {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(serde_json::to_string(&self)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?
                    .into())
            }
        }
    };
}

/// A camera's declared (desired-state) configuration plus the per-camera
/// processing pointer. Cameras are never destroyed in place; `deleted` is a
/// tombstone which excludes the camera from the supervisor tick.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraRecord {
    /// A short display name of the camera.
    pub name: String,

    /// The logical disk root under which this camera's live stream lives.
    pub disk: PathBuf,

    /// Subfolder of `disk` holding `stream.m3u8` and its segments.
    pub folder: String,

    /// Declared stream source. An RTSP URL selects the transcoder's RTSP
    /// input mode; an `.m3u8`/http URL or a plain file path selects
    /// file-source mode. `None` builds the default RTSP URL from
    /// `ip`/`passwd`.
    #[serde(default)]
    pub stream_source: Option<String>,

    /// Camera address, used to build default RTSP and motion-API URLs.
    #[serde(default)]
    pub ip: Option<String>,

    /// Camera password for the built-in `admin` account.
    #[serde(default)]
    pub passwd: Option<String>,

    /// Explicit motion API URL; overrides the Reolink-style default.
    #[serde(default)]
    pub motion_url: Option<String>,

    #[serde(default)]
    pub enable_streaming: bool,

    #[serde(default)]
    pub enable_movement: bool,

    /// Minimum interval between motion API polls.
    #[serde(default = "default_poll_frequency_ms")]
    pub poll_frequency_ms: u64,

    /// Number of consecutive no-movement polls which closes an episode.
    /// Zero closes on the first no-movement poll.
    #[serde(default = "default_polls_without_movement")]
    pub polls_without_movement: u32,

    /// Hard cap on a single motion episode's length.
    #[serde(default = "default_max_single_movement_secs")]
    pub max_single_movement_secs: u64,

    /// Quiet period after a (re)started stream before motion polling arms.
    #[serde(default = "default_movement_startup_delay_secs")]
    pub movement_startup_delay_secs: u64,

    /// Segments of padding before/after an event for playback. Persisted for
    /// the playback layer; the supervisor itself doesn't consume them.
    #[serde(default = "default_playback_padding")]
    pub playback_pre_segments: u32,
    #[serde(default = "default_playback_padding")]
    pub playback_post_segments: u32,

    /// The per-camera processing pointer: every motion key less than or equal
    /// to this is in a terminal processing state. Monotonically
    /// non-decreasing; compared lexicographically against motion keys.
    #[serde(default)]
    pub last_processed_movement_key: String,

    /// Tombstone; excluded from the tick when set.
    #[serde(default)]
    pub deleted: bool,
}

sql!(CameraRecord);

fn default_poll_frequency_ms() -> u64 {
    1000
}
fn default_polls_without_movement() -> u32 {
    3
}
fn default_max_single_movement_secs() -> u64 {
    600
}
fn default_movement_startup_delay_secs() -> u64 {
    0
}
fn default_playback_padding() -> u32 {
    5
}

impl Default for CameraRecord {
    fn default() -> Self {
        CameraRecord {
            name: String::new(),
            disk: PathBuf::new(),
            folder: String::new(),
            stream_source: None,
            ip: None,
            passwd: None,
            motion_url: None,
            enable_streaming: false,
            enable_movement: false,
            poll_frequency_ms: default_poll_frequency_ms(),
            polls_without_movement: default_polls_without_movement(),
            max_single_movement_secs: default_max_single_movement_secs(),
            movement_startup_delay_secs: default_movement_startup_delay_secs(),
            playback_pre_segments: default_playback_padding(),
            playback_post_segments: default_playback_padding(),
            last_processed_movement_key: String::new(),
            deleted: false,
        }
    }
}

/// The singleton settings record.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Base directory for detection frames and disk accounting.
    #[serde(default)]
    pub base_dir: PathBuf,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Disk-usage percentage above which the cleanup loop reclaims space.
    #[serde(default = "default_cleanup_capacity_pct")]
    pub cleanup_capacity_pct: u8,

    #[serde(default)]
    pub enable_detection: bool,

    #[serde(default = "default_detection_model")]
    pub detection_model: String,

    #[serde(default = "default_target_hardware")]
    pub target_hardware: String,

    /// Subdirectory of `base_dir` for event playlists and extracted frames;
    /// `None` places them next to each camera's live stream.
    #[serde(default)]
    pub detection_frames_path: Option<String>,

    /// Overrides the detector worker invocation. The test/stub hook; `None`
    /// runs the stock worker from the `ai/` directory.
    #[serde(default)]
    pub detector_command: Option<Vec<String>>,

    #[serde(default = "default_stream_verify_timeout_ms")]
    pub stream_verify_timeout_ms: u64,

    /// Daily detector restart time as `HH:MM`; empty disables.
    #[serde(default = "default_ml_restart_schedule")]
    pub ml_restart_schedule: String,

    /// Tag → minimum probability. When non-empty, detections for unlisted
    /// tags or below the per-tag minimum are discarded on merge.
    #[serde(default)]
    pub tag_filters: BTreeMap<String, f64>,
}

sql!(Settings);

fn default_cleanup_interval_secs() -> u64 {
    60
}
fn default_cleanup_capacity_pct() -> u8 {
    90
}
fn default_detection_model() -> String {
    "default".to_owned()
}
fn default_target_hardware() -> String {
    "cpu".to_owned()
}
fn default_stream_verify_timeout_ms() -> u64 {
    10_000
}
fn default_ml_restart_schedule() -> String {
    "01:00".to_owned()
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings object deserializes")
    }
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingState::Completed | ProcessingState::Failed)
    }
}

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Starting,
    Extracting,
    Analyzing,
    Complete,
    Failed,
}

/// A tag aggregated across all of an episode's analyzed frames.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSummary {
    pub tag: String,

    /// Highest probability seen for this tag, rounded to 2 decimals;
    /// non-decreasing.
    pub max_probability: f64,

    /// Total detections of this tag across all frames.
    pub count: u32,

    /// File name of the frame that produced `max_probability`.
    pub max_probability_image: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionOutput {
    #[serde(default)]
    pub tags: Vec<TagSummary>,
}

/// One motion episode. Keyed in the store by the zero-padded millisecond
/// wall clock of its start, so lexicographic order equals chronological
/// order.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionRecord {
    pub camera_key: String,

    /// Milliseconds since the Unix epoch at episode start.
    pub start_ms: i64,

    /// First live-manifest segment index covered by the episode.
    pub start_segment: u64,

    /// Target duration inherited from the live manifest at detection time.
    #[serde(default = "default_target_duration_secs")]
    pub target_duration_secs: u32,

    /// Episode length so far, continually updated while open.
    #[serde(default)]
    pub seconds: u64,

    #[serde(default)]
    pub poll_count: u32,

    #[serde(default)]
    pub consecutive_polls_without_movement: u32,

    /// The bounded per-episode playlist and the last segment appended to it.
    #[serde(default)]
    pub playlist_path: Option<PathBuf>,
    #[serde(default)]
    pub playlist_last_segment: Option<u64>,

    #[serde(default)]
    pub processing_state: ProcessingState,
    #[serde(default)]
    pub processing_started_at: Option<i64>,
    #[serde(default)]
    pub processing_completed_at: Option<i64>,
    #[serde(default)]
    pub processing_error: Option<String>,

    /// `None` means undefined (never entered detection).
    #[serde(default)]
    pub detection_status: Option<DetectionStatus>,
    #[serde(default)]
    pub detection_started_at: Option<i64>,
    #[serde(default)]
    pub detection_ended_at: Option<i64>,

    #[serde(default)]
    pub detection_output: DetectionOutput,

    #[serde(default)]
    pub frames_sent_to_ml: u32,
    #[serde(default)]
    pub frames_received_from_ml: u32,
    #[serde(default)]
    pub ml_total_processing_time_ms: u64,
    #[serde(default)]
    pub ml_max_processing_time_ms: u64,
}

sql!(MotionRecord);

fn default_target_duration_secs() -> u32 {
    2
}

impl MotionRecord {
    pub fn new(camera_key: String, start_ms: i64, start_segment: u64) -> Self {
        MotionRecord {
            camera_key,
            start_ms,
            start_segment,
            target_duration_secs: default_target_duration_secs(),
            seconds: 0,
            poll_count: 0,
            consecutive_polls_without_movement: 0,
            playlist_path: None,
            playlist_last_segment: None,
            processing_state: ProcessingState::Pending,
            processing_started_at: None,
            processing_completed_at: None,
            processing_error: None,
            detection_status: None,
            detection_started_at: None,
            detection_ended_at: None,
            detection_output: DetectionOutput::default(),
            frames_sent_to_ml: 0,
            frames_received_from_ml: 0,
            ml_total_processing_time_ms: 0,
            ml_max_processing_time_ms: 0,
        }
    }

    /// An episode is open until its detection side has been finalized.
    pub fn is_open(&self) -> bool {
        self.detection_ended_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_defaults_from_sparse_json() {
        let c: CameraRecord =
            serde_json::from_str(r#"{"name": "porch", "disk": "/media/a", "folder": "porch"}"#)
                .unwrap();
        assert_eq!(c.poll_frequency_ms, 1000);
        assert_eq!(c.max_single_movement_secs, 600);
        assert!(!c.deleted);
        assert_eq!(c.last_processed_movement_key, "");
    }

    #[test]
    fn settings_defaults() {
        let s = Settings::default();
        assert_eq!(s.stream_verify_timeout_ms, 10_000);
        assert_eq!(s.ml_restart_schedule, "01:00");
        assert_eq!(s.cleanup_capacity_pct, 90);
        assert!(s.tag_filters.is_empty());
    }

    #[test]
    fn processing_state_round_trip() {
        assert_eq!(
            serde_json::to_string(&ProcessingState::Pending).unwrap(),
            r#""pending""#
        );
        let s: ProcessingState = serde_json::from_str(r#""failed""#).unwrap();
        assert_eq!(s, ProcessingState::Failed);
        assert!(s.is_terminal());
    }

    #[test]
    fn motion_record_camel_case_fields() {
        let m = MotionRecord::new("C100".to_owned(), 1_700_000_000_000, 42);
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("cameraKey").is_some());
        assert!(v.get("startSegment").is_some());
        assert_eq!(v["processingState"], "pending");
    }
}
