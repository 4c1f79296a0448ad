// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving the persistence library. Used
//! for tests of both the `vigil_db` crate itself and the `vigil_nvr` crate.

use crate::json::{CameraRecord, MotionRecord, Settings};
use crate::{motion_key, Database};
use std::sync::Arc;
use tempfile::TempDir;

static INIT: std::sync::Once = std::sync::Once::new();

/// Key of the camera created by `TestDb::new` below.
pub const TEST_CAMERA_KEY: &str = "C100";

/// Performs global initialization for tests: set up logging.
/// (Note the output can be confusing unless `RUST_TEST_THREADS=1` is set in
/// the program's environment prior to running.)
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

pub struct TestDb {
    pub db: Arc<Database>,
    pub tmpdir: TempDir,
}

impl TestDb {
    /// Creates a test database with one camera whose disk points at a fresh
    /// temporary directory.
    pub fn new() -> Self {
        init();
        let tmpdir = tempfile::Builder::new()
            .prefix("vigil-nvr-test")
            .tempdir()
            .unwrap();

        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::init(&mut conn).unwrap();
        let db = Arc::new(Database::new(conn).unwrap());
        {
            let l = db.lock();
            l.put_camera(
                TEST_CAMERA_KEY,
                &CameraRecord {
                    name: "test camera".to_owned(),
                    disk: tmpdir.path().to_owned(),
                    folder: "cam".to_owned(),
                    enable_streaming: true,
                    enable_movement: true,
                    ..CameraRecord::default()
                },
            )
            .unwrap();
            l.put_settings(&Settings {
                base_dir: tmpdir.path().to_owned(),
                ..Settings::default()
            })
            .unwrap();
        }
        std::fs::create_dir_all(tmpdir.path().join("cam")).unwrap();
        TestDb { db, tmpdir }
    }

    /// Inserts a pending motion record for the test camera and returns its
    /// key.
    pub fn insert_motion(&self, start_ms: i64, start_segment: u64) -> String {
        let key = motion_key(start_ms);
        let record = MotionRecord::new(TEST_CAMERA_KEY.to_owned(), start_ms, start_segment);
        self.db.lock().put_motion(&key, &record).unwrap();
        key
    }

    /// The live stream directory of the test camera.
    pub fn stream_dir(&self) -> std::path::PathBuf {
        self.tmpdir.path().join("cam")
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
