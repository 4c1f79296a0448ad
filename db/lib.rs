// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The persistent store: three ordered key→value collections over SQLite.
//!
//! The store is the authoritative source of truth. Keys are opaque
//! byte-ordered strings; motion keys are fixed-width millisecond timestamps
//! so lexicographic order equals chronological order. Values are
//! JSON-encoded records (see [`json`]). All supervisor components tolerate
//! observing their own prior writes after a restart and re-derive in-memory
//! state from here.

use base::{bail_t, Error, ErrorKind, ResultExt as _};
use std::sync::{Mutex, MutexGuard};

pub mod json;
mod raw;
pub mod testutil;

pub use json::{
    CameraRecord, DetectionOutput, DetectionStatus, MotionRecord, ProcessingState, Settings,
    TagSummary,
};

/// 2020-09-13T00:00:00Z; camera keys and live HLS segment numbering count
/// seconds from here to stay short.
pub const CUSTOM_EPOCH_SEC: i64 = 1_599_955_200;

/// Builds a camera key from a wall-clock creation time.
pub fn camera_key(epoch_sec: i64) -> String {
    format!("C{}", epoch_sec - CUSTOM_EPOCH_SEC)
}

/// Builds a motion key from an episode start time in milliseconds.
///
/// Zero-padded to 13 digits so lexicographic order equals chronological
/// order through the year 2286.
pub fn motion_key(start_ms: i64) -> String {
    format!("{start_ms:013}")
}

const SCHEMA_SQL: &str = r#"
    create table settings (
        key text primary key,
        data text not null
    ) without rowid;

    create table camera (
        key text primary key,
        data text not null
    ) without rowid;

    create table motion (
        key text primary key,
        data text not null
    ) without rowid;
"#;

/// Initializes the database schema. Idempotence is the caller's concern;
/// `init` on an initialized database returns an error.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA_SQL)
        .err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// The open store. Clone-free; share via `Arc` and access via [`lock`].
///
/// [`lock`]: Database::lock
#[derive(Debug)]
pub struct Database {
    conn: Mutex<rusqlite::Connection>,
}

impl Database {
    /// Wraps an open connection, verifying the schema exists.
    pub fn new(conn: rusqlite::Connection) -> Result<Self, Error> {
        let tables: i64 = conn
            .query_row(
                "select count(*) from sqlite_master \
                 where type = 'table' and name in ('settings', 'camera', 'motion')",
                [],
                |row| row.get(0),
            )
            .err_kind(ErrorKind::Internal)?;
        if tables != 3 {
            bail_t!(FailedPrecondition, "no schema present; run init first");
        }
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    pub fn lock(&self) -> LockedDatabase<'_> {
        LockedDatabase(self.conn.lock().unwrap())
    }
}

/// Accessor for the store; holds the connection for its lifetime, so keep
/// critical sections short.
pub struct LockedDatabase<'db>(MutexGuard<'db, rusqlite::Connection>);

impl LockedDatabase<'_> {
    /// Returns the settings record, or defaults when none has been stored.
    pub fn get_settings(&self) -> Result<Settings, Error> {
        Ok(raw::get_settings(&self.0)?.unwrap_or_default())
    }

    pub fn put_settings(&self, settings: &Settings) -> Result<(), Error> {
        raw::put_settings(&self.0, settings)
    }

    pub fn get_camera(&self, key: &str) -> Result<Option<CameraRecord>, Error> {
        raw::get_camera(&self.0, key)
    }

    pub fn put_camera(&self, key: &str, camera: &CameraRecord) -> Result<(), Error> {
        raw::put_camera(&self.0, key, camera)
    }

    /// Lists all cameras in key (= insertion) order, tombstones included.
    pub fn list_cameras(&self) -> Result<Vec<(String, CameraRecord)>, Error> {
        raw::list_cameras(&self.0)
    }

    pub fn get_motion(&self, key: &str) -> Result<Option<MotionRecord>, Error> {
        raw::get_motion(&self.0, key)
    }

    pub fn put_motion(&self, key: &str, motion: &MotionRecord) -> Result<(), Error> {
        raw::put_motion(&self.0, key, motion)
    }

    /// Deletes the given motion keys in a single transaction.
    pub fn delete_motions(&mut self, keys: &[String]) -> Result<(), Error> {
        raw::delete_motions(&mut self.0, keys)
    }

    /// Iterates motion records with key strictly greater than `key_gt`, in
    /// ascending order, until `f` returns `Ok(false)`.
    pub fn list_motion_from(
        &self,
        key_gt: &str,
        f: &mut dyn FnMut(&str, MotionRecord) -> Result<bool, Error>,
    ) -> Result<(), Error> {
        raw::list_motion_from(&self.0, key_gt, f)
    }

    /// Iterates all motion records in descending key order until `f` returns
    /// `Ok(false)`.
    pub fn list_motion_desc(
        &self,
        f: &mut dyn FnMut(&str, MotionRecord) -> Result<bool, Error>,
    ) -> Result<(), Error> {
        raw::list_motion_desc(&self.0, f)
    }

    /// Returns the camera's open episode (no `detection_ended_at`), if any.
    ///
    /// Episodes are singletons per camera while the supervisor holds the
    /// invariant; the newest match wins regardless.
    pub fn open_motion_for(
        &self,
        camera_key: &str,
    ) -> Result<Option<(String, MotionRecord)>, Error> {
        let mut found = None;
        self.list_motion_desc(&mut |key, motion| {
            if motion.camera_key == camera_key && motion.is_open() {
                found = Some((key.to_owned(), motion));
                return Ok(false);
            }
            Ok(true)
        })?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_db() -> Database {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        init(&mut conn).unwrap();
        Database::new(conn).unwrap()
    }

    #[test]
    fn new_without_schema_fails() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let e = Database::new(conn).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn motion_key_order_is_chronological() {
        let a = motion_key(999);
        let b = motion_key(1_000_000);
        let c = motion_key(1_700_000_000_000);
        assert!(a < b && b < c);
        assert_eq!(c.len(), 13);
    }

    #[test]
    fn camera_key_from_epoch() {
        assert_eq!(camera_key(CUSTOM_EPOCH_SEC + 100), "C100");
    }

    #[test]
    fn settings_default_then_round_trip() {
        let db = new_db();
        let l = db.lock();
        assert_eq!(l.get_settings().unwrap(), Settings::default());
        let mut s = Settings::default();
        s.enable_detection = true;
        s.ml_restart_schedule = "03:30".to_owned();
        l.put_settings(&s).unwrap();
        assert_eq!(l.get_settings().unwrap(), s);
    }

    #[test]
    fn camera_round_trip_and_order() {
        let db = new_db();
        let l = db.lock();
        let mut cam = CameraRecord {
            name: "front".to_owned(),
            ..CameraRecord::default()
        };
        l.put_camera("C200", &cam).unwrap();
        cam.name = "back".to_owned();
        l.put_camera("C100", &cam).unwrap();
        let cameras = l.list_cameras().unwrap();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].0, "C100");
        assert_eq!(cameras[1].0, "C200");
        assert_eq!(l.get_camera("C200").unwrap().unwrap().name, "front");
        assert!(l.get_camera("C999").unwrap().is_none());
    }

    #[test]
    fn motion_iteration_bounds() {
        let db = new_db();
        let mut l = db.lock();
        for start_ms in [1_000, 2_000, 3_000, 4_000] {
            let key = motion_key(start_ms);
            let m = MotionRecord::new("C100".to_owned(), start_ms, 0);
            l.put_motion(&key, &m).unwrap();
        }

        // Strictly-greater-than iteration in ascending order.
        let mut seen = Vec::new();
        l.list_motion_from(&motion_key(2_000), &mut |key, _| {
            seen.push(key.to_owned());
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, vec![motion_key(3_000), motion_key(4_000)]);

        // Early exit.
        let mut seen = Vec::new();
        l.list_motion_from("", &mut |key, _| {
            seen.push(key.to_owned());
            Ok(seen.len() < 2)
        })
        .unwrap();
        assert_eq!(seen.len(), 2);

        // Descending.
        let mut first = None;
        l.list_motion_desc(&mut |key, _| {
            first = Some(key.to_owned());
            Ok(false)
        })
        .unwrap();
        assert_eq!(first.as_deref(), Some(motion_key(4_000).as_str()));

        // Batched delete.
        l.delete_motions(&[motion_key(1_000), motion_key(3_000)])
            .unwrap();
        let mut remaining = Vec::new();
        l.list_motion_from("", &mut |key, _| {
            remaining.push(key.to_owned());
            Ok(true)
        })
        .unwrap();
        assert_eq!(remaining, vec![motion_key(2_000), motion_key(4_000)]);
    }

    #[test]
    fn open_motion_lookup() {
        let db = new_db();
        let l = db.lock();
        let mut closed = MotionRecord::new("C100".to_owned(), 1_000, 0);
        closed.detection_ended_at = Some(2_000);
        l.put_motion(&motion_key(1_000), &closed).unwrap();
        assert!(l.open_motion_for("C100").unwrap().is_none());

        let open = MotionRecord::new("C100".to_owned(), 3_000, 7);
        l.put_motion(&motion_key(3_000), &open).unwrap();
        let (key, rec) = l.open_motion_for("C100").unwrap().unwrap();
        assert_eq!(key, motion_key(3_000));
        assert_eq!(rec.start_segment, 7);
        assert!(l.open_motion_for("C999").unwrap().is_none());
    }
}
