// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw database access: SQLite statements which do not touch any cached state.

use crate::json::{CameraRecord, MotionRecord, Settings};
use base::{Error, ErrorKind, ResultExt as _};
use rusqlite::{named_params, params, Connection, OptionalExtension as _};

/// The fixed key of the singleton settings row.
const SETTINGS_KEY: &str = "settings";

const GET_SETTINGS_SQL: &str = "select data from settings where key = :key";
const PUT_SETTINGS_SQL: &str = r#"
    insert into settings (key, data) values (:key, :data)
    on conflict (key) do update set data = excluded.data
"#;

const GET_CAMERA_SQL: &str = "select data from camera where key = :key";
const PUT_CAMERA_SQL: &str = r#"
    insert into camera (key, data) values (:key, :data)
    on conflict (key) do update set data = excluded.data
"#;
const LIST_CAMERAS_SQL: &str = "select key, data from camera order by key";

const GET_MOTION_SQL: &str = "select data from motion where key = :key";
const PUT_MOTION_SQL: &str = r#"
    insert into motion (key, data) values (:key, :data)
    on conflict (key) do update set data = excluded.data
"#;
const LIST_MOTION_ASC_SQL: &str = r#"
    select key, data from motion where key > :key order by key
"#;
const LIST_MOTION_DESC_SQL: &str = "select key, data from motion order by key desc";
const DELETE_MOTION_SQL: &str = "delete from motion where key = ?";

pub(crate) fn get_settings(conn: &Connection) -> Result<Option<Settings>, Error> {
    let mut stmt = conn
        .prepare_cached(GET_SETTINGS_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.query_row(named_params! {":key": SETTINGS_KEY}, |row| row.get(0))
        .optional()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn put_settings(conn: &Connection, settings: &Settings) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(PUT_SETTINGS_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {":key": SETTINGS_KEY, ":data": settings})
        .err_kind(ErrorKind::Internal)?;
    Ok(())
}

pub(crate) fn get_camera(conn: &Connection, key: &str) -> Result<Option<CameraRecord>, Error> {
    let mut stmt = conn
        .prepare_cached(GET_CAMERA_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.query_row(named_params! {":key": key}, |row| row.get(0))
        .optional()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn put_camera(conn: &Connection, key: &str, camera: &CameraRecord) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(PUT_CAMERA_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {":key": key, ":data": camera})
        .err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// Lists all cameras in key (= insertion) order, tombstones included.
pub(crate) fn list_cameras(conn: &Connection) -> Result<Vec<(String, CameraRecord)>, Error> {
    let mut stmt = conn
        .prepare_cached(LIST_CAMERAS_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query([]).err_kind(ErrorKind::Internal)?;
    let mut cameras = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let key: String = row.get(0).err_kind(ErrorKind::Internal)?;
        let camera: CameraRecord = row.get(1).err_kind(ErrorKind::DataLoss)?;
        cameras.push((key, camera));
    }
    Ok(cameras)
}

pub(crate) fn get_motion(conn: &Connection, key: &str) -> Result<Option<MotionRecord>, Error> {
    let mut stmt = conn
        .prepare_cached(GET_MOTION_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.query_row(named_params! {":key": key}, |row| row.get(0))
        .optional()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn put_motion(conn: &Connection, key: &str, motion: &MotionRecord) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(PUT_MOTION_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {":key": key, ":data": motion})
        .err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// Deletes the given motion keys in a single transaction.
pub(crate) fn delete_motions(conn: &mut Connection, keys: &[String]) -> Result<(), Error> {
    let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
    {
        let mut stmt = tx
            .prepare_cached(DELETE_MOTION_SQL)
            .err_kind(ErrorKind::Internal)?;
        for key in keys {
            stmt.execute(params![key]).err_kind(ErrorKind::Internal)?;
        }
    }
    tx.commit().err_kind(ErrorKind::Internal)
}

/// Iterates motion records with key strictly greater than `key_gt`, in
/// ascending key order, until `f` returns `Ok(false)`.
pub(crate) fn list_motion_from(
    conn: &Connection,
    key_gt: &str,
    f: &mut dyn FnMut(&str, MotionRecord) -> Result<bool, Error>,
) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(LIST_MOTION_ASC_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! {":key": key_gt})
        .err_kind(ErrorKind::Internal)?;
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let key: String = row.get(0).err_kind(ErrorKind::Internal)?;
        let motion: MotionRecord = row.get(1).err_kind(ErrorKind::DataLoss)?;
        if !f(&key, motion)? {
            break;
        }
    }
    Ok(())
}

/// Iterates all motion records in descending key order until `f` returns
/// `Ok(false)`.
pub(crate) fn list_motion_desc(
    conn: &Connection,
    f: &mut dyn FnMut(&str, MotionRecord) -> Result<bool, Error>,
) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(LIST_MOTION_DESC_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query([]).err_kind(ErrorKind::Internal)?;
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let key: String = row.get(0).err_kind(ErrorKind::Internal)?;
        let motion: MotionRecord = row.get(1).err_kind(ErrorKind::DataLoss)?;
        if !f(&key, motion)? {
            break;
        }
    }
    Ok(())
}
