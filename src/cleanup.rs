// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Disk cleanup: a low-cadence loop, separate from the supervisor tick,
//! that reclaims space once usage crosses the configured capacity.
//!
//! Reclaim order is oldest motion record first; each record's artifacts
//! (event playlist and extracted frames) go with it. A record may still be
//! pending when its media is reclaimed; the processing supervisor then fails
//! it with a precise reason on its next claim scan.

use base::{Error, ErrorKind, ResultExt as _};
use db::Database;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Records deleted per store transaction.
const BATCH: usize = 16;

/// Disk statistics are collaborator-provided; this seam keeps the loop
/// testable without filling a filesystem.
pub trait DiskStats: Send + Sync {
    /// Percentage of the filesystem holding `path` that is in use.
    fn usage_pct(&self, path: &Path) -> Result<f64, Error>;
}

pub struct StatvfsStats;

impl DiskStats for StatvfsStats {
    fn usage_pct(&self, path: &Path) -> Result<f64, Error> {
        let vfs = nix::sys::statvfs::statvfs(path).err_kind(ErrorKind::Internal)?;
        let blocks = vfs.blocks() as f64;
        if blocks <= 0.0 {
            return Ok(0.0);
        }
        let available = vfs.blocks_available() as f64;
        Ok((blocks - available) / blocks * 100.0)
    }
}

pub struct Cleaner {
    db: Arc<Database>,
    stats: Box<dyn DiskStats>,
}

impl Cleaner {
    pub fn new(db: Arc<Database>, stats: Box<dyn DiskStats>) -> Self {
        Cleaner { db, stats }
    }

    /// Runs until shutdown, sweeping at the configured cadence.
    pub async fn run(mut self, mut shutdown_rx: base::shutdown::Receiver) {
        loop {
            let interval = self
                .db
                .lock()
                .get_settings()
                .map(|s| s.cleanup_interval_secs.max(1))
                .unwrap_or(60);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                    if let Err(e) = self.sweep() {
                        warn!("disk cleanup sweep failed: {}", e.chain());
                    }
                }
                _ = shutdown_rx.wait() => break,
            }
        }
        debug!("disk cleanup loop exiting");
    }

    /// One sweep: when usage exceeds the threshold, delete oldest motion
    /// records (and their artifacts) until it doesn't. Returns how many
    /// records were reclaimed.
    pub fn sweep(&mut self) -> Result<usize, Error> {
        let settings = self.db.lock().get_settings()?;
        if settings.base_dir.as_os_str().is_empty() {
            return Ok(0);
        }
        let threshold = f64::from(settings.cleanup_capacity_pct);
        let mut usage = self.stats.usage_pct(&settings.base_dir)?;
        if usage <= threshold {
            return Ok(0);
        }
        info!(
            "disk usage {usage:.1}% exceeds {threshold}%, reclaiming oldest motion records"
        );

        let mut reclaimed = 0;
        let mut freed: u64 = 0;
        loop {
            let mut batch: Vec<(String, Option<PathBuf>)> = Vec::new();
            self.db.lock().list_motion_from("", &mut |key, record| {
                batch.push((key.to_owned(), record.playlist_path));
                Ok(batch.len() < BATCH)
            })?;
            if batch.is_empty() {
                warn!("disk still over capacity with no motion records left to reclaim");
                break;
            }
            for (key, playlist) in &batch {
                if let Some(playlist) = playlist {
                    freed += delete_artifacts(key, playlist);
                }
            }
            let keys: Vec<String> = batch.into_iter().map(|(k, _)| k).collect();
            self.db.lock().delete_motions(&keys)?;
            reclaimed += keys.len();

            usage = self.stats.usage_pct(&settings.base_dir)?;
            if usage <= threshold {
                break;
            }
        }
        info!(
            "reclaimed {reclaimed} motion records ({}); disk usage now {usage:.1}%",
            base::strutil::encode_size(freed as i64)
        );
        Ok(reclaimed)
    }
}

/// Removes an episode's playlist and extracted frames, returning the bytes
/// freed. Best-effort; the record deletion proceeds regardless.
fn delete_artifacts(movement_key: &str, playlist: &Path) -> u64 {
    let mut freed = 0;
    let frame_prefix = format!("mov{movement_key}_");
    if let Some(dir) = playlist.parent() {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(&frame_prefix) && name.ends_with(".jpg") {
                    let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    if std::fs::remove_file(entry.path()).is_ok() {
                        freed += len;
                    }
                }
            }
        }
    }
    let len = std::fs::metadata(playlist).map(|m| m.len()).unwrap_or(0);
    match std::fs::remove_file(playlist) {
        Ok(()) => freed += len,
        Err(e) => debug!("removing {} failed: {e}", playlist.display()),
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::testutil::TestDb;
    use std::sync::Mutex;

    /// Scripted usage readings; the last value repeats.
    struct FakeStats(Mutex<Vec<f64>>);

    impl DiskStats for FakeStats {
        fn usage_pct(&self, _path: &Path) -> Result<f64, Error> {
            let mut v = self.0.lock().unwrap();
            if v.len() > 1 {
                Ok(v.remove(0))
            } else {
                Ok(v[0])
            }
        }
    }

    fn cleaner(t: &TestDb, readings: Vec<f64>) -> Cleaner {
        Cleaner::new(t.db.clone(), Box::new(FakeStats(Mutex::new(readings))))
    }

    #[test]
    fn under_threshold_is_a_no_op() {
        let t = TestDb::new();
        t.insert_motion(1_000, 0);
        let mut c = cleaner(&t, vec![50.0]);
        assert_eq!(c.sweep().unwrap(), 0);
        assert!(t.db.lock().get_motion(&db::motion_key(1_000)).unwrap().is_some());
    }

    #[test]
    fn reclaims_oldest_records_and_artifacts() {
        let t = TestDb::new();
        let old_key = t.insert_motion(1_000, 0);
        let new_key = t.insert_motion(2_000, 0);

        // Give the old record artifacts on disk.
        let playlist = t.stream_dir().join(format!("mov{old_key}.m3u8"));
        std::fs::write(&playlist, "#EXTM3U\n").unwrap();
        let frame = t.stream_dir().join(format!("mov{old_key}_0001.jpg"));
        std::fs::write(&frame, b"jpeg").unwrap();
        {
            let l = t.db.lock();
            let mut record = l.get_motion(&old_key).unwrap().unwrap();
            record.playlist_path = Some(playlist.clone());
            l.put_motion(&old_key, &record).unwrap();
        }

        // Over capacity once, then fine: one batch suffices. Both fixture
        // records fit in a single batch, so both go; the point is order and
        // artifact removal.
        let mut c = cleaner(&t, vec![95.0, 50.0]);
        let reclaimed = c.sweep().unwrap();
        assert_eq!(reclaimed, 2);
        assert!(t.db.lock().get_motion(&old_key).unwrap().is_none());
        assert!(t.db.lock().get_motion(&new_key).unwrap().is_none());
        assert!(!playlist.exists());
        assert!(!frame.exists());
    }

    #[test]
    fn stops_when_store_is_empty() {
        let t = TestDb::new();
        let mut c = cleaner(&t, vec![95.0]);
        assert_eq!(c.sweep().unwrap(), 0);
    }
}
