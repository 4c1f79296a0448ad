// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Push notifications for motion-record mutations.
//!
//! Every store mutation that changes a motion record broadcasts an event.
//! The delivery mechanism (SSE) lives outside this crate; here there is only
//! the seam.

use db::MotionRecord;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PushEvent {
    MovementNew,
    MovementUpdate,
    MovementComplete,
}

impl fmt::Display for PushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PushEvent::MovementNew => "movement_new",
            PushEvent::MovementUpdate => "movement_update",
            PushEvent::MovementComplete => "movement_complete",
        })
    }
}

pub trait PushSink: Send + Sync {
    fn broadcast(&self, event: PushEvent, movement_key: &str, movement: &MotionRecord);

    /// Fired every 30 ticks to keep idle client connections open.
    fn keep_alive(&self) {}
}

/// Fans events out over a tokio broadcast channel; the HTTP layer subscribes
/// on the other end. Slow or absent subscribers never block the supervisor.
pub struct ChannelSink {
    tx: broadcast::Sender<String>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        ChannelSink { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl PushSink for ChannelSink {
    fn broadcast(&self, event: PushEvent, movement_key: &str, movement: &MotionRecord) {
        let payload = serde_json::json!({
            "event": event.to_string(),
            "key": movement_key,
            "movement": movement,
        });
        // A send error just means nobody is subscribed right now.
        let _ = self.tx.send(payload.to_string());
    }

    fn keep_alive(&self) {
        let _ = self.tx.send(String::new());
    }
}

/// Discards everything; for tests.
#[derive(Default)]
pub struct NullSink;

impl PushSink for NullSink {
    fn broadcast(&self, event: PushEvent, movement_key: &str, _movement: &MotionRecord) {
        debug!("push {event} for {movement_key} discarded");
    }
}
