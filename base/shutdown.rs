// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! Dropping the [`Sender`] requests shutdown. The [`Receiver`] can be cloned,
//! checked synchronously, or awaited in async code.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

pub struct Sender(#[allow(dead_code)] watch::Sender<()>);

#[derive(Clone)]
pub struct Receiver(watch::Receiver<()>);

impl Receiver {
    /// Returns an error iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.requested() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    pub fn requested(&self) -> bool {
        self.0.has_changed().is_err()
    }

    /// Completes when shutdown is requested.
    pub async fn wait(&mut self) {
        // `changed` returns `Err` once the sender is dropped.
        while self.0.changed().await.is_ok() {}
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown.
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = watch::channel(());
    (Sender(tx), Receiver(rx))
}
