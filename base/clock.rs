// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn realtime(&self) -> jiff::Timestamp;

    /// Gets the current time from a monotonic clock, as a duration since an
    /// arbitrary origin.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Duration;

    /// Current wall-clock time in milliseconds since the Unix epoch.
    fn realtime_ms(&self) -> i64 {
        self.realtime().as_millisecond()
    }
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: nix::time::ClockId) -> Duration {
        // `clock_gettime` on a supported clock only fails in a broken
        // environment; main() verifies it works before anything else.
        let ts = nix::time::clock_gettime(clock).expect("clock_gettime failed");
        Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32)
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Duration {
        self.get(nix::time::ClockId::CLOCK_BOOTTIME)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Duration {
        self.get(nix::time::ClockId::CLOCK_MONOTONIC)
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: jiff::Timestamp,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }

    /// Advances the clock by the specified amount without actually sleeping.
    pub fn advance(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock().unwrap();
        *l += how_long;
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> jiff::Timestamp {
        let uptime = *self.0.uptime.lock().unwrap();
        self.0
            .boot
            .checked_add(jiff::SignedDuration::try_from(uptime).unwrap())
            .unwrap()
    }

    fn monotonic(&self) -> Duration {
        *self.0.uptime.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advance() {
        let boot: jiff::Timestamp = "2026-03-01T00:00:00Z".parse().unwrap();
        let c = SimulatedClocks::new(boot);
        assert_eq!(c.monotonic(), Duration::ZERO);
        c.advance(Duration::from_millis(1500));
        assert_eq!(c.monotonic(), Duration::from_millis(1500));
        assert_eq!(c.realtime_ms(), boot.as_millisecond() + 1500);
    }

    #[test]
    fn real_monotonic_is_nondecreasing() {
        let c = RealClocks::default();
        let a = c.monotonic();
        let b = c.monotonic();
        assert!(b >= a);
    }
}
