//! Debug telemetry accumulated by an engine.

use std::time::Instant;

use serde::Serialize;

/// Operation count and timings, accumulated over all calculations of one
/// engine that ran with [`Settings::debug`](crate::Settings::debug) enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DebugInfo {
    /// Applied operations, counted `n` per operation.
    pub number_of_operations: u64,
    /// Time spent moving inputs to and outputs from the device.
    pub nanoseconds_data_copy: u64,
    /// Time spent building kernels.
    pub nanoseconds_program_build: u64,
    /// Time spent executing kernels.
    pub nanoseconds_calculation: u64,
}

impl DebugInfo {
    /// Clears all counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Wall-clock stopwatch that only measures when enabled.
#[derive(Debug)]
pub(crate) struct Stopwatch {
    start: Option<Instant>,
}

impl Stopwatch {
    pub(crate) fn start(enabled: bool) -> Self {
        Self {
            start: enabled.then(Instant::now),
        }
    }

    /// Nanoseconds since start (or the last lap), restarting the watch.
    pub(crate) fn lap(&mut self) -> u64 {
        match self.start.as_mut() {
            Some(start) => {
                let now = Instant::now();
                let elapsed = now.duration_since(*start).as_nanos() as u64;
                *start = now;
                elapsed
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_stopwatch_reports_zero() {
        let mut watch = Stopwatch::start(false);
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert_eq!(watch.lap(), 0);
    }

    #[test]
    fn test_enabled_stopwatch_measures() {
        let mut watch = Stopwatch::start(true);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(watch.lap() >= 1_000_000);
    }

    #[test]
    fn test_reset() {
        let mut info = DebugInfo {
            number_of_operations: 8,
            nanoseconds_calculation: 10,
            ..DebugInfo::default()
        };
        info.reset();
        assert_eq!(info, DebugInfo::default());
    }
}
