//! Transfer progress.

use std::time::Instant;

use serde::Serialize;

/// Snapshot of an active transfer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// 0.0 to 100.0; stays at 0.0 while the total is unknown
    pub percent: f64,
    /// Bytes received so far
    pub transferred: u64,
    /// Announced size, if any
    pub total: Option<u64>,
    /// Average rate since the transfer started
    pub bytes_per_second: u64,
}

impl Progress {
    /// Merge with the previous snapshot so neither counter goes backwards.
    pub fn monotonic_after(self, previous: Option<&Progress>) -> Self {
        match previous {
            Some(prev) => Self {
                percent: self.percent.max(prev.percent),
                transferred: self.transferred.max(prev.transferred),
                total: self.total.or(prev.total),
                bytes_per_second: self.bytes_per_second,
            },
            None => self,
        }
    }
}

/// Accumulates transferred bytes and produces [`Progress`] snapshots.
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    started: Instant,
    total: Option<u64>,
    transferred: u64,
}

impl ProgressMeter {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            started: Instant::now(),
            total: total.filter(|t| *t > 0),
            transferred: 0,
        }
    }

    /// Record `bytes` more and return the new snapshot.
    pub fn advance(&mut self, bytes: usize) -> Progress {
        self.transferred += bytes as u64;
        self.snapshot()
    }

    pub fn snapshot(&self) -> Progress {
        let percent = match self.total {
            Some(total) => (self.transferred as f64 / total as f64 * 100.0).min(100.0),
            None => 0.0,
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes_per_second = if elapsed > 0.0 {
            (self.transferred as f64 / elapsed) as u64
        } else {
            0
        };

        Progress {
            percent,
            transferred: self.transferred,
            total: self.total,
            bytes_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_percent() {
        let mut meter = ProgressMeter::new(Some(200));
        assert_eq!(meter.advance(50).percent, 25.0);
        let done = meter.advance(150);
        assert_eq!(done.percent, 100.0);
        assert_eq!(done.transferred, 200);
    }

    #[test]
    fn test_meter_unknown_total() {
        let mut meter = ProgressMeter::new(None);
        let p = meter.advance(1024);
        assert_eq!(p.percent, 0.0);
        assert_eq!(p.total, None);
        assert_eq!(p.transferred, 1024);
    }

    #[test]
    fn test_overshoot_capped() {
        let mut meter = ProgressMeter::new(Some(10));
        assert_eq!(meter.advance(25).percent, 100.0);
    }

    #[test]
    fn test_monotonic_after() {
        let prev = Progress {
            percent: 40.0,
            transferred: 400,
            total: Some(1000),
            bytes_per_second: 10,
        };
        let next = Progress {
            percent: 30.0,
            transferred: 300,
            total: None,
            bytes_per_second: 5,
        };
        let merged = next.monotonic_after(Some(&prev));
        assert_eq!(merged.percent, 40.0);
        assert_eq!(merged.transferred, 400);
        assert_eq!(merged.total, Some(1000));
    }
}
