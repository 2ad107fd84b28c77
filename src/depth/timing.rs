//! Per-phase timing diagnostics.
//!
//! Each pipeline phase keeps an exponential moving average of its wall time;
//! call rates are folded in about once per second. Reported through
//! `tracing` at debug level.

use std::time::{Duration, Instant};

use tracing::debug;

/// One timed phase of the mapping pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Observe,
    FillHoles,
    Regularize,
    Propagate,
    SetDepth,
    Update,
    Create,
    Finalize,
}

const NUM_PHASES: usize = 8;

impl Phase {
    fn index(self) -> usize {
        match self {
            Phase::Observe => 0,
            Phase::FillHoles => 1,
            Phase::Regularize => 2,
            Phase::Propagate => 3,
            Phase::SetDepth => 4,
            Phase::Update => 5,
            Phase::Create => 6,
            Phase::Finalize => 7,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Phase::Observe => "observe",
            Phase::FillHoles => "fill_holes",
            Phase::Regularize => "regularize",
            Phase::Propagate => "propagate",
            Phase::SetDepth => "set_depth",
            Phase::Update => "update",
            Phase::Create => "create",
            Phase::Finalize => "finalize",
        }
    }
}

const ALL_PHASES: [Phase; NUM_PHASES] = [
    Phase::Observe,
    Phase::FillHoles,
    Phase::Regularize,
    Phase::Propagate,
    Phase::SetDepth,
    Phase::Update,
    Phase::Create,
    Phase::Finalize,
];

#[derive(Debug, Clone, Copy, Default)]
struct PhaseStat {
    ema_ms: f64,
    count: u32,
    hz: f64,
}

/// Moving-average timing over all pipeline phases.
#[derive(Debug)]
pub struct PhaseTimings {
    stats: [PhaseStat; NUM_PHASES],
    last_rate_sample: Instant,
}

impl PhaseTimings {
    pub fn new() -> Self {
        Self {
            stats: [PhaseStat::default(); NUM_PHASES],
            last_rate_sample: Instant::now(),
        }
    }

    /// Fold one phase execution into its moving average.
    pub(crate) fn record(&mut self, phase: Phase, elapsed: Duration) {
        let stat = &mut self.stats[phase.index()];
        let ms = elapsed.as_secs_f64() * 1e3;
        stat.ema_ms = 0.9 * stat.ema_ms + 0.1 * ms;
        stat.count += 1;
    }

    /// Moving-average milliseconds of one phase.
    pub fn ema_ms(&self, phase: Phase) -> f64 {
        self.stats[phase.index()].ema_ms
    }

    /// Moving-average call rate of one phase in Hz.
    pub fn rate_hz(&self, phase: Phase) -> f64 {
        self.stats[phase.index()].hz
    }

    /// Fold accumulated call counts into the per-phase rates and log a
    /// one-line summary. No-op when called more often than once a second.
    pub fn sample_rates(&mut self) {
        let secs = self.last_rate_sample.elapsed().as_secs_f64();
        if secs < 1.0 {
            return;
        }
        self.last_rate_sample = Instant::now();

        for stat in &mut self.stats {
            stat.hz = 0.8 * stat.hz + 0.2 * (stat.count as f64 / secs);
            stat.count = 0;
        }

        let mut line = String::new();
        for phase in ALL_PHASES {
            let stat = &self.stats[phase.index()];
            line.push_str(&format!(
                "{} {:.1}ms ({:.1}Hz); ",
                phase.name(),
                stat.ema_ms,
                stat.hz
            ));
        }
        debug!("[Timing] {}", line.trim_end_matches("; "));
    }
}

impl Default for PhaseTimings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_moves_towards_samples() {
        let mut t = PhaseTimings::new();
        for _ in 0..200 {
            t.record(Phase::Observe, Duration::from_millis(10));
        }
        let ema = t.ema_ms(Phase::Observe);
        assert!(ema > 9.9 && ema <= 10.0, "ema = {}", ema);
        assert_eq!(t.ema_ms(Phase::Propagate), 0.0);
    }
}
