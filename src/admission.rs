//! Adaptive limit on concurrently playing sources
//!
//! After every mix call the device reports how long mixing took and how many
//! sources were active. The limit follows the number of sources that fit in
//! the mix deadline: it climbs by at most one per call and drops straight to
//! a lower value. With no limits configured the policy admits everything.

use crate::error::{PetalSonicError, Result};
use crate::source::PRIORITY_ALWAYS_ADMIT;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounds for the adaptive source limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub low: usize,
    /// Limit used whenever nothing is playing.
    pub start: usize,
    pub high: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            low: 4,
            start: 8,
            high: 64,
        }
    }
}

impl AdmissionLimits {
    pub fn validate(&self) -> Result<()> {
        if self.low == 0 || self.low > self.start || self.start > self.high {
            return Err(PetalSonicError::Configuration(format!(
                "admission limits must satisfy 0 < low <= start <= high, got {}/{}/{}",
                self.low, self.start, self.high
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct AdmissionControl {
    limits: Option<AdmissionLimits>,
    max_sources: AtomicUsize,
    cores: usize,
}

impl AdmissionControl {
    pub fn new(limits: Option<AdmissionLimits>) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_cores(limits, cores)
    }

    pub fn with_cores(limits: Option<AdmissionLimits>, cores: usize) -> Self {
        let start = limits.map(|l| l.start).unwrap_or(usize::MAX);
        Self {
            limits,
            max_sources: AtomicUsize::new(start),
            cores,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limits.is_some()
    }

    /// Current limit, or `None` when admission control is off.
    pub fn max_sources(&self) -> Option<usize> {
        self.limits.map(|_| self.max_sources.load(Ordering::Relaxed))
    }

    /// Time budget for mixing `samples` frames: half the period with more
    /// than one core, a fifth otherwise.
    pub fn mix_deadline_us(&self, samples: usize, frequency: u32) -> u64 {
        let period_us = samples as u64 * 1_000_000 / frequency.max(1) as u64;
        if self.cores > 1 { period_us / 2 } else { period_us / 5 }
    }

    /// Feeds one mix call's timing back into the limit. Returns the old and
    /// new limit when it changed.
    pub fn update(&self, elapsed_us: u64, active_sources: usize, samples: usize, frequency: u32) -> Option<(usize, usize)> {
        let limits = self.limits?;
        let current = self.max_sources.load(Ordering::Relaxed);

        let next = if active_sources > 0 {
            let time_per_source = (elapsed_us / active_sources as u64).max(1);
            let within_deadline = (self.mix_deadline_us(samples, frequency) / time_per_source) as usize;
            let target = within_deadline.max(limits.low).min(limits.high);
            if target > current {
                current + 1
            } else {
                target
            }
        } else {
            limits.start
        };

        if next == current {
            return None;
        }
        self.max_sources.store(next, Ordering::Relaxed);
        Some((current, next))
    }

    /// Whether one more source may start when `active_sources` are playing.
    /// `priority_slots` of the limit are held back for sources marked
    /// [`PRIORITY_ALWAYS_ADMIT`], which are never refused.
    pub fn can_admit(&self, active_sources: usize, priority: u8, priority_slots: usize) -> bool {
        let Some(max) = self.max_sources() else {
            return true;
        };
        priority >= PRIORITY_ALWAYS_ADMIT || active_sources + priority_slots < max
    }
}

impl Default for AdmissionControl {
    fn default() -> Self {
        Self::new(None)
    }
}
