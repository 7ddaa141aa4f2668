//! # Lost updates
//!
//! [`RaceCounter::increment`] is a load followed by a store, each `Relaxed`.
//! Both halves are individually atomic, so there is no undefined behaviour,
//! but the pair is not: two units that load the same value both store
//! `value + 1` and one increment is lost. Visibility does not help here; only
//! an indivisible read-modify-write such as
//! [`increment_atomic`](RaceCounter::increment_atomic) does.
//!
//! Whether updates are actually lost on a given run depends on the scheduler
//! and the hardware. [`RaceReport`] therefore only promises
//! `1 <= observed <= expected`; losing updates is likely, never guaranteed.

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::unit::{self, current_unit, StartGate};
use crate::CancellationToken;

/// Incrementers check their cancellation token once per this many increments.
const CANCEL_POLL_INTERVAL: u64 = 1 << 10;

/// Integer cell with a deliberately non-atomic increment.
#[derive(Debug, Default)]
pub struct RaceCounter {
    value: AtomicU64,
}

impl RaceCounter {
    /// A counter starting at zero.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Read, add one, write. Concurrent calls may overwrite each other.
    #[inline]
    pub fn increment(&self) {
        let current = self.value.load(Ordering::Relaxed);
        self.value
            .store(black_box(current) + 1, Ordering::Relaxed);
    }

    /// Indivisible increment; never loses an update.
    #[inline]
    pub fn increment_atomic(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value. Only meaningful once every incrementing unit has joined.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Parameters of one race run: `units` incrementers, `increments_per_unit`
/// each, all joined within `join_timeout`.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub units: usize,
    pub increments_per_unit: u64,
    /// Use [`RaceCounter::increment_atomic`] instead of the racy increment.
    pub atomic: bool,
    pub join_timeout: Duration,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            units: 10,
            increments_per_unit: 1000,
            atomic: false,
            join_timeout: Duration::from_secs(10),
        }
    }
}

impl RaceConfig {
    pub fn with_units(mut self, units: usize) -> Self {
        self.units = units;
        self
    }

    pub fn with_increments(mut self, increments_per_unit: u64) -> Self {
        self.increments_per_unit = increments_per_unit;
        self
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

/// Final counter value next to the value a lossless run would reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceReport {
    /// `units * increments_per_unit`.
    pub expected: u64,
    pub observed: u64,
}

impl RaceReport {
    pub fn lost_updates(&self) -> u64 {
        self.expected.saturating_sub(self.observed)
    }

    pub fn lost_any(&self) -> bool {
        self.observed < self.expected
    }

    /// The only hard guarantee of the racy counter.
    pub fn in_bounds(&self) -> bool {
        (1..=self.expected).contains(&self.observed)
    }
}

/// K units each incrementing one shared counter M times.
#[derive(Debug)]
pub struct RaceExperiment {
    config: RaceConfig,
}

impl RaceExperiment {
    pub fn new(config: RaceConfig) -> Self {
        Self { config }
    }

    /// `race/racy` or `race/atomic`, used as the `experiment` log field.
    pub fn name(&self) -> &'static str {
        if self.config.atomic {
            "race/atomic"
        } else {
            "race/racy"
        }
    }

    /// Runs every incrementer to completion and reports the final count.
    ///
    /// Fails with [`HarnessError::UnitTimedOut`] if the group does not finish
    /// within `join_timeout`, and with [`HarnessError::InvalidConfig`] when
    /// `units` is zero.
    pub fn run(&self) -> Result<RaceReport> {
        let RaceConfig {
            units,
            increments_per_unit,
            atomic,
            join_timeout,
        } = self.config;
        let experiment = self.name();
        if units == 0 {
            return Err(HarnessError::InvalidConfig {
                experiment: experiment.to_owned(),
                reason: "at least one incrementer is required",
            });
        }

        let counter = Arc::new(RaceCounter::new());
        // Release all units together to widen the window for interleaving.
        let start = StartGate::new();

        let mut handles = unit::spawn_group("incrementer", units, |_| {
            let counter = Arc::clone(&counter);
            let start = start.clone();
            move |token: CancellationToken| {
                if start.wait(&token).is_err() {
                    token.acknowledge();
                    return;
                }
                for i in 0..increments_per_unit {
                    if i % CANCEL_POLL_INTERVAL == 0 && token.is_cancelled() {
                        token.acknowledge();
                        return;
                    }
                    if atomic {
                        counter.increment_atomic();
                    } else {
                        counter.increment();
                    }
                }
            }
        })?;
        start.open();

        unit::join_group(experiment, &mut handles, join_timeout)?;

        let report = RaceReport {
            expected: units as u64 * increments_per_unit,
            observed: counter.value(),
        };
        if report.lost_any() {
            info!(
                experiment,
                unit = %current_unit(),
                expected = report.expected,
                observed = report.observed,
                lost = report.lost_updates(),
                "updates lost to the read-modify-write race"
            );
        } else if !atomic && units > 1 {
            warn!(
                experiment,
                unit = %current_unit(),
                expected = report.expected,
                "no updates lost this run; the race did not manifest"
            );
        } else {
            info!(experiment, unit = %current_unit(), observed = report.observed, "all updates kept");
        }
        Ok(report)
    }
}
