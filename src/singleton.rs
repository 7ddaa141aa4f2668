//! # Double-checked locking
//!
//! [`LazySingleton`] constructs its value at most once, on first use, no
//! matter how many execution units ask for it at the same time.
//!
//! 1. Fast path: an `Acquire` load of the instance pointer. If it is set the
//!    value is returned without touching the lock.
//! 2. Slow path: take the [`SpinLock`], load again, and only if the pointer
//!    is still null run the constructor.
//! 3. The boxed value is published with a `Release` store, so a fast-path
//!    reader that sees the pointer also sees the fully constructed value.
//!
//! The lock guard and the in-progress marker are both released by `Drop`, so
//! a constructor that returns an error or panics leaves the initializer
//! [`Absent`](InitState::Absent) and the next caller retries.
//!
//! There are no statics here: the owner creates one initializer and hands it
//! out by reference (or in an `Arc`) to every consumer.

use std::collections::HashSet;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::{Cancelled, HarnessError, Result};
use crate::unit::{self, current_unit, StartGate};
use crate::{CancellationToken, SpinLock};

/// Lifecycle of a [`LazySingleton`]. `Present` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Absent,
    ConstructionInProgress,
    Present,
}

/// A value built at most once, on first use, by whichever caller gets there
/// first.
///
/// `experiment` only labels the log events of this initializer.
///
/// # Example
/// ```
/// use visibility_harness::{InitState, LazySingleton};
///
/// let config = LazySingleton::named("config-loader");
/// assert_eq!(config.state(), InitState::Absent);
///
/// let value: &String = config.get_or_init(|| "loaded".to_owned());
/// assert_eq!(value, "loaded");
/// assert_eq!(config.state(), InitState::Present);
/// assert_eq!(config.construction_attempts(), 1);
/// ```
pub struct LazySingleton<T> {
    experiment: &'static str,
    instance: AtomicPtr<T>,
    lock: SpinLock<()>,
    constructing: AtomicBool,
    attempts: AtomicUsize,
    _owns: PhantomData<Box<T>>,
}

/// Clears the in-progress marker on every exit path of the constructor.
struct Constructing<'a>(&'a AtomicBool);

impl<'a> Constructing<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Relaxed);
        Constructing(flag)
    }
}

impl Drop for Constructing<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

impl<T> LazySingleton<T> {
    /// An absent initializer whose events are logged as `experiment = "singleton"`.
    pub const fn new() -> Self {
        Self::named("singleton")
    }

    /// An absent initializer whose events are logged under `experiment`.
    pub const fn named(experiment: &'static str) -> Self {
        Self {
            experiment,
            instance: AtomicPtr::new(ptr::null_mut()),
            lock: SpinLock::new(()),
            constructing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            _owns: PhantomData,
        }
    }

    /// The instance if it has been published, without locking.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        let instance = self.instance.load(Ordering::Acquire);
        // SAFETY: a non-null pointer was published by `get_or_try_init` with
        // Release after the value was fully written, and it is only freed in
        // `Drop`, which needs `&mut self`.
        unsafe { instance.as_ref() }
    }

    /// Returns the instance, constructing it with `init` on first use.
    pub fn get_or_init<F>(&self, init: F) -> &T
    where
        F: FnOnce() -> T,
    {
        match self.get_or_try_init(|| Ok::<T, Infallible>(init())) {
            Ok(instance) => instance,
            Err(never) => match never {},
        }
    }

    /// Returns the instance, constructing it with `init` on first use.
    ///
    /// If `init` fails its error is returned, nothing is published and a
    /// later call runs its own constructor.
    pub fn get_or_try_init<F, E>(&self, init: F) -> Result<&T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(instance) = self.get() {
            return Ok(instance);
        }

        let _guard = self.lock.lock();
        if let Some(instance) = self.get() {
            debug!(
                experiment = self.experiment,
                unit = %current_unit(),
                "instance published while waiting for the lock"
            );
            return Ok(instance);
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let _constructing = Constructing::enter(&self.constructing);
        info!(experiment = self.experiment, unit = %current_unit(), attempt, "construction started");

        let value = match init() {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    experiment = self.experiment,
                    unit = %current_unit(),
                    attempt,
                    "construction failed, initializer stays absent"
                );
                return Err(err);
            }
        };

        let instance = Box::into_raw(Box::new(value));
        self.instance.store(instance, Ordering::Release);
        info!(
            experiment = self.experiment,
            unit = %current_unit(),
            attempt,
            "construction finished, instance published"
        );

        // SAFETY: freshly leaked box, freed only in `Drop`.
        Ok(unsafe { &*instance })
    }

    /// Snapshot of the lifecycle. Only `Present` stays true once observed.
    pub fn state(&self) -> InitState {
        if !self.instance.load(Ordering::Acquire).is_null() {
            InitState::Present
        } else if self.constructing.load(Ordering::Relaxed) {
            InitState::ConstructionInProgress
        } else {
            InitState::Absent
        }
    }

    /// Times a constructor was entered, failed attempts included.
    pub fn construction_attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Slow-path callers that found the lock already held.
    pub fn lock_contention(&self) -> usize {
        self.lock.contended_acquisitions()
    }
}

impl<T> Default for LazySingleton<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LazySingleton<T> {
    fn drop(&mut self) {
        let instance = *self.instance.get_mut();
        if !instance.is_null() {
            // SAFETY: came from `Box::into_raw` and nothing can borrow it now.
            drop(unsafe { Box::from_raw(instance) });
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for LazySingleton<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazySingleton")
            .field("experiment", &self.experiment)
            .field("state", &self.state())
            .field("instance", &self.get())
            .finish()
    }
}

// SAFETY: the value is built on whichever thread wins the lock and then read
// through `&T` from every thread.
unsafe impl<T: Send> Send for LazySingleton<T> {}
unsafe impl<T: Send + Sync> Sync for LazySingleton<T> {}

/// Stand-in for a value that is costly to build.
#[derive(Debug)]
pub struct ExpensiveResource {
    data: String,
}

impl ExpensiveResource {
    /// Sleeps for `cost` to simulate expensive setup, giving up with
    /// [`Cancelled`] as soon as `token` is cancelled.
    pub fn build_cancellable(token: &CancellationToken, cost: Duration) -> Result<Self, Cancelled> {
        token.sleep(cost)?;
        Ok(Self::stamped())
    }

    fn stamped() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            data: format!("Initialized at {millis}"),
        }
    }

    pub fn data(&self) -> &str {
        &self.data
    }
}

/// Parameters of one singleton run.
#[derive(Debug, Clone)]
pub struct SingletonConfig {
    /// Units calling `get_or_init` at the same time.
    pub callers: usize,
    /// How long the constructor takes, keeping later callers on the slow path.
    pub construction_delay: Duration,
    /// Bound on the wait for every caller to return.
    pub join_timeout: Duration,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            callers: 10,
            construction_delay: Duration::from_millis(10),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl SingletonConfig {
    pub fn with_callers(mut self, callers: usize) -> Self {
        self.callers = callers;
        self
    }

    pub fn with_construction_delay(mut self, delay: Duration) -> Self {
        self.construction_delay = delay;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

/// What the callers of one singleton run got back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingletonReport {
    pub callers: usize,
    /// Distinct instance addresses returned to the callers.
    pub distinct_instances: usize,
    /// Constructor calls counted by the instrumented constructor.
    pub constructions: usize,
}

impl SingletonReport {
    pub fn all_identical(&self) -> bool {
        self.distinct_instances == 1
    }
}

/// Many units racing for the first `get_or_init` of one shared initializer.
#[derive(Debug)]
pub struct SingletonExperiment {
    config: SingletonConfig,
}

impl SingletonExperiment {
    pub fn new(config: SingletonConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &'static str {
        "singleton/double-checked"
    }

    /// Releases every caller at once and collects the instance addresses
    /// they got back.
    ///
    /// Fails with [`HarnessError::UnitTimedOut`] if the callers do not all
    /// return within `join_timeout`; the constructor in flight is cancelled.
    pub fn run(&self) -> Result<SingletonReport> {
        let experiment = self.name();
        let SingletonConfig {
            callers,
            construction_delay,
            join_timeout,
        } = self.config.clone();
        if callers == 0 {
            return Err(HarnessError::InvalidConfig {
                experiment: experiment.to_owned(),
                reason: "at least one caller is required",
            });
        }

        let singleton = Arc::new(LazySingleton::<ExpensiveResource>::named(experiment));
        let constructions = Arc::new(AtomicUsize::new(0));
        let start = StartGate::new();

        let mut handles = unit::spawn_group("caller", callers, |_| {
            let singleton = Arc::clone(&singleton);
            let constructions = Arc::clone(&constructions);
            let start = start.clone();
            move |token: CancellationToken| -> Result<usize, Cancelled> {
                let instance = start.wait(&token).and_then(|()| {
                    singleton.get_or_try_init(|| {
                        constructions.fetch_add(1, Ordering::SeqCst);
                        ExpensiveResource::build_cancellable(&token, construction_delay)
                    })
                });
                match instance {
                    Ok(instance) => Ok(instance as *const ExpensiveResource as usize),
                    Err(cancelled) => {
                        token.acknowledge();
                        Err(cancelled)
                    }
                }
            }
        })?;
        start.open();

        let returned = unit::join_group(experiment, &mut handles, join_timeout)?;
        let mut addresses = HashSet::new();
        for (handle, returned) in handles.iter().zip(returned) {
            let address = returned.map_err(|_| HarnessError::Inconclusive {
                experiment: experiment.to_owned(),
                reason: format!("`{}` was cancelled before getting the instance", handle.name()),
            })?;
            addresses.insert(address);
        }

        let report = SingletonReport {
            callers,
            distinct_instances: addresses.len(),
            constructions: constructions.load(Ordering::SeqCst),
        };
        info!(
            experiment,
            unit = %current_unit(),
            callers,
            distinct = report.distinct_instances,
            constructions = report.constructions,
            contended = singleton.lock_contention(),
            data = singleton.get().map(ExpensiveResource::data).unwrap_or("<absent>"),
            "singleton experiment finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Joined;
    use std::panic::{self, AssertUnwindSafe};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn starts_absent_and_becomes_present_once() {
        let singleton = LazySingleton::<u32>::new();
        assert_eq!(singleton.state(), InitState::Absent);
        assert!(singleton.get().is_none());

        let first: *const u32 = singleton.get_or_init(|| 7);
        let second: *const u32 = singleton.get_or_init(|| 8);

        assert_eq!(first, second);
        assert_eq!(singleton.get(), Some(&7));
        assert_eq!(singleton.state(), InitState::Present);
        assert_eq!(singleton.construction_attempts(), 1);
    }

    #[test]
    fn failed_construction_is_retryable() {
        let singleton = LazySingleton::<String>::new();

        let err = singleton
            .get_or_try_init(|| Err::<String, _>("disk on fire"))
            .unwrap_err();
        assert_eq!(err, "disk on fire");
        assert_eq!(singleton.state(), InitState::Absent);

        let value = singleton
            .get_or_try_init(|| Ok::<_, &str>("second try".to_owned()))
            .unwrap();
        assert_eq!(value, "second try");
        assert_eq!(singleton.construction_attempts(), 2);
    }

    #[test]
    fn panicking_constructor_does_not_poison() {
        let singleton = LazySingleton::<u64>::new();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            singleton.get_or_init(|| panic!("constructor panicked"));
        }));
        assert!(result.is_err());
        assert_eq!(singleton.state(), InitState::Absent);

        assert_eq!(*singleton.get_or_init(|| 99), 99);
    }

    #[test]
    fn state_reports_construction_in_progress() {
        let singleton = Arc::new(LazySingleton::<u8>::new());
        let release = StartGate::new();

        let mut builder = {
            let singleton = Arc::clone(&singleton);
            let release = release.clone();
            unit::spawn("builder", move |token: CancellationToken| {
                *singleton.get_or_init(|| {
                    let _ = release.wait(&token);
                    1
                })
            })
            .unwrap()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while singleton.state() != InitState::ConstructionInProgress {
            assert!(Instant::now() < deadline, "constructor never started");
            thread::yield_now();
        }
        release.open();

        assert_eq!(
            builder.join_timeout(Duration::from_secs(5)).unwrap(),
            Joined::Finished(1)
        );
        assert_eq!(singleton.state(), InitState::Present);
    }

    #[test]
    fn stuck_constructor_fails_at_the_join_deadline() {
        crate::init_test_tracing();

        let config = SingletonConfig::default()
            .with_callers(4)
            .with_construction_delay(Duration::from_secs(60))
            .with_join_timeout(Duration::from_millis(200));

        let start = Instant::now();
        let err = SingletonExperiment::new(config).run().unwrap_err();
        assert!(matches!(
            err,
            HarnessError::UnitTimedOut { ref experiment, .. } if experiment == "singleton/double-checked"
        ));
        assert!(start.elapsed() < Duration::from_secs(5), "join was not bounded");
    }

    #[test]
    fn initializer_carries_its_experiment_label() {
        let labelled = LazySingleton::<u8>::named("singleton/labelled");
        assert!(format!("{labelled:?}").contains("singleton/labelled"));
        assert!(format!("{:?}", LazySingleton::<u8>::new()).contains("\"singleton\""));
    }

    #[test]
    fn zero_callers_is_a_config_error() {
        assert!(matches!(
            SingletonExperiment::new(SingletonConfig::default().with_callers(0)).run(),
            Err(HarnessError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn cancelled_build_leaves_the_initializer_absent() {
        let singleton = LazySingleton::named("cancel-test");
        let token = CancellationToken::new();
        token.cancel();

        let result = singleton
            .get_or_try_init(|| ExpensiveResource::build_cancellable(&token, Duration::from_secs(60)));
        assert_eq!(result.unwrap_err(), Cancelled);
        assert_eq!(singleton.state(), InitState::Absent);
    }

    #[test]
    fn concurrent_first_callers_share_one_instance() {
        crate::init_test_tracing();

        let report = SingletonExperiment::new(SingletonConfig::default())
            .run()
            .unwrap();

        assert_eq!(report.callers, 10);
        assert!(report.all_identical());
        assert_eq!(report.constructions, 1);
    }

    #[test]
    fn instance_is_dropped_with_the_initializer() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let singleton = LazySingleton::new();
            singleton.get_or_init(|| Tracked(Arc::clone(&drops)));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
