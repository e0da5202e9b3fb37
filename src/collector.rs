//! Clock registry & collector.
//!
//! `collect` is the heart of scheduling bootstrap: it binds every
//! newly created source to a default clock if the script/caller never
//! gave it one, harvests the whole clock registry under one lock, and
//! then runs startup for everything harvested, outside any lock. This
//! is the process-wide generalization of `Clock::start_outputs`'s own
//! two-phase split: sources created "simultaneously" start together.

use crate::clock::{Clock, ClockHandle, ClockVariable, Wallclock};
use crate::source::{self, ActiveSource};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// One-shot monotonic progression of the process's overall startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Started {
    No,
    Soon,
    Yes,
}

struct GlobalState {
    started: Started,
    after_collect_tasks: u64,
    registry: Vec<Weak<dyn ClockHandle>>,
    shutdown_requested: bool,
}

impl GlobalState {
    fn fresh() -> Self {
        Self {
            started: Started::No,
            // A fake task held open until `start()` is called, so an
            // early `collect()` triggered by source construction
            // during initial configuration loading is a no-op
            // (invariant 5).
            after_collect_tasks: 1,
            registry: Vec::new(),
            shutdown_requested: false,
        }
    }
}

static STATE: OnceLock<Mutex<GlobalState>> = OnceLock::new();
static DEFAULT_CLOCK: Mutex<Option<Arc<Wallclock>>> = Mutex::new(None);
static SETTINGS: OnceLock<Mutex<ClockSettings>> = OnceLock::new();

/// The pacing/error-handling knobs the default clock is built from,
/// sourced from a loaded [`crate::config::Config`] (or its defaults if
/// none was ever applied).
#[derive(Debug, Clone, Copy)]
struct ClockSettings {
    max_latency: Duration,
    allow_streaming_errors: bool,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_secs(60),
            allow_streaming_errors: false,
        }
    }
}

fn settings() -> &'static Mutex<ClockSettings> {
    SETTINGS.get_or_init(|| Mutex::new(ClockSettings::default()))
}

/// Apply a loaded configuration's `clock.*`/`root.*` settings to the
/// clocks the collector manages. Must be called before `default_clock()`
/// is first accessed (i.e. before `start()`) to have any effect — like
/// any other `Wallclock`, the default clock's pacing parameters are
/// fixed at construction, not re-read per tick.
pub fn configure(config: &crate::config::Config) {
    *settings().lock() = ClockSettings {
        max_latency: Duration::from_secs_f64(config.root.max_latency),
        allow_streaming_errors: config.clock.allow_streaming_errors,
    };
}

/// The default "main" wallclock, lazily constructed from whatever
/// settings `configure()` last applied (or its built-in defaults if it
/// was never called).
///
/// Frame duration (1024 samples @ 44100 Hz ≈ 23.2ms) is fixed
/// regardless of configuration — it isn't one of the recognized
/// config keys; a caller that wants different framing constructs its
/// own [`Wallclock`] and attaches sources to it directly instead of
/// relying on collection's default-binding behavior.
pub fn default_clock() -> Arc<Wallclock> {
    let mut slot = DEFAULT_CLOCK.lock();
    if let Some(wc) = slot.as_ref() {
        return wc.clone();
    }

    let cfg = *settings().lock();
    let wc = Wallclock::new(
        "main".to_string(),
        Duration::from_secs_f64(1024.0 / 44_100.0),
        cfg.max_latency,
        cfg.allow_streaming_errors,
    );
    register_clock(wc.clone());
    *slot = Some(wc.clone());
    wc
}

/// Register a clock (of any kind implementing [`ClockHandle`]) into
/// the process-wide weak registry. The registry holds only weak
/// references; an unreferenced clock is dropped without any explicit
/// unregistration call.
pub fn register_clock<C: ClockHandle + 'static>(clock: Arc<C>) {
    let handle: Arc<dyn ClockHandle> = clock;
    state().lock().registry.push(Arc::downgrade(&handle));
}

/// Request a global shutdown. Never raises — the caller (a clock's
/// driving thread, or `collect` itself on a boot-time startup
/// failure) must survive to let pending `leave` calls complete.
pub fn request_shutdown() {
    let mut st = state().lock();
    if !st.shutdown_requested {
        st.shutdown_requested = true;
        tracing::error!("global shutdown requested");
    }
}

pub fn shutdown_requested() -> bool {
    state().lock().shutdown_requested
}

/// Assign the default clock to every still-unbound new source, then
/// harvest the whole registry and run startup outside any lock.
///
/// A no-op while `after_collect_tasks > 0` (invariant 5) — some other
/// in-progress `collect_after` task, or initial boot, isn't ready for
/// sources to start yet.
pub fn collect() {
    let (thunks, started_before, run_post_step) = {
        let mut st = state().lock();
        if st.after_collect_tasks > 0 {
            return;
        }

        source::iterate_new_outputs(|s| {
            if !s.clock_variable().is_known() {
                let _ = ClockVariable::unify(
                    s.clock_variable(),
                    &ClockVariable::known(default_clock().clock_arc()),
                );
            }
        });

        st.registry.retain(|w| w.strong_count() > 0);
        let thunks: Vec<_> = st
            .registry
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|c| c.harvest_thunk(&|_| true))
            .collect();

        let started_before = st.started;
        let run_post_step = if st.started == Started::No {
            st.started = Started::Soon;
            true
        } else {
            false
        };

        (thunks, started_before, run_post_step)
    };

    let mut errors = Vec::new();
    for thunk in thunks {
        errors.extend(thunk());
    }

    if !errors.is_empty() && started_before != Started::Yes {
        // A startup failure collected during initial boot (before
        // `start()` has flipped `started` to `Yes`) takes down the
        // whole process rather than limping on without that source.
        request_shutdown();
    }

    if run_post_step {
        tracing::info!("main phase starts");
        state().lock().started = Started::Yes;
    }
}

/// Run `f`, deferring collection until it (and any nested
/// `collect_after` it triggers) has finished — even if `f` unwinds.
pub fn collect_after<F, T>(f: F) -> T
where
    F: FnOnce() -> T,
{
    state().lock().after_collect_tasks += 1;

    struct Guard;
    impl Drop for Guard {
        fn drop(&mut self) {
            state().lock().after_collect_tasks -= 1;
            collect();
        }
    }
    let _guard = Guard;

    f()
}

/// Synchronous variant used at early boot: assigns the default clock
/// to filtered new sources, then runs `start_outputs(filter)` on every
/// registered clock directly (bypassing `after_collect_tasks`), and
/// returns the concatenated error list.
pub fn force_init(
    filter: &(dyn Fn(&Arc<dyn ActiveSource>) -> bool + Send + Sync),
) -> Vec<(Arc<dyn ActiveSource>, crate::error::ClockError)> {
    source::iterate_new_outputs(|s| {
        if filter(s) && !s.clock_variable().is_known() {
            let _ = ClockVariable::unify(
                s.clock_variable(),
                &ClockVariable::known(default_clock().clock_arc()),
            );
        }
    });

    let registry: Vec<Weak<dyn ClockHandle>> = {
        let mut st = state().lock();
        st.registry.retain(|w| w.strong_count() > 0);
        st.registry.clone()
    };

    registry
        .into_iter()
        .filter_map(|w| w.upgrade())
        .flat_map(|c| c.harvest_thunk(filter)())
        .collect()
}

/// Must be called exactly once, after initial configuration is
/// loaded. Releases the boot-time fake task and runs the first real
/// collection.
pub fn start() {
    {
        let mut st = state().lock();
        st.after_collect_tasks = st.after_collect_tasks.saturating_sub(1);
    }
    collect();
}

/// Detach every source on every registered clock. Driving threads
/// notice the empty `outputs` at the next loop iteration and exit.
pub fn stop() {
    let registry: Vec<Weak<dyn ClockHandle>> = state().lock().registry.clone();
    for weak in registry {
        if let Some(c) = weak.upgrade() {
            c.detach_all();
        }
    }
}

/// Test-only: restore collector globals to a fresh state so scenario
/// tests don't leak `after_collect_tasks`/`started`/default-clock
/// state into each other. Tests that touch this are `#[serial]`.
#[cfg(any(test, feature = "test-util"))]
pub fn reset_for_test() {
    *state().lock() = GlobalState::fresh();
    *DEFAULT_CLOCK.lock() = None;
    *settings().lock() = ClockSettings::default();
}
