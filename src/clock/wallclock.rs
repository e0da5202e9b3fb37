//! Wallclock.
//!
//! A wallclock embeds a base [`Clock`] and adds a driving thread that
//! calls `end_tick` paced by real time (`sync = true`) or, once a
//! blocking source delegates pacing, as fast as `end_tick`
//! returns. The driving thread is spawned lazily and idempotently the
//! first time `start_outputs` leaves at least one source in
//! `outputs` — not eagerly at construction, since a wallclock with no
//! sources yet has nothing to pace.

use super::base::Clock;
use super::ClockHandle;
use crate::error::ClockError;
use crate::source::ActiveSource;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Wallclock {
    clock: Arc<Clock>,
    frame_duration: Duration,
    max_latency: Duration,
    /// `true` = paced by real time, `false` = delegated to blocking
    /// sources' own I/O. Shared with whatever registers/
    /// unregisters blocking sources, hence an atomic rather than a
    /// thread-local.
    sync: AtomicBool,
    running: Mutex<bool>,
}

impl Wallclock {
    pub fn new(
        id: String,
        frame_duration: Duration,
        max_latency: Duration,
        allow_streaming_errors: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock: Arc::new(Clock::with_options(id, allow_streaming_errors)),
            frame_duration,
            max_latency,
            sync: AtomicBool::new(true),
            running: Mutex::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.clock.id
    }

    pub fn clock_arc(&self) -> Arc<Clock> {
        self.clock.clone()
    }

    pub fn max_latency(&self) -> Duration {
        self.max_latency
    }

    pub fn allow_streaming_errors(&self) -> bool {
        self.clock.allow_streaming_errors()
    }

    pub fn attach(&self, s: Arc<dyn ActiveSource>) {
        self.clock.attach(s);
    }

    pub fn detach(&self, pred: impl Fn(&Arc<dyn ActiveSource>) -> bool) {
        self.clock.detach(pred);
    }

    pub fn get_tick(&self) -> u64 {
        self.clock.get_tick()
    }

    pub fn is_sync(&self) -> bool {
        self.sync.load(Ordering::SeqCst)
    }

    pub fn set_sync(&self, sync: bool) {
        self.sync.store(sync, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Harvest, run startup, and (idempotently) spawn the driving
    /// thread if any source survived startup. Returns the startup
    /// errors from the sources that failed to come up; a failure to
    /// spawn the driving thread itself is logged and surfaced as an
    /// error against every source that just started, since none of
    /// them will actually be driven.
    pub fn start_outputs(
        self: &Arc<Self>,
        filter: &(dyn Fn(&Arc<dyn ActiveSource>) -> bool + Send + Sync),
    ) -> Vec<(Arc<dyn ActiveSource>, ClockError)> {
        let thunk = Clock::harvest(&self.clock, filter);
        let errors = thunk.run();
        if let Err(e) = self.maybe_spawn_thread() {
            for (_, s) in self.clock.outputs_snapshot() {
                tracing::error!("[{}] '{}' started with no driving thread: {}", self.clock.id, s, e);
            }
        }
        errors
    }

    fn maybe_spawn_thread(self: &Arc<Self>) -> Result<(), ClockError> {
        if self.clock.is_empty() {
            return Ok(());
        }
        let mut running = self.running.lock();
        if *running {
            return Ok(());
        }
        *running = true;
        drop(running);

        let wc = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("wallclock-{}", wc.clock.id))
            .spawn(move || wc.drive());

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                *self.running.lock() = false;
                Err(ClockError::Runtime(format!(
                    "failed to spawn wallclock driving thread: {e}"
                )))
            }
        }
    }

    /// The driving thread's main loop.
    fn drive(self: Arc<Self>) {
        tracing::info!("[{}] driving thread started", self.clock.id);

        let frame_secs = self.frame_duration.as_secs_f64();
        let max_latency_secs = self.max_latency.as_secs_f64();

        let mut t0 = Instant::now();
        let mut ticks: u64 = 0;
        let mut acc: u32 = 0;
        let mut last_latency_log = Instant::now() - Duration::from_secs(2);

        loop {
            if self.clock.is_empty() {
                break;
            }

            let sync = self.is_sync();
            let rem = if sync {
                let scheduled = frame_secs * (ticks + 1) as f64;
                scheduled - t0.elapsed().as_secs_f64()
            } else {
                0.0
            };

            if rem > 0.0 || !sync {
                usleep(Duration::from_secs_f64(rem.max(0.0)));
                acc = 0;
            } else if rem < -max_latency_secs {
                tracing::error!(
                    "[{}] latency overrun: {:.3}s behind schedule, resetting active sources",
                    self.clock.id,
                    -rem
                );
                self.clock.reset_active_sources();
                t0 = Instant::now();
                ticks = 0;
                acc = 0;
            } else if (rem <= -1.0 || acc >= 100) && last_latency_log.elapsed() >= Duration::from_secs(1)
            {
                tracing::warn!(
                    "[{}] catching up, {:.3}s behind schedule",
                    self.clock.id,
                    -rem
                );
                last_latency_log = Instant::now();
                acc = 0;
            } else {
                acc += 1;
            }

            ticks += 1;
            self.clock.end_tick();
        }

        tracing::info!("[{}] driving thread exiting, outputs empty", self.clock.id);
        *self.running.lock() = false;
    }
}

/// Sleep for `d`. `std::thread::sleep` already retries internally
/// across an interrupted syscall to guarantee the full duration
/// elapses, so no manual retry logic is needed at this layer.
fn usleep(d: Duration) {
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}

impl ClockHandle for Wallclock {
    fn id(&self) -> &str {
        Wallclock::id(self)
    }

    fn detach_all(&self) {
        self.clock.detach(|_| true);
    }

    fn harvest_thunk(
        self: Arc<Self>,
        filter: &(dyn Fn(&Arc<dyn ActiveSource>) -> bool + Send + Sync),
    ) -> Box<dyn FnOnce() -> Vec<(Arc<dyn ActiveSource>, ClockError)> + Send> {
        let thunk = Clock::harvest(&self.clock, filter);
        let wc = self.clone();
        Box::new(move || {
            let errors = thunk.run();
            if let Err(e) = wc.maybe_spawn_thread() {
                tracing::error!("[{}] failed to start driving thread: {}", wc.clock.id, e);
            }
            errors
        })
    }
}

