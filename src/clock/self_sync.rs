//! Self-sync wallclock.
//!
//! Wraps a [`Wallclock`] and toggles its `sync` flag based on how many
//! *blocking* sources (sources whose own I/O, like a soundcard write,
//! already provides pacing) are currently registered. While at least
//! one is running, the wallclock stops busy-waiting on real time and
//! lets `end_tick` run back-to-back, paced entirely by the blocking
//! source's `output()` call.

use super::wallclock::Wallclock;
use super::ClockHandle;
use crate::error::ClockError;
use crate::source::ActiveSource;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub struct SelfSyncWallclock {
    wallclock: Arc<Wallclock>,
    blocking_sources: Mutex<u64>,
}

impl SelfSyncWallclock {
    pub fn new(
        id: String,
        frame_duration: Duration,
        max_latency: Duration,
        allow_streaming_errors: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            wallclock: Wallclock::new(id, frame_duration, max_latency, allow_streaming_errors),
            blocking_sources: Mutex::new(0),
        })
    }

    pub fn id(&self) -> &str {
        self.wallclock.id()
    }

    pub fn wallclock(&self) -> &Arc<Wallclock> {
        &self.wallclock
    }

    pub fn attach(&self, s: Arc<dyn ActiveSource>) {
        self.wallclock.attach(s);
    }

    pub fn detach(&self, pred: impl Fn(&Arc<dyn ActiveSource>) -> bool) {
        self.wallclock.detach(pred);
    }

    pub fn get_tick(&self) -> u64 {
        self.wallclock.get_tick()
    }

    pub fn start_outputs(
        self: &Arc<Self>,
        filter: &(dyn Fn(&Arc<dyn ActiveSource>) -> bool + Send + Sync),
    ) -> Vec<(Arc<dyn ActiveSource>, ClockError)> {
        self.wallclock.start_outputs(filter)
    }

    pub fn is_sync(&self) -> bool {
        self.wallclock.is_sync()
    }

    /// If the counter was 0, delegate pacing to this (now-running)
    /// blocking source before incrementing.
    pub fn register_blocking_source(&self) {
        let mut count = self.blocking_sources.lock();
        if *count == 0 {
            tracing::info!("[{}] delegating pacing to blocking source", self.wallclock.id());
            self.wallclock.set_sync(false);
        }
        *count += 1;
    }

    /// Decrement, and resync to wall time if this was the last
    /// blocking source.
    pub fn unregister_blocking_source(&self) {
        let mut count = self.blocking_sources.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            tracing::info!("[{}] resynching to wall clock", self.wallclock.id());
            self.wallclock.set_sync(true);
        }
    }
}

impl ClockHandle for SelfSyncWallclock {
    fn id(&self) -> &str {
        SelfSyncWallclock::id(self)
    }

    fn detach_all(&self) {
        self.wallclock.detach(|_| true);
    }

    fn harvest_thunk(
        self: Arc<Self>,
        filter: &(dyn Fn(&Arc<dyn ActiveSource>) -> bool + Send + Sync),
    ) -> Box<dyn FnOnce() -> Vec<(Arc<dyn ActiveSource>, ClockError)> + Send> {
        let wc = self.wallclock.clone();
        ClockHandle::harvest_thunk(wc, filter)
    }
}
