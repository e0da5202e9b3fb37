//! The clock scheduler itself.
//!
//! A `Clock` owns a list of `(SourceFlag, ActiveSource)` pairs and
//! drives them tick by tick via `end_tick`. `start_outputs` is split
//! into an in-lock harvest (`harvest`) and an out-of-lock startup
//! (`StartupThunk::run`) so the collector can harvest every clock in
//! the registry under one critical section before running any of
//! their (possibly slow, possibly nested) startup code, since startup
//! callbacks can themselves attach to other clocks and would deadlock
//! if run while still holding this one's lock.

use crate::collector;
use crate::error::ClockError;
use crate::source::ActiveSource;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::variable::ClockVariable;

/// Where an attached source sits in its lifecycle inside one clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFlag {
    New,
    Starting,
    Aborted,
    Active,
    Old,
}

type Output = (SourceFlag, Arc<dyn ActiveSource>);

pub struct Clock {
    pub id: String,
    outputs: Mutex<Vec<Output>>,
    sub_clocks: Mutex<Vec<ClockVariable>>,
    round: AtomicU64,
    allow_streaming_errors: bool,
}

impl Clock {
    pub fn new(id: String) -> Self {
        Self::with_options(id, false)
    }

    pub fn with_options(id: String, allow_streaming_errors: bool) -> Self {
        Self {
            id,
            outputs: Mutex::new(Vec::new()),
            sub_clocks: Mutex::new(Vec::new()),
            round: AtomicU64::new(0),
            allow_streaming_errors,
        }
    }

    /// Snapshot of `(flag, source id)` pairs, for tests and
    /// diagnostics.
    pub fn outputs_snapshot(&self) -> Vec<(SourceFlag, String)> {
        self.outputs
            .lock()
            .iter()
            .map(|(flag, s)| (*flag, s.id().to_string()))
            .collect()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.lock().len()
    }

    /// True once every attached source has been removed — a driving
    /// thread uses this to notice `stop()` and exit.
    pub fn is_empty(&self) -> bool {
        self.outputs.lock().is_empty()
    }

    /// Drop internal buffering on every still-usable active source
    /// after a latency reset.
    pub fn reset_active_sources(&self) {
        let outputs = self.outputs.lock();
        for (flag, s) in outputs.iter() {
            if *flag == SourceFlag::Active && s.is_active() {
                s.output_reset();
            }
        }
    }

    /// Adds `(New, s)` if `s` is not already present. Idempotent.
    pub fn attach(&self, s: Arc<dyn ActiveSource>) {
        let mut outputs = self.outputs.lock();
        if outputs
            .iter()
            .any(|(_, existing)| crate::source::same_source(existing, &s))
        {
            return;
        }
        outputs.push((SourceFlag::New, s));
    }

    /// For every `(flag, s)` with `pred(s)`: `New` is removed,
    /// `Starting` becomes `Aborted`, `Active` becomes `Old`, and
    /// `Old`/`Aborted` are left unchanged.
    pub fn detach(&self, pred: impl Fn(&Arc<dyn ActiveSource>) -> bool) {
        let mut outputs = self.outputs.lock();
        outputs.retain_mut(|(flag, s)| {
            if !pred(s) {
                return true;
            }
            match flag {
                SourceFlag::New => false,
                SourceFlag::Starting => {
                    *flag = SourceFlag::Aborted;
                    true
                }
                SourceFlag::Active => {
                    *flag = SourceFlag::Old;
                    true
                }
                SourceFlag::Aborted | SourceFlag::Old => true,
            }
        });
    }

    pub fn attach_clock(&self, v: ClockVariable) {
        self.sub_clocks.lock().push(v);
    }

    /// Requires `v` to already be attached.
    pub fn detach_clock(&self, v: &ClockVariable) -> crate::error::Result<()> {
        let mut subs = self.sub_clocks.lock();
        let before = subs.len();
        subs.retain(|existing| !existing.same_as(v));
        if subs.len() == before {
            return Err(ClockError::Configuration(format!(
                "detach_clock: variable not attached to clock '{}'",
                self.id
            )));
        }
        Ok(())
    }

    pub fn get_tick(&self) -> u64 {
        self.round.load(Ordering::SeqCst)
    }

    pub fn allow_streaming_errors(&self) -> bool {
        self.allow_streaming_errors
    }

    /// In-lock harvest phase: every `(New, s)` with `filter(s)` moves
    /// to `Starting` and is collected for startup.
    pub fn harvest(self: &Arc<Self>, filter: &dyn Fn(&Arc<dyn ActiveSource>) -> bool) -> StartupThunk {
        let mut to_start = Vec::new();
        {
            let mut outputs = self.outputs.lock();
            for (flag, s) in outputs.iter_mut() {
                if *flag == SourceFlag::New && filter(s) {
                    *flag = SourceFlag::Starting;
                    to_start.push(s.clone());
                }
            }
        }
        StartupThunk {
            clock: self.clone(),
            to_start,
        }
    }

    /// Convenience: harvest then immediately run startup. The
    /// collector instead harvests every clock first and runs the
    /// resulting thunks afterwards, outside any clock's lock.
    pub fn start_outputs(
        self: &Arc<Self>,
        filter: &dyn Fn(&Arc<dyn ActiveSource>) -> bool,
    ) -> Vec<(Arc<dyn ActiveSource>, ClockError)> {
        self.harvest(filter).run()
    }

    /// One streaming tick.
    pub fn end_tick(&self) {
        let (leaving, active) = {
            let mut outputs = self.outputs.lock();
            let mut leaving = Vec::new();
            let mut active = Vec::new();
            outputs.retain(|(flag, s)| match flag {
                SourceFlag::Old => {
                    leaving.push(s.clone());
                    false
                }
                SourceFlag::Active => {
                    active.push(s.clone());
                    true
                }
                _ => true,
            });
            (leaving, active)
        };

        for s in &leaving {
            s.leave(false);
        }

        let mut errored: Vec<Arc<dyn ActiveSource>> = Vec::new();
        for s in &active {
            if let Err(e) = s.output() {
                tracing::error!("[{}] streaming failure in '{}': {}", self.id, s.id(), e);
                s.leave(false);
                errored.push(s.clone());
            }
        }

        if !errored.is_empty() {
            let mut outputs = self.outputs.lock();
            outputs.retain(|(_, s)| !errored.iter().any(|e| crate::source::same_source(e, s)));
        }

        if !errored.is_empty() && !self.allow_streaming_errors {
            tracing::error!(
                "[{}] {} source(s) failed and allow_streaming_errors=false, requesting shutdown",
                self.id,
                errored.len()
            );
            collector::request_shutdown();
        }

        self.round.fetch_add(1, Ordering::SeqCst);

        for s in &active {
            if !errored.iter().any(|e| crate::source::same_source(e, s)) {
                s.after_output();
            }
        }
    }
}

/// The out-of-lock startup phase produced by [`Clock::harvest`].
pub struct StartupThunk {
    clock: Arc<Clock>,
    to_start: Vec<Arc<dyn ActiveSource>>,
}

impl StartupThunk {
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty()
    }

    /// Runs `get_ready`/`output_get_ready` outside any lock, then
    /// reconciles flags under the clock's lock. Aborted sources are
    /// always left exactly once and never reported as errors — by the
    /// time startup finished they were already withdrawn by the
    /// caller, so re-reporting their startup error would be surfacing
    /// a failure nobody is waiting on (see DESIGN.md for this
    /// double-dispatch resolution).
    pub fn run(self) -> Vec<(Arc<dyn ActiveSource>, ClockError)> {
        let roots: Vec<String> = self.to_start.iter().map(|s| s.id().to_string()).collect();

        let outcomes: Vec<(Arc<dyn ActiveSource>, crate::error::Result<()>)> = self
            .to_start
            .into_iter()
            .map(|s| {
                let result = s.get_ready(&roots).and_then(|_| s.output_get_ready());
                (s, result)
            })
            .collect();

        let mut errors = Vec::new();
        let mut to_leave = Vec::new();

        {
            let mut outputs = self.clock.outputs.lock();
            for (s, result) in outcomes {
                let idx = outputs
                    .iter()
                    .position(|(_, existing)| crate::source::same_source(existing, &s));

                let Some(idx) = idx else {
                    // Source vanished from outputs entirely (e.g. a
                    // `New`-flag detach raced with harvest); nothing to
                    // reconcile.
                    continue;
                };

                let current_flag = outputs[idx].0;
                if current_flag == SourceFlag::Aborted {
                    if let Err(e) = &result {
                        tracing::warn!(
                            "[{}] '{}' was detached during startup; startup error swallowed: {}",
                            self.clock.id,
                            s.id(),
                            e
                        );
                    }
                    outputs.remove(idx);
                    to_leave.push(s);
                } else if result.is_ok() {
                    outputs[idx].0 = SourceFlag::Active;
                } else {
                    let err = result.unwrap_err();
                    outputs.remove(idx);
                    errors.push((s.clone(), err));
                    to_leave.push(s);
                }
            }
        }

        for s in &to_leave {
            s.leave(true);
        }

        errors
    }
}

impl super::ClockHandle for Clock {
    fn id(&self) -> &str {
        &self.id
    }

    fn detach_all(&self) {
        self.detach(|_| true);
    }

    fn harvest_thunk(
        self: Arc<Self>,
        filter: &(dyn Fn(&Arc<dyn ActiveSource>) -> bool + Send + Sync),
    ) -> Box<dyn FnOnce() -> Vec<(Arc<dyn ActiveSource>, ClockError)> + Send> {
        let thunk = Clock::harvest(&self, filter);
        Box::new(move || thunk.run())
    }
}
