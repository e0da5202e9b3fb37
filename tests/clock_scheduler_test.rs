//! Clock scheduler lifecycle integration test.
//!
//! Exercises `Clock` purely through its public API — attach, detach,
//! start_outputs, end_tick — with a small test-only active source, the
//! way a caller outside the crate would drive it. Covers the flag
//! state machine (attach/detach transitions), the two-phase startup
//! split including abort-during-starting, and streaming-failure
//! cleanup.

use harborclock::source::same_source;
use harborclock::{ActiveSource, Clock, ClockError, ClockVariable, Result, Source, SourceFlag, Stype};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Minimal active source recording how many times each lifecycle hook
/// ran, and optionally failing `get_ready`/`output` on command.
struct ScenarioSource {
    id: String,
    clock_var: ClockVariable,
    fail_get_ready: AtomicBool,
    fail_output: AtomicBool,
    get_ready_calls: AtomicUsize,
    output_calls: AtomicUsize,
    leave_calls: AtomicUsize,
}

impl ScenarioSource {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            clock_var: ClockVariable::unknown(),
            fail_get_ready: AtomicBool::new(false),
            fail_output: AtomicBool::new(false),
            get_ready_calls: AtomicUsize::new(0),
            output_calls: AtomicUsize::new(0),
            leave_calls: AtomicUsize::new(0),
        })
    }
}

impl Source for ScenarioSource {
    fn id(&self) -> &str {
        &self.id
    }
    fn stype(&self) -> Stype {
        Stype::Fallible
    }
    fn clock_variable(&self) -> &ClockVariable {
        &self.clock_var
    }
}

impl ActiveSource for ScenarioSource {
    fn get_ready(&self, _roots: &[String]) -> Result<()> {
        self.get_ready_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_get_ready.load(Ordering::SeqCst) {
            return Err(ClockError::StartupFailure(self.id.clone(), "forced failure".into()));
        }
        Ok(())
    }

    fn output(&self) -> Result<()> {
        self.output_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_output.load(Ordering::SeqCst) {
            return Err(ClockError::StreamingFailure(self.id.clone(), "forced failure".into()));
        }
        Ok(())
    }

    fn leave(&self, _root: bool) {
        self.leave_calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn as_active(s: &Arc<ScenarioSource>) -> Arc<dyn ActiveSource> {
    s.clone() as Arc<dyn ActiveSource>
}

#[test]
fn attach_is_idempotent() {
    let clock = Arc::new(Clock::new("c".into()));
    let s = ScenarioSource::new("s1");
    clock.attach(as_active(&s));
    clock.attach(as_active(&s));
    assert_eq!(clock.output_count(), 1);
}

#[test]
fn detach_new_removes_immediately() {
    let clock = Arc::new(Clock::new("c".into()));
    let s = ScenarioSource::new("s1");
    clock.attach(as_active(&s));
    clock.detach(|x| same_source(x, &as_active(&s)));
    assert_eq!(clock.output_count(), 0);
}

// Invariant 1: the flags on `outputs` form a disjoint partition.
#[test]
fn flags_partition_outputs() {
    let clock = Arc::new(Clock::new("c".into()));
    for i in 0..5 {
        clock.attach(as_active(&ScenarioSource::new(&format!("s{i}"))));
    }
    let snap = clock.outputs_snapshot();
    let mut ids: Vec<_> = snap.iter().map(|(_, id)| id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4"]);
}

// Invariant 3/4: a source only reaches Active via Starting, and
// get_tick increments by exactly 1 per end_tick.
#[test]
fn start_outputs_activates_source_then_ticks_advance_round() {
    let clock = Arc::new(Clock::new("c".into()));
    let s = ScenarioSource::new("s1");
    clock.attach(as_active(&s));

    let errors = clock.start_outputs(&|_| true);
    assert!(errors.is_empty());
    assert_eq!(s.get_ready_calls.load(Ordering::SeqCst), 1);
    assert_eq!(clock.outputs_snapshot(), vec![(SourceFlag::Active, "s1".to_string())]);

    assert_eq!(clock.get_tick(), 0);
    clock.end_tick();
    assert_eq!(clock.get_tick(), 1);
    clock.end_tick();
    assert_eq!(clock.get_tick(), 2);
}

#[test]
fn end_tick_removes_old_sources_after_leaving() {
    let clock = Arc::new(Clock::new("c".into()));
    let s = ScenarioSource::new("s1");
    clock.attach(as_active(&s));
    clock.start_outputs(&|_| true);

    clock.detach(|x| same_source(x, &as_active(&s)));
    assert_eq!(clock.outputs_snapshot(), vec![(SourceFlag::Old, "s1".to_string())]);

    clock.end_tick();
    assert_eq!(clock.output_count(), 0);
    assert_eq!(s.leave_calls.load(Ordering::SeqCst), 1);
}

// Invariant 2: streaming failures still leave exactly once and remove
// the source from outputs.
#[test]
fn streaming_failure_removes_source_and_calls_leave() {
    let clock = Arc::new(Clock::new("c".into()));
    let s = ScenarioSource::new("s1");
    clock.attach(as_active(&s));
    clock.start_outputs(&|_| true);

    s.fail_output.store(true, Ordering::SeqCst);
    clock.end_tick();

    assert_eq!(clock.output_count(), 0);
    assert_eq!(s.leave_calls.load(Ordering::SeqCst), 1);
}

// S2: a source whose get_ready fails is reported as an error and torn
// down; outputs ends up empty.
#[test]
fn startup_failure_is_reported_and_left() {
    let clock = Arc::new(Clock::new("c".into()));
    let s = ScenarioSource::new("s1");
    s.fail_get_ready.store(true, Ordering::SeqCst);
    clock.attach(as_active(&s));

    let errors = clock.start_outputs(&|_| true);

    assert_eq!(errors.len(), 1);
    assert!(same_source(&(errors[0].0.clone()), &as_active(&s)));
    assert_eq!(s.leave_calls.load(Ordering::SeqCst), 1);
    assert_eq!(clock.output_count(), 0);
}

// S3: detaching a source between harvest and startup completing marks
// it Aborted; the thunk reports no error, but still calls get_ready
// then leave exactly once, and outputs ends up empty.
#[test]
fn detach_during_starting_aborts_and_leaves_without_reporting() {
    let clock = Arc::new(Clock::new("c".into()));
    let s = ScenarioSource::new("s1");
    clock.attach(as_active(&s));

    let thunk = clock.harvest(&|_| true);
    clock.detach(|x| same_source(x, &as_active(&s)));
    let errors = thunk.run();

    assert!(errors.is_empty());
    assert_eq!(s.get_ready_calls.load(Ordering::SeqCst), 1);
    assert_eq!(s.leave_calls.load(Ordering::SeqCst), 1);
    assert_eq!(clock.output_count(), 0);
}
