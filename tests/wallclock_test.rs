//! Wallclock driving-thread integration test.
//!
//! Drives a real `Wallclock` end to end through its public API: pacing
//! by real time (S1), resetting on a latency overrun (S4), and
//! terminating its thread once every source has detached (invariant 7).

use harborclock::source::same_source;
use harborclock::{ActiveSource, ClockVariable, Result, Source, Stype, Wallclock};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An active source whose `output()` runs an injected closure before
/// returning, so a test can record timestamps, detach itself after a
/// tick count, or sleep to simulate a stalled tick.
struct ScenarioSource {
    id: String,
    clock_var: ClockVariable,
    output_calls: AtomicUsize,
    output_reset_calls: AtomicUsize,
    timestamps: Mutex<Vec<Instant>>,
    on_output: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl ScenarioSource {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            clock_var: ClockVariable::unknown(),
            output_calls: AtomicUsize::new(0),
            output_reset_calls: AtomicUsize::new(0),
            timestamps: Mutex::new(Vec::new()),
            on_output: Mutex::new(None),
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
        Ok(())
    }

    fn output(&self) -> Result<()> {
        self.output_calls.fetch_add(1, Ordering::SeqCst);
        self.timestamps.lock().push(Instant::now());
        if let Some(f) = self.on_output.lock().as_ref() {
            f();
        }
        Ok(())
    }

    fn output_reset(&self) {
        self.output_reset_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self, _root: bool) {}
}

fn as_active(s: &Arc<ScenarioSource>) -> Arc<dyn ActiveSource> {
    s.clone() as Arc<dyn ActiveSource>
}

// S1: single infallible source, sync mode — ticks are paced by
// frame_duration within a loose tolerance, and the source can stop the
// driving thread by detaching itself.
#[test]
fn drives_attached_source_at_frame_duration_then_stops_on_detach() {
    let frame_duration = Duration::from_millis(20);
    let wc = Wallclock::new("s1clock".into(), frame_duration, Duration::from_secs(1), false);
    let s = ScenarioSource::new("s1");

    let wc_for_detach = wc.clone();
    let s_for_detach = s.clone();
    *s.on_output.lock() = Some(Box::new(move || {
        if s_for_detach.output_calls.load(Ordering::SeqCst) >= 10 {
            let target = s_for_detach.clone();
            wc_for_detach.detach(move |x| same_source(x, &as_active(&target)));
        }
    }));

    wc.attach(as_active(&s));
    wc.start_outputs(&|_| true);

    // Invariant 7: once outputs is empty, the driving thread
    // terminates within roughly one tick interval.
    let deadline = Instant::now() + Duration::from_secs(5);
    while wc.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!wc.is_running(), "driving thread did not stop after detach");

    assert!(wc.get_tick() >= 10);
    let timestamps = s.timestamps.lock();
    assert!(timestamps.len() >= 10);
    for pair in timestamps.windows(2) {
        let delta = pair[1].duration_since(pair[0]).as_secs_f64();
        assert!(
            (0.0..=0.1).contains(&delta),
            "tick spacing {delta} out of expected 0.02s +/- range"
        );
    }
}

// S4: a source whose first output() sleeps 3s blows a 1s max_latency
// budget; the next loop iteration must reset every active source
// rather than try to catch up tick by tick.
#[test]
fn latency_overrun_resets_active_sources() {
    let wc = Wallclock::new("s4clock".into(), Duration::from_millis(10), Duration::from_secs(1), false);
    let s = ScenarioSource::new("s4");

    let slept_once = Arc::new(AtomicBool::new(false));
    let slept_once_cb = slept_once.clone();
    *s.on_output.lock() = Some(Box::new(move || {
        if !slept_once_cb.swap(true, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(3));
        }
    }));

    wc.attach(as_active(&s));
    wc.start_outputs(&|_| true);

    let deadline = Instant::now() + Duration::from_secs(10);
    while s.output_reset_calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(
        s.output_reset_calls.load(Ordering::SeqCst) >= 1,
        "expected output_reset after latency overrun"
    );

    let target = s.clone();
    wc.detach(move |x| same_source(x, &as_active(&target)));
}

#[test]
fn empty_wallclock_never_spawns_thread() {
    let wc = Wallclock::new("t".into(), Duration::from_millis(10), Duration::from_secs(1), false);
    let errors = wc.start_outputs(&|_| true);
    assert!(errors.is_empty());
    assert!(!wc.is_running());
}
