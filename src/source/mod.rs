//! Source & active source contracts.
//!
//! `Source` is the capability set every producer/consumer implements;
//! `ActiveSource` extends it with the hooks a clock drives each tick.
//! Sources are held behind `Arc<dyn ActiveSource>` everywhere so a
//! clock's `outputs` list and the process-wide "new outputs" queue can
//! share ownership without cloning source state.

use crate::clock::variable::ClockVariable;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// Whether a source's fallible operations (`output`, `get_ready`, ...)
/// can actually fail at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stype {
    Infallible,
    Fallible,
}

/// Base capability set shared by every source.
pub trait Source: Send + Sync {
    fn id(&self) -> &str;
    fn stype(&self) -> Stype;
    fn clock_variable(&self) -> &ClockVariable;
}

/// A source a clock actually drives: initialized via `get_ready`, then
/// polled once per tick via `output`, and torn down exactly once via
/// `leave`.
pub trait ActiveSource: Source {
    /// Initialize the source. May fail (`StartupFailure`).
    fn get_ready(&self, roots: &[String]) -> Result<()>;

    /// Finalize initialization after the source's clock wakes it up.
    /// Most sources have nothing to do here; the default is a no-op.
    fn output_get_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Produce (and, for true active sources, consume) one frame.
    fn output(&self) -> Result<()>;

    /// Post-tick hook, called outside the clock lock after every
    /// source has been polled for the round.
    fn after_output(&self) {}

    /// True while the source is still usable; a wallclock only resets
    /// sources for which this holds.
    fn is_active(&self) -> bool {
        true
    }

    /// Drop internal buffering after a latency reset.
    fn output_reset(&self) {}

    /// Release resources. Must be called exactly once per source that
    /// successfully started. Errors are logged and swallowed — this is
    /// the single tear-down path and must not fail noisily.
    fn leave(&self, root: bool);
}

/// The process-wide queue of sources created since the last
/// collection. Lives here, not in the collector, because source
/// construction is the only thing that pushes into it.
static NEW_OUTPUTS: OnceLock<Mutex<Vec<Arc<dyn ActiveSource>>>> = OnceLock::new();

fn new_outputs() -> &'static Mutex<Vec<Arc<dyn ActiveSource>>> {
    NEW_OUTPUTS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a freshly constructed source so the next collection can
/// bind it to a default clock if it wasn't given one explicitly.
pub fn register_new_source(source: Arc<dyn ActiveSource>) {
    new_outputs().lock().push(source);
}

/// Drain and iterate the new-outputs queue. Each source is visited
/// exactly once; sources created while `f` runs are not observed by
/// this call (they'll be picked up by the next collection).
pub fn iterate_new_outputs<F: FnMut(&Arc<dyn ActiveSource>)>(mut f: F) {
    let drained: Vec<_> = std::mem::take(&mut *new_outputs().lock());
    for source in &drained {
        f(source);
    }
}

/// Two `Arc<dyn ActiveSource>` refer to the same source iff they point
/// at the same allocation — matches the host language's physical
/// equality used throughout clock scheduling (`detach(pred)`, `attach`
/// idempotency).
pub fn same_source(a: &Arc<dyn ActiveSource>, b: &Arc<dyn ActiveSource>) -> bool {
    Arc::ptr_eq(a, b)
}
