//! Clock scheduling machinery.
//!
//! `base` holds the scheduler contract every clock shares; `variable`
//! holds the unification cells that let freshly created sources bind
//! to a clock after the fact; `wallclock` and `self_sync` layer a
//! driving thread and delegated pacing on top of `base::Clock` via
//! struct composition rather than an inheritance chain.

pub mod base;
pub mod self_sync;
pub mod variable;
pub mod wallclock;

pub use base::{Clock, SourceFlag};
pub use self_sync::SelfSyncWallclock;
pub use variable::ClockVariable;
pub use wallclock::Wallclock;

use crate::error::ClockError;
use crate::source::ActiveSource;
use std::sync::Arc;

/// Object-safe facade the collector drives every clock kind through.
///
/// The collector's registry is heterogeneous — a mix of bare
/// [`Clock`]s, [`Wallclock`]s, and [`SelfSyncWallclock`]s — but only
/// needs two things from each: a name for logging, and the ability to
/// harvest+start newly attached sources. `harvest_thunk` mirrors
/// `start_outputs`'s own split: it performs the in-lock harvest
/// immediately and returns a thunk for the caller to run once every
/// clock in the registry has been harvested.
pub trait ClockHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Detach every attached source, regardless of flag (used by
    /// `collector::stop`).
    fn detach_all(&self);

    #[allow(clippy::type_complexity)]
    fn harvest_thunk(
        self: Arc<Self>,
        filter: &(dyn Fn(&Arc<dyn ActiveSource>) -> bool + Send + Sync),
    ) -> Box<dyn FnOnce() -> Vec<(Arc<dyn ActiveSource>, ClockError)> + Send>;
}
