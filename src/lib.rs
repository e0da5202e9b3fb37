//! Clock-driven streaming scheduler and buffered harbor input for
//! audio/video pipelines.
//!
//! Two subsystems live here:
//!
//! - [`clock`] — named clocks that drive attached sources tick by
//!   tick, a wallclock specialization paced by real time, and a
//!   self-sync specialization that delegates pacing to blocking
//!   sources. [`collector`] binds freshly created sources to a
//!   default clock and coordinates process-wide startup/shutdown.
//! - [`harbor`] — a socket-fed decoder that feeds a bounded
//!   [`frame::Generator`], attaches to a clock like any other source,
//!   and applies backpressure by dropping old samples when a consumer
//!   falls behind.
//!
//! [`source`] defines the capability set both sides are built on, and
//! [`config`] loads the process-wide settings that govern them.

pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod frame;
pub mod harbor;
pub mod source;

pub use clock::{Clock, ClockHandle, ClockVariable, SelfSyncWallclock, SourceFlag, Wallclock};
pub use config::Config;
pub use error::{ClockError, Result};
pub use frame::{Generator, MetadataMarker};
pub use harbor::{HarborConfig, HarborInput, Login, Telemetry};
pub use source::{ActiveSource, Source, Stype};
