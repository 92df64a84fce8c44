// src/signal/mod.rs
// Post-acquisition processing: calibration, zero-phase filtering, derived metrics.
pub mod butterworth;
pub mod orientation;
pub mod pipeline;
pub mod platform;
pub mod table;
pub use butterworth::Butterworth;
pub use pipeline::{SignalPipeline, TableKind};
pub use platform::{PlatformDimensions, SingularityWarning};
pub use table::{DataTable, TableWindow};
