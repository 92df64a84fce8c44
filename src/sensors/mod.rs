// src/sensors/mod.rs
pub mod group;
pub mod registry;
pub mod sensor;
pub use group::{AxisMembers, SensorGroup};
pub use registry::SensorRegistry;
pub use sensor::Sensor;
