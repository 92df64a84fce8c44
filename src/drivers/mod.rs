// src/drivers/mod.rs
// Device layer: one synchronous read per sensor per tick.
pub mod imu_serial;
pub mod phidget;
pub mod source;
pub use imu_serial::{FrameParser, PacketType, SerialImu};
pub use phidget::{PhidgetClass, PhidgetDevice};
pub use source::{
    DeviceFactory, HardwareFactory, ScriptedDevice, SensorDevice, SimulatedDevice,
    SimulatedFactory,
};
