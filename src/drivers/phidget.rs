use anyhow::{anyhow, Context, Result};
use libloading::Library;
use log::debug;
use once_cell::sync::OnceCell;
use std::os::raw::{c_double, c_int, c_void};
use crate::config::{SensorConfig, SerialAddress};
use crate::drivers::SensorDevice;
use crate::error::ForceError;
use crate::types::Reading;
const EPHIDGET_OK: c_int = 0;
const ATTACH_TIMEOUT_MS: u32 = 5000;
// Fastest rate the bridge and encoder boards accept.
const MIN_DATA_INTERVAL_MS: u32 = 8;
type Handle = *mut c_void;
/// Symbols used from the `phidget22` C library.
struct PhidgetApi {
    #[allow(dead_code)]
    lib: Library,
    voltage_ratio_create: unsafe extern "C" fn(*mut Handle) -> c_int,
    voltage_ratio_delete: unsafe extern "C" fn(*mut Handle) -> c_int,
    voltage_ratio_get: unsafe extern "C" fn(Handle, *mut c_double) -> c_int,
    voltage_ratio_set_interval: unsafe extern "C" fn(Handle, u32) -> c_int,
    encoder_create: unsafe extern "C" fn(*mut Handle) -> c_int,
    encoder_delete: unsafe extern "C" fn(*mut Handle) -> c_int,
    encoder_get_position: unsafe extern "C" fn(Handle, *mut i64) -> c_int,
    encoder_set_position: unsafe extern "C" fn(Handle, i64) -> c_int,
    encoder_set_interval: unsafe extern "C" fn(Handle, u32) -> c_int,
    set_serial_number: unsafe extern "C" fn(Handle, i32) -> c_int,
    set_channel: unsafe extern "C" fn(Handle, c_int) -> c_int,
    open_wait_for_attachment: unsafe extern "C" fn(Handle, u32) -> c_int,
    close: unsafe extern "C" fn(Handle) -> c_int,
}
impl PhidgetApi {
    fn load() -> Result<Self> {
        let name = libloading::library_filename("phidget22");
        let lib = unsafe { Library::new(&name) }
            .with_context(|| format!("{} not found on the library path", name.to_string_lossy()))?;
        // Safety: signatures follow the phidget22 C headers.
        unsafe {
            Ok(Self {
                voltage_ratio_create: *lib.get(b"PhidgetVoltageRatioInput_create\0")?,
                voltage_ratio_delete: *lib.get(b"PhidgetVoltageRatioInput_delete\0")?,
                voltage_ratio_get: *lib.get(b"PhidgetVoltageRatioInput_getVoltageRatio\0")?,
                voltage_ratio_set_interval: *lib
                    .get(b"PhidgetVoltageRatioInput_setDataInterval\0")?,
                encoder_create: *lib.get(b"PhidgetEncoder_create\0")?,
                encoder_delete: *lib.get(b"PhidgetEncoder_delete\0")?,
                encoder_get_position: *lib.get(b"PhidgetEncoder_getPosition\0")?,
                encoder_set_position: *lib.get(b"PhidgetEncoder_setPosition\0")?,
                encoder_set_interval: *lib.get(b"PhidgetEncoder_setDataInterval\0")?,
                set_serial_number: *lib.get(b"Phidget_setDeviceSerialNumber\0")?,
                set_channel: *lib.get(b"Phidget_setChannel\0")?,
                open_wait_for_attachment: *lib.get(b"Phidget_openWaitForAttachment\0")?,
                close: *lib.get(b"Phidget_close\0")?,
                lib,
            })
        }
    }
    fn instance() -> Result<&'static PhidgetApi> {
        static API: OnceCell<PhidgetApi> = OnceCell::new();
        API.get_or_try_init(Self::load)
    }
    fn check(code: c_int, ctx: &str) -> Result<()> {
        if code == EPHIDGET_OK {
            Ok(())
        } else {
            Err(anyhow!("{ctx} failed (phidget22 code {code:#x})"))
        }
    }
}
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhidgetClass {
    /// Bridge input for load cells.
    VoltageRatio,
    /// Quadrature encoder input.
    Encoder,
}
/// Channel handle owned by exactly one sampling thread at a time.
struct ChannelHandle(Handle);
// Safety: phidget22 channel handles may be used from any thread.
unsafe impl Send for ChannelHandle {}
/// One channel of a PhidgetBridge or PhidgetEncoder board.
pub struct PhidgetDevice {
    name: String,
    class: PhidgetClass,
    serial: i32,
    channel: i32,
    initial_position: i64,
    handle: Option<ChannelHandle>,
}
impl PhidgetDevice {
    pub fn from_config(config: &SensorConfig, class: PhidgetClass) -> Result<Self, ForceError> {
        let serial = match &config.connection.serial {
            Some(SerialAddress::Number(n)) => i32::try_from(*n).map_err(|_| {
                ForceError::Configuration(format!("{}: serial {n} out of range", config.name))
            })?,
            other => {
                return Err(ForceError::Configuration(format!(
                    "{}: phidget boards need a numeric serial, got {other:?}",
                    config.name
                )))
            }
        };
        Ok(Self {
            name: config.name.clone(),
            class,
            serial,
            channel: config.connection.channel.unwrap_or(0),
            initial_position: config.initial_position,
            handle: None,
        })
    }
    fn api(&self) -> Result<&'static PhidgetApi, ForceError> {
        PhidgetApi::instance().map_err(|e| ForceError::device(&self.name, format!("{e:#}")))
    }
    fn attach(&self, api: &PhidgetApi) -> Result<Handle> {
        let mut handle: Handle = std::ptr::null_mut();
        unsafe {
            match self.class {
                PhidgetClass::VoltageRatio => {
                    PhidgetApi::check((api.voltage_ratio_create)(&mut handle), "create")?
                }
                PhidgetClass::Encoder => {
                    PhidgetApi::check((api.encoder_create)(&mut handle), "create")?
                }
            }
            if let Err(e) = self.configure(api, handle) {
                self.dispose(api, handle);
                return Err(e);
            }
        }
        Ok(handle)
    }
    /// # Safety
    /// `handle` must come from the create call matching `self.class`.
    unsafe fn configure(&self, api: &PhidgetApi, handle: Handle) -> Result<()> {
        PhidgetApi::check((api.set_serial_number)(handle, self.serial), "set serial")?;
        PhidgetApi::check((api.set_channel)(handle, self.channel), "set channel")?;
        PhidgetApi::check(
            (api.open_wait_for_attachment)(handle, ATTACH_TIMEOUT_MS),
            "open",
        )?;
        match self.class {
            PhidgetClass::VoltageRatio => PhidgetApi::check(
                (api.voltage_ratio_set_interval)(handle, MIN_DATA_INTERVAL_MS),
                "set data interval",
            ),
            PhidgetClass::Encoder => {
                PhidgetApi::check(
                    (api.encoder_set_interval)(handle, MIN_DATA_INTERVAL_MS),
                    "set data interval",
                )?;
                PhidgetApi::check(
                    (api.encoder_set_position)(handle, self.initial_position),
                    "set position",
                )
            }
        }
    }
    /// # Safety
    /// `handle` must come from the create call matching `self.class` and not be used afterwards.
    unsafe fn dispose(&self, api: &PhidgetApi, mut handle: Handle) {
        (api.close)(handle);
        match self.class {
            PhidgetClass::VoltageRatio => (api.voltage_ratio_delete)(&mut handle),
            PhidgetClass::Encoder => (api.encoder_delete)(&mut handle),
        };
    }
    fn release(&mut self, api: &PhidgetApi) {
        if let Some(ChannelHandle(handle)) = self.handle.take() {
            unsafe { self.dispose(api, handle) };
            debug!("{} released", self.name);
        }
    }
}
impl SensorDevice for PhidgetDevice {
    fn open(&mut self) -> Result<(), ForceError> {
        let api = self.api()?;
        self.release(api);
        let handle = self
            .attach(api)
            .map_err(|e| ForceError::device(&self.name, format!("{e:#}")))?;
        self.handle = Some(ChannelHandle(handle));
        debug!(
            "{} attached (serial {}, channel {})",
            self.name, self.serial, self.channel
        );
        Ok(())
    }
    fn read_one(&mut self) -> Result<Reading, ForceError> {
        let api = self.api()?;
        let handle = self
            .handle
            .as_ref()
            .map(|h| h.0)
            .ok_or_else(|| ForceError::device(&self.name, "channel not open"))?;
        let value = unsafe {
            match self.class {
                PhidgetClass::VoltageRatio => {
                    let mut ratio: c_double = 0.0;
                    PhidgetApi::check((api.voltage_ratio_get)(handle, &mut ratio), "read")
                        .map(|_| ratio)
                }
                PhidgetClass::Encoder => {
                    let mut position: i64 = 0;
                    PhidgetApi::check((api.encoder_get_position)(handle, &mut position), "read")
                        .map(|_| position as f64)
                }
            }
        };
        value
            .map(Reading::Scalar)
            .map_err(|e| ForceError::device(&self.name, format!("{e:#}")))
    }
    fn close(&mut self) {
        if let Ok(api) = PhidgetApi::instance() {
            self.release(api);
        }
    }
}
impl Drop for PhidgetDevice {
    fn drop(&mut self) {
        self.close();
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    fn loadcell(serial: &str) -> SensorConfig {
        serde_yaml::from_str(&format!(
            "name: LC_Z_1\ntype: SENSOR_LOADCELL\nconnection:\n  channel: 2\n  serial: {serial}\n"
        ))
        .unwrap()
    }
    #[test]
    fn numeric_serial_and_channel_are_taken_from_config() {
        let dev = PhidgetDevice::from_config(&loadcell("583477"), PhidgetClass::VoltageRatio)
            .unwrap();
        assert_eq!(dev.serial, 583477);
        assert_eq!(dev.channel, 2);
    }
    #[test]
    fn path_serial_is_rejected() {
        let err = PhidgetDevice::from_config(&loadcell("/dev/ttyUSB0"), PhidgetClass::Encoder);
        assert!(matches!(err, Err(ForceError::Configuration(_))));
    }
    #[cfg(unix)]
    mod fake {
        use super::*;
        use std::sync::atomic::{AtomicUsize, Ordering};
        pub static DELETED: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn create(handle: *mut Handle) -> c_int {
            *handle = std::ptr::NonNull::<u8>::dangling().as_ptr().cast();
            EPHIDGET_OK
        }
        unsafe extern "C" fn delete(handle: *mut Handle) -> c_int {
            DELETED.fetch_add(1, Ordering::SeqCst);
            *handle = std::ptr::null_mut();
            EPHIDGET_OK
        }
        unsafe extern "C" fn get_ratio(_: Handle, _: *mut c_double) -> c_int {
            EPHIDGET_OK
        }
        unsafe extern "C" fn get_position(_: Handle, _: *mut i64) -> c_int {
            EPHIDGET_OK
        }
        unsafe extern "C" fn set_position(_: Handle, _: i64) -> c_int {
            EPHIDGET_OK
        }
        unsafe extern "C" fn set_u32(_: Handle, _: u32) -> c_int {
            EPHIDGET_OK
        }
        unsafe extern "C" fn set_i32(_: Handle, _: i32) -> c_int {
            EPHIDGET_OK
        }
        // 0x03 is EPHIDGET_TIMEOUT
        unsafe extern "C" fn attach_times_out(_: Handle, _: u32) -> c_int {
            0x03
        }
        unsafe extern "C" fn close(_: Handle) -> c_int {
            EPHIDGET_OK
        }
        /// Symbol table whose boards never attach.
        pub fn unattached_api() -> PhidgetApi {
            PhidgetApi {
                lib: libloading::os::unix::Library::this().into(),
                voltage_ratio_create: create,
                voltage_ratio_delete: delete,
                voltage_ratio_get: get_ratio,
                voltage_ratio_set_interval: set_u32,
                encoder_create: create,
                encoder_delete: delete,
                encoder_get_position: get_position,
                encoder_set_position: set_position,
                encoder_set_interval: set_u32,
                set_serial_number: set_i32,
                set_channel: set_i32,
                open_wait_for_attachment: attach_times_out,
                close,
            }
        }
    }
    #[cfg(unix)]
    #[test]
    fn failed_attach_deletes_the_created_handle() {
        use std::sync::atomic::Ordering;
        let api = fake::unattached_api();
        let dev = PhidgetDevice::from_config(&loadcell("1"), PhidgetClass::Encoder).unwrap();
        let err = dev.attach(&api).unwrap_err();
        assert!(format!("{err:#}").contains("open failed"));
        assert_eq!(fake::DELETED.load(Ordering::SeqCst), 1);
    }
    #[test]
    fn reading_before_open_is_a_device_error() {
        let mut dev = PhidgetDevice::from_config(&loadcell("1"), PhidgetClass::VoltageRatio)
            .unwrap();
        // either the library is missing or the channel is not open
        assert!(matches!(dev.read_one(), Err(ForceError::Device { .. })));
    }
}
