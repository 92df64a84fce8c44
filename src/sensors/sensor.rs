use log::{debug, info};
use crate::drivers::SensorDevice;
use crate::types::{Calibration, ConnectionState, GroupId, SensorId, SensorKind};
/// One physical channel and its calibration.
pub struct Sensor {
    id: SensorId,
    key: String,
    name: String,
    kind: SensorKind,
    group: GroupId,
    read: bool,
    state: ConnectionState,
    calibration: Calibration,
    device: Option<Box<dyn SensorDevice>>,
}
impl Sensor {
    pub(crate) fn new(
        id: SensorId,
        key: String,
        name: String,
        kind: SensorKind,
        group: GroupId,
        read: bool,
        calibration: Calibration,
        device: Option<Box<dyn SensorDevice>>,
    ) -> Self {
        // IMU vectors are stored as delivered
        let calibration = if kind.is_calibrated() {
            calibration
        } else {
            Calibration::identity()
        };
        Self {
            id,
            key,
            name,
            kind,
            group,
            read,
            state: ConnectionState::Ignored,
            calibration,
            device,
        }
    }
    pub fn id(&self) -> SensorId {
        self.id
    }
    /// Identifier used in the configuration document.
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> SensorKind {
        self.kind
    }
    pub fn group(&self) -> GroupId {
        self.group
    }
    pub fn read(&self) -> bool {
        self.read
    }
    pub fn state(&self) -> ConnectionState {
        self.state
    }
    pub fn is_available(&self) -> bool {
        self.state == ConnectionState::Available
    }
    pub fn calibration(&self) -> Calibration {
        self.calibration
    }
    pub(crate) fn set_read(&mut self, read: bool) {
        self.read = read;
    }
    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }
    pub(crate) fn set_intercept(&mut self, intercept: f64) {
        if self.kind.is_calibrated() {
            self.calibration.intercept = intercept;
        }
    }
    /// Opens the channel unless the sensor or its group is disabled.
    pub(crate) fn check_connection(&mut self, group_read: bool) -> ConnectionState {
        self.state = if !group_read || !self.read {
            if let Some(device) = self.device.as_mut() {
                device.close();
            }
            ConnectionState::Ignored
        } else {
            match self.device.as_mut() {
                Some(device) => match device.open() {
                    Ok(()) => ConnectionState::Available,
                    Err(e) => {
                        info!("{} not found: {e}", self.name);
                        ConnectionState::NotFound
                    }
                },
                None => ConnectionState::NotFound,
            }
        };
        debug!("{} -> {}", self.name, self.state);
        self.state
    }
    pub(crate) fn take_device(&mut self) -> Option<Box<dyn SensorDevice>> {
        self.device.take()
    }
    pub(crate) fn restore_device(&mut self, device: Box<dyn SensorDevice>) {
        self.device = Some(device);
    }
}
