//! Arena of sensors and groups built from the configuration document.
use std::collections::HashMap;
use log::{info, warn};
use crate::config::ConfigStore;
use crate::drivers::{DeviceFactory, SensorDevice};
use crate::error::ForceError;
use crate::sensors::{Sensor, SensorGroup};
use crate::types::{Calibration, ConnectionState, GroupId, GroupStatus, SensorId};

#[derive(Default)]
pub struct SensorRegistry {
    sensors: Vec<Sensor>,
    groups: Vec<SensorGroup>,
}

impl SensorRegistry {
    /// Loads every group and the sensors its `sensor_list` names.
    ///
    /// Sensors no group lists are not loaded. A sensor listed twice stays
    /// with the first group. Device construction failures leave the sensor
    /// without a device, so it reports `NotFound` on the next check.
    pub fn from_config(config: &ConfigStore, factory: &dyn DeviceFactory) -> Self {
        let declared: HashMap<String, _> = config.sensors().into_iter().collect();
        let mut registry = Self::default();
        let mut owner: HashMap<String, GroupId> = HashMap::new();
        for (key, group_cfg) in config.groups() {
            let gid = GroupId(registry.groups.len());
            let mut group = SensorGroup::new(
                gid,
                key.clone(),
                group_cfg.name.clone(),
                group_cfg.kind,
                group_cfg.read,
                group_cfg.properties.clone(),
            );
            for sensor_key in &group_cfg.sensor_list {
                let Some(sensor_cfg) = declared.get(sensor_key) else {
                    warn!("Group {key} lists unknown sensor {sensor_key}");
                    continue;
                };
                if let Some(first) = owner.get(sensor_key) {
                    warn!(
                        "Sensor {sensor_key} already belongs to {}, skipped in {key}",
                        registry.groups[first.0].key()
                    );
                    continue;
                }
                let device = match factory.build(sensor_cfg) {
                    Ok(device) => Some(device),
                    Err(e) => {
                        warn!("No device for {}: {e}", sensor_cfg.name);
                        None
                    }
                };
                let sid = SensorId(registry.sensors.len());
                registry.sensors.push(Sensor::new(
                    sid,
                    sensor_key.clone(),
                    sensor_cfg.name.clone(),
                    sensor_cfg.kind,
                    gid,
                    sensor_cfg.read,
                    Calibration {
                        slope: sensor_cfg.calibration.slope,
                        intercept: sensor_cfg.calibration.intercept,
                    },
                    device,
                ));
                owner.insert(sensor_key.clone(), gid);
                group.push(sid);
            }
            registry.groups.push(group);
        }
        info!(
            "Loaded {} sensors in {} groups",
            registry.sensors.len(),
            registry.groups.len()
        );
        registry
    }

    pub fn sensor(&self, id: SensorId) -> Option<&Sensor> {
        self.sensors.get(id.0)
    }

    fn group(&self, id: GroupId) -> Option<&SensorGroup> {
        self.groups.get(id.0)
    }

    pub fn find_sensor(&self, name: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.name() == name)
    }

    pub fn all_sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    /// Groups in declaration order; `only_available` keeps enabled groups in `Ok` status.
    pub fn groups(&self, only_available: bool) -> Vec<&SensorGroup> {
        self.groups
            .iter()
            .filter(|g| !only_available || (g.read() && g.status() == GroupStatus::Ok))
            .collect()
    }

    pub fn sensors_of(&self, group: GroupId, only_available: bool) -> Vec<&Sensor> {
        let Some(group) = self.group(group) else {
            return Vec::new();
        };
        group
            .sensors()
            .iter()
            .filter_map(|id| self.sensor(*id))
            .filter(|s| !only_available || s.is_available())
            .collect()
    }

    /// Opens every channel and derives the group status from the results.
    pub fn check_connections(&mut self) {
        for group in &mut self.groups {
            let mut enabled = 0;
            let mut available = 0;
            for id in group.sensors() {
                let sensor = &mut self.sensors[id.0];
                if sensor.read() {
                    enabled += 1;
                }
                if sensor.check_connection(group.read()) == ConnectionState::Available {
                    available += 1;
                }
            }
            let status = if !group.read() {
                GroupStatus::Ignored
            } else if enabled > 0 && available == 0 {
                GroupStatus::Error
            } else {
                GroupStatus::Ok
            };
            info!(
                "Group {}: {available}/{} sensors available ({status:?})",
                group.name(),
                group.sensors().len()
            );
            group.set_status(status);
        }
    }

    /// True once at least one sensor passed its connection check.
    pub fn any_available(&self) -> bool {
        self.sensors.iter().any(Sensor::is_available)
    }

    /// Sensors that take part in a test: available, enabled, in an enabled non-error group.
    pub fn acquisition_sensors(&self) -> Vec<SensorId> {
        self.groups
            .iter()
            .filter(|g| g.read() && g.status() != GroupStatus::Error)
            .flat_map(|g| g.sensors().iter().copied())
            .filter(|id| {
                self.sensor(*id)
                    .map(|s| s.read() && s.is_available())
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn set_sensor_read(
        &mut self,
        config: &mut ConfigStore,
        group: GroupId,
        sensor: SensorId,
        read: bool,
    ) -> Result<(), ForceError> {
        let belongs = self
            .group(group)
            .map(|g| g.sensors().contains(&sensor))
            .unwrap_or(false);
        if !belongs {
            return Err(ForceError::Precondition(format!(
                "sensor {sensor:?} is not a member of group {group:?}"
            )));
        }
        let entry = &mut self.sensors[sensor.0];
        entry.set_read(read);
        config.set_value(&format!("sensors.{}.read", entry.key()), read)?;
        config.save()
    }

    pub fn set_group_read(
        &mut self,
        config: &mut ConfigStore,
        group: GroupId,
        read: bool,
    ) -> Result<(), ForceError> {
        let entry = self
            .groups
            .get_mut(group.0)
            .ok_or_else(|| ForceError::Precondition(format!("unknown group {group:?}")))?;
        entry.set_read(read);
        if !read {
            entry.set_status(GroupStatus::Ignored);
        }
        config.set_value(&format!("sensor_groups.{}.read", entry.key()), read)?;
        config.save()
    }

    /// Stores a new intercept and persists it to `sensors.<id>.calibration.intercept`.
    pub fn set_intercept(
        &mut self,
        config: &mut ConfigStore,
        sensor: SensorId,
        intercept: f64,
    ) -> Result<(), ForceError> {
        let entry = self
            .sensors
            .get_mut(sensor.0)
            .ok_or_else(|| ForceError::Precondition(format!("unknown sensor {sensor:?}")))?;
        if !entry.kind().is_calibrated() {
            return Ok(());
        }
        entry.set_intercept(intercept);
        config.set_value(
            &format!("sensors.{}.calibration.intercept", entry.key()),
            intercept,
        )
    }

    pub(crate) fn take_device(&mut self, sensor: SensorId) -> Option<Box<dyn SensorDevice>> {
        self.sensors.get_mut(sensor.0)?.take_device()
    }

    pub(crate) fn restore_device(&mut self, sensor: SensorId, device: Box<dyn SensorDevice>) {
        if let Some(entry) = self.sensors.get_mut(sensor.0) {
            entry.restore_device(device);
        }
    }

    pub(crate) fn mark_error(&mut self, sensor: SensorId) {
        if let Some(entry) = self.sensors.get_mut(sensor.0) {
            entry.set_state(ConnectionState::Error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;
    use crate::drivers::ScriptedDevice;
    use crate::types::Reading;

    const DOC: &str = r#"
sensor_groups:
  platform_1:
    name: Platform
    type: GROUP_PLATFORM
    sensor_list: [lc_z1, lc_z2, ghost]
  legs:
    name: Legs
    type: GROUP_DEFAULT
    sensor_list: [imu_1, lc_z1, enc_1]
  spare:
    name: Spare
    type: GROUP_DEFAULT
    read: false
    sensor_list: [lc_x1]
  broken:
    name: Broken
    type: GROUP_DEFAULT
    sensor_list: [missing_1]
sensors:
  lc_z1:
    name: LC_Z_1
    type: SENSOR_LOADCELL
    calibration: {slope: 2.0, intercept: 1.0}
  lc_z2:
    name: LC_Z_2
    type: SENSOR_LOADCELL
    read: false
  lc_x1:
    name: LC_X_1
    type: SENSOR_LOADCELL
  imu_1:
    name: IMU_1
    type: SENSOR_IMU
    calibration: {slope: 5.0, intercept: 3.0}
  enc_1:
    name: Encoder_1
    type: SENSOR_ENCODER
  missing_1:
    name: missing_1
    type: SENSOR_ENCODER
  unlisted:
    name: Unlisted
    type: SENSOR_LOADCELL
"#;

    fn factory(cfg: &SensorConfig) -> Result<Box<dyn SensorDevice>, ForceError> {
        let dev = ScriptedDevice::constant(&cfg.name, Reading::sentinel(cfg.kind));
        Ok(Box::new(if cfg.name.contains("missing") {
            dev.disconnected()
        } else {
            dev
        }))
    }

    fn registry() -> (ConfigStore, SensorRegistry) {
        let config = ConfigStore::from_yaml(DOC).unwrap();
        let registry = SensorRegistry::from_config(&config, &factory);
        (config, registry)
    }

    #[test]
    fn loads_only_listed_sensors_once() {
        let (_, reg) = registry();
        let names: Vec<_> = reg.all_sensors().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec!["LC_Z_1", "LC_Z_2", "IMU_1", "Encoder_1", "LC_X_1", "missing_1"]
        );
        let legs = reg.groups(false)[1];
        assert_eq!(reg.sensors_of(legs.id(), false).len(), 2);
        assert!(reg.find_sensor("Unlisted").is_none());
    }

    #[test]
    fn imu_calibration_is_identity() {
        let (_, reg) = registry();
        let imu = reg.find_sensor("IMU_1").unwrap();
        assert_eq!(imu.calibration(), Calibration::identity());
        let lc = reg.find_sensor("LC_Z_1").unwrap();
        assert_eq!(lc.calibration().slope, 2.0);
    }

    #[test]
    fn connection_check_sets_states_and_group_status() {
        let (_, mut reg) = registry();
        assert!(!reg.any_available());
        reg.check_connections();
        assert!(reg.any_available());
        let state = |name: &str| reg.find_sensor(name).unwrap().state();
        assert_eq!(state("LC_Z_1"), ConnectionState::Available);
        assert_eq!(state("LC_Z_2"), ConnectionState::Ignored);
        assert_eq!(state("LC_X_1"), ConnectionState::Ignored);
        assert_eq!(state("missing_1"), ConnectionState::NotFound);
        let status: Vec<_> = reg.groups(false).iter().map(|g| g.status()).collect();
        assert_eq!(
            status,
            vec![
                GroupStatus::Ok,
                GroupStatus::Ok,
                GroupStatus::Ignored,
                GroupStatus::Error
            ]
        );
        assert_eq!(reg.groups(true).len(), 2);
    }

    #[test]
    fn disabled_group_contributes_no_sensors() {
        let (_, mut reg) = registry();
        reg.check_connections();
        let ids = reg.acquisition_sensors();
        let names: Vec<_> = ids
            .iter()
            .map(|id| reg.sensor(*id).unwrap().name())
            .collect();
        assert_eq!(names, vec!["LC_Z_1", "IMU_1", "Encoder_1"]);
    }

    #[test]
    fn toggles_are_persisted() {
        let (mut config, mut reg) = registry();
        let platform = reg.groups(false)[0].id();
        let lc_z2 = reg.find_sensor("LC_Z_2").unwrap().id();
        reg.set_sensor_read(&mut config, platform, lc_z2, true).unwrap();
        assert_eq!(config.get_or("sensors.lc_z2.read", false), true);
        reg.set_group_read(&mut config, platform, false).unwrap();
        assert_eq!(config.get_or("sensor_groups.platform_1.read", true), false);
        reg.check_connections();
        assert_eq!(
            reg.find_sensor("LC_Z_2").unwrap().state(),
            ConnectionState::Ignored
        );
        let imu = reg.find_sensor("IMU_1").unwrap().id();
        assert!(reg.set_sensor_read(&mut config, platform, imu, false).is_err());
    }

    #[test]
    fn intercept_is_written_back() {
        let (mut config, mut reg) = registry();
        let lc = reg.find_sensor("LC_Z_1").unwrap().id();
        reg.set_intercept(&mut config, lc, -4.5).unwrap();
        assert_eq!(reg.sensor(lc).unwrap().calibration().intercept, -4.5);
        assert_eq!(config.get_or("sensors.lc_z1.calibration.intercept", 0.0), -4.5);
        let imu = reg.find_sensor("IMU_1").unwrap().id();
        reg.set_intercept(&mut config, imu, 9.0).unwrap();
        assert_eq!(reg.sensor(imu).unwrap().calibration(), Calibration::identity());
    }
}
