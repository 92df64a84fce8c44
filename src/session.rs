// src/session.rs
//! Explicit context tying configuration, sensors, acquisition and processing together.
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{debug, info, warn};
use crate::autostop::AutoStop;
use crate::config::{ConfigStore, INTERVAL_RANGE_MS};
use crate::drivers::DeviceFactory;
use crate::engine::{AcquisitionEngine, Participant};
use crate::error::ForceError;
use crate::recorder;
use crate::sensors::SensorRegistry;
use crate::signal::SignalPipeline;
use crate::tare::{apply_tare, TareResult};
use crate::types::{ConnectionState, SensorId, TestStatus};

/// Outcome of a stopped test.
#[derive(Clone, Debug, PartialEq)]
pub struct TestSummary {
    pub run_id: u64,
    pub ticks: usize,
    pub sensors: usize,
    pub faulted: Vec<SensorId>,
    pub lost: Vec<SensorId>,
}

pub struct Session {
    config: ConfigStore,
    registry: SensorRegistry,
    engine: AcquisitionEngine,
    pipeline: SignalPipeline,
    auto_stop: Option<AutoStop>,
    interval_ms: u64,
}

impl Session {
    pub fn new(config: ConfigStore, factory: &dyn DeviceFactory) -> Self {
        let registry = SensorRegistry::from_config(&config, factory);
        let interval_ms = config.recording_settings().interval_ms;
        Self {
            config,
            registry,
            engine: AcquisitionEngine::new(),
            pipeline: SignalPipeline::new(),
            auto_stop: None,
            interval_ms,
        }
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn registry(&self) -> &SensorRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &SignalPipeline {
        &self.pipeline
    }

    pub fn engine(&self) -> &AcquisitionEngine {
        &self.engine
    }

    pub fn status(&self) -> TestStatus {
        self.engine.status()
    }

    /// Marks sensors that failed in the running test as errored.
    ///
    /// Returns the ones not reported before.
    pub fn sync_faults(&mut self) -> Vec<SensorId> {
        let mut fresh = Vec::new();
        for sensor in self.engine.faulted_sensors() {
            let known = self
                .registry
                .sensor(sensor)
                .is_some_and(|s| s.state() == ConnectionState::Error);
            if !known {
                self.registry.mark_error(sensor);
                fresh.push(sensor);
            }
        }
        fresh
    }

    /// Rebuilds the sensor arena after the configuration changed.
    pub fn reload(&mut self, factory: &dyn DeviceFactory) -> Result<(), ForceError> {
        if self.engine.current_run().is_some() {
            return Err(ForceError::Precondition(
                "cannot reload sensors while a test is running".into(),
            ));
        }
        self.registry = SensorRegistry::from_config(&self.config, factory);
        Ok(())
    }

    /// Opens every channel; returns whether any sensor is available.
    ///
    /// Refused while a test runs, since the devices are on loan to the engine.
    pub fn check_connections(&mut self) -> Result<bool, ForceError> {
        if self.engine.current_run().is_some() {
            return Err(ForceError::Precondition(
                "cannot check connections while a test is running".into(),
            ));
        }
        self.registry.check_connections();
        Ok(self.registry.any_available())
    }

    fn cancel_auto_stop(&mut self) {
        if let Some(mut timer) = self.auto_stop.take() {
            let pending = timer.is_pending();
            if timer.cancel() {
                debug!("Auto-stop for test {} had already fired", timer.run_id());
            } else if pending {
                debug!("Pending auto-stop for test {} cancelled", timer.run_id());
            }
        }
    }

    /// Starts a test at the configured interval, optionally stopping itself after `auto_stop`.
    pub fn test_start(&mut self, auto_stop: Option<Duration>) -> Result<u64, ForceError> {
        self.cancel_auto_stop();
        if self.engine.current_run().is_some() {
            return Err(ForceError::Precondition("a test is already running".into()));
        }
        let ids = self.registry.acquisition_sensors();
        if ids.is_empty() {
            return Err(ForceError::Precondition(
                "no sensor is available for acquisition".into(),
            ));
        }
        let interval_ms = self
            .config
            .recording_settings()
            .interval_ms
            .clamp(*INTERVAL_RANGE_MS.start(), *INTERVAL_RANGE_MS.end());
        let mut participants = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(sensor) = self.registry.sensor(id) else {
                continue;
            };
            let (name, kind) = (sensor.name().to_owned(), sensor.kind());
            match self.registry.take_device(id) {
                Some(device) => participants.push(Participant {
                    sensor: id,
                    name,
                    kind,
                    device,
                }),
                None => warn!("{name} has no device, left out of the test"),
            }
        }
        let run_id = self
            .engine
            .test_start(participants, Duration::from_millis(interval_ms))?;
        self.interval_ms = interval_ms;
        if let Some(after) = auto_stop {
            self.auto_stop = Some(AutoStop::arm(self.engine.clone(), run_id, after));
        }
        Ok(run_id)
    }

    /// Tares calibrated sensors with the configured window size and persists the intercepts.
    pub fn tare(&mut self) -> Result<Vec<TareResult>, ForceError> {
        let settings = self.config.recording_settings();
        let windows = self
            .engine
            .tare(settings.tare_amount, Duration::from_millis(self.interval_ms))?;
        apply_tare(&mut self.registry, &mut self.config, &windows)
    }

    /// Stops the test, gives the devices back and loads the result into the pipeline.
    ///
    /// The configured filter is applied right away; sampling frequency is
    /// `1000 / interval_ms`.
    pub fn test_stop(&mut self) -> Result<TestSummary, ForceError> {
        self.cancel_auto_stop();
        let run_id = self.engine.current_run().unwrap_or_default();
        let finished = self.engine.test_stop()?;
        for (sensor, device) in finished.devices {
            self.registry.restore_device(sensor, device);
        }
        for sensor in finished.faulted.iter().chain(&finished.lost) {
            self.registry.mark_error(*sensor);
        }
        self.pipeline.load_data(&finished.test, &self.registry)?;
        if let Err(e) = self.apply_filter(None, None) {
            warn!("Filter not applied: {e}");
        }
        Ok(TestSummary {
            run_id,
            ticks: finished.test.len(),
            sensors: finished.test.sequences.len(),
            faulted: finished.faulted,
            lost: finished.lost,
        })
    }

    pub fn sampling_frequency(&self) -> f64 {
        1000.0 / self.interval_ms as f64
    }

    /// Filters with explicit or configured parameters; the default cutoff sits just below Nyquist.
    pub fn apply_filter(&mut self, fc: Option<f64>, order: Option<usize>) -> Result<(), ForceError> {
        let settings = self.config.filter_settings();
        let fs = self.sampling_frequency();
        let fc = fc.or(settings.fc_hz).unwrap_or((fs - 0.02) / 2.0);
        let order = order.unwrap_or(settings.order);
        self.pipeline.apply_filter(fs, fc, order)?;
        info!("Filter applied: fs={fs:.2} Hz, fc={fc:.2} Hz, order {order}");
        Ok(())
    }

    /// Exports the three tables under the configured test name.
    pub fn export(&self, dir: &Path, idx1: usize, idx2: usize) -> Result<Vec<PathBuf>, ForceError> {
        recorder::export_tables(&self.pipeline, dir, &self.config.test_name(), idx1, idx2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;
    use crate::drivers::{ScriptedDevice, SensorDevice};
    use crate::types::{Reading, SensorKind};
    use std::thread;
    use std::time::Instant;

    const DOC: &str = r#"
general_settings:
  test:
    name: Balance
  recording:
    data_interval_ms: 10
    tare_data_amount: 10
  filter:
    order: 2
sensor_groups:
  platform_1:
    name: Platform
    type: GROUP_PLATFORM
    sensor_list: [z1, z2]
  legs:
    name: Legs
    type: GROUP_DEFAULT
    sensor_list: [imu, enc]
sensors:
  z1: {name: LC_Z_1, type: SENSOR_LOADCELL, calibration: {slope: 100.0, intercept: 0.0}}
  z2: {name: LC_Z_2, type: SENSOR_LOADCELL, calibration: {slope: 100.0, intercept: 0.0}}
  imu: {name: IMU, type: SENSOR_IMU}
  enc: {name: ENC, type: SENSOR_ENCODER}
"#;

    fn factory(cfg: &SensorConfig) -> Result<Box<dyn SensorDevice>, ForceError> {
        let reading = match cfg.kind {
            SensorKind::Imu => Reading::Imu([0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 9.8]),
            _ => Reading::Scalar(0.25),
        };
        let device = ScriptedDevice::constant(&cfg.name, reading);
        Ok(Box::new(if cfg.name == "ENC" {
            device.failing_at(40)
        } else {
            device
        }))
    }

    fn wait_for(session: &Session, samples: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while session.status().samples < samples {
            assert!(Instant::now() < deadline, "acquisition stalled");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn full_cycle_with_tare_and_fault() {
        let config = ConfigStore::from_yaml(DOC).unwrap();
        let mut session = Session::new(config, &factory);
        assert!(matches!(session.tare(), Err(ForceError::Precondition(_))));
        assert!(session.check_connections().unwrap());
        session.test_start(None).unwrap();
        assert!(matches!(
            session.test_start(None),
            Err(ForceError::Precondition(_))
        ));
        wait_for(&session, 3);
        let tared = session.tare().unwrap();
        assert_eq!(tared.len(), 3);
        for result in tared.iter().filter(|r| r.sensor.0 < 2) {
            assert!((result.new_intercept - -25.0).abs() < 1e-9);
        }
        wait_for(&session, 50);
        let summary = session.test_stop().unwrap();
        assert!(summary.ticks >= 50);
        assert_eq!(summary.sensors, 4);
        let enc = session.registry().find_sensor("ENC").unwrap();
        assert_eq!(summary.faulted, vec![enc.id()]);
        assert_eq!(enc.state(), ConnectionState::Error);

        let pipeline = session.pipeline();
        assert_eq!(pipeline.row_count(), summary.ticks);
        let calibrated = pipeline.calibrated_dataframe(0, 0);
        let z1 = calibrated.table.column_vec("LC_Z_1").unwrap();
        assert!(z1.iter().all(|v| v.abs() < 1e-9));
        let enc_values = calibrated.table.column_vec("ENC").unwrap();
        assert!(enc_values.iter().any(|v| v.is_nan()));
        assert!(pipeline.filter_params().is_some());
        assert_eq!(session.sampling_frequency(), 100.0);
        assert_eq!(session.config().get_or("sensors.z1.calibration.intercept", 0.0), -25.0);
    }

    #[test]
    fn auto_stop_ends_the_test() {
        let config = ConfigStore::from_yaml(DOC).unwrap();
        let mut session = Session::new(config, &factory);
        session.check_connections().unwrap();
        session
            .test_start(Some(Duration::from_millis(60)))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.status().recording {
            assert!(Instant::now() < deadline, "auto-stop never fired");
            thread::sleep(Duration::from_millis(5));
        }
        let summary = session.test_stop().unwrap();
        assert!(summary.ticks >= 1);
    }

    #[test]
    fn connection_check_is_refused_mid_test() {
        let config = ConfigStore::from_yaml(DOC).unwrap();
        let mut session = Session::new(config, &factory);
        session.check_connections().unwrap();
        session.test_start(None).unwrap();
        wait_for(&session, 5);
        assert!(matches!(
            session.check_connections(),
            Err(ForceError::Precondition(_))
        ));
        let summary = session.test_stop().unwrap();
        assert_eq!(summary.sensors, 4);
        let columns = session.pipeline().table(crate::signal::TableKind::Raw).columns().len();
        assert_eq!(columns, 2 + 1 + 10);
        let z1 = session.registry().find_sensor("LC_Z_1").unwrap();
        assert_eq!(z1.state(), ConnectionState::Available);
        // the devices are back, so the next check and test work
        assert!(session.check_connections().unwrap());
        session.test_start(None).unwrap();
        wait_for(&session, 2);
        session.test_stop().unwrap();
    }

    #[test]
    fn read_failure_is_visible_while_recording() {
        let config = ConfigStore::from_yaml(DOC).unwrap();
        let mut session = Session::new(config, &factory);
        session.check_connections().unwrap();
        session.test_start(None).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while session.status().faulted == 0 {
            assert!(Instant::now() < deadline, "fault never reported");
            thread::sleep(Duration::from_millis(2));
        }
        let enc = session.registry().find_sensor("ENC").unwrap().id();
        assert_eq!(session.sync_faults(), vec![enc]);
        assert!(session.status().recording);
        let state = session.registry().sensor(enc).unwrap().state();
        assert_eq!(state, ConnectionState::Error);
        assert!(session.sync_faults().is_empty());
        let summary = session.test_stop().unwrap();
        assert_eq!(summary.faulted, vec![enc]);
    }

    #[test]
    fn nothing_enabled_means_no_test() {
        let doc = DOC
            .replace("name: Platform\n", "name: Platform\n    read: false\n")
            .replace("name: Legs\n", "name: Legs\n    read: false\n");
        let mut session = Session::new(ConfigStore::from_yaml(&doc).unwrap(), &factory);
        assert!(!session.check_connections().unwrap());
        assert!(matches!(
            session.test_start(None),
            Err(ForceError::Precondition(_))
        ));
    }

    #[test]
    fn exports_under_test_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::from_yaml(DOC).unwrap();
        let mut session = Session::new(config, &factory);
        session.check_connections().unwrap();
        session.test_start(None).unwrap();
        wait_for(&session, 3);
        session.test_stop().unwrap();
        let files = session.export(dir.path(), 0, 0).unwrap();
        assert!(files[0].ends_with("Balance_RAW.csv"));
        let text = std::fs::read_to_string(&files[2]).unwrap();
        assert!(text.starts_with("timestamp,LC_Z_1,LC_Z_2,IMU_qx"));
    }
}
