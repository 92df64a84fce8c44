// src/tare.rs
//! Re-zeroing of calibrated sensors from a window sampled mid-test.
use log::{info, warn};
use crate::config::ConfigStore;
use crate::error::ForceError;
use crate::sensors::SensorRegistry;
use crate::types::{Calibration, SensorId};

/// Raw values one sensor delivered during a tare window.
#[derive(Debug, Clone, PartialEq)]
pub struct TareWindow {
    pub sensor: SensorId,
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TareResult {
    pub sensor: SensorId,
    pub old_intercept: f64,
    pub new_intercept: f64,
}

/// Intercept that makes the calibrated mean of `values` zero:
/// `b_new = b_old - mean(slope * v + b_old)`.
pub fn tared_intercept(calibration: Calibration, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().map(|v| calibration.apply(*v)).sum::<f64>() / values.len() as f64;
    Some(calibration.intercept - mean)
}

/// Writes the new intercepts to the registry and persists them.
pub fn apply_tare(
    registry: &mut SensorRegistry,
    config: &mut ConfigStore,
    windows: &[TareWindow],
) -> Result<Vec<TareResult>, ForceError> {
    let mut results = Vec::with_capacity(windows.len());
    for window in windows {
        let Some(sensor) = registry.sensor(window.sensor) else {
            continue;
        };
        if !sensor.kind().is_calibrated() {
            continue;
        }
        let calibration = sensor.calibration();
        let Some(intercept) = tared_intercept(calibration, &window.values) else {
            warn!("{}: empty tare window, intercept kept", window.name);
            continue;
        };
        registry.set_intercept(config, window.sensor, intercept)?;
        info!(
            "{} tared over {} samples: intercept {:.6} -> {:.6}",
            window.name,
            window.values.len(),
            calibration.intercept,
            intercept
        );
        results.push(TareResult {
            sensor: window.sensor,
            old_intercept: calibration.intercept,
            new_intercept: intercept,
        });
    }
    config.save()?;
    Ok(results)
}
