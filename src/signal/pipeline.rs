// src/signal/pipeline.rs
use log::{debug, error, info};
use crate::config::FILTER_ORDER_RANGE;
use crate::engine::Test;
use crate::error::ForceError;
use crate::sensors::{AxisMembers, SensorRegistry};
use crate::signal::butterworth::Butterworth;
use crate::signal::orientation::euler_series;
use crate::signal::platform::{
    center_of_pressure, confidence_ellipse, AxisForces, ConfidenceEllipse, CopTrace,
    PlatformDimensions, PlatformForces,
};
use crate::signal::table::{DataTable, TableWindow};
use crate::types::{GroupKind, GroupStatus, Reading, SensorKind, SENTINEL};

pub const IMU_ANGLE_SUFFIXES: [&str; 4] = ["qx", "qy", "qz", "qw"];
pub const IMU_VELOCITY_SUFFIXES: [&str; 3] = ["wx", "wy", "wz"];
pub const IMU_ACCELERATION_SUFFIXES: [&str; 3] = ["x_acc", "y_acc", "z_acc"];
pub const ANGLES_SUFFIX: &str = "_ANGLES";
pub const VELOCITIES_SUFFIX: &str = "_VELOCITIES";
pub const ACCELERATIONS_SUFFIX: &str = "_ACCELERATIONS";
pub const FORCES_SUFFIX: &str = "_FORCES";
pub const COP_SUFFIX: &str = "_COP";

/// Columns and unit label of one sensor figure.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorFigureSpec {
    pub columns: Vec<String>,
    pub units: &'static str,
}

/// Load-cell columns of one platform, split by axis.
#[derive(Clone, Debug, PartialEq)]
pub struct PlatformFigureSpec {
    pub group: String,
    pub axes: AxisMembers,
    pub dimensions: PlatformDimensions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Raw,
    Calibrated,
    Filtered,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterParams {
    pub fs: f64,
    pub fc: f64,
    pub order: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SensorSeries {
    pub units: &'static str,
    pub columns: Vec<(String, Vec<f64>)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlatformCop {
    pub trace: CopTrace,
    pub ellipse: Option<ConfidenceEllipse>,
}

/// Post-acquisition tables and the figures derived from them.
///
/// `filtered` is always computed from `calibrated` in one pass and stays
/// empty until [`SignalPipeline::apply_filter`] succeeds.
#[derive(Default)]
pub struct SignalPipeline {
    timestamps: Vec<u64>,
    raw: DataTable,
    calibrated: DataTable,
    filtered: DataTable,
    filter: Option<FilterParams>,
    sensor_figures: Vec<(String, SensorFigureSpec)>,
    platform_figures: Vec<(String, PlatformFigureSpec)>,
}

impl SignalPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn clear(&mut self, rows: usize) {
        self.raw = DataTable::with_rows(rows);
        self.calibrated = DataTable::with_rows(rows);
        self.filtered = DataTable::with_rows(rows);
        self.filter = None;
        self.sensor_figures.clear();
        self.platform_figures.clear();
    }

    /// Rebuilds every table from a finished test.
    ///
    /// Sensors count when they are enabled, belong to an enabled group that
    /// is not in error, and have a sequence in `test`.
    pub fn load_data(&mut self, test: &Test, registry: &SensorRegistry) -> Result<(), ForceError> {
        let rows = test.len();
        self.clear(rows);
        self.timestamps = test.timestamps.clone();
        for group in registry.groups(false) {
            if !group.read() || group.status() == GroupStatus::Error {
                continue;
            }
            let mut loadcells = Vec::new();
            for sensor in registry.sensors_of(group.id(), false) {
                if !sensor.read() {
                    continue;
                }
                let Some(sequence) = test.sequence(sensor.id()) else {
                    continue;
                };
                if sequence.values.len() != rows {
                    return Err(ForceError::Precondition(format!(
                        "{} has {} values for {rows} timestamps",
                        sensor.name(),
                        sequence.values.len()
                    )));
                }
                if sensor.kind() == SensorKind::Imu {
                    self.load_imu(sensor.name(), &sequence.values)?;
                    continue;
                }
                let raw: Vec<f64> = sequence
                    .values
                    .iter()
                    .map(|r| r.scalar().unwrap_or(SENTINEL))
                    .collect();
                let calibration = sensor.calibration();
                let calibrated: Vec<f64> = raw.iter().map(|v| calibration.apply(*v)).collect();
                self.raw.push_column(sensor.name(), &raw)?;
                self.calibrated.push_column(sensor.name(), &calibrated)?;
                self.sensor_figures.push((
                    sensor.name().to_owned(),
                    SensorFigureSpec {
                        columns: vec![sensor.name().to_owned()],
                        units: sensor.kind().units(),
                    },
                ));
                if sensor.kind() == SensorKind::Loadcell {
                    loadcells.push(sensor.name());
                }
            }
            if group.kind() != GroupKind::Platform {
                continue;
            }
            let axes = AxisMembers::classify(loadcells);
            if axes.is_empty() {
                continue;
            }
            let spec = PlatformFigureSpec {
                group: group.name().to_owned(),
                dimensions: PlatformDimensions::from_properties(group.properties()),
                axes,
            };
            if spec.axes.supports_cop() {
                self.platform_figures
                    .push((format!("{}{COP_SUFFIX}", group.name()), spec.clone()));
            }
            self.platform_figures
                .push((format!("{}{FORCES_SUFFIX}", group.name()), spec));
        }
        info!(
            "Loaded {rows} ticks into {} columns ({} sensor figures, {} platform figures)",
            self.raw.columns().len(),
            self.sensor_figures.len(),
            self.platform_figures.len()
        );
        Ok(())
    }

    fn load_imu(&mut self, name: &str, values: &[Reading]) -> Result<(), ForceError> {
        let suffixes = IMU_ANGLE_SUFFIXES
            .iter()
            .chain(&IMU_VELOCITY_SUFFIXES)
            .chain(&IMU_ACCELERATION_SUFFIXES);
        for (i, suffix) in suffixes.enumerate() {
            let column: Vec<f64> = values
                .iter()
                .map(|r| r.components().get(i).copied().unwrap_or(SENTINEL))
                .collect();
            let header = format!("{name}_{suffix}");
            self.raw.push_column(&header, &column)?;
            self.calibrated.push_column(&header, &column)?;
        }
        let headers = |suffixes: &[&str]| -> Vec<String> {
            suffixes.iter().map(|s| format!("{name}_{s}")).collect()
        };
        self.sensor_figures.push((
            format!("{name}{ANGLES_SUFFIX}"),
            SensorFigureSpec {
                columns: headers(&IMU_ANGLE_SUFFIXES),
                units: "Angle (deg)",
            },
        ));
        self.sensor_figures.push((
            format!("{name}{VELOCITIES_SUFFIX}"),
            SensorFigureSpec {
                columns: headers(&IMU_VELOCITY_SUFFIXES),
                units: "Angular velocity (deg/s)",
            },
        ));
        self.sensor_figures.push((
            format!("{name}{ACCELERATIONS_SUFFIX}"),
            SensorFigureSpec {
                columns: headers(&IMU_ACCELERATION_SUFFIXES),
                units: "Linear acceleration (m/s2)",
            },
        ));
        Ok(())
    }

    /// Zero-phase low-pass of every calibrated column.
    ///
    /// On invalid parameters the previous `filtered` table is kept.
    pub fn apply_filter(&mut self, fs: f64, fc: f64, order: usize) -> Result<(), ForceError> {
        if !FILTER_ORDER_RANGE.contains(&order) {
            return Err(ForceError::Configuration(format!(
                "filter order {order} outside {FILTER_ORDER_RANGE:?}"
            )));
        }
        let filter = Butterworth::from_frequencies(order, fs, fc)?;
        self.filtered = self.calibrated.map_columns(|column| filter.filtfilt(column));
        self.filter = Some(FilterParams { fs, fc, order });
        debug!(
            "Filtered {} columns: fs={fs} Hz fc={fc} Hz order={order}",
            self.filtered.columns().len()
        );
        Ok(())
    }

    pub fn filter_params(&self) -> Option<FilterParams> {
        self.filter
    }

    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }

    /// Seconds since the first tick.
    pub fn time_increments(&self) -> Vec<f64> {
        let Some(&t0) = self.timestamps.first() else {
            return Vec::new();
        };
        self.timestamps
            .iter()
            .map(|t| t.saturating_sub(t0) as f64 / 1000.0)
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.raw.rows()
    }

    pub fn table(&self, kind: TableKind) -> &DataTable {
        match kind {
            TableKind::Raw => &self.raw,
            TableKind::Calibrated => &self.calibrated,
            TableKind::Filtered => &self.filtered,
        }
    }

    /// Rows `[idx1, idx2)` of one table; out-of-range requests return it whole.
    pub fn dataframe(&self, kind: TableKind, idx1: usize, idx2: usize) -> TableWindow {
        TableWindow::new(&self.timestamps, self.table(kind), idx1, idx2)
    }

    pub fn raw_dataframe(&self, idx1: usize, idx2: usize) -> TableWindow {
        self.dataframe(TableKind::Raw, idx1, idx2)
    }

    pub fn calibrated_dataframe(&self, idx1: usize, idx2: usize) -> TableWindow {
        self.dataframe(TableKind::Calibrated, idx1, idx2)
    }

    pub fn filtered_dataframe(&self, idx1: usize, idx2: usize) -> TableWindow {
        self.dataframe(TableKind::Filtered, idx1, idx2)
    }

    pub fn sensor_figure_options(&self) -> Vec<&str> {
        self.sensor_figures.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn platform_figure_options(&self) -> Vec<&str> {
        self.platform_figures.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn sensor_figure(&self, key: &str) -> Option<&SensorFigureSpec> {
        self.sensor_figures
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, spec)| spec)
    }

    pub fn platform_figure(&self, key: &str) -> Option<&PlatformFigureSpec> {
        self.platform_figures
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, spec)| spec)
    }

    fn filtered_column(&self, name: &str) -> Result<Vec<f64>, ForceError> {
        if self.filter.is_none() {
            return Err(ForceError::Precondition(
                "no filter has been applied to the loaded data".into(),
            ));
        }
        self.filtered
            .column_vec(name)
            .ok_or_else(|| ForceError::UnknownFigure(name.to_owned()))
    }

    fn unknown(key: &str) -> ForceError {
        error!("There is no data tagged as {key}");
        ForceError::UnknownFigure(key.to_owned())
    }

    /// Filtered columns of a sensor figure; `_ANGLES` figures come back as Euler angles.
    pub fn sensor_series(&self, key: &str) -> Result<SensorSeries, ForceError> {
        let spec = self.sensor_figure(key).ok_or_else(|| Self::unknown(key))?;
        let columns = spec
            .columns
            .iter()
            .map(|c| Ok((c.clone(), self.filtered_column(c)?)))
            .collect::<Result<Vec<_>, ForceError>>()?;
        let Some(name) = key.strip_suffix(ANGLES_SUFFIX) else {
            return Ok(SensorSeries {
                units: spec.units,
                columns,
            });
        };
        let q = |i: usize| columns[i].1.as_slice();
        // sequence order: the X angle is exported as `_yaw`
        let [first, second, third] = euler_series(q(0), q(1), q(2), q(3));
        Ok(SensorSeries {
            units: spec.units,
            columns: vec![
                (format!("{name}_yaw"), first),
                (format!("{name}_pitch"), second),
                (format!("{name}_roll"), third),
            ],
        })
    }

    fn axis(&self, names: &[String]) -> Result<AxisForces, ForceError> {
        let columns = names
            .iter()
            .map(|n| Ok((n.clone(), self.filtered_column(n)?)))
            .collect::<Result<Vec<_>, ForceError>>()?;
        Ok(AxisForces::new(columns, self.row_count()))
    }

    /// Filtered load-cell columns of a platform figure with per-axis totals.
    pub fn platform_forces(&self, key: &str) -> Result<PlatformForces, ForceError> {
        let spec = self.platform_figure(key).ok_or_else(|| Self::unknown(key))?;
        Ok(PlatformForces {
            x: self.axis(&spec.axes.x)?,
            y: self.axis(&spec.axes.y)?,
            z: self.axis(&spec.axes.z)?,
        })
    }

    /// Centered COP and its dispersion ellipse for a `_COP` figure.
    pub fn platform_cop(&self, key: &str) -> Result<PlatformCop, ForceError> {
        let spec = self
            .platform_figure(key)
            .filter(|spec| key.ends_with(COP_SUFFIX) && spec.axes.supports_cop())
            .ok_or_else(|| Self::unknown(key))?;
        let column = |n: &String| self.filtered_column(n);
        let x = spec.axes.x.iter().map(column).collect::<Result<Vec<_>, _>>()?;
        let y = spec.axes.y.iter().map(column).collect::<Result<Vec<_>, _>>()?;
        let z = spec.axes.z.iter().map(column).collect::<Result<Vec<_>, _>>()?;
        let trace = center_of_pressure(
            &spec.group,
            [&x[0], &x[1]],
            [&y[0], &y[1]],
            [&z[0], &z[1], &z[2], &z[3]],
            spec.dimensions,
        );
        let ellipse = confidence_ellipse(&trace.cop_x, &trace.cop_y);
        Ok(PlatformCop { trace, ellipse })
    }
}
