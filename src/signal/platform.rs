// src/signal/platform.rs
//! Force-platform resultants, center of pressure and its dispersion ellipse.
//!
//! Load cells are assigned by declaration order: `X1, X2` and `Y1, Y2` are
//! opposing horizontal cells, `Z1..Z4` the vertical corner cells. The moment
//! equations assume that physical layout; a plate wired differently gives a
//! COP with swapped or inverted axes.
use std::f64::consts::PI;
use log::warn;
use serde_json::Value;

/// Vertical loads below this magnitude (N) make the COP division singular.
pub const FZ_EPSILON: f64 = 1e-6;
pub const ELLIPSE_POINTS: usize = 100;

/// Plate geometry in millimetres.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlatformDimensions {
    pub lx: f64,
    pub ly: f64,
    pub h: f64,
}

impl Default for PlatformDimensions {
    fn default() -> Self {
        Self {
            lx: 506.0,
            ly: 306.0,
            h: 50.6,
        }
    }
}

impl PlatformDimensions {
    /// Reads `lx_mm`, `ly_mm` and `h_mm` from group properties, keeping defaults for the rest.
    pub fn from_properties(properties: &Value) -> Self {
        let read = |key: &str, default: f64| {
            properties
                .get(key)
                .and_then(Value::as_f64)
                .unwrap_or(default)
        };
        let d = Self::default();
        Self {
            lx: read("lx_mm", d.lx),
            ly: read("ly_mm", d.ly),
            h: read("h_mm", d.h),
        }
    }
}

/// The cells of one axis and their per-tick sum.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AxisForces {
    pub columns: Vec<(String, Vec<f64>)>,
    pub total: Vec<f64>,
}

impl AxisForces {
    pub fn new(columns: Vec<(String, Vec<f64>)>, rows: usize) -> Self {
        let mut total = vec![0.0; rows];
        for (_, values) in &columns {
            total.iter_mut().zip(values).for_each(|(t, v)| *t += v);
        }
        if columns.is_empty() {
            total.clear();
        }
        Self { columns, total }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlatformForces {
    pub x: AxisForces,
    pub y: AxisForces,
    pub z: AxisForces,
}

/// Ticks where the vertical load was too small for a meaningful COP.
#[derive(Clone, Debug, PartialEq)]
pub struct SingularityWarning {
    pub group: String,
    pub ticks: usize,
    pub min_abs_fz: f64,
}

/// COP displacement from its mean, in millimetres.
#[derive(Clone, Debug, PartialEq)]
pub struct CopTrace {
    pub cop_x: Vec<f64>,
    pub cop_y: Vec<f64>,
    pub warning: Option<SingularityWarning>,
}

/// Computes the centered COP from two X, two Y and four Z cell series.
pub fn center_of_pressure(
    group: &str,
    x: [&[f64]; 2],
    y: [&[f64]; 2],
    z: [&[f64]; 4],
    dims: PlatformDimensions,
) -> CopTrace {
    let n = x
        .iter()
        .chain(&y)
        .chain(&z)
        .map(|c| c.len())
        .min()
        .unwrap_or(0);
    let mut cop_x = Vec::with_capacity(n);
    let mut cop_y = Vec::with_capacity(n);
    let mut singular = 0;
    let mut min_abs_fz = f64::INFINITY;
    for i in 0..n {
        let fx = x[0][i] - x[1][i];
        let fy = y[0][i] - y[1][i];
        let fz = z[0][i] + z[1][i] + z[2][i] + z[3][i];
        let mx = dims.ly / 2.0 * (-z[0][i] - z[1][i] + z[2][i] + z[3][i]) + dims.h * fy;
        let my = dims.lx / 2.0 * (z[0][i] - z[1][i] - z[2][i] + z[3][i]) - dims.h * fx;
        if fz.abs() < FZ_EPSILON {
            singular += 1;
        }
        min_abs_fz = min_abs_fz.min(fz.abs());
        cop_x.push(-my / fz);
        cop_y.push(mx / fz);
    }
    center(&mut cop_x);
    center(&mut cop_y);
    let warning = (singular > 0).then(|| {
        let warning = SingularityWarning {
            group: group.to_owned(),
            ticks: singular,
            min_abs_fz,
        };
        warn!(
            "{group}: vertical load near zero on {singular} ticks (min |fz| = {min_abs_fz:e} N), COP is unreliable there"
        );
        warning
    });
    CopTrace {
        cop_x,
        cop_y,
        warning,
    }
}

/// Subtracts the mean of the finite samples.
fn center(values: &mut [f64]) {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        return;
    }
    let mean = sum / count as f64;
    values.iter_mut().for_each(|v| *v -= mean);
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConfidenceEllipse {
    pub center: (f64, f64),
    /// Semi-axes in mm, major first.
    pub a: f64,
    pub b: f64,
    /// Orientation of the major axis, radians.
    pub theta: f64,
    pub area_cm2: f64,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

/// Covariance ellipse of a COP trace; `None` with fewer than two finite points.
pub fn confidence_ellipse(cop_x: &[f64], cop_y: &[f64]) -> Option<ConfidenceEllipse> {
    let points: Vec<(f64, f64)> = cop_x
        .iter()
        .zip(cop_y)
        .map(|(x, y)| (*x, *y))
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let x0 = points.iter().map(|p| p.0).sum::<f64>() / n;
    let y0 = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for (x, y) in &points {
        let (dx, dy) = (x - x0, y - y0);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let (sxx, syy, sxy) = (sxx / (n - 1.0), syy / (n - 1.0), sxy / (n - 1.0));

    // closed-form eigen decomposition of the symmetric 2x2 matrix
    let mid = (sxx + syy) / 2.0;
    let radius = (((sxx - syy) / 2.0).powi(2) + sxy * sxy).sqrt();
    let major = (mid + radius).max(0.0);
    let minor = (mid - radius).max(0.0);
    let (vx, vy) = if sxy != 0.0 {
        (major - syy, sxy)
    } else if sxx >= syy {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };
    let theta = vy.atan2(vx);
    let (a, b) = (major.sqrt(), minor.sqrt());
    let (sin_t, cos_t) = theta.sin_cos();
    let (x, y) = (0..ELLIPSE_POINTS)
        .map(|i| {
            let phi = 2.0 * PI * i as f64 / (ELLIPSE_POINTS - 1) as f64;
            let (sin_p, cos_p) = phi.sin_cos();
            (
                x0 + a * cos_p * cos_t - b * sin_p * sin_t,
                y0 + a * cos_p * sin_t + b * sin_p * cos_t,
            )
        })
        .unzip();
    Some(ConfidenceEllipse {
        center: (x0, y0),
        a,
        b,
        theta,
        area_cm2: PI * a * b / 100.0,
        x,
        y,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_from_group_properties() {
        let props: Value = serde_json::json!({"lx_mm": 400.0, "h_mm": 40});
        let dims = PlatformDimensions::from_properties(&props);
        assert_eq!(dims.lx, 400.0);
        assert_eq!(dims.ly, 306.0);
        assert_eq!(dims.h, 40.0);
        assert_eq!(
            PlatformDimensions::from_properties(&Value::Null),
            PlatformDimensions::default()
        );
    }

    #[test]
    fn axis_totals_sum_each_tick() {
        let forces = AxisForces::new(
            vec![("Z_1".into(), vec![1.0, 2.0]), ("Z_2".into(), vec![3.0, 4.0])],
            2,
        );
        assert_eq!(forces.total, vec![4.0, 6.0]);
        assert!(AxisForces::new(Vec::new(), 2).total.is_empty());
    }

    #[test]
    fn cop_is_centered() {
        let n = 50;
        let ramp: Vec<f64> = (0..n).map(|i| 100.0 + i as f64).collect();
        let flat = vec![100.0; n];
        let small: Vec<f64> = (0..n).map(|i| (i as f64 * 0.3).sin()).collect();
        let zero = vec![0.0; n];
        let trace = center_of_pressure(
            "P",
            [&small, &zero],
            [&zero, &small],
            [&ramp, &flat, &flat, &ramp],
            PlatformDimensions::default(),
        );
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        assert_eq!(trace.cop_x.len(), n);
        assert!(mean(&trace.cop_x).abs() < 1e-9);
        assert!(mean(&trace.cop_y).abs() < 1e-9);
        assert!(trace.cop_x.iter().any(|v| v.abs() > 1e-3));
        assert!(trace.warning.is_none());
    }

    #[test]
    fn zero_vertical_load_is_flagged() {
        let zero = vec![0.0; 5];
        let one = vec![1.0; 5];
        let trace = center_of_pressure(
            "P",
            [&one, &zero],
            [&zero, &zero],
            [&zero, &zero, &zero, &zero],
            PlatformDimensions::default(),
        );
        let warning = trace.warning.unwrap();
        assert_eq!(warning.ticks, 5);
        assert_eq!(warning.group, "P");
        assert_eq!(warning.min_abs_fz, 0.0);
    }

    #[test]
    fn ellipse_of_rotated_distribution() {
        let n = 360;
        let rot = 30f64.to_radians();
        let (mut xs, mut ys) = (Vec::new(), Vec::new());
        for i in 0..n {
            let t = 2.0 * PI * i as f64 / n as f64;
            let (u, v) = (3.0 * t.cos(), t.sin());
            xs.push(u * rot.cos() - v * rot.sin());
            ys.push(u * rot.sin() + v * rot.cos());
        }
        let e = confidence_ellipse(&xs, &ys).unwrap();
        assert!((e.a / e.b - 3.0).abs() < 1e-6);
        assert!((e.theta.tan() - rot.tan()).abs() < 1e-6);
        assert!((e.area_cm2 - PI * e.a * e.b / 100.0).abs() < 1e-12);
        assert_eq!(e.x.len(), ELLIPSE_POINTS);
        // boundary closes on itself
        assert!((e.x[0] - e.x[ELLIPSE_POINTS - 1]).abs() < 1e-9);
        assert!(e.center.0.abs() < 1e-9 && e.center.1.abs() < 1e-9);
    }

    #[test]
    fn degenerate_ellipse() {
        let e = confidence_ellipse(&[0.0; 10], &[0.0; 10]).unwrap();
        assert_eq!(e.area_cm2, 0.0);
        assert_eq!(e.theta, 0.0);
        assert!(confidence_ellipse(&[1.0], &[1.0]).is_none());
    }
}
