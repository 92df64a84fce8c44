// src/signal/orientation.rs
//! Quaternion to Euler angles, intrinsic X-Y-Z rotation order.
//!
//! Quaternions are expected normalised; anything else is converted as-is
//! and may yield NaN angles.

/// Angles of the intrinsic X-Y-Z sequence, in degrees, in the order they are applied.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EulerAngles {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// `q` is ordered `[x, y, z, w]`.
pub fn quaternion_to_euler(q: [f64; 4]) -> EulerAngles {
    let [x, y, z, w] = q;
    let r00 = 1.0 - 2.0 * (y * y + z * z);
    let r01 = 2.0 * (x * y - z * w);
    let r02 = 2.0 * (x * z + y * w);
    let r12 = 2.0 * (y * z - x * w);
    let r22 = 1.0 - 2.0 * (x * x + y * y);
    // R = Rx(a) * Ry(b) * Rz(c)
    let a = (-r12).atan2(r22);
    let b = r02.clamp(-1.0, 1.0).asin();
    let c = (-r01).atan2(r00);
    EulerAngles {
        x: a.to_degrees(),
        y: b.to_degrees(),
        z: c.to_degrees(),
    }
}

/// Per-tick angles from the four quaternion columns, returned in sequence order `[x, y, z]`.
///
/// Exported figures label these `_yaw`, `_pitch`, `_roll` in that order, so
/// `_yaw` carries the first rotation (about X).
pub fn euler_series(qx: &[f64], qy: &[f64], qz: &[f64], qw: &[f64]) -> [Vec<f64>; 3] {
    let n = qx.len().min(qy.len()).min(qz.len()).min(qw.len());
    let mut out = [
        Vec::with_capacity(n),
        Vec::with_capacity(n),
        Vec::with_capacity(n),
    ];
    for i in 0..n {
        let angles = quaternion_to_euler([qx[i], qy[i], qz[i], qw[i]]);
        out[0].push(angles.x);
        out[1].push(angles.y);
        out[2].push(angles.z);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: EulerAngles, x: f64, y: f64, z: f64) -> bool {
        (a.x - x).abs() < 1e-9 && (a.y - y).abs() < 1e-9 && (a.z - z).abs() < 1e-9
    }

    #[test]
    fn identity_is_zero() {
        let series = euler_series(&[0.0; 10], &[0.0; 10], &[0.0; 10], &[1.0; 10]);
        for column in &series {
            assert_eq!(column.len(), 10);
            assert!(column.iter().all(|v| v.abs() < 1e-12));
        }
    }

    #[test]
    fn single_axis_rotations() {
        let h = (std::f64::consts::FRAC_PI_4).sin();
        let c = (std::f64::consts::FRAC_PI_4).cos();
        // 90 degrees about each axis
        assert!(close(quaternion_to_euler([h, 0.0, 0.0, c]), 90.0, 0.0, 0.0));
        assert!(close(quaternion_to_euler([0.0, 0.0, h, c]), 0.0, 0.0, 90.0));
        let half = (15f64).to_radians();
        let q = [0.0, half.sin(), 0.0, half.cos()];
        assert!(close(quaternion_to_euler(q), 0.0, 30.0, 0.0));
    }

    #[test]
    fn series_is_in_sequence_order() {
        let h = (std::f64::consts::FRAC_PI_4).sin();
        let [first, second, third] = euler_series(&[h], &[0.0], &[0.0], &[h]);
        assert!((first[0] - 90.0).abs() < 1e-9);
        assert!(second[0].abs() < 1e-9 && third[0].abs() < 1e-9);
    }

    #[test]
    fn malformed_quaternion_is_not_rejected() {
        let angles = quaternion_to_euler([f64::NAN, 0.0, 0.0, 1.0]);
        assert!(angles.x.is_nan());
    }
}
