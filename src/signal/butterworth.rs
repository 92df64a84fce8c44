// src/signal/butterworth.rs
//! Digital low-pass Butterworth design and zero-phase (forward-backward) filtering.
use std::f64::consts::PI;
use crate::error::ForceError;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Section {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Section {
    fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    /// Delay-line state for a unit step that has settled.
    fn steady_state(&self) -> [f64; 2] {
        let g = self.dc_gain();
        let z2 = self.b2 - self.a2 * g;
        let z1 = self.b1 - self.a1 * g + z2;
        [z1, z2]
    }

    // Transposed direct form II
    fn run(&self, data: &mut [f64], mut z: [f64; 2]) {
        for x in data.iter_mut() {
            let input = *x;
            let y = self.b0 * input + z[0];
            z[0] = self.b1 * input - self.a1 * y + z[1];
            z[1] = self.b2 * input - self.a2 * y;
            *x = y;
        }
    }
}

/// Cascade of second-order sections of an order-`n` low-pass filter.
#[derive(Clone, Debug, PartialEq)]
pub struct Butterworth {
    order: usize,
    sections: Vec<Section>,
}

impl Butterworth {
    /// `wn` is the cutoff normalised to Nyquist (`fc / (0.5 * fs)`), strictly inside (0, 1).
    pub fn lowpass(order: usize, wn: f64) -> Result<Self, ForceError> {
        if order == 0 {
            return Err(ForceError::Configuration("filter order must be at least 1".into()));
        }
        if !(wn.is_finite() && wn > 0.0 && wn < 1.0) {
            return Err(ForceError::Configuration(format!(
                "normalised cutoff {wn} must lie strictly between 0 and 1"
            )));
        }
        // prewarped analog cutoff for the bilinear transform
        let k = (PI * wn / 2.0).tan();
        let k2 = k * k;
        let mut sections = Vec::with_capacity((order + 1) / 2);
        for i in 0..order / 2 {
            let a = 2.0 * ((2 * i + 1) as f64 * PI / (2 * order) as f64).sin();
            let a0 = 1.0 + a * k + k2;
            sections.push(Section {
                b0: k2 / a0,
                b1: 2.0 * k2 / a0,
                b2: k2 / a0,
                a1: 2.0 * (k2 - 1.0) / a0,
                a2: (1.0 - a * k + k2) / a0,
            });
        }
        if order % 2 == 1 {
            let a0 = 1.0 + k;
            sections.push(Section {
                b0: k / a0,
                b1: k / a0,
                b2: 0.0,
                a1: (k - 1.0) / a0,
                a2: 0.0,
            });
        }
        Ok(Self { order, sections })
    }

    /// Convenience constructor from sampling and cutoff frequencies in Hz.
    pub fn from_frequencies(order: usize, fs: f64, fc: f64) -> Result<Self, ForceError> {
        if !(fs.is_finite() && fs > 0.0) {
            return Err(ForceError::Configuration(format!(
                "sampling frequency {fs} Hz must be positive"
            )));
        }
        Self::lowpass(order, fc / (0.5 * fs))
    }

    /// Edge padding used by `filtfilt`, in samples.
    pub fn padlen(&self) -> usize {
        3 * (self.order + 1)
    }

    fn lfilter(&self, data: &mut [f64]) {
        let Some(&first) = data.first() else {
            return;
        };
        let mut level = first;
        for section in &self.sections {
            let zi = section.steady_state();
            section.run(data, [zi[0] * level, zi[1] * level]);
            level *= section.dc_gain();
        }
    }

    /// Forward-backward filtering with odd extension at both ends.
    ///
    /// Non-finite samples are left in place; every finite run between them
    /// is filtered on its own.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        let mut out = signal.to_vec();
        let mut start = 0;
        while start < out.len() {
            if !out[start].is_finite() {
                start += 1;
                continue;
            }
            let end = out[start..]
                .iter()
                .position(|v| !v.is_finite())
                .map_or(out.len(), |p| start + p);
            let filtered = self.filtfilt_finite(&out[start..end]);
            out[start..end].copy_from_slice(&filtered);
            start = end;
        }
        out
    }

    fn filtfilt_finite(&self, x: &[f64]) -> Vec<f64> {
        let n = x.len();
        if n < 2 {
            return x.to_vec();
        }
        let pad = self.padlen().min(n - 1);
        let mut ext = Vec::with_capacity(n + 2 * pad);
        ext.extend((1..=pad).rev().map(|i| 2.0 * x[0] - x[i]));
        ext.extend_from_slice(x);
        ext.extend((1..=pad).map(|i| 2.0 * x[n - 1] - x[n - 1 - i]));
        self.lfilter(&mut ext);
        ext.reverse();
        self.lfilter(&mut ext);
        ext.reverse();
        ext[pad..pad + n].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_order_half_band_coefficients() {
        let filter = Butterworth::lowpass(2, 0.5).unwrap();
        let s = filter.sections[0];
        assert!((s.b0 - 0.292_893_218_8).abs() < 1e-9);
        assert!((s.b1 - 0.585_786_437_6).abs() < 1e-9);
        assert!(s.a1.abs() < 1e-12);
        assert!((s.a2 - 0.171_572_875_3).abs() < 1e-9);
    }

    #[test]
    fn odd_order_adds_first_order_section() {
        let filter = Butterworth::lowpass(5, 0.2).unwrap();
        assert_eq!(filter.sections.len(), 3);
        for section in &filter.sections {
            assert!((section.dc_gain() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn rejects_cutoff_outside_unit_interval() {
        assert!(matches!(
            Butterworth::lowpass(4, 1.0),
            Err(ForceError::Configuration(_))
        ));
        assert!(Butterworth::lowpass(4, 0.0).is_err());
        assert!(Butterworth::lowpass(0, 0.5).is_err());
        assert!(Butterworth::from_frequencies(6, 100.0, 50.0).is_err());
        assert!(Butterworth::from_frequencies(6, 100.0, 49.9).is_ok());
    }

    #[test]
    fn constant_signal_passes_unchanged() {
        let filter = Butterworth::from_frequencies(6, 100.0, 5.0).unwrap();
        let out = filter.filtfilt(&[3.5; 200]);
        assert!(out.iter().all(|v| (v - 3.5).abs() < 1e-9));
    }

    #[test]
    fn attenuates_above_cutoff_without_phase_shift() {
        let fs = 1000.0;
        let slow: Vec<f64> = (0..2000)
            .map(|i| (2.0 * PI * 2.0 * i as f64 / fs).sin())
            .collect();
        let noisy: Vec<f64> = slow
            .iter()
            .enumerate()
            .map(|(i, s)| s + 0.5 * (2.0 * PI * 200.0 * i as f64 / fs).sin())
            .collect();
        let filter = Butterworth::from_frequencies(4, fs, 20.0).unwrap();
        let out = filter.filtfilt(&noisy);
        // compare away from the edges
        let err = out[200..1800]
            .iter()
            .zip(&slow[200..1800])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(err < 1e-2, "max error {err}");
    }

    #[test]
    fn short_and_gappy_signals() {
        let filter = Butterworth::lowpass(6, 0.1).unwrap();
        assert_eq!(filter.filtfilt(&[]), Vec::<f64>::new());
        assert_eq!(filter.filtfilt(&[2.0]), vec![2.0]);
        let out = filter.filtfilt(&[1.0, 1.0, 1.0]);
        assert!(out.iter().all(|v| (v - 1.0).abs() < 1e-9));
        let mut gappy = vec![4.0; 30];
        gappy.extend([f64::NAN; 5]);
        let out = filter.filtfilt(&gappy);
        assert!(out[..30].iter().all(|v| (v - 4.0).abs() < 1e-9));
        assert!(out[30..].iter().all(|v| v.is_nan()));
    }
}
