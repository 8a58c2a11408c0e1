//! Second-order IIR sections for the anti-alias filters.
//!
//! Coefficients come from the bilinear-transform low-pass design. Each
//! instance filters one real channel (I and Q run separate instances) and
//! stores two previous inputs and outputs, which is the state that must be
//! zeroed on a stream discontinuity.

use std::f64::consts::PI;

use crate::errors::DspError;

/// One direct-form-I biquad section.
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    /// Butterworth-Q low-pass at `cutoff_hz`.
    pub fn lowpass(sample_rate: f64, cutoff_hz: f64) -> Result<Self, DspError> {
        Self::lowpass_q(sample_rate, cutoff_hz, std::f64::consts::FRAC_1_SQRT_2)
    }

    /// Low-pass with an explicit Q.
    pub fn lowpass_q(sample_rate: f64, cutoff_hz: f64, q: f64) -> Result<Self, DspError> {
        if !(cutoff_hz > 0.0 && cutoff_hz < sample_rate / 2.0) {
            return Err(DspError::FilterDesignFailed {
                reason: format!(
                    "cutoff {cutoff_hz} Hz outside (0, {}) at fs={sample_rate}",
                    sample_rate / 2.0
                ),
            });
        }
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let a0 = 1.0 + alpha;

        Ok(Self {
            b0: ((1.0 - cos_w0) / 2.0) / a0,
            b1: (1.0 - cos_w0) / a0,
            b2: ((1.0 - cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        })
    }

    /// Filter one sample.
    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    /// Zero the history. Called on source discontinuity.
    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    fn tone_gain(filter: &mut Biquad, sample_rate: f64, freq: f64) -> f64 {
        // Settle, then measure RMS over an integer number of cycles
        let n = (sample_rate / freq).round() as usize * 50;
        let mut sum_sq = 0.0;
        let mut count = 0usize;
        for i in 0..2 * n {
            let x = (TAU * freq * i as f64 / sample_rate).sin();
            let y = filter.process(x);
            if i >= n {
                sum_sq += y * y;
                count += 1;
            }
        }
        (sum_sq / count as f64).sqrt() * std::f64::consts::SQRT_2
    }

    #[test]
    fn test_passband_gain_near_unity() {
        let mut f = Biquad::lowpass(2_000_000.0, 5_000.0).unwrap();
        let gain = tone_gain(&mut f, 2_000_000.0, 1_000.0);
        let gain_db = 20.0 * gain.log10();
        assert!(gain_db.abs() < 0.5, "1 kHz passband gain {gain_db:.2} dB");
    }

    #[test]
    fn test_stopband_attenuation() {
        let mut f = Biquad::lowpass(2_000_000.0, 5_000.0).unwrap();
        let gain = tone_gain(&mut f, 2_000_000.0, 100_000.0);
        let gain_db = 20.0 * gain.log10();
        // Second-order rolloff: 12 dB/octave, >= 50 dB down at 20x cutoff
        assert!(gain_db < -40.0, "100 kHz stopband gain {gain_db:.2} dB");
    }

    #[test]
    fn test_reset_clears_history() {
        let mut f = Biquad::lowpass(50_000.0, 5_000.0).unwrap();
        for _ in 0..100 {
            f.process(1.0);
        }
        f.reset();
        // After reset an all-zero input yields exactly zero
        assert_eq!(f.process(0.0), 0.0);
    }

    #[test]
    fn test_rejects_bad_cutoff() {
        assert!(Biquad::lowpass(50_000.0, 25_000.0).is_err());
        assert!(Biquad::lowpass(50_000.0, 0.0).is_err());
    }
}
