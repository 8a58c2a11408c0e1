//! Windowed-FFT frame processor shared by all frequency-selective detectors.
//!
//! Each detector owns one `FftFrame` sized for its path (256 or 2048 points
//! at 50 kHz, 2048 or 4096 at 12.5 kHz). The plan is built once at
//! construction; `process` windows the input into an internal buffer and
//! transforms in place, so the hot path allocates nothing.

use std::sync::Arc;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::dsp::window;
use crate::errors::DspError;

/// Which window the frame applies before transforming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Hann,
    BlackmanHarris,
}

/// Reusable forward-FFT of a fixed size with a baked-in window.
///
/// After `process`, the bucket and noise queries read the internal spectrum;
/// bin 0 is DC and bins above `size/2` hold the negative frequencies.
pub struct FftFrame {
    size: usize,
    sample_rate: f64,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    window_gain: f64,
    buffer: Vec<Complex32>,
}

impl FftFrame {
    pub fn new(size: usize, sample_rate: f64, kind: WindowKind) -> Result<Self, DspError> {
        if !size.is_power_of_two() {
            return Err(DspError::InvalidFftSize { size });
        }
        let window = match kind {
            WindowKind::Hann => window::hann(size),
            WindowKind::BlackmanHarris => window::blackman_harris(size),
        };
        let window_gain = window::coherent_gain(&window);
        let mut planner = FftPlanner::new();
        Ok(Self {
            size,
            sample_rate,
            fft: planner.plan_fft_forward(size),
            window,
            window_gain,
            buffer: vec![Complex32::new(0.0, 0.0); size],
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bin spacing in Hz.
    pub fn hz_per_bin(&self) -> f64 {
        self.sample_rate / self.size as f64
    }

    /// Window `samples` (must be exactly `size` long) and transform in place.
    pub fn process(&mut self, samples: &[Complex32]) {
        debug_assert_eq!(samples.len(), self.size);
        for ((dst, &src), &w) in self.buffer.iter_mut().zip(samples).zip(&self.window) {
            *dst = src * w;
        }
        self.fft.process(&mut self.buffer);
    }

    /// The spectrum produced by the last `process` call.
    pub fn spectrum(&self) -> &[Complex32] {
        &self.buffer
    }

    /// Positive-sideband bin range covering `center_hz +/- half_width_hz`,
    /// clamped to the first Nyquist zone.
    pub fn bucket_bins(&self, center_hz: f64, half_width_hz: f64) -> std::ops::RangeInclusive<usize> {
        let hz_per_bin = self.hz_per_bin();
        let lo = ((center_hz - half_width_hz) / hz_per_bin).floor().max(0.0) as usize;
        let hi = (((center_hz + half_width_hz) / hz_per_bin).ceil() as usize).min(self.size / 2);
        lo..=hi
    }

    /// Summed magnitude-squared energy over a positive-sideband bucket and
    /// its negative-frequency mirror, normalized for window loss. Non-finite
    /// bins are treated as "no detection this frame" and contribute zero.
    pub fn bucket_energy(&self, bins: std::ops::RangeInclusive<usize>) -> f64 {
        let norm = 1.0 / (self.size as f64 * self.window_gain);
        let mut energy = 0.0;
        for bin in bins {
            let pos = self.buffer[bin].norm_sqr() as f64;
            let neg = if bin == 0 {
                0.0
            } else {
                self.buffer[self.size - bin].norm_sqr() as f64
            };
            let contrib = (pos + neg) * norm * norm;
            if contrib.is_finite() {
                energy += contrib;
            }
        }
        energy
    }

    /// Magnitude of a single bin, window-normalized.
    pub fn bin_magnitude(&self, bin: usize) -> f64 {
        let norm = 1.0 / (self.size as f64 * self.window_gain);
        let mag = self.buffer[bin].norm() as f64 * norm;
        if mag.is_finite() {
            mag
        } else {
            0.0
        }
    }

    /// Mean bin magnitude over the positive sideband excluding `signal_bins`
    /// and DC; the noise reference for SNR estimates.
    pub fn mean_offband_magnitude(&self, signal_bins: std::ops::RangeInclusive<usize>) -> f64 {
        let norm = 1.0 / (self.size as f64 * self.window_gain);
        let mut sum = 0.0;
        let mut count = 0usize;
        for bin in 1..self.size / 2 {
            if signal_bins.contains(&bin) {
                continue;
            }
            let mag = self.buffer[bin].norm() as f64 * norm;
            if mag.is_finite() {
                sum += mag;
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

/// Amplitude ratio in dB, floored at -120 dB for zero/denormal inputs.
pub fn ratio_db(num: f64, den: f64) -> f64 {
    if num <= 0.0 || den <= 0.0 {
        return -120.0;
    }
    (20.0 * (num / den).log10()).max(-120.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    fn tone(freq: f64, rate: f64, n: usize) -> Vec<Complex32> {
        (0..n)
            .map(|i| {
                let phase = TAU * freq * i as f64 / rate;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(FftFrame::new(300, 50_000.0, WindowKind::Hann).is_err());
    }

    #[test]
    fn test_bucket_bins_for_tick_tone() {
        let frame = FftFrame::new(256, 50_000.0, WindowKind::Hann).unwrap();
        // 195.3 Hz/bin: 1 kHz +/- 100 Hz covers bins 4..=6
        assert_eq!(frame.bucket_bins(1000.0, 100.0), 4..=6);
    }

    #[test]
    fn test_tone_lands_in_bucket() {
        let mut frame = FftFrame::new(256, 50_000.0, WindowKind::Hann).unwrap();
        let samples = tone(1000.0, 50_000.0, 256);
        frame.process(&samples);
        let in_band = frame.bucket_energy(frame.bucket_bins(1000.0, 100.0));
        let off_band = frame.bucket_energy(40..=60);
        assert!(in_band > 100.0 * off_band, "in={in_band} off={off_band}");
    }

    #[test]
    fn test_bucket_energy_tracks_amplitude() {
        let mut frame = FftFrame::new(256, 50_000.0, WindowKind::Hann).unwrap();
        let bins = frame.bucket_bins(1000.0, 100.0);

        let full: Vec<Complex32> = tone(1000.0, 50_000.0, 256);
        frame.process(&full);
        let e_full = frame.bucket_energy(bins.clone());

        let half: Vec<Complex32> = full.iter().map(|c| c * 0.5).collect();
        frame.process(&half);
        let e_half = frame.bucket_energy(bins);

        let ratio = e_full / e_half;
        assert!((ratio - 4.0).abs() < 0.1, "energy ratio {ratio}");
    }

    #[test]
    fn test_offband_magnitude_is_small_for_clean_tone() {
        let mut frame = FftFrame::new(2048, 12_500.0, WindowKind::BlackmanHarris).unwrap();
        let samples = tone(500.0, 12_500.0, 2048);
        frame.process(&samples);
        let bins = frame.bucket_bins(500.0, 30.0);
        let peak = bins.clone().map(|b| frame.bin_magnitude(b)).fold(0.0, f64::max);
        let noise = frame.mean_offband_magnitude(bins);
        assert!(ratio_db(peak, noise) > 60.0);
    }

    #[test]
    fn test_ratio_db_guards() {
        assert_eq!(ratio_db(0.0, 1.0), -120.0);
        assert_eq!(ratio_db(1.0, 0.0), -120.0);
        assert!((ratio_db(10.0, 1.0) - 20.0).abs() < 1e-9);
    }
}
