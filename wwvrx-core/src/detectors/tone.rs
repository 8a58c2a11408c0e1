//! Tone trackers: carrier-offset and audio-subcarrier frequency
//! measurement on the 12.5 kHz display chain.
//!
//! Each tracker fills a 4096-sample buffer, applies a Blackman-Harris
//! window, and refines the spectral peak with parabolic interpolation. The
//! audio tones (500 / 600 Hz) are AM sidebands, so their frequency is taken
//! as the average of the upper and lower sideband peaks; the carrier
//! tracker reads the single complex line nearest DC with a signed
//! fractional bin.

use num_complex::Complex32;

use crate::config::rates;
use crate::dsp::interp::parabolic_peak_offset;
use crate::dsp::spectrum::{ratio_db, WindowKind};
use crate::dsp::FftFrame;
use crate::events::ChannelQuality;

const FFT_SIZE: usize = 4096;
/// Peak-search half-width around the nominal bin
const SEARCH_BINS: usize = 8;
/// Readings below this SNR are flagged invalid
const MIN_VALID_SNR_DB: f64 = 10.0;

/// One frequency measurement (~3 per second).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneReading {
    pub timestamp_ms: f64,
    pub nominal_hz: f64,
    pub measured_hz: f64,
    pub offset_hz: f64,
    /// Offset scaled to the tracker's reference frequency
    pub offset_ppm: f64,
    pub snr_db: f64,
    pub valid: bool,
}

pub struct ToneTracker {
    /// 0.0 tracks the carrier itself
    nominal_hz: f64,
    /// Frequency the ppm figure is scaled against (the RF reference for the
    /// carrier tracker, the tone itself otherwise)
    reference_hz: f64,
    fft: FftFrame,
    pending: Vec<Complex32>,
    consumed: u64,
    last_reading: Option<ToneReading>,
}

impl ToneTracker {
    pub fn new(nominal_hz: f64, reference_hz: f64) -> Self {
        Self {
            nominal_hz,
            reference_hz: if reference_hz > 0.0 { reference_hz } else { 1.0 },
            fft: FftFrame::new(FFT_SIZE, rates::DISPLAY as f64, WindowKind::BlackmanHarris)
                .expect("fixed power-of-two FFT size"),
            pending: Vec::with_capacity(2 * FFT_SIZE),
            consumed: 0,
            last_reading: None,
        }
    }

    pub fn nominal_hz(&self) -> f64 {
        self.nominal_hz
    }

    /// Telemetry channel suffix, e.g. `TRK500`.
    pub fn channel_name(&self) -> String {
        format!("TRK{}", self.nominal_hz.round() as i64)
    }

    pub fn process_samples(&mut self, samples: &[Complex32]) -> Vec<ToneReading> {
        let mut readings = Vec::new();
        self.pending.extend_from_slice(samples);
        self.consumed += samples.len() as u64;

        let mut buf = Vec::with_capacity(FFT_SIZE);
        while self.pending.len() >= FFT_SIZE {
            buf.clear();
            buf.extend(self.pending.drain(..FFT_SIZE));
            let end_sample = self.consumed - self.pending.len() as u64;
            let timestamp_ms = (end_sample as f64 * 1000.0 / rates::DISPLAY as f64
                - rates::DISPLAY_GROUP_DELAY_MS)
                .max(0.0);
            if let Some(reading) = self.measure(&buf, timestamp_ms) {
                self.last_reading = Some(reading);
                readings.push(reading);
            }
        }
        readings
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_reading = None;
    }

    pub fn last_reading(&self) -> Option<ToneReading> {
        self.last_reading
    }

    pub fn quality(&self) -> ChannelQuality {
        match self.last_reading {
            Some(r) => ChannelQuality {
                timestamp_ms: r.timestamp_ms,
                noise_floor: 0.0,
                peak: r.measured_hz,
                snr_db: r.snr_db,
            },
            None => ChannelQuality {
                timestamp_ms: 0.0,
                noise_floor: 0.0,
                peak: 0.0,
                snr_db: 0.0,
            },
        }
    }

    fn measure(&mut self, buf: &[Complex32], timestamp_ms: f64) -> Option<ToneReading> {
        self.fft.process(buf);
        let hz_per_bin = self.fft.hz_per_bin();
        let n = FFT_SIZE;

        let (measured_hz, peak_mag, signal_bins) = if self.nominal_hz == 0.0 {
            // Carrier: single complex line nearest DC, signed bin offset
            let (bin, frac, mag) = self.wrapped_peak(0isize, SEARCH_BINS)?;
            let signed_bin = if bin as usize > n / 2 {
                bin - n as isize
            } else {
                bin
            };
            let freq = (signed_bin as f64 + frac) * hz_per_bin;
            let lo = (n as isize + bin - SEARCH_BINS as isize) as usize % n;
            let hi = (bin + SEARCH_BINS as isize) as usize % n;
            // Exclusion range for the noise estimate, positive side only
            let range = if lo <= hi { lo..=hi } else { 0..=hi.max(SEARCH_BINS) };
            (freq, mag, range)
        } else {
            let nominal_bin = (self.nominal_hz / hz_per_bin).round() as isize;
            let (usb_bin, usb_frac, usb_mag) = self.wrapped_peak(nominal_bin, SEARCH_BINS)?;
            let (lsb_bin, lsb_frac, lsb_mag) =
                self.wrapped_peak(n as isize - nominal_bin, SEARCH_BINS)?;
            let usb_hz = (usb_bin as f64 + usb_frac) * hz_per_bin;
            let lsb_equiv_hz = (n as f64 - (lsb_bin as f64 + lsb_frac)) * hz_per_bin;
            let freq = (usb_hz + lsb_equiv_hz) / 2.0;
            let lo = (nominal_bin - SEARCH_BINS as isize).max(1) as usize;
            let hi = ((nominal_bin + SEARCH_BINS as isize) as usize).min(n / 2);
            (freq, usb_mag.max(lsb_mag), lo..=hi)
        };

        if !measured_hz.is_finite() {
            return None;
        }

        let noise = self.fft.mean_offband_magnitude(signal_bins);
        let snr_db = ratio_db(peak_mag, noise);
        let offset_hz = measured_hz - self.nominal_hz;
        Some(ToneReading {
            timestamp_ms,
            nominal_hz: self.nominal_hz,
            measured_hz,
            offset_hz,
            offset_ppm: offset_hz / self.reference_hz * 1e6,
            snr_db,
            valid: snr_db >= MIN_VALID_SNR_DB,
        })
    }

    /// Peak magnitude bin within `center +/- width` (indices wrap), plus the
    /// parabolic fractional offset. Returns `None` when the spectrum is
    /// degenerate (all-zero input).
    fn wrapped_peak(&self, center: isize, width: usize) -> Option<(isize, f64, f64)> {
        let n = FFT_SIZE as isize;
        let mut best_bin = center;
        let mut best_mag = -1.0f64;
        for d in -(width as isize)..=(width as isize) {
            let bin = (center + d).rem_euclid(n) as usize;
            let mag = self.fft.bin_magnitude(bin);
            if mag > best_mag {
                best_mag = mag;
                best_bin = (center + d).rem_euclid(n);
            }
        }
        if best_mag <= 0.0 {
            return None;
        }
        let prev = self.fft.bin_magnitude((best_bin - 1).rem_euclid(n) as usize);
        let next = self.fft.bin_magnitude((best_bin + 1).rem_euclid(n) as usize);
        let frac = parabolic_peak_offset(prev, best_mag, next);
        Some((best_bin, frac, best_mag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::f64::consts::TAU;

    /// Display-chain style signal: carrier at `carrier_off` Hz plus a real
    /// audio tone at `tone_hz`.
    fn display_signal(carrier_off: f64, tone_hz: f64, seconds: f64) -> Vec<Complex32> {
        let rate = rates::DISPLAY as f64;
        let n = (seconds * rate) as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(31);
        (0..n)
            .map(|i| {
                let t = i as f64 / rate;
                let carrier = Complex32::new(
                    (TAU * carrier_off * t).cos() as f32,
                    (TAU * carrier_off * t).sin() as f32,
                ) * 0.8;
                let audio = (TAU * tone_hz * t).cos() as f32 * 0.3;
                carrier
                    + Complex32::new(audio, 0.0)
                    + Complex32::new(rng.gen_range(-0.002..0.002), rng.gen_range(-0.002..0.002))
            })
            .collect()
    }

    #[test]
    fn test_500hz_tone_measured_accurately() {
        let mut trk = ToneTracker::new(500.0, 500.0);
        let readings = trk.process_samples(&display_signal(0.0, 500.0, 1.0));
        assert!(!readings.is_empty());
        let r = readings.last().unwrap();
        assert!(r.valid, "snr {}", r.snr_db);
        assert!((r.measured_hz - 500.0).abs() < 0.5, "measured {}", r.measured_hz);
        assert!(r.offset_hz.abs() < 0.5);
    }

    #[test]
    fn test_tone_offset_detected() {
        let mut trk = ToneTracker::new(600.0, 600.0);
        let readings = trk.process_samples(&display_signal(0.0, 601.5, 1.0));
        let r = readings.last().unwrap();
        assert!(r.valid);
        assert!((r.offset_hz - 1.5).abs() < 0.5, "offset {}", r.offset_hz);
        let expected_ppm = 1.5 / 600.0 * 1e6;
        assert!((r.offset_ppm - expected_ppm).abs() < 1000.0);
    }

    #[test]
    fn test_carrier_offset_signed() {
        // 10 MHz reference; carrier 2 Hz high
        let mut trk = ToneTracker::new(0.0, 10_000_000.0);
        let readings = trk.process_samples(&display_signal(2.0, 500.0, 1.0));
        let r = readings.last().unwrap();
        assert!((r.measured_hz - 2.0).abs() < 1.0, "measured {}", r.measured_hz);
        assert!(r.offset_ppm > 0.0 && r.offset_ppm < 1.0);

        let mut trk = ToneTracker::new(0.0, 10_000_000.0);
        let readings = trk.process_samples(&display_signal(-2.0, 500.0, 1.0));
        let r = readings.last().unwrap();
        assert!((r.measured_hz + 2.0).abs() < 1.0, "measured {}", r.measured_hz);
    }

    #[test]
    fn test_noise_only_reading_invalid() {
        let mut trk = ToneTracker::new(500.0, 500.0);
        let rate = rates::DISPLAY as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(37);
        let noise: Vec<Complex32> = (0..rate)
            .map(|_| Complex32::new(rng.gen_range(-0.1..0.1), rng.gen_range(-0.1..0.1)))
            .collect();
        let readings = trk.process_samples(&noise);
        assert!(!readings.is_empty());
        assert!(!readings.last().unwrap().valid);
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(ToneTracker::new(500.0, 500.0).channel_name(), "TRK500");
        assert_eq!(ToneTracker::new(0.0, 1.0).channel_name(), "TRK0");
    }

    #[test]
    fn test_reading_cadence() {
        let mut trk = ToneTracker::new(500.0, 500.0);
        // One second at 12.5 kHz = 12500 samples = 3 full 4096 buffers
        let readings = trk.process_samples(&display_signal(0.0, 500.0, 1.0));
        assert_eq!(readings.len(), 3);
        let mut last = -1.0;
        for r in &readings {
            assert!(r.timestamp_ms > last);
            last = r.timestamp_ms;
        }
    }
}
