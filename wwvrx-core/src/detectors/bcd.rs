//! BCD subcarrier detectors: pulses of the 100 Hz AM subcarrier carrying
//! the NIST time code (200 / 500 / 800 ms per second).
//!
//! Two instances run in parallel on the 50 kHz chain:
//!
//! - **Time path**: 256-point frames (5.12 ms) with a wide 100 +/- 50 Hz
//!   bucket and a tick-style adaptive floor. Edge timing is good to one
//!   frame; frequency selectivity is poor.
//! - **Frequency path**: 2048-point frames (40.96 ms) with a narrow
//!   100 +/- 15 Hz bucket, a sliding one-second accumulator, and a slow
//!   baseline. The accumulated energy against the baseline gates whether a
//!   pulse is credible at all; the per-frame energy then places its
//!   (smeared) edges, the same split the minute-marker detector uses.
//!
//! Both paths exclude DC from the bucket and remove the frame mean so the
//! AM carrier does not swamp the measurement. The correlator (C8) fuses
//! both series per second slot.

use std::collections::VecDeque;

use num_complex::Complex32;

use crate::config::rates;
use crate::dsp::spectrum::WindowKind;
use crate::dsp::FftFrame;
use crate::events::{BcdPath, ChannelQuality, DetectorEvent, EventKind};

use super::PulseDetector;

const SUBCARRIER_HZ: f64 = 100.0;
/// Accept window for raw pulse candidates; classification happens in C8
const MIN_PULSE_MS: f64 = 100.0;
const MAX_PULSE_MS: f64 = 1100.0;
/// Frequency-path accumulator threshold and baseline adaptation
const FREQ_THRESHOLD_MULT: f64 = 3.0;
const FREQ_BASELINE_ADAPT: f64 = 0.001;

/// Which of the two C5 geometries this instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcdMode {
    Time,
    Freq,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PulseState {
    Idle,
    InPulse {
        start_ms: f64,
        high_frames: u32,
        low_run: u32,
        peak_energy: f64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BcdCounters {
    pub emitted: u64,
    pub rejected_duration: u64,
}

pub struct BcdDetector {
    mode: BcdMode,
    fft: FftFrame,
    fft_size: usize,
    frame_ms: f64,
    bins: std::ops::RangeInclusive<usize>,
    end_debounce: u32,

    pending: Vec<Complex32>,
    scratch: Vec<Complex32>,
    frame_start_sample: u64,
    consumed: u64,

    // Time path: tick-style adaptive floor on per-frame energy
    noise_floor: f64,
    floor_seeded: bool,

    // Freq path: one-second sliding accumulator with a slow baseline
    accum: VecDeque<f64>,
    accum_capacity: usize,
    accum_sum: f64,
    baseline: f64,
    baseline_seeded: bool,
    /// Frames above the per-frame threshold, tracked ahead of the
    /// accumulator crossing so the start edge is not lost
    high_run: u32,

    state: PulseState,
    counters: BcdCounters,
    last_energy: f64,
    last_quality_ms: f64,
}

impl BcdDetector {
    pub fn new(mode: BcdMode) -> Self {
        let (fft_size, half_width, end_debounce, accum_capacity) = match mode {
            BcdMode::Time => (256, 50.0, 3, 0),
            BcdMode::Freq => (2048, 15.0, 2, 24),
        };
        let fft = FftFrame::new(fft_size, rates::DETECTOR as f64, WindowKind::Hann)
            .expect("fixed power-of-two FFT size");
        let raw = fft.bucket_bins(SUBCARRIER_HZ, half_width);
        // Never include DC: the carrier lives there
        let bins = (*raw.start()).max(1)..=(*raw.end()).max(1);
        Self {
            mode,
            fft,
            fft_size,
            frame_ms: fft_size as f64 * 1000.0 / rates::DETECTOR as f64,
            bins,
            end_debounce,
            pending: Vec::with_capacity(4 * fft_size),
            scratch: Vec::with_capacity(fft_size),
            frame_start_sample: 0,
            consumed: 0,
            noise_floor: 0.0,
            floor_seeded: false,
            accum: VecDeque::with_capacity(accum_capacity),
            accum_capacity,
            accum_sum: 0.0,
            baseline: 0.0,
            baseline_seeded: false,
            high_run: 0,
            state: PulseState::Idle,
            counters: BcdCounters::default(),
            last_energy: 0.0,
            last_quality_ms: 0.0,
        }
    }

    pub fn mode(&self) -> BcdMode {
        self.mode
    }

    pub fn counters(&self) -> BcdCounters {
        self.counters
    }

    fn frame_start_ms(&self) -> f64 {
        (self.frame_start_sample as f64 * 1000.0 / rates::DETECTOR as f64
            - rates::DETECTOR_GROUP_DELAY_MS)
            .max(0.0)
    }

    /// Time-path floor, shared scheme with the tick detector: fast
    /// float-down, slow pull-up, frozen while the pulse is on.
    fn update_floor(&mut self, energy: f64, threshold_high: f64) {
        if !self.floor_seeded {
            self.noise_floor = energy.max(1e-12);
            self.floor_seeded = true;
            return;
        }
        if energy < self.noise_floor {
            self.noise_floor = self.noise_floor * 0.995 + energy * 0.005;
        } else if energy < threshold_high {
            self.noise_floor += 0.001 * (energy - self.noise_floor);
        }
        self.noise_floor = self.noise_floor.max(1e-12);
    }

    fn process_frame(&mut self, frame: &[Complex32], events: &mut Vec<DetectorEvent>) {
        // Remove the frame mean so the AM carrier (at/near DC) does not
        // leak across the narrow subcarrier bucket
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let n = frame.len() as f32;
        let mean = frame.iter().sum::<Complex32>() / n;
        scratch.extend(frame.iter().map(|&s| s - mean));
        self.fft.process(&scratch);
        self.scratch = scratch;

        let energy = self.fft.bucket_energy(self.bins.clone());
        self.last_energy = energy;
        self.last_quality_ms = self.frame_start_ms();

        match self.mode {
            BcdMode::Time => self.detect_time(energy, events),
            BcdMode::Freq => self.detect_freq(energy, events),
        }
    }

    /// Hysteresis machine on per-frame energy against the adaptive floor.
    fn detect_time(&mut self, energy: f64, events: &mut Vec<DetectorEvent>) {
        let threshold_high = self.noise_floor * 2.0;
        let threshold_low = threshold_high * 0.7;
        self.update_floor(energy, threshold_high);
        if !self.floor_seeded {
            return;
        }

        match self.state {
            PulseState::Idle => {
                if energy > threshold_high {
                    self.state = PulseState::InPulse {
                        start_ms: self.frame_start_ms(),
                        high_frames: 1,
                        low_run: 0,
                        peak_energy: energy,
                    };
                }
            }
            PulseState::InPulse {
                start_ms,
                high_frames,
                low_run,
                peak_energy,
            } => {
                if energy < threshold_low {
                    let low_run = low_run + 1;
                    if low_run >= self.end_debounce {
                        self.finish_candidate(start_ms, high_frames, peak_energy, events);
                        self.state = PulseState::Idle;
                    } else {
                        self.state = PulseState::InPulse {
                            start_ms,
                            high_frames,
                            low_run,
                            peak_energy,
                        };
                    }
                } else {
                    self.state = PulseState::InPulse {
                        start_ms,
                        high_frames: high_frames + 1,
                        low_run: 0,
                        peak_energy: peak_energy.max(energy),
                    };
                }
            }
        }
    }

    /// Accumulator-gated machine, the minute-marker pattern: the sliding
    /// sum against the slow baseline says whether sustained subcarrier
    /// energy is present at all, the per-frame energy places the edges.
    fn detect_freq(&mut self, energy: f64, events: &mut Vec<DetectorEvent>) {
        if self.accum.len() == self.accum_capacity {
            if let Some(old) = self.accum.pop_front() {
                self.accum_sum -= old;
            }
        }
        self.accum.push_back(energy);
        self.accum_sum += energy;

        if !self.baseline_seeded {
            if self.accum.len() == self.accum_capacity {
                self.baseline = self.accum_sum.max(1e-12);
                self.baseline_seeded = true;
            }
            return;
        }

        let threshold = self.baseline * FREQ_THRESHOLD_MULT;
        let frame_threshold =
            self.baseline / self.accum_capacity as f64 * FREQ_THRESHOLD_MULT;
        let frame_high = energy > frame_threshold;
        if frame_high {
            self.high_run += 1;
        }

        match self.state {
            PulseState::Idle => {
                // Baseline adapts only while idle
                self.baseline += FREQ_BASELINE_ADAPT * (self.accum_sum - self.baseline);
                self.baseline = self.baseline.max(1e-12);

                if self.accum_sum > threshold && frame_high {
                    let run_ms = self.high_run.saturating_sub(1) as f64 * self.frame_ms;
                    self.state = PulseState::InPulse {
                        start_ms: (self.frame_start_ms() - run_ms).max(0.0),
                        high_frames: self.high_run,
                        low_run: 0,
                        peak_energy: energy,
                    };
                }
            }
            PulseState::InPulse {
                start_ms,
                high_frames,
                low_run,
                peak_energy,
            } => {
                if frame_high {
                    self.state = PulseState::InPulse {
                        start_ms,
                        high_frames: high_frames + 1,
                        low_run: 0,
                        peak_energy: peak_energy.max(energy),
                    };
                } else {
                    let low_run = low_run + 1;
                    if low_run >= self.end_debounce {
                        self.finish_candidate(start_ms, high_frames, peak_energy, events);
                        self.high_run = 0;
                        self.state = PulseState::Idle;
                    } else {
                        self.state = PulseState::InPulse {
                            start_ms,
                            high_frames,
                            low_run,
                            peak_energy,
                        };
                    }
                }
            }
        }

        if !frame_high && matches!(self.state, PulseState::Idle) {
            self.high_run = 0;
        }
    }

    fn finish_candidate(
        &mut self,
        start_ms: f64,
        high_frames: u32,
        peak_energy: f64,
        events: &mut Vec<DetectorEvent>,
    ) {
        let duration_ms = high_frames as f64 * self.frame_ms;
        if !(MIN_PULSE_MS..=MAX_PULSE_MS).contains(&duration_ms) {
            self.counters.rejected_duration += 1;
            return;
        }
        let energy = if self.mode == BcdMode::Freq {
            // Report the integrated energy: that is what the freq path is for
            self.accum_sum.max(peak_energy)
        } else {
            peak_energy
        };
        self.counters.emitted += 1;
        events.push(DetectorEvent {
            kind: EventKind::BcdPulse,
            timestamp_ms: start_ms,
            duration_ms,
            peak_energy: energy,
            correlation: None,
            bcd_path: Some(match self.mode {
                BcdMode::Time => BcdPath::Time,
                BcdMode::Freq => BcdPath::Freq,
            }),
        });
    }
}

impl PulseDetector for BcdDetector {
    fn process_samples(&mut self, samples: &[Complex32]) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        self.pending.extend_from_slice(samples);
        self.consumed += samples.len() as u64;

        let mut frame = Vec::with_capacity(self.fft_size);
        while self.pending.len() >= self.fft_size {
            frame.clear();
            frame.extend(self.pending.drain(..self.fft_size));
            self.process_frame(&frame, &mut events);
            self.frame_start_sample += self.fft_size as u64;
        }
        events
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.noise_floor = 0.0;
        self.floor_seeded = false;
        self.accum.clear();
        self.accum_sum = 0.0;
        self.baseline = 0.0;
        self.baseline_seeded = false;
        self.high_run = 0;
        self.state = PulseState::Idle;
        self.frame_start_sample = self.consumed;
    }

    fn quality(&self) -> ChannelQuality {
        let floor = match self.mode {
            BcdMode::Time => self.noise_floor,
            BcdMode::Freq => self.baseline / self.accum_capacity.max(1) as f64,
        };
        let snr_db = if floor > 0.0 && self.last_energy > 0.0 {
            10.0 * (self.last_energy / floor).log10()
        } else {
            0.0
        };
        ChannelQuality {
            timestamp_ms: self.last_quality_ms,
            noise_floor: floor,
            peak: self.last_energy,
            snr_db,
        }
    }
}
