//! Minute-marker detector: the 800 ms tone pulse at the start of each UTC
//! minute.
//!
//! Front-end matches the tick detector (tone-bucket energy per FFT frame),
//! but detection integrates over a sliding one-second accumulator so a long
//! pulse stands out against short interference. Two instances run in the
//! pipeline: the fast path (256-point frames at 50 kHz) and a slow
//! confirmation path on the display chain (2048-point frames at 12.5 kHz)
//! whose events feed the symbol-confidence scoring.

use std::collections::VecDeque;

use num_complex::Complex32;

use crate::config::{rates, MarkerParams, Station};
use crate::dsp::spectrum::WindowKind;
use crate::dsp::FftFrame;
use crate::events::{ChannelQuality, DetectorEvent, EventKind};

use super::PulseDetector;

/// Reported durations are quantized to this resolution.
const DURATION_RESOLUTION_MS: f64 = 5.0;
const END_DEBOUNCE_FRAMES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
enum MarkerState {
    Idle,
    InMarker {
        start_ms: f64,
        high_frames: u32,
        low_run: u32,
        peak_accum: f64,
    },
    Cooldown {
        frames_left: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerCounters {
    pub emitted: u64,
    pub rejected_duration: u64,
}

pub struct MarkerDetector {
    params: MarkerParams,
    fft: FftFrame,
    fft_size: usize,
    frame_ms: f64,
    group_delay_ms: f64,
    bins: std::ops::RangeInclusive<usize>,

    pending: Vec<Complex32>,
    scratch: Vec<Complex32>,
    frame_start_sample: u64,
    consumed: u64,
    sample_rate: f64,

    /// Sliding window of per-frame energies (~1 s)
    accum: VecDeque<f64>,
    accum_capacity: usize,
    accum_sum: f64,
    baseline: f64,
    baseline_seeded: bool,
    /// Frames above the per-frame threshold, tracked ahead of the
    /// accumulator crossing so the start edge is not lost
    high_run: u32,

    state: MarkerState,
    counters: MarkerCounters,
    last_energy: f64,
    last_quality_ms: f64,
}

impl MarkerDetector {
    /// Fast-path instance on the 50 kHz detector chain.
    pub fn fast(station: Station, params: MarkerParams) -> Self {
        Self::with_geometry(
            station,
            params,
            256,
            rates::DETECTOR as f64,
            195,
            rates::DETECTOR_GROUP_DELAY_MS,
        )
    }

    /// Slow confirmation instance on the 12.5 kHz display chain.
    pub fn slow(station: Station, params: MarkerParams) -> Self {
        Self::with_geometry(
            station,
            params,
            2048,
            rates::DISPLAY as f64,
            10,
            rates::DISPLAY_GROUP_DELAY_MS,
        )
    }

    fn with_geometry(
        station: Station,
        params: MarkerParams,
        fft_size: usize,
        sample_rate: f64,
        accum_frames: usize,
        group_delay_ms: f64,
    ) -> Self {
        let fft = FftFrame::new(fft_size, sample_rate, WindowKind::Hann)
            .expect("fixed power-of-two FFT size");
        let bins = fft.bucket_bins(station.tick_freq_hz(), 100.0);
        Self {
            params,
            fft,
            fft_size,
            frame_ms: fft_size as f64 * 1000.0 / sample_rate,
            group_delay_ms,
            bins,
            pending: Vec::with_capacity(4 * fft_size),
            scratch: Vec::with_capacity(fft_size),
            frame_start_sample: 0,
            consumed: 0,
            sample_rate,
            accum: VecDeque::with_capacity(accum_frames),
            accum_capacity: accum_frames,
            accum_sum: 0.0,
            baseline: 0.0,
            baseline_seeded: false,
            high_run: 0,
            state: MarkerState::Idle,
            counters: MarkerCounters::default(),
            last_energy: 0.0,
            last_quality_ms: 0.0,
        }
    }

    pub fn set_params(&mut self, params: MarkerParams) {
        self.params = params;
    }

    pub fn params(&self) -> &MarkerParams {
        &self.params
    }

    pub fn counters(&self) -> MarkerCounters {
        self.counters
    }

    fn frame_start_ms(&self) -> f64 {
        (self.frame_start_sample as f64 * 1000.0 / self.sample_rate - self.group_delay_ms).max(0.0)
    }

    fn cooldown_frames(&self) -> u32 {
        (500.0 / self.frame_ms).ceil() as u32
    }

    fn push_accum(&mut self, energy: f64) {
        if self.accum.len() == self.accum_capacity {
            if let Some(old) = self.accum.pop_front() {
                self.accum_sum -= old;
            }
        }
        self.accum.push_back(energy);
        self.accum_sum += energy;
        // Guard against drift from repeated subtraction
        if self.accum_sum < 0.0 {
            self.accum_sum = self.accum.iter().sum();
        }
    }

    fn process_frame(&mut self, frame: &[Complex32], events: &mut Vec<DetectorEvent>) {
        self.fft.process(frame);
        let energy = self.fft.bucket_energy(self.bins.clone());
        self.last_energy = energy;
        self.last_quality_ms = self.frame_start_ms();
        self.push_accum(energy);

        if !self.baseline_seeded {
            if self.accum.len() == self.accum_capacity {
                self.baseline = self.accum_sum.max(1e-12);
                self.baseline_seeded = true;
            }
            return;
        }

        let threshold = self.baseline * self.params.threshold_mult;
        let frame_threshold = self.baseline / self.accum_capacity as f64 * self.params.threshold_mult;

        let frame_high = energy > frame_threshold;
        if frame_high {
            self.high_run += 1;
        }

        match self.state {
            MarkerState::Idle => {
                // Baseline adapts only while idle
                self.baseline += self.params.noise_adapt * (self.accum_sum - self.baseline);
                self.baseline = self.baseline.max(1e-12);

                if self.accum_sum > threshold && frame_high {
                    let run_ms = self.high_run.saturating_sub(1) as f64 * self.frame_ms;
                    self.state = MarkerState::InMarker {
                        start_ms: (self.frame_start_ms() - run_ms).max(0.0),
                        high_frames: self.high_run,
                        low_run: 0,
                        peak_accum: self.accum_sum,
                    };
                }
            }
            MarkerState::InMarker {
                start_ms,
                high_frames,
                low_run,
                peak_accum,
            } => {
                if frame_high {
                    self.state = MarkerState::InMarker {
                        start_ms,
                        high_frames: high_frames + 1,
                        low_run: 0,
                        peak_accum: peak_accum.max(self.accum_sum),
                    };
                } else {
                    let low_run = low_run + 1;
                    if low_run >= END_DEBOUNCE_FRAMES {
                        self.finish_candidate(start_ms, high_frames, peak_accum, events);
                        self.high_run = 0;
                        self.state = MarkerState::Cooldown {
                            frames_left: self.cooldown_frames(),
                        };
                    } else {
                        self.state = MarkerState::InMarker {
                            start_ms,
                            high_frames,
                            low_run,
                            peak_accum,
                        };
                    }
                }
            }
            MarkerState::Cooldown { frames_left } => {
                self.high_run = 0;
                self.state = if frames_left <= 1 {
                    MarkerState::Idle
                } else {
                    MarkerState::Cooldown {
                        frames_left: frames_left - 1,
                    }
                };
            }
        }

        if !frame_high && matches!(self.state, MarkerState::Idle) {
            self.high_run = 0;
        }
    }

    fn finish_candidate(
        &mut self,
        start_ms: f64,
        high_frames: u32,
        peak_accum: f64,
        events: &mut Vec<DetectorEvent>,
    ) {
        let raw_ms = high_frames as f64 * self.frame_ms;
        let duration_ms = (raw_ms / DURATION_RESOLUTION_MS).round() * DURATION_RESOLUTION_MS;
        if duration_ms < self.params.min_duration_ms || duration_ms > self.params.max_duration_ms {
            self.counters.rejected_duration += 1;
            return;
        }
        self.counters.emitted += 1;
        events.push(DetectorEvent {
            kind: EventKind::Marker,
            timestamp_ms: start_ms,
            duration_ms,
            peak_energy: peak_accum,
            correlation: None,
            bcd_path: None,
        });
    }
}

impl PulseDetector for MarkerDetector {
    fn process_samples(&mut self, samples: &[Complex32]) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        self.pending.extend_from_slice(samples);
        self.consumed += samples.len() as u64;

        let mut scratch = std::mem::take(&mut self.scratch);
        while self.pending.len() >= self.fft_size {
            scratch.clear();
            scratch.extend(self.pending.drain(..self.fft_size));
            self.process_frame(&scratch, &mut events);
            self.frame_start_sample += self.fft_size as u64;
        }
        self.scratch = scratch;
        events
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.accum.clear();
        self.accum_sum = 0.0;
        self.baseline = 0.0;
        self.baseline_seeded = false;
        self.high_run = 0;
        self.state = MarkerState::Idle;
        self.frame_start_sample = self.consumed;
    }

    fn quality(&self) -> ChannelQuality {
        let per_frame_baseline = self.baseline / self.accum_capacity.max(1) as f64;
        let snr_db = if per_frame_baseline > 0.0 && self.last_energy > 0.0 {
            10.0 * (self.last_energy / per_frame_baseline).log10()
        } else {
            0.0
        };
        ChannelQuality {
            timestamp_ms: self.last_quality_ms,
            noise_floor: per_frame_baseline,
            peak: self.last_energy,
            snr_db,
        }
    }
}
