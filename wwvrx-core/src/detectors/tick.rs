//! Seconds-tick detector: 5 ms bursts of the 1 kHz (WWV) or 1.2 kHz (WWVH)
//! tone at each UTC second.
//!
//! Front-end: 256-point Hann FFT at 50 kHz (5.12 ms frames), energy summed
//! over the tone bucket in both sidebands. An adaptive noise floor feeds a
//! hysteresis state machine; an optional matched filter and an optional
//! sync-fed position gate reject interference that passes the energy test.

use std::f64::consts::TAU;
use std::sync::Arc;

use num_complex::Complex32;

use crate::config::{rates, Station, TickParams};
use crate::dsp::spectrum::WindowKind;
use crate::dsp::{window, FftFrame};
use crate::events::{ChannelQuality, DetectorEvent, EpochHintCell, EventKind};

use super::PulseDetector;

const FFT_SIZE: usize = 256;
const FRAME_MS: f64 = FFT_SIZE as f64 * 1000.0 / rates::DETECTOR as f64;
/// Tone-bucket half width
const BUCKET_HALF_HZ: f64 = 100.0;
/// Matched-filter template length: 5 ms at 50 kHz
const TEMPLATE_LEN: usize = 250;
/// Consecutive low-energy frames required to close a pulse
const END_DEBOUNCE_FRAMES: u32 = 3;
/// Nominal tick centre within a second: leading edge at the boundary plus
/// half the 5 ms pulse
const TICK_CENTER_OFFSET_MS: f64 = 12.5;

/// Position-gate window bounds and narrowing schedule.
const GATE_WINDOW_START_MS: f64 = 50.0;
const GATE_WINDOW_MIN_MS: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum TickState {
    Idle,
    InTick {
        start_ms: f64,
        high_frames: u32,
        low_run: u32,
        peak_energy: f64,
        peak_corr: f64,
    },
    Cooldown {
        frames_left: u32,
    },
}

/// Counters surfaced through `STATUS` and the telemetry bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickCounters {
    pub emitted: u64,
    /// Candidates outside the duration window (the false-rejection counter)
    pub rejected_duration: u64,
    pub rejected_correlation: u64,
    pub rejected_gate: u64,
}

pub struct TickDetector {
    params: TickParams,
    fft: FftFrame,
    bins: std::ops::RangeInclusive<usize>,
    template: Vec<Complex32>,
    template_norm: f64,

    pending: Vec<Complex32>,
    scratch: Vec<Complex32>,
    /// Stream sample index of the next frame's first sample (50 kHz domain)
    frame_start_sample: u64,
    consumed: u64,

    noise_floor: f64,
    floor_seeded: bool,
    corr_noise: f64,
    state: TickState,

    epoch_hint: Option<Arc<EpochHintCell>>,
    gate_window_ms: f64,
    gate_streak: u32,

    counters: TickCounters,
    last_tick_ms: Option<f64>,
    last_interval_ms: Option<f64>,
    last_energy: f64,
    last_quality_ms: f64,
}

impl TickDetector {
    pub fn new(station: Station, params: TickParams) -> Self {
        let tone_hz = station.tick_freq_hz();
        let fft = FftFrame::new(FFT_SIZE, rates::DETECTOR as f64, WindowKind::Hann)
            .expect("fixed power-of-two FFT size");
        let bins = fft.bucket_bins(tone_hz, BUCKET_HALF_HZ);

        // 5 ms Hann-windowed tone burst, the transmitted tick shape
        let env = window::hann(TEMPLATE_LEN);
        let template: Vec<Complex32> = (0..TEMPLATE_LEN)
            .map(|i| {
                let phase = TAU * tone_hz * i as f64 / rates::DETECTOR as f64;
                Complex32::new(
                    (phase.cos() * env[i] as f64) as f32,
                    (phase.sin() * env[i] as f64) as f32,
                )
            })
            .collect();
        let template_norm = template
            .iter()
            .map(|c| c.norm_sqr() as f64)
            .sum::<f64>()
            .sqrt();

        Self {
            params,
            fft,
            bins,
            template,
            template_norm,
            pending: Vec::with_capacity(4 * FFT_SIZE),
            scratch: Vec::with_capacity(FFT_SIZE),
            frame_start_sample: 0,
            consumed: 0,
            noise_floor: 0.0,
            floor_seeded: false,
            corr_noise: 0.05,
            state: TickState::Idle,
            epoch_hint: None,
            gate_window_ms: GATE_WINDOW_START_MS,
            gate_streak: 0,
            counters: TickCounters::default(),
            last_tick_ms: None,
            last_interval_ms: None,
            last_energy: 0.0,
            last_quality_ms: 0.0,
        }
    }

    /// Connect the sync detector's epoch feedback (enables the gate).
    pub fn attach_epoch_hint(&mut self, cell: Arc<EpochHintCell>) {
        self.epoch_hint = Some(cell);
    }

    /// Swap in a new parameter snapshot (applied from the next frame).
    pub fn set_params(&mut self, params: TickParams) {
        self.params = params;
    }

    pub fn params(&self) -> &TickParams {
        &self.params
    }

    pub fn counters(&self) -> TickCounters {
        self.counters
    }

    /// Interval between the two most recent emitted ticks.
    pub fn last_interval_ms(&self) -> Option<f64> {
        self.last_interval_ms
    }

    fn cooldown_frames(&self) -> u32 {
        (self.params.cooldown_ms / FRAME_MS).ceil() as u32
    }

    /// Timestamp of the current frame's first sample, corrected for the
    /// decimation-chain group delay.
    fn frame_start_ms(&self) -> f64 {
        (self.frame_start_sample as f64 * 1000.0 / rates::DETECTOR as f64
            - rates::DETECTOR_GROUP_DELAY_MS)
            .max(0.0)
    }

    /// First sample at or above half the frame's peak envelope: the
    /// sub-frame leading-edge estimate.
    fn leading_edge_offset_ms(frame: &[Complex32]) -> f64 {
        let peak = frame.iter().map(|c| c.norm_sqr()).fold(0.0f32, f32::max);
        if peak <= 0.0 {
            return 0.0;
        }
        let half = peak * 0.25; // envelope half-amplitude = quarter power
        let idx = frame
            .iter()
            .position(|c| c.norm_sqr() >= half)
            .unwrap_or(0);
        idx as f64 * 1000.0 / rates::DETECTOR as f64
    }

    /// Normalized matched-filter correlation, evaluated with the template
    /// centred on the frame's envelope peak.
    fn correlation(&self, frame: &[Complex32]) -> f64 {
        let peak_idx = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.norm_sqr().total_cmp(&b.1.norm_sqr()))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let start = peak_idx
            .saturating_sub(TEMPLATE_LEN / 2)
            .min(FFT_SIZE - TEMPLATE_LEN);
        let window = &frame[start..start + TEMPLATE_LEN];

        let mut dot = num_complex::Complex64::new(0.0, 0.0);
        let mut win_energy = 0.0f64;
        for (s, t) in window.iter().zip(&self.template) {
            let s64 = num_complex::Complex64::new(s.re as f64, s.im as f64);
            let t64 = num_complex::Complex64::new(t.re as f64, t.im as f64);
            dot += s64 * t64.conj();
            win_energy += s64.norm_sqr();
        }
        let denom = win_energy.sqrt() * self.template_norm;
        if denom <= 1e-12 || !denom.is_finite() {
            return 0.0;
        }
        let corr = dot.norm() / denom;
        if corr.is_finite() {
            corr
        } else {
            0.0
        }
    }

    /// Adaptive floor: fast multiplicative float-down below the floor, slow
    /// pull-up while in the noise band, frozen while signal is present.
    fn update_floor(&mut self, energy: f64, threshold_high: f64) {
        if !self.floor_seeded {
            self.noise_floor = energy.max(1e-12);
            self.floor_seeded = true;
            return;
        }
        if energy < self.noise_floor {
            self.noise_floor = self.noise_floor * self.params.adapt_down
                + energy * (1.0 - self.params.adapt_down);
        } else if energy < threshold_high {
            self.noise_floor += self.params.adapt_up * (energy - self.noise_floor);
        }
        self.noise_floor = self.noise_floor.max(1e-12);
    }

    /// Gate a candidate against the predicted tick position. Returns whether
    /// the candidate is accepted; adjusts the narrowing window either way.
    fn gate_check(&mut self, center_ms: f64) -> bool {
        let hint = match self.epoch_hint.as_ref().and_then(|c| c.load()) {
            Some(h) => h,
            None => return true,
        };
        let predicted = (hint.epoch_ms + TICK_CENTER_OFFSET_MS).rem_euclid(1000.0);
        let phase = center_ms.rem_euclid(1000.0);
        let mut dist = (phase - predicted).abs();
        if dist > 500.0 {
            dist = 1000.0 - dist;
        }
        if dist <= self.gate_window_ms {
            self.gate_streak += 1;
            let factor = if self.gate_streak > 30 {
                0.98
            } else if self.gate_streak > 10 {
                0.95
            } else {
                1.0
            };
            self.gate_window_ms = (self.gate_window_ms * factor).max(GATE_WINDOW_MIN_MS);
            true
        } else {
            self.gate_streak = 0;
            self.gate_window_ms = GATE_WINDOW_START_MS;
            false
        }
    }

    fn process_frame(&mut self, frame: &[Complex32], events: &mut Vec<DetectorEvent>) {
        self.fft.process(frame);
        let energy = self.fft.bucket_energy(self.bins.clone());
        self.last_energy = energy;
        self.last_quality_ms = self.frame_start_ms();

        let threshold_high = self.noise_floor * self.params.threshold_mult;
        let threshold_low = threshold_high * 0.7;
        self.update_floor(energy, threshold_high);

        match self.state {
            TickState::Idle => {
                if self.floor_seeded && energy > threshold_high {
                    let corr = self.correlation(frame);
                    self.state = TickState::InTick {
                        start_ms: self.frame_start_ms() + Self::leading_edge_offset_ms(frame),
                        high_frames: 1,
                        low_run: 0,
                        peak_energy: energy,
                        peak_corr: corr,
                    };
                } else if self.frame_start_sample / FFT_SIZE as u64 % 8 == 0 {
                    // Sample the correlation noise level on quiet frames;
                    // every 8th is plenty and keeps the idle path cheap
                    let corr = self.correlation(frame);
                    self.corr_noise += 0.05 * (corr - self.corr_noise);
                }
            }
            TickState::InTick {
                start_ms,
                high_frames,
                low_run,
                peak_energy,
                peak_corr,
            } => {
                if energy < threshold_low {
                    let low_run = low_run + 1;
                    if low_run >= END_DEBOUNCE_FRAMES {
                        self.finish_candidate(start_ms, high_frames, peak_energy, peak_corr, events);
                        self.state = TickState::Cooldown {
                            frames_left: self.cooldown_frames(),
                        };
                    } else {
                        self.state = TickState::InTick {
                            start_ms,
                            high_frames,
                            low_run,
                            peak_energy,
                            peak_corr,
                        };
                    }
                } else {
                    let corr = self.correlation(frame);
                    self.state = TickState::InTick {
                        start_ms,
                        high_frames: high_frames + 1,
                        low_run: 0,
                        peak_energy: peak_energy.max(energy),
                        peak_corr: peak_corr.max(corr),
                    };
                }
            }
            TickState::Cooldown { frames_left } => {
                self.state = if frames_left <= 1 {
                    TickState::Idle
                } else {
                    TickState::Cooldown {
                        frames_left: frames_left - 1,
                    }
                };
            }
        }
    }

    fn finish_candidate(
        &mut self,
        start_ms: f64,
        high_frames: u32,
        peak_energy: f64,
        peak_corr: f64,
        events: &mut Vec<DetectorEvent>,
    ) {
        let duration_ms = high_frames as f64 * FRAME_MS;
        if duration_ms < self.params.min_duration_ms || duration_ms > self.params.max_duration_ms {
            self.counters.rejected_duration += 1;
            return;
        }
        if self.params.matched_filter && peak_corr < self.params.correlation_mult * self.corr_noise
        {
            self.counters.rejected_correlation += 1;
            return;
        }
        if !self.gate_check(start_ms + duration_ms / 2.0) {
            self.counters.rejected_gate += 1;
            return;
        }

        if let Some(last) = self.last_tick_ms {
            self.last_interval_ms = Some(start_ms - last);
        }
        self.last_tick_ms = Some(start_ms);
        self.counters.emitted += 1;
        events.push(DetectorEvent {
            kind: EventKind::Tick,
            timestamp_ms: start_ms,
            duration_ms,
            peak_energy,
            correlation: Some(peak_corr),
            bcd_path: None,
        });
    }
}

impl PulseDetector for TickDetector {
    fn process_samples(&mut self, samples: &[Complex32]) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        self.pending.extend_from_slice(samples);
        self.consumed += samples.len() as u64;

        let mut scratch = std::mem::take(&mut self.scratch);
        while self.pending.len() >= FFT_SIZE {
            scratch.clear();
            scratch.extend(self.pending.drain(..FFT_SIZE));
            self.process_frame(&scratch, &mut events);
            self.frame_start_sample += FFT_SIZE as u64;
        }
        self.scratch = scratch;
        events
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.state = TickState::Idle;
        self.floor_seeded = false;
        self.noise_floor = 0.0;
        self.corr_noise = 0.05;
        self.gate_window_ms = GATE_WINDOW_START_MS;
        self.gate_streak = 0;
        self.last_tick_ms = None;
        self.last_interval_ms = None;
        // Realign frames to the post-gap stream position
        self.frame_start_sample = self.consumed;
    }

    fn quality(&self) -> ChannelQuality {
        let snr_db = if self.noise_floor > 0.0 && self.last_energy > 0.0 {
            10.0 * (self.last_energy / self.noise_floor).log10()
        } else {
            0.0
        };
        ChannelQuality {
            timestamp_ms: self.last_quality_ms,
            noise_floor: self.noise_floor,
            peak: self.last_energy,
            snr_db,
        }
    }
}
