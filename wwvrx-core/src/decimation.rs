//! Dual-rate decimation: one 2 MHz input, two independent output streams.
//!
//! The detector chain low-passes at 5 kHz and keeps every 40th sample
//! (50 kHz); the display chain low-passes at 6 kHz and keeps every 160th
//! (12.5 kHz). I and Q run separate filter instances. All filter history is
//! zeroed on a source discontinuity, and the output sample counters keep
//! running so downstream timestamps stay monotonic across the gap.

use num_complex::Complex32;

use crate::config::rates;
use crate::dsp::Biquad;
use crate::errors::DspError;
use crate::source::IqFrame;

/// One low-pass-then-keep-every-Nth chain.
pub struct DecimationChain {
    filter_i: Biquad,
    filter_q: Biquad,
    ratio: usize,
    phase: usize,
    produced: u64,
    output_rate: u32,
}

impl DecimationChain {
    pub fn new(source_rate: u32, cutoff_hz: f64, ratio: usize) -> Result<Self, DspError> {
        if ratio == 0 || source_rate % ratio as u32 != 0 {
            return Err(DspError::InvalidDecimationRatio { ratio, source_rate });
        }
        Ok(Self {
            filter_i: Biquad::lowpass(source_rate as f64, cutoff_hz)?,
            filter_q: Biquad::lowpass(source_rate as f64, cutoff_hz)?,
            ratio,
            phase: 0,
            produced: 0,
            output_rate: source_rate / ratio as u32,
        })
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Output samples produced since start; the monotonic timestamp base.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Timestamp (ms since stream start) of the next output sample.
    pub fn next_output_ms(&self) -> f64 {
        self.produced as f64 * 1000.0 / self.output_rate as f64
    }

    /// Filter every input sample, append every `ratio`-th to `out`.
    pub fn process(&mut self, input: &[Complex32], out: &mut Vec<Complex32>) {
        for &sample in input {
            let i = self.filter_i.process(sample.re as f64);
            let q = self.filter_q.process(sample.im as f64);
            if self.phase == 0 {
                out.push(Complex32::new(i as f32, q as f32));
                self.produced += 1;
            }
            self.phase += 1;
            if self.phase == self.ratio {
                self.phase = 0;
            }
        }
    }

    /// Zero the filter history (the counters keep running).
    pub fn reset(&mut self) {
        self.filter_i.reset();
        self.filter_q.reset();
        self.phase = 0;
    }
}

/// Both chains over the shared normalized input.
pub struct DualDecimator {
    detector: DecimationChain,
    display: DecimationChain,
}

/// One frame's worth of output on both paths.
#[derive(Debug, Default)]
pub struct DecimatedFrames {
    pub detector: Vec<Complex32>,
    pub display: Vec<Complex32>,
    pub discontinuity: bool,
}

impl DualDecimator {
    pub fn new() -> Result<Self, DspError> {
        Ok(Self {
            detector: DecimationChain::new(rates::SOURCE, 5_000.0, rates::DETECTOR_DECIM)?,
            display: DecimationChain::new(rates::SOURCE, 6_000.0, rates::DISPLAY_DECIM)?,
        })
    }

    pub fn detector_chain(&self) -> &DecimationChain {
        &self.detector
    }

    pub fn display_chain(&self) -> &DecimationChain {
        &self.display
    }

    /// Run one source frame through both chains. A discontinuity resets the
    /// filter state before the frame's samples enter.
    pub fn process(&mut self, frame: &IqFrame) -> DecimatedFrames {
        if frame.discontinuity {
            self.detector.reset();
            self.display.reset();
        }
        let mut out = DecimatedFrames {
            discontinuity: frame.discontinuity,
            ..Default::default()
        };
        out.detector.reserve(frame.samples.len() / rates::DETECTOR_DECIM + 1);
        out.display.reserve(frame.samples.len() / rates::DISPLAY_DECIM + 1);
        self.detector.process(&frame.samples, &mut out.detector);
        self.display.process(&frame.samples, &mut out.display);
        out
    }
}
