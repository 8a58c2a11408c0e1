//! Shared synthesizer presets and pipeline drivers.

use wwvrx_core::config::rates;
use wwvrx_core::events::SyncState;
use wwvrx_core::synth::{SynthConfig, WwvSynthesizer};
use wwvrx_core::{DecodedTime, ReceiverConfig, ReceiverPipeline};

/// The time encoded by the default synthesizer configuration: minute 37 of
/// hour 14, day-of-year 200, year 25.
pub fn reference_time() -> DecodedTime {
    SynthConfig::default().time
}

/// Synthesizer producing 50 kHz detector-path baseband directly.
pub fn detector_rate_synth(start_second: u8, snr_db: Option<f64>, seed: u64) -> WwvSynthesizer {
    WwvSynthesizer::new(SynthConfig {
        sample_rate: rates::DETECTOR,
        start_second,
        snr_db,
        seed,
        ..Default::default()
    })
}

pub fn pipeline() -> ReceiverPipeline {
    ReceiverPipeline::new(ReceiverConfig::default(), None).expect("pipeline construction")
}

/// Feed `seconds` of synthesized signal in one-second chunks, recording the
/// sync state at each second boundary.
pub fn drive_seconds(
    pipeline: &mut ReceiverPipeline,
    synth: &mut WwvSynthesizer,
    seconds: usize,
) -> Vec<SyncState> {
    let mut states = Vec::with_capacity(seconds);
    for _ in 0..seconds {
        let chunk = synth.generate(1.0);
        pipeline.process_detector_samples(&chunk);
        states.push(pipeline.frame_time().state);
    }
    states
}

/// Same, but over a caller-prepared sample buffer.
pub fn drive_samples(
    pipeline: &mut ReceiverPipeline,
    samples: &[num_complex::Complex32],
) -> Vec<SyncState> {
    let rate = rates::DETECTOR as usize;
    let mut states = Vec::new();
    for chunk in samples.chunks(rate) {
        pipeline.process_detector_samples(chunk);
        states.push(pipeline.frame_time().state);
    }
    states
}

/// Index of the first `Locked` entry, if any.
pub fn first_locked(states: &[SyncState]) -> Option<usize> {
    states.iter().position(|s| *s == SyncState::Locked)
}
