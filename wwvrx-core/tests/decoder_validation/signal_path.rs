//! Signal-path checks: the full 2 MHz front-end and the FFT selectivity
//! bounds the detectors rely on.

use std::f64::consts::TAU;

use num_complex::Complex32;
use wwvrx_core::config::rates;
use wwvrx_core::decimation::DualDecimator;
use wwvrx_core::dsp::spectrum::WindowKind;
use wwvrx_core::dsp::FftFrame;
use wwvrx_core::events::SyncState;
use wwvrx_core::source::IqFrame;
use wwvrx_core::synth::{SynthConfig, WwvSynthesizer};
use wwvrx_core::{ReceiverConfig, ReceiverPipeline};

fn tone_frame(freq: f64, n: usize) -> IqFrame {
    IqFrame {
        samples: (0..n)
            .map(|i| {
                let phase = TAU * freq * i as f64 / rates::SOURCE as f64;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect(),
        start_index: 0,
        sample_rate: rates::SOURCE,
        discontinuity: false,
        overload: false,
        metadata_changed: false,
    }
}

fn rms_db(samples: &[Complex32]) -> f64 {
    let p: f64 = samples.iter().map(|c| c.norm_sqr() as f64).sum::<f64>() / samples.len() as f64;
    10.0 * p.log10()
}

#[test]
fn test_1khz_tone_amplitude_preserved_on_both_paths() {
    let mut decimator = DualDecimator::new().unwrap();
    let out = decimator.process(&tone_frame(1000.0, 400_000));
    // Unit-magnitude complex tone: 0 dB reference
    let det_db = rms_db(&out.detector[2_000..]);
    let disp_db = rms_db(&out.display[500..]);
    assert!(det_db.abs() < 0.5, "detector path {det_db:.2} dB");
    assert!(disp_db.abs() < 0.5, "display path {disp_db:.2} dB");
}

#[test]
fn test_100hz_subcarrier_rejected_by_tick_bucket() {
    // The BCD subcarrier must not reach the tick detector's tone bucket:
    // >= 40 dB down relative to the tone it is tuned for
    let rate = rates::DETECTOR as f64;
    let mut frame = FftFrame::new(256, rate, WindowKind::Hann).unwrap();
    let bins = frame.bucket_bins(1000.0, 100.0);

    let tick_tone: Vec<Complex32> = (0..256)
        .map(|i| Complex32::new((TAU * 1000.0 * i as f64 / rate).cos() as f32, 0.0))
        .collect();
    frame.process(&tick_tone);
    let tick_energy = frame.bucket_energy(bins.clone());

    let bcd_tone: Vec<Complex32> = (0..256)
        .map(|i| Complex32::new((TAU * 100.0 * i as f64 / rate).cos() as f32, 0.0))
        .collect();
    frame.process(&bcd_tone);
    let bcd_energy = frame.bucket_energy(bins);

    let rejection_db = 10.0 * (tick_energy / bcd_energy.max(1e-30)).log10();
    assert!(rejection_db >= 40.0, "only {rejection_db:.1} dB rejection");
}

#[test]
fn test_full_rate_front_end_locks() {
    // The complete path: framed bytes, source adapter, decimation, both
    // detector banks, fusion
    let mut synth = WwvSynthesizer::new(SynthConfig {
        start_second: 57,
        snr_db: None,
        ..Default::default()
    });
    let bytes = synth.generate_framed(12.0, 200_000);

    let mut rx = ReceiverPipeline::new(ReceiverConfig::default(), None).unwrap();
    let summary = rx.process_source(std::io::Cursor::new(bytes)).unwrap();

    assert!((summary.seconds_processed - 12.0).abs() < 0.2);
    assert_eq!(rx.frame_time().state, SyncState::Locked);
    assert!(summary.tick_events >= 8, "{} ticks", summary.tick_events);
    assert_eq!(summary.marker_events, 1);
}
