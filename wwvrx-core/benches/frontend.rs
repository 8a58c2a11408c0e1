//! Front-end throughput: the decimation chains and the tick detector must
//! comfortably beat real time (2 MHz in, 50 kHz detector path).

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use num_complex::Complex32;
use std::f64::consts::TAU;

use wwvrx_core::config::{rates, Station, TickParams};
use wwvrx_core::decimation::DualDecimator;
use wwvrx_core::detectors::{PulseDetector, TickDetector};
use wwvrx_core::source::IqFrame;

fn source_tone(n: usize) -> IqFrame {
    IqFrame {
        samples: (0..n)
            .map(|i| {
                let phase = TAU * 1000.0 * i as f64 / rates::SOURCE as f64;
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

fn detector_tone(n: usize) -> Vec<Complex32> {
    (0..n)
        .map(|i| {
            let phase = TAU * 1000.0 * i as f64 / rates::DETECTOR as f64;
            Complex32::new(0.02 * phase.cos() as f32, 0.02 * phase.sin() as f32)
        })
        .collect()
}

fn bench_decimation(c: &mut Criterion) {
    // 100 ms of source-rate input per iteration
    let frame = source_tone(200_000);
    let mut group = c.benchmark_group("decimation");
    group.throughput(Throughput::Elements(frame.samples.len() as u64));
    group.bench_function("dual_chain_100ms", |b| {
        let mut decimator = DualDecimator::new().unwrap();
        b.iter(|| decimator.process(&frame));
    });
    group.finish();
}

fn bench_tick_detector(c: &mut Criterion) {
    // One second of detector-path input per iteration
    let samples = detector_tone(rates::DETECTOR as usize);
    let mut group = c.benchmark_group("tick_detector");
    group.throughput(Throughput::Elements(samples.len() as u64));
    group.bench_function("quiet_second", |b| {
        let mut detector = TickDetector::new(Station::Wwv, TickParams::default());
        b.iter(|| detector.process_samples(&samples));
    });
    group.finish();
}

criterion_group!(benches, bench_decimation, bench_tick_detector);
criterion_main!(benches);
