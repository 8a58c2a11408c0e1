//! Control plane driven against a live pipeline.

use wwvrx_core::{ReceiverConfig, ReceiverPipeline};

use super::fixtures::{detector_rate_synth, drive_seconds};

#[test]
fn test_retune_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let param_path = dir.path().join("params.ini");

    let mut synth = detector_rate_synth(56, Some(14.0), 11);
    let mut rx =
        ReceiverPipeline::new(ReceiverConfig::default(), Some(param_path.clone())).unwrap();

    drive_seconds(&mut rx, &mut synth, 6);
    let ticks_before = rx.detectors().tick.counters().emitted;
    assert!(ticks_before >= 3);

    assert_eq!(
        rx.handle_control("SET_TICK_THRESHOLD 3.0"),
        "OK threshold_mult=3.000"
    );
    assert!(rx
        .handle_control("SET_TICK_THRESHOLD 10.0")
        .starts_with("ERR RANGE"));
    assert!(rx
        .handle_control("SET_TICK_THRESHOLD 0.0")
        .starts_with("ERR RANGE"));

    // The accepted value is live and persisted; the rejected ones are not
    assert_eq!(rx.detectors().tick.params().threshold_mult, 3.0);
    let on_disk = std::fs::read_to_string(&param_path).unwrap();
    assert!(
        on_disk.contains("threshold_multiplier=3.000"),
        "{on_disk}"
    );

    // The stream keeps decoding across the retune
    drive_seconds(&mut rx, &mut synth, 4);
    let ticks_after = rx.detectors().tick.counters().emitted;
    assert!(ticks_after > ticks_before, "detector stalled after retune");
}

#[test]
fn test_reload_flag_restores_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let param_path = dir.path().join("params.ini");

    let mut rx =
        ReceiverPipeline::new(ReceiverConfig::default(), Some(param_path.clone())).unwrap();
    rx.handle_control("SET_MARKER_THRESHOLD 4.0");
    rx.handle_control("SET_SYNC_MIN_RETAIN 0.1");
    drop(rx);

    let config = ReceiverConfig {
        reload: true,
        ..Default::default()
    };
    let rx = ReceiverPipeline::new(config, Some(param_path)).unwrap();
    assert_eq!(rx.detectors().marker.params().threshold_mult, 4.0);
}

#[test]
fn test_rate_limit_in_stream_time() {
    let mut synth = detector_rate_synth(5, None, 13);
    let mut rx = ReceiverPipeline::new(ReceiverConfig::default(), None).unwrap();
    drive_seconds(&mut rx, &mut synth, 2);

    // Stream time is frozen between chunks, so the rolling window admits
    // exactly ten commands
    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..15 {
        let response = rx.handle_control("GET_TICK_THRESHOLD");
        if response.starts_with("OK") {
            ok += 1;
        } else {
            assert!(response.starts_with("ERR RATE_LIMIT"), "{response}");
            limited += 1;
        }
    }
    assert_eq!(ok, 10);
    assert_eq!(limited, 5);

    // A second of stream progress refills the window
    drive_seconds(&mut rx, &mut synth, 2);
    assert!(rx.handle_control("GET_TICK_THRESHOLD").starts_with("OK"));
}

#[test]
fn test_status_reflects_live_state() {
    let mut synth = detector_rate_synth(56, None, 17);
    let mut rx = ReceiverPipeline::new(ReceiverConfig::default(), None).unwrap();
    drive_seconds(&mut rx, &mut synth, 8);

    let status = rx.handle_control("STATUS");
    assert!(status.contains("state=LOCKED"), "{status}");
    assert!(status.contains("markers=1"), "{status}");
}
