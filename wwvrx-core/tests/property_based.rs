//! Property tests: parameter-store invariants, BCD frame round-trips, and
//! rate-limiter admission.

use proptest::prelude::*;

use wwvrx_core::config::{ParamId, TunableParams};
use wwvrx_core::control::ControlPlane;
use wwvrx_core::decoder::{encode_frame, symbol_duration_ms, BcdCorrelator};
use wwvrx_core::events::{
    BcdPath, DecodedTime, DetectorEvent, EventKind, FrameTime, SyncState,
};

fn arbitrary_param() -> impl Strategy<Value = ParamId> {
    (0..ParamId::ALL.len()).prop_map(|i| ParamId::ALL[i])
}

proptest! {
    /// Every accepted write is readable back; every rejected write leaves
    /// the full set untouched.
    #[test]
    fn prop_param_writes_all_or_nothing(
        writes in proptest::collection::vec((arbitrary_param(), -20.0f64..20.0), 1..40)
    ) {
        let mut params = TunableParams::default();
        for (id, value) in writes {
            let before = params;
            let spec = id.spec();
            match id.set(&mut params, value) {
                Ok(()) => {
                    prop_assert!(value >= spec.min && value <= spec.max);
                    prop_assert_eq!(id.get(&params), value);
                }
                Err(_) => {
                    prop_assert!(value < spec.min || value > spec.max);
                    prop_assert_eq!(params, before);
                }
            }
            // The whole set stays in range at all times
            for other in ParamId::ALL {
                let s = other.spec();
                let v = other.get(&params);
                prop_assert!(v >= s.min && v <= s.max);
            }
        }
    }

    /// Any valid time survives encode -> correlate -> decode.
    #[test]
    fn prop_bcd_frame_roundtrip(
        minutes in 0u8..60,
        hours in 0u8..24,
        day_of_year in 1u16..=366,
        year in 0u8..100,
        dut1_tenths in -9i8..=9,
        leap_year: bool,
        leap_second_pending: bool,
        dst: bool,
    ) {
        let time = DecodedTime {
            minutes, hours, day_of_year, year, dut1_tenths,
            leap_year, leap_second_pending, dst,
        };
        let frame = encode_frame(&time);
        let mut corr = BcdCorrelator::new();
        let mut decoded = None;
        for (sec, &sym) in frame.iter().enumerate() {
            let start = sec as f64 * 1000.0;
            let d = symbol_duration_ms(sym);
            if d > 0.0 {
                corr.on_pulse(&DetectorEvent {
                    kind: EventKind::BcdPulse,
                    timestamp_ms: start + 30.0,
                    duration_ms: d,
                    peak_energy: 1.0,
                    correlation: None,
                    bcd_path: Some(BcdPath::Time),
                });
            }
            let ft = FrameTime {
                current_second: sec as u8,
                second_start_ms: start,
                confidence: 0.9,
                evidence_mask: 0,
                state: SyncState::Locked,
            };
            let out = corr.advance(&ft, start + 1200.0);
            if let Some(d) = out.decoded {
                decoded = Some(d);
            }
        }
        prop_assert_eq!(decoded, Some(time));
    }

    /// No more than ten commands are ever admitted inside any rolling
    /// one-second window.
    #[test]
    fn prop_rate_limiter_rolling_window(
        gaps in proptest::collection::vec(0.0f64..400.0, 1..120)
    ) {
        let mut plane = ControlPlane::new(TunableParams::default(), None);
        let mut now = 0.0;
        let mut admitted: Vec<f64> = Vec::new();
        for gap in gaps {
            now += gap;
            let reply = plane.handle_line("GET_TICK_THRESHOLD", now);
            if reply.response.starts_with("OK") {
                admitted.push(now);
            }
        }
        for (i, &t) in admitted.iter().enumerate() {
            let in_window = admitted[..=i]
                .iter()
                .filter(|&&u| t - u < 1000.0)
                .count();
            prop_assert!(in_window <= 10, "{in_window} admitted in one second");
        }
    }
}
