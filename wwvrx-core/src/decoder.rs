//! BCD correlator and time-code decoder.
//!
//! Consumes BCD pulse events from both C5 paths plus `FrameTime` snapshots
//! from the sync detector. Pulses are integrated per one-second window,
//! classified into symbols at each boundary, gathered into a 60-slot minute
//! frame, and decoded into the NIST fields once per complete minute.
//!
//! The field windows are fixed by the transmitted format (minutes 1-8,
//! hours 10-18, day-of-year 20-33, DUT1 34-38, year 40-48, flags 50-58).
//! Within a window, bits carry plain BCD weights, units digit first,
//! skipping the P-marker second that falls inside the day-of-year window.

use crate::events::{
    BcdPath, DecodedTime, DetectorEvent, FrameTime, Symbol, SymbolEvent, SyncState,
};

/// Seconds carrying position markers.
pub const P_MARKER_SECONDS: [u8; 7] = [0, 9, 19, 29, 39, 49, 59];

/// Classification boundaries (ms).
const ZERO_RANGE_MS: (f64, f64) = (150.0, 350.0);
const ONE_RANGE_MS: (f64, f64) = (350.0, 650.0);
const MARKER_RANGE_MS: (f64, f64) = (650.0, 950.0);

/// Events later than this past a window's end cannot change it, so the
/// window closes once `now` passes end + lag.
const CLOSE_LAG_MS: f64 = 150.0;
/// Freq-path timing smear tolerated when matching pulses to windows.
const FREQ_SMEAR_MS: f64 = 300.0;
/// Grid disagreement with the sync detector that forces a realign.
const REALIGN_TOL_MS: f64 = 100.0;
/// A slow-marker confirmation within this of a Marker symbol raises its
/// confidence.
const SLOW_CONFIRM_MS: f64 = 1000.0;

/// Bit layout: (second, weight) pairs per field.
pub(crate) mod layout {
    pub const MINUTES: [(u8, u16); 7] =
        [(1, 1), (2, 2), (3, 4), (4, 8), (5, 10), (6, 20), (7, 40)];
    pub const HOURS: [(u8, u16); 6] = [(10, 1), (11, 2), (12, 4), (13, 8), (14, 10), (15, 20)];
    pub const DAY_OF_YEAR: [(u8, u16); 10] = [
        (20, 1),
        (21, 2),
        (22, 4),
        (23, 8),
        (24, 10),
        (25, 20),
        (26, 40),
        (27, 80),
        (28, 100),
        (30, 200),
    ];
    pub const DUT1_SIGN: u8 = 34;
    pub const DUT1_TENTHS: [(u8, u16); 4] = [(35, 1), (36, 2), (37, 4), (38, 8)];
    pub const YEAR: [(u8, u16); 8] = [
        (40, 1),
        (41, 2),
        (42, 4),
        (43, 8),
        (44, 10),
        (45, 20),
        (46, 40),
        (47, 80),
    ];
    pub const FLAG_LEAP_YEAR: u8 = 50;
    pub const FLAG_LEAP_SECOND: u8 = 51;
    pub const FLAG_DST: u8 = 52;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorCounters {
    pub symbols_emitted: u64,
    pub rejected_marker_position: u64,
    pub frames_decoded: u64,
    pub invalid_frames: u64,
}

/// Output of one `advance` call.
#[derive(Debug, Default)]
pub struct CorrelatorOutput {
    pub symbols: Vec<SymbolEvent>,
    pub decoded: Option<DecodedTime>,
}

pub struct BcdCorrelator {
    time_events: Vec<DetectorEvent>,
    freq_events: Vec<DetectorEvent>,
    last_slow_marker_ms: Option<f64>,

    /// Start of the window currently being integrated, with its second slot
    window: Option<(f64, u8)>,
    frame: [Option<Symbol>; 60],
    /// Pulse-start jitter accumulator for the CORR channel
    jitter_sq_sum: f64,
    jitter_count: u64,
    /// Consecutive non-None symbols
    chain_len: u32,

    counters: CorrelatorCounters,
}

impl Default for BcdCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl BcdCorrelator {
    pub fn new() -> Self {
        Self {
            time_events: Vec::new(),
            freq_events: Vec::new(),
            last_slow_marker_ms: None,
            window: None,
            frame: [None; 60],
            jitter_sq_sum: 0.0,
            jitter_count: 0,
            chain_len: 0,
            counters: CorrelatorCounters::default(),
        }
    }

    pub fn counters(&self) -> CorrelatorCounters {
        self.counters
    }

    /// (timing variance in ms^2, consecutive classified symbols)
    pub fn stats(&self) -> (f64, u32) {
        let variance = if self.jitter_count > 0 {
            self.jitter_sq_sum / self.jitter_count as f64
        } else {
            0.0
        };
        (variance, self.chain_len)
    }

    pub fn frame_slot(&self, second: u8) -> Option<Symbol> {
        self.frame[second as usize % 60]
    }

    /// Buffer a BCD pulse event from either C5 path.
    pub fn on_pulse(&mut self, event: &DetectorEvent) {
        match event.bcd_path {
            Some(BcdPath::Time) => self.time_events.push(event.clone()),
            Some(BcdPath::Freq) => self.freq_events.push(event.clone()),
            None => {}
        }
    }

    /// Slow-path marker confirmation (display chain), used for confidence.
    pub fn on_slow_marker(&mut self, event: &DetectorEvent) {
        self.last_slow_marker_ms = Some(event.timestamp_ms);
    }

    /// Stream discontinuity: drop buffered pulses and the partial frame.
    pub fn reset(&mut self) {
        self.time_events.clear();
        self.freq_events.clear();
        self.window = None;
        self.frame = [None; 60];
        self.chain_len = 0;
    }

    /// Close every window whose end has passed, emitting one symbol each.
    pub fn advance(&mut self, frame_time: &FrameTime, now_ms: f64) -> CorrelatorOutput {
        let mut out = CorrelatorOutput::default();

        if frame_time.state == SyncState::Acquiring {
            // No timing: buffered pulses go stale quickly
            self.window = None;
            self.prune(now_ms - 2000.0);
            return out;
        }

        // Align our window grid to the sync detector's
        let expected_start = frame_time.second_start_ms;
        match self.window {
            Some((start, second)) => {
                let steps = (frame_time.current_second as i64 - second as i64).rem_euclid(60);
                let projected = start + steps as f64 * 1000.0;
                if (projected - expected_start).abs() > REALIGN_TOL_MS {
                    self.window = Some((expected_start, frame_time.current_second));
                }
            }
            None => {
                self.window = Some((expected_start, frame_time.current_second));
            }
        }

        while let Some((start, second)) = self.window {
            if now_ms < start + 1000.0 + CLOSE_LAG_MS {
                break;
            }
            let (symbol_event, was_minute_end) =
                self.close_window(start, second, frame_time.state);
            if was_minute_end {
                out.decoded = self.decode_frame();
                self.frame = [None; 60];
            }
            out.symbols.push(symbol_event);
            self.window = Some((start + 1000.0, (second + 1) % 60));
        }

        self.prune(now_ms - 4000.0);
        out
    }

    fn prune(&mut self, before_ms: f64) {
        self.time_events.retain(|e| e.timestamp_ms >= before_ms);
        self.freq_events.retain(|e| e.timestamp_ms >= before_ms);
    }

    /// Integrate both paths over `[start, start + 1000)` and classify.
    fn close_window(
        &mut self,
        start: f64,
        second: u8,
        sync_state: SyncState,
    ) -> (SymbolEvent, bool) {
        let end = start + 1000.0;
        let time_pulse = self
            .time_events
            .iter()
            .filter(|e| e.timestamp_ms >= start && e.timestamp_ms < end)
            .max_by(|a, b| a.duration_ms.total_cmp(&b.duration_ms))
            .cloned();
        let freq_pulse = self
            .freq_events
            .iter()
            .filter(|e| {
                e.timestamp_ms >= start - FREQ_SMEAR_MS && e.timestamp_ms < end - FREQ_SMEAR_MS / 2.0
            })
            .max_by(|a, b| a.duration_ms.total_cmp(&b.duration_ms))
            .cloned();

        // Duration fusion: trust the time path's edges; the freq path
        // confirms the subcarrier and substitutes when the time path missed
        let (duration_ms, mut confidence): (f64, f64) = match (&time_pulse, &freq_pulse) {
            (Some(t), Some(f)) => {
                let agree = (t.duration_ms - f.duration_ms).abs() <= 250.0;
                (t.duration_ms, if agree { 0.9 } else { 0.6 })
            }
            (Some(t), None) => (t.duration_ms, 0.6),
            (None, Some(f)) => (f.duration_ms, 0.4),
            (None, None) => (0.0, 0.5),
        };

        if let Some(t) = &time_pulse {
            let jitter = t.timestamp_ms - start - 30.0;
            self.jitter_sq_sum += jitter * jitter;
            self.jitter_count += 1;
        }

        let mut symbol = classify(duration_ms);

        // Position gating: markers only at the seven P slots
        if symbol == Symbol::Marker
            && matches!(sync_state, SyncState::Locked | SyncState::Tentative)
            && !p_slot_allowed(second)
        {
            self.counters.rejected_marker_position += 1;
            symbol = Symbol::None;
        }

        if symbol == Symbol::Marker {
            if let Some(slow) = self.last_slow_marker_ms {
                if (slow - start).abs() <= SLOW_CONFIRM_MS {
                    confidence = (confidence + 0.1).min(1.0);
                }
            }
        }

        self.chain_len = if symbol == Symbol::None {
            0
        } else {
            self.chain_len + 1
        };

        self.frame[second as usize] = Some(symbol);
        self.counters.symbols_emitted += 1;

        let event = SymbolEvent {
            symbol,
            frame_second: second,
            duration_ms,
            confidence,
            sync_state,
        };
        (event, second == 59)
    }

    /// Decode the 60-slot frame. `None` when the frame is incomplete,
    /// under-marked, or fails range validation.
    fn decode_frame(&mut self) -> Option<DecodedTime> {
        if self.frame.iter().any(|s| s.is_none()) {
            return None;
        }
        let markers = P_MARKER_SECONDS
            .iter()
            .filter(|&&s| self.frame[s as usize] == Some(Symbol::Marker))
            .count();
        if markers < 4 {
            self.counters.invalid_frames += 1;
            return None;
        }

        let minutes = self.field(&layout::MINUTES)?;
        let hours = self.field(&layout::HOURS)?;
        let day_of_year = self.field(&layout::DAY_OF_YEAR)?;
        let dut1_mag = self.field(&layout::DUT1_TENTHS)?;
        let year = self.field(&layout::YEAR)?;
        let dut1_neg = self.bit(layout::DUT1_SIGN)?;
        let leap_year = self.bit(layout::FLAG_LEAP_YEAR)?;
        let leap_second_pending = self.bit(layout::FLAG_LEAP_SECOND)?;
        let dst = self.bit(layout::FLAG_DST)?;

        let valid = minutes <= 59
            && hours <= 23
            && (1..=366).contains(&day_of_year)
            && year <= 99
            && dut1_mag <= 9;
        if !valid {
            self.counters.invalid_frames += 1;
            return None;
        }

        self.counters.frames_decoded += 1;
        let dut1_tenths = if dut1_neg {
            -(dut1_mag as i8)
        } else {
            dut1_mag as i8
        };
        Some(DecodedTime {
            minutes: minutes as u8,
            hours: hours as u8,
            day_of_year,
            year: year as u8,
            dut1_tenths,
            leap_year,
            leap_second_pending,
            dst,
        })
    }

    /// Weighted-bit field value; `None` when a bit slot holds anything but
    /// Zero/One, or the BCD units nibble is not a digit.
    fn field(&mut self, bits: &[(u8, u16)]) -> Option<u16> {
        let mut value = 0u16;
        let mut units = 0u16;
        for &(second, weight) in bits {
            let bit = match self.frame[second as usize] {
                Some(Symbol::One) => 1u16,
                Some(Symbol::Zero) => 0,
                _ => {
                    self.counters.invalid_frames += 1;
                    return None;
                }
            };
            value += bit * weight;
            if weight < 10 {
                units += bit * weight;
            }
        }
        if units > 9 {
            self.counters.invalid_frames += 1;
            return None;
        }
        Some(value)
    }

    fn bit(&mut self, second: u8) -> Option<bool> {
        match self.frame[second as usize] {
            Some(Symbol::One) => Some(true),
            Some(Symbol::Zero) => Some(false),
            _ => {
                self.counters.invalid_frames += 1;
                None
            }
        }
    }
}

fn classify(duration_ms: f64) -> Symbol {
    if (ZERO_RANGE_MS.0..ZERO_RANGE_MS.1).contains(&duration_ms) {
        Symbol::Zero
    } else if (ONE_RANGE_MS.0..ONE_RANGE_MS.1).contains(&duration_ms) {
        Symbol::One
    } else if (MARKER_RANGE_MS.0..=MARKER_RANGE_MS.1).contains(&duration_ms) {
        Symbol::Marker
    } else {
        Symbol::None
    }
}

fn p_slot_allowed(second: u8) -> bool {
    P_MARKER_SECONDS
        .iter()
        .any(|&p| (second as i16 - p as i16).abs() <= 1)
        || second == 0
        || second == 59
}

/// Encode a `DecodedTime` into the 60 per-second symbols of one minute
/// frame. The synthesizer and the frame tests share this with the decoder
/// so the two sides cannot drift apart.
pub fn encode_frame(time: &DecodedTime) -> [Symbol; 60] {
    let mut frame = [Symbol::Zero; 60];
    for &s in &P_MARKER_SECONDS {
        frame[s as usize] = Symbol::Marker;
    }
    let mut set_field = |bits: &[(u8, u16)], value: u16| {
        for &(second, weight) in bits {
            // Weighted BCD: a bit is set when the value contains the weight
            let digit_base = if weight >= 100 {
                100
            } else if weight >= 10 {
                10
            } else {
                1
            };
            let digit = (value / digit_base) % 10;
            let bit_weight = weight / digit_base;
            frame[second as usize] = if digit & bit_weight != 0 {
                Symbol::One
            } else {
                Symbol::Zero
            };
        }
    };
    set_field(&layout::MINUTES, time.minutes as u16);
    set_field(&layout::HOURS, time.hours as u16);
    set_field(&layout::DAY_OF_YEAR, time.day_of_year);
    set_field(&layout::DUT1_TENTHS, time.dut1_tenths.unsigned_abs() as u16);
    set_field(&layout::YEAR, time.year as u16);
    frame[layout::DUT1_SIGN as usize] = if time.dut1_tenths < 0 {
        Symbol::One
    } else {
        Symbol::Zero
    };
    frame[layout::FLAG_LEAP_YEAR as usize] = if time.leap_year {
        Symbol::One
    } else {
        Symbol::Zero
    };
    frame[layout::FLAG_LEAP_SECOND as usize] = if time.leap_second_pending {
        Symbol::One
    } else {
        Symbol::Zero
    };
    frame[layout::FLAG_DST as usize] = if time.dst {
        Symbol::One
    } else {
        Symbol::Zero
    };
    frame
}

/// Transmitted pulse duration for a symbol, milliseconds.
pub fn symbol_duration_ms(symbol: Symbol) -> f64 {
    match symbol {
        Symbol::Zero => 200.0,
        Symbol::One => 500.0,
        Symbol::Marker => 800.0,
        Symbol::None => 0.0,
    }
}
