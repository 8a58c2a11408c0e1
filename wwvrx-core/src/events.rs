//! Event and snapshot records exchanged between pipeline components.
//!
//! All timestamps are milliseconds since stream start, double precision,
//! derived from the monotonic sample index of the producing path. Events are
//! copied between components, never shared.

use serde::{Deserialize, Serialize};

/// Kind of pulse a detector observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// 5 ms seconds tick at 1 kHz (1.2 kHz for WWVH)
    Tick,
    /// 800 ms minute marker at 1 kHz
    Marker,
    /// Pulse on the 100 Hz BCD subcarrier
    BcdPulse,
}

/// Which detector path produced a BCD pulse event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BcdPath {
    /// 256-point FFT: precise edges, poor selectivity
    Time,
    /// 2048-point FFT: confident 100 Hz identification, smeared timing
    Freq,
}

/// Evidence-mask bits, sticky within one second, cleared on the boundary.
pub mod evidence {
    pub const TICK: u8 = 0x01;
    pub const MARKER: u8 = 0x02;
    pub const P_MARKER: u8 = 0x04;
    pub const TICK_HOLE: u8 = 0x08;
    pub const COMBINED: u8 = 0x10;
    pub const ALL: u8 = 0x1f;
}

/// A single detection, as produced by the tick, marker, and BCD detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorEvent {
    pub kind: EventKind,
    /// Leading-edge time; the event belongs to the second this falls in
    pub timestamp_ms: f64,
    pub duration_ms: f64,
    pub peak_energy: f64,
    /// Matched-filter score, when the producing detector runs one
    pub correlation: Option<f64>,
    /// Producing BCD path, `None` for tick/marker events
    pub bcd_path: Option<BcdPath>,
}

/// Lifecycle of the second-epoch estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Acquiring,
    Tentative,
    Locked,
    Recovering,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Acquiring => "ACQUIRING",
            SyncState::Tentative => "TENTATIVE",
            SyncState::Locked => "LOCKED",
            SyncState::Recovering => "RECOVERING",
        }
    }
}

/// Snapshot of the sync detector's notion of "which millisecond of which
/// second". Single authoritative copy lives in the sync detector; consumers
/// get copies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameTime {
    /// 0..59
    pub current_second: u8,
    pub second_start_ms: f64,
    /// Clamped to [0, 1]
    pub confidence: f64,
    /// Bit-set of `evidence::*` seen in the current second
    pub evidence_mask: u8,
    pub state: SyncState,
}

/// BCD symbol for one UTC second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symbol {
    Zero,
    One,
    /// Position marker (800 ms pulse)
    Marker,
    /// Silent second or unclassifiable pulse
    None,
}

impl Symbol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Symbol::Zero => "0",
            Symbol::One => "1",
            Symbol::Marker => "P",
            Symbol::None => "-",
        }
    }
}

/// One classified symbol, emitted exactly once per second boundary while the
/// correlator has timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolEvent {
    pub symbol: Symbol,
    /// Second slot `[0, 59]` the symbol was integrated over
    pub frame_second: u8,
    pub duration_ms: f64,
    pub confidence: f64,
    pub sync_state: SyncState,
}

/// Decoded NIST time code, one per complete minute frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTime {
    pub minutes: u8,
    pub hours: u8,
    pub day_of_year: u16,
    /// Two-digit year as transmitted; century is up to the caller
    pub year: u8,
    /// Tenths of a second, signed
    pub dut1_tenths: i8,
    pub leap_year: bool,
    pub leap_second_pending: bool,
    pub dst: bool,
}

/// Per-channel quality snapshot for telemetry, captured about once a second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelQuality {
    pub timestamp_ms: f64,
    pub noise_floor: f64,
    pub peak: f64,
    pub snr_db: f64,
}

/// Epoch estimate the sync detector feeds back to the tick gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochHint {
    /// Second-boundary phase in `[0, 1000)` ms
    pub epoch_ms: f64,
    /// Half-width of the acceptance window around the predicted tick
    pub window_ms: f64,
    pub confidence: f64,
}

/// Lock-free mailbox for the epoch hint. The sync detector publishes, the
/// tick detector reads one snapshot at the top of each outer loop; neither
/// holds a reference to the other.
#[derive(Debug, Default)]
pub struct EpochHintCell {
    enabled: std::sync::atomic::AtomicBool,
    epoch_ms: atomic_float::AtomicF64,
    window_ms: atomic_float::AtomicF64,
    confidence: atomic_float::AtomicF64,
}

impl EpochHintCell {
    pub fn publish(&self, hint: EpochHint) {
        use std::sync::atomic::Ordering;
        self.epoch_ms.store(hint.epoch_ms, Ordering::Relaxed);
        self.window_ms.store(hint.window_ms, Ordering::Relaxed);
        self.confidence.store(hint.confidence, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.enabled.store(false, std::sync::atomic::Ordering::Release);
    }

    pub fn load(&self) -> Option<EpochHint> {
        use std::sync::atomic::Ordering;
        if !self.enabled.load(Ordering::Acquire) {
            return None;
        }
        Some(EpochHint {
            epoch_ms: self.epoch_ms.load(Ordering::Relaxed),
            window_ms: self.window_ms.load(Ordering::Relaxed),
            confidence: self.confidence.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_bits_disjoint() {
        let bits = [
            evidence::TICK,
            evidence::MARKER,
            evidence::P_MARKER,
            evidence::TICK_HOLE,
            evidence::COMBINED,
        ];
        for (i, a) in bits.iter().enumerate() {
            for b in &bits[i + 1..] {
                assert_eq!(a & b, 0, "evidence bits overlap");
            }
        }
        assert_eq!(evidence::ALL, 0x1f);
    }

    #[test]
    fn test_sync_state_names() {
        assert_eq!(SyncState::Acquiring.as_str(), "ACQUIRING");
        assert_eq!(SyncState::Recovering.as_str(), "RECOVERING");
    }
}
