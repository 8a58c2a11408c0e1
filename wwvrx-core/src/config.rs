//! Configuration types for the receiver pipeline.
//!
//! Tunable parameters are grouped per detector. Each detector task owns an
//! immutable copy of its group and swaps in a replacement between FFT frames
//! when the control plane accepts a write, so the hot path never takes a
//! lock. `ParamId` is the control-plane's view: one entry per tunable, with
//! the wire command, the on-disk location, and the validated range.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Fixed rates of the two decimation paths.
pub mod rates {
    /// Front-end complex sample rate (Hz)
    pub const SOURCE: u32 = 2_000_000;

    /// Detector path: 2 MHz / 40
    pub const DETECTOR_DECIM: usize = 40;
    pub const DETECTOR: u32 = SOURCE / DETECTOR_DECIM as u32;

    /// Display path: 2 MHz / 160 = 12.5 kHz exactly. Chosen over /166 so the
    /// rate is an integer and the 4096-point tone-tracker bin width
    /// (12500/4096 Hz) is exactly representable.
    pub const DISPLAY_DECIM: usize = 160;
    pub const DISPLAY: u32 = SOURCE / DISPLAY_DECIM as u32;

    /// Detector-chain group delay, subtracted from event timestamps
    pub const DETECTOR_GROUP_DELAY_MS: f64 = 3.0;
    /// Display-chain group delay
    pub const DISPLAY_GROUP_DELAY_MS: f64 = 2.5;
}

/// Which station the receiver is tuned to; selects the tick/marker tone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Station {
    #[default]
    Wwv,
    Wwvh,
}

impl Station {
    /// Tick and minute-marker tone frequency.
    pub fn tick_freq_hz(&self) -> f64 {
        match self {
            Station::Wwv => 1000.0,
            Station::Wwvh => 1200.0,
        }
    }
}

/// Tick-detector tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickParams {
    /// threshold_high = noise floor x this
    pub threshold_mult: f64,
    /// Multiplicative floor decay per frame while energy < floor
    pub adapt_down: f64,
    /// EMA weight pulling the floor up while energy > floor
    pub adapt_up: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Lockout after every candidate, accepted or not
    pub cooldown_ms: f64,
    /// Require matched-filter correlation >= this multiple of the
    /// correlation noise estimate
    pub correlation_mult: f64,
    pub matched_filter: bool,
    /// Reserved future-work hook; validated and persisted, consumed nowhere
    pub phase_tolerance_ms: f64,
}

impl Default for TickParams {
    fn default() -> Self {
        Self {
            threshold_mult: 2.0,
            adapt_down: 0.995,
            adapt_up: 0.02,
            min_duration_ms: 2.0,
            max_duration_ms: 15.0,
            cooldown_ms: 50.0,
            correlation_mult: 2.0,
            matched_filter: true,
            phase_tolerance_ms: 100.0,
        }
    }
}

/// Marker-detector tunables (shared by the fast and slow instances).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerParams {
    pub threshold_mult: f64,
    /// Baseline EMA weight while IDLE
    pub noise_adapt: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Reserved future-work hook
    pub tolerance_ms: f64,
}

impl Default for MarkerParams {
    fn default() -> Self {
        Self {
            threshold_mult: 3.0,
            noise_adapt: 0.001,
            min_duration_ms: 500.0,
            max_duration_ms: 1500.0,
            tolerance_ms: 500.0,
        }
    }
}

/// Sync-detector tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncParams {
    /// TENTATIVE -> LOCKED confidence threshold
    pub locked_threshold: f64,
    /// RECOVERING -> ACQUIRING when confidence falls below this
    pub min_retain: f64,
    /// Confidence decay per periodic check while LOCKED
    pub decay_normal: f64,
    /// Confidence decay per periodic check while RECOVERING
    pub decay_recovering: f64,
    pub weight_tick: f64,
    pub weight_marker: f64,
    pub weight_p_marker: f64,
    pub weight_tick_hole: f64,
    pub weight_combined: f64,
    /// Reserved future-work hook
    pub p_marker_tolerance_ms: f64,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            locked_threshold: 0.70,
            min_retain: 0.05,
            decay_normal: 0.9999,
            decay_recovering: 0.980,
            weight_tick: 0.05,
            weight_marker: 0.40,
            weight_p_marker: 0.15,
            weight_tick_hole: 0.20,
            weight_combined: 0.50,
            p_marker_tolerance_ms: 200.0,
        }
    }
}

/// The full tunable-parameter set. Single authoritative copy owned by the
/// control plane; detector tasks hold per-group snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TunableParams {
    pub tick: TickParams,
    pub marker: MarkerParams,
    pub sync: SyncParams,
}

/// Top-level receiver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub station: Station,
    pub params: TunableParams,
    /// Read the parameter file at startup when set
    pub reload: bool,
}

/// Static description of one tunable: wire command, display name, file
/// location, and validated range.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub id: ParamId,
    /// `SET_<command>` / `GET_<command>` token
    pub command: &'static str,
    /// Name echoed in `OK <name>=<value>` responses
    pub name: &'static str,
    /// Parameter-file section and key
    pub section: &'static str,
    pub key: &'static str,
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

/// Identity of every control-plane-reachable tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamId {
    TickThreshold,
    TickAdaptDown,
    TickAdaptUp,
    TickMinDuration,
    TickPhaseTolerance,
    MarkerThreshold,
    MarkerNoiseAdapt,
    MarkerMinDuration,
    MarkerTolerance,
    SyncLockedThreshold,
    SyncMinRetain,
    SyncDecayNormal,
    SyncDecayRecovering,
    SyncWeightTick,
    SyncWeightMarker,
    SyncWeightPMarker,
    SyncWeightHole,
    SyncWeightCombined,
    SyncPMarkerTolerance,
}

impl ParamId {
    pub const ALL: &'static [ParamId] = &[
        ParamId::TickThreshold,
        ParamId::TickAdaptDown,
        ParamId::TickAdaptUp,
        ParamId::TickMinDuration,
        ParamId::TickPhaseTolerance,
        ParamId::MarkerThreshold,
        ParamId::MarkerNoiseAdapt,
        ParamId::MarkerMinDuration,
        ParamId::MarkerTolerance,
        ParamId::SyncLockedThreshold,
        ParamId::SyncMinRetain,
        ParamId::SyncDecayNormal,
        ParamId::SyncDecayRecovering,
        ParamId::SyncWeightTick,
        ParamId::SyncWeightMarker,
        ParamId::SyncWeightPMarker,
        ParamId::SyncWeightHole,
        ParamId::SyncWeightCombined,
        ParamId::SyncPMarkerTolerance,
    ];

    pub fn spec(&self) -> ParamSpec {
        use ParamId::*;
        let (command, name, section, key, min, max, default) = match self {
            TickThreshold => ("TICK_THRESHOLD", "threshold_mult", "tick_detector", "threshold_multiplier", 1.0, 5.0, 2.0),
            TickAdaptDown => ("TICK_ADAPT_DOWN", "adapt_down", "tick_detector", "adapt_down", 0.9, 0.999, 0.995),
            TickAdaptUp => ("TICK_ADAPT_UP", "adapt_up", "tick_detector", "adapt_up", 0.001, 0.1, 0.02),
            TickMinDuration => ("TICK_MIN_DURATION", "min_duration_ms", "tick_detector", "min_duration_ms", 1.0, 10.0, 2.0),
            TickPhaseTolerance => ("TICK_PHASE_TOLERANCE", "phase_tolerance_ms", "tick_detector", "phase_tolerance_ms", 10.0, 500.0, 100.0),
            MarkerThreshold => ("MARKER_THRESHOLD", "threshold_mult", "marker_detector", "threshold_multiplier", 2.0, 5.0, 3.0),
            MarkerNoiseAdapt => ("MARKER_NOISE_ADAPT", "noise_adapt", "marker_detector", "noise_adapt", 0.0001, 0.01, 0.001),
            MarkerMinDuration => ("MARKER_MIN_DURATION", "min_duration_ms", "marker_detector", "min_duration_ms", 300.0, 700.0, 500.0),
            MarkerTolerance => ("MARKER_TOLERANCE", "tolerance_ms", "marker_detector", "tolerance_ms", 100.0, 1000.0, 500.0),
            SyncLockedThreshold => ("SYNC_LOCKED_THRESHOLD", "locked_threshold", "sync_detector", "locked_threshold", 0.5, 0.9, 0.70),
            SyncMinRetain => ("SYNC_MIN_RETAIN", "min_retain", "sync_detector", "min_retain", 0.01, 0.2, 0.05),
            SyncDecayNormal => ("SYNC_DECAY_NORMAL", "decay_normal", "sync_detector", "decay_normal", 0.99, 0.9999, 0.9999),
            SyncDecayRecovering => ("SYNC_DECAY_RECOVERING", "decay_recovering", "sync_detector", "decay_recovering", 0.90, 0.99, 0.980),
            SyncWeightTick => ("SYNC_WEIGHT_TICK", "weight_tick", "sync_detector", "weight_tick", 0.0, 1.0, 0.05),
            SyncWeightMarker => ("SYNC_WEIGHT_MARKER", "weight_marker", "sync_detector", "weight_marker", 0.0, 1.0, 0.40),
            SyncWeightPMarker => ("SYNC_WEIGHT_PMARKER", "weight_p_marker", "sync_detector", "weight_p_marker", 0.0, 1.0, 0.15),
            SyncWeightHole => ("SYNC_WEIGHT_HOLE", "weight_tick_hole", "sync_detector", "weight_tick_hole", 0.0, 1.0, 0.20),
            SyncWeightCombined => ("SYNC_WEIGHT_COMBINED", "weight_combined", "sync_detector", "weight_combined", 0.0, 1.0, 0.50),
            SyncPMarkerTolerance => ("SYNC_PMARKER_TOLERANCE", "p_marker_tolerance_ms", "sync_detector", "p_marker_tolerance_ms", 50.0, 500.0, 200.0),
        };
        ParamSpec {
            id: *self,
            command,
            name,
            section,
            key,
            min,
            max,
            default,
        }
    }

    /// Look up by the `SET_`/`GET_` command token (already stripped).
    pub fn from_command(token: &str) -> Option<ParamId> {
        ParamId::ALL
            .iter()
            .copied()
            .find(|id| id.spec().command == token)
    }

    /// Current value inside a parameter set.
    pub fn get(&self, p: &TunableParams) -> f64 {
        use ParamId::*;
        match self {
            TickThreshold => p.tick.threshold_mult,
            TickAdaptDown => p.tick.adapt_down,
            TickAdaptUp => p.tick.adapt_up,
            TickMinDuration => p.tick.min_duration_ms,
            TickPhaseTolerance => p.tick.phase_tolerance_ms,
            MarkerThreshold => p.marker.threshold_mult,
            MarkerNoiseAdapt => p.marker.noise_adapt,
            MarkerMinDuration => p.marker.min_duration_ms,
            MarkerTolerance => p.marker.tolerance_ms,
            SyncLockedThreshold => p.sync.locked_threshold,
            SyncMinRetain => p.sync.min_retain,
            SyncDecayNormal => p.sync.decay_normal,
            SyncDecayRecovering => p.sync.decay_recovering,
            SyncWeightTick => p.sync.weight_tick,
            SyncWeightMarker => p.sync.weight_marker,
            SyncWeightPMarker => p.sync.weight_p_marker,
            SyncWeightHole => p.sync.weight_tick_hole,
            SyncWeightCombined => p.sync.weight_combined,
            SyncPMarkerTolerance => p.sync.p_marker_tolerance_ms,
        }
    }

    /// Validate `value` against the range and store it. On rejection the set
    /// is left untouched.
    pub fn set(&self, p: &mut TunableParams, value: f64) -> Result<(), ConfigError> {
        let spec = self.spec();
        if !value.is_finite() || value < spec.min || value > spec.max {
            return Err(ConfigError::OutOfRange {
                name: spec.name,
                value,
                min: spec.min,
                max: spec.max,
            });
        }
        use ParamId::*;
        match self {
            TickThreshold => p.tick.threshold_mult = value,
            TickAdaptDown => p.tick.adapt_down = value,
            TickAdaptUp => p.tick.adapt_up = value,
            TickMinDuration => p.tick.min_duration_ms = value,
            TickPhaseTolerance => p.tick.phase_tolerance_ms = value,
            MarkerThreshold => p.marker.threshold_mult = value,
            MarkerNoiseAdapt => p.marker.noise_adapt = value,
            MarkerMinDuration => p.marker.min_duration_ms = value,
            MarkerTolerance => p.marker.tolerance_ms = value,
            SyncLockedThreshold => p.sync.locked_threshold = value,
            SyncMinRetain => p.sync.min_retain = value,
            SyncDecayNormal => p.sync.decay_normal = value,
            SyncDecayRecovering => p.sync.decay_recovering = value,
            SyncWeightTick => p.sync.weight_tick = value,
            SyncWeightMarker => p.sync.weight_marker = value,
            SyncWeightPMarker => p.sync.weight_p_marker = value,
            SyncWeightHole => p.sync.weight_tick_hole = value,
            SyncWeightCombined => p.sync.weight_combined = value,
            SyncPMarkerTolerance => p.sync.p_marker_tolerance_ms = value,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_specs() {
        let params = TunableParams::default();
        for id in ParamId::ALL {
            let spec = id.spec();
            assert_eq!(
                id.get(&params),
                spec.default,
                "default mismatch for {}",
                spec.command
            );
            assert!(spec.default >= spec.min && spec.default <= spec.max);
        }
    }

    #[test]
    fn test_command_tokens_unique() {
        for (i, a) in ParamId::ALL.iter().enumerate() {
            for b in &ParamId::ALL[i + 1..] {
                assert_ne!(a.spec().command, b.spec().command);
            }
        }
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let mut params = TunableParams::default();
        let before = params;
        assert!(ParamId::TickThreshold.set(&mut params, 10.0).is_err());
        assert!(ParamId::TickThreshold.set(&mut params, 0.0).is_err());
        assert!(ParamId::TickThreshold.set(&mut params, f64::NAN).is_err());
        assert_eq!(params, before, "rejected write must leave state unchanged");

        assert!(ParamId::TickThreshold.set(&mut params, 3.0).is_ok());
        assert_eq!(params.tick.threshold_mult, 3.0);
    }

    #[test]
    fn test_from_command() {
        assert_eq!(
            ParamId::from_command("TICK_THRESHOLD"),
            Some(ParamId::TickThreshold)
        );
        assert_eq!(ParamId::from_command("BOGUS"), None);
    }

    #[test]
    fn test_display_rate_is_exact() {
        assert_eq!(rates::SOURCE % rates::DETECTOR_DECIM as u32, 0);
        assert_eq!(rates::SOURCE % rates::DISPLAY_DECIM as u32, 0);
        assert_eq!(rates::DETECTOR, 50_000);
        assert_eq!(rates::DISPLAY, 12_500);
    }

    #[test]
    fn test_station_tones() {
        assert_eq!(Station::Wwv.tick_freq_hz(), 1000.0);
        assert_eq!(Station::Wwvh.tick_freq_hz(), 1200.0);
    }
}
