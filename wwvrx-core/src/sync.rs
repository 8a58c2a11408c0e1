//! Sync detector: fuses tick, marker, and BCD-pulse evidence into a
//! phase-locked estimate of the current UTC second.
//!
//! The estimate is the pair (anchor, current_second): `anchor_ms` is the
//! stream time of the most recent second boundary, advanced by exactly one
//! second as time passes and refined by exponential smoothing whenever a
//! marker or an on-phase tick confirms it. Confidence accumulates additively
//! from the evidence table and decays multiplicatively on every periodic
//! check. Tick and minute-marker leading edges sit 10 ms after the second
//! boundary; BCD pulses start 30 ms after it (the protected zone).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::SyncParams;
use crate::events::{
    evidence, DetectorEvent, EpochHint, EpochHintCell, EventKind, FrameTime, SyncState,
};

/// Leading-edge offset of ticks and markers from the second boundary.
const EDGE_OFFSET_MS: f64 = 10.0;
/// BCD pulse start offset (after the protected zone).
const BCD_OFFSET_MS: f64 = 30.0;
/// Two ticks closer than this are one DUT1 double tick.
const DOUBLE_TICK_MS: f64 = 100.0;
/// Tick-to-tick gap ranges that read as a silent second (and as a silent
/// second plus the marker second).
const HOLE_GAP_MS: (f64, f64) = (1700.0, 2200.0);
const DOUBLE_HOLE_GAP_MS: (f64, f64) = (2700.0, 3300.0);
/// Gap that counts as signal weakness.
const WEAK_GAP_MS: f64 = 2500.0;
const WEAK_DEBOUNCE_CHECKS: u32 = 3;
/// RECOVERING limits.
const RECOVERY_TIMEOUT_MS: f64 = 10_000.0;
const MAX_SIGNAL_GAP_MS: f64 = 120_000.0;
/// Validation tolerances (leap_second_pending adds 1000 ms to each).
const TICK_PHASE_TOL_MS: f64 = 100.0;
const MARKER_TOL_MS: f64 = 500.0;
const P_MARKER_TOL_MS: f64 = 200.0;
/// Anchor smoothing factors.
const MARKER_ANCHOR_ALPHA: f64 = 0.1;
const TICK_ANCHOR_ALPHA: f64 = 0.05;
/// P-marker BCD duration class.
const P_MARKER_DURATION_MS: (f64, f64) = (650.0, 950.0);
/// Window published to the tick gate on marker confirmation.
const HINT_WINDOW_MS: f64 = 50.0;

const ALLOWED_P_SECONDS: [u8; 7] = [0, 9, 19, 29, 39, 49, 59];

/// Internal lifecycle with per-state data embedded in the variant.
#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Acquiring {
        /// Second-boundary phase candidate derived from ticks
        tick_anchor: Option<f64>,
        /// Recent tick-hole end times, for the double-hole bootstrap
        holes: VecDeque<f64>,
    },
    Tentative,
    Locked,
    Recovering {
        since_ms: f64,
        /// First half of the tick-then-marker validation
        tick_at_phase: bool,
    },
}

impl Phase {
    fn public(&self) -> SyncState {
        match self {
            Phase::Acquiring { .. } => SyncState::Acquiring,
            Phase::Tentative => SyncState::Tentative,
            Phase::Locked => SyncState::Locked,
            Phase::Recovering { .. } => SyncState::Recovering,
        }
    }
}

fn acquiring() -> Phase {
    Phase::Acquiring {
        tick_anchor: None,
        holes: VecDeque::with_capacity(4),
    }
}

/// Wrap a time difference onto `[-500, 500)` ms, one second circular.
fn wrap_phase_ms(diff: f64) -> f64 {
    let mut d = diff.rem_euclid(1000.0);
    if d >= 500.0 {
        d -= 1000.0;
    }
    d
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub tick_holes: u64,
    pub double_ticks_merged: u64,
    pub markers_confirmed: u64,
    pub markers_rejected: u64,
    pub recoveries: u64,
}

pub struct SyncDetector {
    params: SyncParams,
    phase: Phase,
    confidence: f64,
    anchor_ms: Option<f64>,
    current_second: u8,
    evidence_mask: u8,
    special_minute: bool,
    leap_second_pending: bool,

    last_tick_ms: Option<f64>,
    last_marker_ms: Option<f64>,
    last_signal_ms: Option<f64>,
    weak_checks: u32,
    now_ms: f64,

    hint: Arc<EpochHintCell>,
    counters: SyncCounters,
    /// State transitions since the last drain, for telemetry
    transitions: Vec<(f64, SyncState)>,
}

impl SyncDetector {
    pub fn new(params: SyncParams) -> Self {
        Self {
            params,
            phase: acquiring(),
            confidence: 0.0,
            anchor_ms: None,
            current_second: 0,
            evidence_mask: 0,
            special_minute: false,
            leap_second_pending: false,
            last_tick_ms: None,
            last_marker_ms: None,
            last_signal_ms: None,
            weak_checks: 0,
            now_ms: 0.0,
            hint: Arc::new(EpochHintCell::default()),
            counters: SyncCounters::default(),
            transitions: Vec::new(),
        }
    }

    /// The cell the tick detector reads its gate hint from.
    pub fn hint_cell(&self) -> Arc<EpochHintCell> {
        Arc::clone(&self.hint)
    }

    pub fn set_params(&mut self, params: SyncParams) {
        self.params = params;
    }

    pub fn params(&self) -> &SyncParams {
        &self.params
    }

    /// Halve all evidence weights during voice/ID minutes.
    pub fn set_special_minute(&mut self, special: bool) {
        self.special_minute = special;
    }

    /// Widens every validation tolerance by one second.
    pub fn set_leap_second_pending(&mut self, pending: bool) {
        self.leap_second_pending = pending;
    }

    pub fn counters(&self) -> SyncCounters {
        self.counters
    }

    pub fn state(&self) -> SyncState {
        self.phase.public()
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Drain state transitions recorded since the last call.
    pub fn take_transitions(&mut self) -> Vec<(f64, SyncState)> {
        std::mem::take(&mut self.transitions)
    }

    pub fn frame_time(&self) -> FrameTime {
        FrameTime {
            current_second: self.current_second,
            second_start_ms: self.anchor_ms.unwrap_or(0.0),
            confidence: self.confidence,
            evidence_mask: self.evidence_mask,
            state: self.phase.public(),
        }
    }

    /// Stream discontinuity: below LOCKED restart acquisition, otherwise
    /// drop to RECOVERING with the anchor retained.
    pub fn on_discontinuity(&mut self) {
        match self.phase {
            Phase::Locked => self.enter_recovering(),
            Phase::Recovering { .. } => {}
            _ => self.enter_acquiring(),
        }
        self.last_tick_ms = None;
        self.weak_checks = 0;
    }

    /// Feed one detector event. The fusion task delivers events sorted by
    /// timestamp; modest residual reordering is tolerated.
    pub fn on_event(&mut self, event: &DetectorEvent) {
        self.now_ms = self.now_ms.max(event.timestamp_ms);
        self.advance_seconds();
        match event.kind {
            EventKind::Tick => self.on_tick(event),
            EventKind::Marker => self.on_marker(event),
            EventKind::BcdPulse => self.on_bcd_pulse(event),
        }
    }

    /// ~100 ms cadence: decay, weakness tracking, timeouts.
    pub fn periodic(&mut self, now_ms: f64) {
        self.now_ms = self.now_ms.max(now_ms);
        self.advance_seconds();

        let decay = match self.phase {
            Phase::Recovering { .. } => self.params.decay_recovering,
            _ => self.params.decay_normal,
        };
        self.confidence = (self.confidence * decay).clamp(0.0, 1.0);

        match &self.phase {
            Phase::Locked => {
                let gap = self
                    .last_signal_ms
                    .map(|t| self.now_ms - t)
                    .unwrap_or(0.0);
                if gap > WEAK_GAP_MS {
                    self.weak_checks += 1;
                    if self.weak_checks >= WEAK_DEBOUNCE_CHECKS {
                        self.enter_recovering();
                    }
                } else {
                    self.weak_checks = 0;
                }
            }
            Phase::Recovering { since_ms, .. } => {
                let signal_gap = self
                    .last_signal_ms
                    .map(|t| self.now_ms - t)
                    .unwrap_or(f64::MAX);
                if self.now_ms - since_ms >= RECOVERY_TIMEOUT_MS
                    || self.confidence < self.params.min_retain
                    || signal_gap > MAX_SIGNAL_GAP_MS
                {
                    self.enter_acquiring();
                }
            }
            Phase::Tentative => {
                if self.confidence >= self.params.locked_threshold {
                    self.enter_locked();
                } else if self.confidence < self.params.min_retain {
                    self.enter_acquiring();
                }
            }
            Phase::Acquiring { .. } => {}
        }
    }

    // ------------------------------------------------------------------
    // Evidence handlers

    fn on_tick(&mut self, event: &DetectorEvent) {
        let t = event.timestamp_ms;

        // DUT1 double tick: the pair is one tick, keep the first
        if let Some(last) = self.last_tick_ms {
            if t - last < DOUBLE_TICK_MS {
                self.counters.double_ticks_merged += 1;
                return;
            }
            let gap = t - last;
            let marker_between = self
                .last_marker_ms
                .map(|m| m > last && m < t)
                .unwrap_or(false);
            let is_hole = (gap >= HOLE_GAP_MS.0 && gap <= HOLE_GAP_MS.1)
                || (gap >= DOUBLE_HOLE_GAP_MS.0 && gap <= DOUBLE_HOLE_GAP_MS.1);
            if is_hole && !marker_between {
                self.counters.tick_holes += 1;
                self.add_evidence(self.params.weight_tick_hole, evidence::TICK_HOLE);
                if let Phase::Acquiring { holes, .. } = &mut self.phase {
                    holes.push_back(t);
                    while holes.len() > 4 {
                        holes.pop_front();
                    }
                }
                self.try_double_hole_bootstrap(t);
            }
        }
        self.last_tick_ms = Some(t);
        self.last_signal_ms = Some(t);

        let boundary = t - EDGE_OFFSET_MS;
        match self.anchor_ms {
            Some(anchor) => {
                let err = wrap_phase_ms(boundary - anchor);
                if err.abs() <= self.tolerance(TICK_PHASE_TOL_MS) {
                    self.add_evidence(self.params.weight_tick, evidence::TICK);
                    if let Some(a) = self.anchor_ms.as_mut() {
                        *a += TICK_ANCHOR_ALPHA * err;
                    }
                    if let Phase::Recovering { tick_at_phase, .. } = &mut self.phase {
                        *tick_at_phase = true;
                    }
                } else if let Phase::Acquiring { tick_anchor, .. } = &mut self.phase {
                    // Off-phase during acquisition: drift the candidate
                    *tick_anchor = Some(boundary);
                    self.anchor_ms = Some(boundary);
                }
            }
            None => {
                self.anchor_ms = Some(boundary);
                if let Phase::Acquiring { tick_anchor, .. } = &mut self.phase {
                    *tick_anchor = Some(boundary);
                }
                self.add_evidence(self.params.weight_tick, evidence::TICK);
            }
        }
        self.check_promotion();
    }

    fn on_marker(&mut self, event: &DetectorEvent) {
        let t = event.timestamp_ms;
        let boundary = t - EDGE_OFFSET_MS;
        self.counters.markers_confirmed += 1;

        // A marker directly after a tick hole (the :59 silence) is the
        // strongest single piece of evidence there is
        let combined = self
            .last_tick_ms
            .map(|last| {
                let gap = t - last;
                gap >= HOLE_GAP_MS.0 && gap <= HOLE_GAP_MS.1
            })
            .unwrap_or(false);

        // With a known minute position the marker must land where the
        // second counter wraps to zero, to +/- 500 ms over the minute wrap
        let at_expected_position = match (&self.phase, self.anchor_ms) {
            (Phase::Acquiring { .. }, _) | (_, None) => true,
            (_, Some(anchor)) => {
                let offset = ((60 - self.current_second as i64) % 60) as f64 * 1000.0;
                let next_zero = anchor + offset;
                let err = boundary - next_zero;
                let err = err - (err / 60_000.0).round() * 60_000.0;
                err.abs() <= self.tolerance(MARKER_TOL_MS)
            }
        };

        if matches!(self.phase, Phase::Locked) && !at_expected_position {
            // Mid-minute marker while locked: interference, not a minute
            self.counters.markers_rejected += 1;
            return;
        }

        if combined {
            self.add_evidence(self.params.weight_combined, evidence::COMBINED);
        } else {
            self.add_evidence(self.params.weight_marker, evidence::MARKER);
        }

        // Sub-second anchor refinement, then hard minute alignment
        match self.anchor_ms {
            Some(anchor) => {
                let err = wrap_phase_ms(boundary - anchor);
                let refined_phase = anchor + MARKER_ANCHOR_ALPHA * err;
                let steps = ((boundary - refined_phase) / 1000.0).round();
                self.anchor_ms = Some(refined_phase + steps * 1000.0);
            }
            None => {
                self.anchor_ms = Some(boundary);
            }
        }
        self.current_second = 0;
        self.last_marker_ms = Some(t);
        self.last_signal_ms = Some(t);

        match self.phase.clone() {
            Phase::Acquiring { tick_anchor, .. } => {
                // Ticks and the marker agreeing on the phase ends acquisition
                let correlated = tick_anchor
                    .map(|ta| wrap_phase_ms(boundary - ta).abs() <= self.tolerance(TICK_PHASE_TOL_MS))
                    .unwrap_or(false);
                if correlated || combined {
                    self.enter_tentative();
                }
            }
            Phase::Recovering { tick_at_phase, .. } => {
                if tick_at_phase && at_expected_position {
                    self.enter_locked();
                } else if tick_at_phase {
                    // Partial recovery: anchor kept, demote instead of restart
                    self.enter_tentative();
                }
            }
            _ => {}
        }

        self.publish_hint();
        self.check_promotion();
    }

    fn on_bcd_pulse(&mut self, event: &DetectorEvent) {
        let d = event.duration_ms;
        if !(P_MARKER_DURATION_MS.0..=P_MARKER_DURATION_MS.1).contains(&d) {
            return;
        }
        let anchor = match self.anchor_ms {
            Some(a) => a,
            None => return,
        };
        let t = event.timestamp_ms;
        let err = wrap_phase_ms(t - BCD_OFFSET_MS - anchor);
        if err.abs() > self.tolerance(P_MARKER_TOL_MS) {
            return;
        }
        // With a known minute position, only the seven P slots count. The
        // anchor (and with it the second counter) is retained through
        // RECOVERING, so recovery validation gets the same gate: a P-marker
        // only validates at an allowed position.
        let position_known = matches!(
            self.phase,
            Phase::Locked | Phase::Tentative | Phase::Recovering { .. }
        );
        if !position_known {
            // Acquiring: no position to attribute the pulse to yet
            return;
        }
        let sec = self.second_of(t);
        let allowed = ALLOWED_P_SECONDS
            .iter()
            .any(|&p| (sec as i16 - p as i16).abs() <= 1 || (p == 59 && sec == 0));
        if !allowed {
            return;
        }

        self.add_evidence(self.params.weight_p_marker, evidence::P_MARKER);
        if let Phase::Recovering { .. } = self.phase {
            // A P-marker at an allowed position validates recovery on its own
            self.enter_locked();
        }
        self.check_promotion();
    }

    // ------------------------------------------------------------------
    // Internals

    fn tolerance(&self, base_ms: f64) -> f64 {
        if self.leap_second_pending {
            base_ms + 1000.0
        } else {
            base_ms
        }
    }

    fn add_evidence(&mut self, weight: f64, bit: u8) {
        let w = if self.special_minute {
            weight * 0.5
        } else {
            weight
        };
        self.confidence = (self.confidence + w).clamp(0.0, 1.0);
        self.evidence_mask |= bit;
    }

    /// Second index the timestamp falls in, relative to the current anchor.
    fn second_of(&self, t: f64) -> u8 {
        let anchor = self.anchor_ms.unwrap_or(0.0);
        let steps = ((t - anchor) / 1000.0).floor() as i64;
        (self.current_second as i64 + steps).rem_euclid(60) as u8
    }

    /// Advance the anchor and second counter up to `now`, clearing the
    /// per-second evidence mask at every boundary.
    fn advance_seconds(&mut self) {
        let anchor = match self.anchor_ms {
            Some(a) => a,
            None => return,
        };
        let mut a = anchor;
        let leap_extra = if self.leap_second_pending && self.current_second == 59 {
            1000.0
        } else {
            0.0
        };
        while a + 1000.0 + leap_extra <= self.now_ms {
            a += 1000.0;
            self.current_second = (self.current_second + 1) % 60;
            self.evidence_mask = 0;
        }
        self.anchor_ms = Some(a);
    }

    /// Two tick holes ~30 s apart fix the second phase well enough to leave
    /// acquisition without a marker.
    fn try_double_hole_bootstrap(&mut self, latest_hole: f64) {
        let bootstrap = if let Phase::Acquiring { holes, .. } = &self.phase {
            holes.iter().any(|&h| {
                let sep = latest_hole - h;
                sep > 1000.0 && (sep / 30_000.0 - (sep / 30_000.0).round()).abs() * 30_000.0 <= 1500.0
            })
        } else {
            false
        };
        if bootstrap {
            // The tick after a hole opens second 30 or 0; pick 30 and let
            // the next marker correct a 30 s error
            self.current_second = 30;
            self.enter_tentative();
        }
    }

    fn check_promotion(&mut self) {
        if matches!(self.phase, Phase::Tentative)
            && self.confidence >= self.params.locked_threshold
        {
            self.enter_locked();
        }
    }

    fn publish_hint(&self) {
        if matches!(self.phase, Phase::Tentative | Phase::Locked) {
            if let Some(anchor) = self.anchor_ms {
                self.hint.publish(EpochHint {
                    epoch_ms: anchor.rem_euclid(1000.0),
                    window_ms: HINT_WINDOW_MS,
                    confidence: self.confidence,
                });
            }
        }
    }

    fn transition(&mut self, phase: Phase) {
        if phase.public() != self.phase.public() {
            self.transitions.push((self.now_ms, phase.public()));
        }
        self.phase = phase;
    }

    fn enter_acquiring(&mut self) {
        self.transition(acquiring());
        self.anchor_ms = None;
        self.confidence = 0.0;
        self.evidence_mask = 0;
        self.weak_checks = 0;
        self.hint.clear();
    }

    fn enter_tentative(&mut self) {
        self.transition(Phase::Tentative);
        self.publish_hint();
    }

    fn enter_locked(&mut self) {
        self.transition(Phase::Locked);
        self.weak_checks = 0;
        self.publish_hint();
    }

    fn enter_recovering(&mut self) {
        self.counters.recoveries += 1;
        let since = self.now_ms;
        self.transition(Phase::Recovering {
            since_ms: since,
            tick_at_phase: false,
        });
        self.weak_checks = 0;
    }
}
