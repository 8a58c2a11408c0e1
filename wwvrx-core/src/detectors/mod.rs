//! Frequency-selective pulse detectors.
//!
//! The tick, marker, and BCD detectors share one skeleton: accumulate a
//! fixed FFT frame, take the energy in a frequency bucket, and run a
//! hysteresis state machine over the per-frame energies. They differ in FFT
//! size, bucket geometry, and acceptance windows, which is what the trait
//! abstracts over. The tone trackers live here too but measure frequency
//! rather than pulses.

use num_complex::Complex32;

use crate::events::{ChannelQuality, DetectorEvent};

pub mod bcd;
pub mod marker;
pub mod tick;
pub mod tone;

pub use bcd::{BcdDetector, BcdMode};
pub use marker::MarkerDetector;
pub use tick::TickDetector;
pub use tone::ToneTracker;

/// Common surface of the pulse detectors: feed decimated samples, get
/// zero or more events back. Implementations never block and never emit
/// events out of timestamp order.
pub trait PulseDetector {
    /// Consume samples from this detector's path, in arrival order.
    fn process_samples(&mut self, samples: &[Complex32]) -> Vec<DetectorEvent>;

    /// Zero all signal-dependent state (stream discontinuity).
    fn reset(&mut self);

    /// Snapshot of noise floor / peak / SNR for the `CHAN` channel.
    fn quality(&self) -> ChannelQuality;
}
