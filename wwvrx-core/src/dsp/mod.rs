//! Shared DSP primitives used by the decimation pipeline and the detectors.

pub mod biquad;
pub mod interp;
pub mod spectrum;
pub mod window;

pub use biquad::Biquad;
pub use spectrum::FftFrame;
