//! Window functions for the FFT front-ends.
//!
//! Detectors use Hann; the tone trackers use the 4-term Blackman-Harris for
//! its low sidelobes, which matter when hunting a fractional-bin peak.

use std::f64::consts::PI;

/// Hann window of length `n`.
pub fn hann(n: usize) -> Vec<f32> {
    periodic_cosine_window(n, &[0.5, -0.5])
}

/// 4-term Blackman-Harris window of length `n` (-92 dB sidelobes).
pub fn blackman_harris(n: usize) -> Vec<f32> {
    periodic_cosine_window(n, &[0.35875, -0.48829, 0.14128, -0.01168])
}

/// Sum of the window coefficients, used to normalize bucket energies so a
/// full-scale tone reads the same through any window.
pub fn coherent_gain(window: &[f32]) -> f64 {
    window.iter().map(|&w| w as f64).sum::<f64>() / window.len() as f64
}

fn periodic_cosine_window(n: usize, terms: &[f64]) -> Vec<f32> {
    if n == 0 {
        return Vec::new();
    }
    (0..n)
        .map(|i| {
            let x = 2.0 * PI * i as f64 / n as f64;
            terms
                .iter()
                .enumerate()
                .map(|(k, &a)| a * (k as f64 * x).cos())
                .sum::<f64>() as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hann_endpoints_and_center() {
        let w = hann(256);
        assert_relative_eq!(w[0], 0.0, epsilon = 1e-6);
        // Periodic form peaks at n/2
        assert_relative_eq!(w[128], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_hann_coherent_gain() {
        let w = hann(1024);
        assert_relative_eq!(coherent_gain(&w), 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_blackman_harris_peak() {
        let w = blackman_harris(4096);
        let peak = w.iter().cloned().fold(f32::MIN, f32::max);
        assert_relative_eq!(peak, 1.0, epsilon = 1e-4);
        // First sample is the -92 dB floor, essentially zero
        assert!(w[0].abs() < 1e-4);
    }

    #[test]
    fn test_empty_window() {
        assert!(hann(0).is_empty());
    }
}
