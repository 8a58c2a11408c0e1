//! Receiver error types with granular categories

use thiserror::Error;

/// Top-level error type for all receiver operations
#[derive(Debug, Error)]
pub enum RxError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("DSP processing error: {0}")]
    Dsp(#[from] DspError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),
}

/// Errors raised by the I/Q source adapter.
///
/// Only `SourceClosed` and the format errors are fatal; `Backpressure` asks
/// the caller to retry after the current buffer period.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source closed")]
    SourceClosed,

    #[error("Malformed stream: {reason}")]
    FormatError { reason: String },

    #[error("Unsupported sample format {format} (only int16-interleaved = 1)")]
    UnsupportedFormat { format: u32 },

    #[error("Bad magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("Source backpressure, retry")]
    Backpressure,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Fatal errors tear the stream down; transient ones are retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SourceError::Backpressure)
    }
}

/// DSP processing errors
#[derive(Debug, Error)]
pub enum DspError {
    #[error("FFT size {size} is not a power of 2")]
    InvalidFftSize { size: usize },

    #[error("Decimation ratio {ratio} does not divide the source rate {source_rate}")]
    InvalidDecimationRatio { ratio: usize, source_rate: u32 },

    #[error("Filter design failed: {reason}")]
    FilterDesignFailed { reason: String },

    #[error("Non-finite value at {stage}")]
    NonFinite { stage: &'static str },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sample rate: {rate} Hz (must be > 0)")]
    InvalidSampleRate { rate: u32 },

    #[error("Parameter {name} out of range: {value} (allowed {min}..{max})")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Parameter file error: {reason}")]
    ParameterFile { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control-plane command failures, mapped onto the wire error codes.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("SYNTAX {0}")]
    Syntax(String),

    #[error("UNKNOWN {0}")]
    UnknownCommand(String),

    #[error("PARAM {0}")]
    UnknownParameter(String),

    #[error("RANGE {name} allowed {min}..{max}")]
    OutOfRange {
        name: &'static str,
        min: f64,
        max: f64,
    },

    #[error("RATE_LIMIT max {limit} commands per second")]
    RateLimited { limit: u32 },

    #[error("STATE {0}")]
    BadState(String),
}

impl ControlError {
    /// Wire error code for the `ERR <CODE> <detail>` response line.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Syntax(_) => "SYNTAX",
            ControlError::UnknownCommand(_) => "UNKNOWN",
            ControlError::UnknownParameter(_) => "PARAM",
            ControlError::OutOfRange { .. } => "RANGE",
            ControlError::RateLimited { .. } => "RATE_LIMIT",
            ControlError::BadState(_) => "STATE",
        }
    }
}

/// Result type alias for receiver operations
pub type Result<T> = std::result::Result<T, RxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_fatality() {
        assert!(SourceError::SourceClosed.is_fatal());
        assert!(SourceError::FormatError {
            reason: "truncated header".into()
        }
        .is_fatal());
        assert!(!SourceError::Backpressure.is_fatal());
    }

    #[test]
    fn test_control_error_codes() {
        assert_eq!(ControlError::Syntax("x".into()).code(), "SYNTAX");
        assert_eq!(
            ControlError::OutOfRange {
                name: "tick.threshold_mult",
                min: 1.0,
                max: 5.0
            }
            .code(),
            "RANGE"
        );
        assert_eq!(ControlError::RateLimited { limit: 10 }.code(), "RATE_LIMIT");
    }
}
