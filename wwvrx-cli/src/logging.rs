//! Structured logging for receiver runs.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use chrono::{DateTime, Utc};
use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use wwvrx_core::DecodedTime;

use crate::config::{LogFormat, LoggingConfig};

/// Structured log event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    /// General info message
    Info { message: String },

    /// Warning message
    Warn { message: String },

    /// Error message
    Error { message: String },

    /// A decoded minute frame
    Decoded(DecodedEvent),

    /// Sync-state transition
    SyncTransition { stream_ms: f64, state: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub timestamp: DateTime<Utc>,
    pub minutes: u8,
    pub hours: u8,
    pub day_of_year: u16,
    pub year: u8,
    pub dut1_tenths: i8,
    pub dst: bool,
}

impl DecodedEvent {
    pub fn from_decoded(t: &DecodedTime) -> Self {
        Self {
            timestamp: Utc::now(),
            minutes: t.minutes,
            hours: t.hours,
            day_of_year: t.day_of_year,
            year: t.year,
            dut1_tenths: t.dut1_tenths,
            dst: t.dst,
        }
    }
}

enum LogWriter {
    Stderr,
    File(BufWriter<File>),
}

/// Writes log events as text or JSON lines.
pub struct StructuredLogger {
    format: LogFormat,
    writer: LogWriter,
}

impl StructuredLogger {
    pub fn new(config: &LoggingConfig) -> Result<Self> {
        let writer = match &config.file {
            Some(path) => LogWriter::File(BufWriter::new(File::create(path)?)),
            None => LogWriter::Stderr,
        };
        Ok(Self {
            format: config.format,
            writer,
        })
    }

    pub fn log(&mut self, event: LogEvent) -> Result<()> {
        let line = match self.format {
            LogFormat::Json => serde_json::to_string(&event)?,
            LogFormat::Text => render_text(&event),
        };
        match &mut self.writer {
            LogWriter::Stderr => writeln!(io::stderr(), "{line}")?,
            LogWriter::File(f) => {
                writeln!(f, "{line}")?;
                f.flush()?;
            }
        }
        Ok(())
    }

    pub fn info(&mut self, message: impl Into<String>) -> Result<()> {
        self.log(LogEvent::Info {
            message: message.into(),
        })
    }

    pub fn warn(&mut self, message: impl Into<String>) -> Result<()> {
        self.log(LogEvent::Warn {
            message: message.into(),
        })
    }
}

fn render_text(event: &LogEvent) -> String {
    let now = Utc::now().format("%H:%M:%S%.3f");
    match event {
        LogEvent::Info { message } => format!("[{now}] INFO  {message}"),
        LogEvent::Warn { message } => format!("[{now}] WARN  {message}"),
        LogEvent::Error { message } => format!("[{now}] ERROR {message}"),
        LogEvent::Decoded(d) => format!(
            "[{now}] TIME  {:02}:{:02} day {} year {:02} DUT1 {:+}00 ms DST {}",
            d.hours, d.minutes, d.day_of_year, d.year, d.dut1_tenths, d.dst
        ),
        LogEvent::SyncTransition { stream_ms, state } => {
            format!("[{now}] SYNC  {state} at {stream_ms:.0} ms")
        }
    }
}
