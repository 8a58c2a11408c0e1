//! Telemetry sink: drains the bus subscription to stdout or a file.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use color_eyre::eyre::Result;
use wwvrx_core::telemetry::{Subscription, TelemetryBus};

use crate::config::TelemetrySection;

enum SinkWriter {
    Stdout,
    File(BufWriter<File>),
}

/// One subscriber draining records into a line-oriented writer.
pub struct TelemetrySink {
    subscription: Subscription,
    writer: SinkWriter,
    lines_written: u64,
}

impl TelemetrySink {
    /// Subscribe on `bus` per the config's channel filter.
    pub fn attach(bus: &TelemetryBus, config: &TelemetrySection) -> Result<Self> {
        let subscription = if config.channels.is_empty() {
            bus.subscribe(8192)
        } else {
            bus.subscribe_filtered(config.channels.iter().cloned(), 8192)
        };
        let writer = match &config.file {
            Some(path) => SinkWriter::File(BufWriter::new(File::create(Path::new(path))?)),
            None => SinkWriter::Stdout,
        };
        Ok(Self {
            subscription,
            writer,
            lines_written: 0,
        })
    }

    /// Drain everything currently queued; returns how many lines went out.
    pub fn drain(&mut self) -> Result<usize> {
        let records = self.subscription.drain();
        let count = records.len();
        match &mut self.writer {
            SinkWriter::Stdout => {
                let stdout = io::stdout();
                let mut lock = stdout.lock();
                for r in &records {
                    writeln!(lock, "{}", r.line())?;
                }
            }
            SinkWriter::File(f) => {
                for r in &records {
                    writeln!(f, "{}", r.line())?;
                }
                f.flush()?;
            }
        }
        self.lines_written += count as u64;
        Ok(count)
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Records the bus evicted because this sink lagged.
    pub fn dropped(&self) -> u64 {
        self.subscription.dropped()
    }
}
