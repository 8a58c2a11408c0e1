mod config;
mod logging;
mod telemetry;

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use wwvrx_core::config::rates;
use wwvrx_core::synth::{FramedSynthReader, SynthConfig, WwvSynthesizer};
use wwvrx_core::telemetry::channels;
use wwvrx_core::{spawn_threaded, ReceiverConfig, ThreadedPipeline};

use config::CliConfig;
use logging::{DecodedEvent, LogEvent, StructuredLogger};
use telemetry::TelemetrySink;

#[derive(Parser, Debug)]
#[command(author, version, about = "WWV/WWVH time-signal receiver", long_about = None)]
struct Cli {
    /// Path to TOML run configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a framed I/Q stream from a file ('-' for stdin). Control
    /// commands are read line-by-line from stdin unless it is the input.
    Run {
        /// Input stream path, or '-' for stdin
        input: String,
    },
    /// Synthesize a WWV signal and decode it end to end
    Demo {
        /// Signal length in seconds
        #[arg(long, default_value_t = 90.0)]
        seconds: f64,

        /// Signal-to-noise ratio in dB (omit for a clean signal)
        #[arg(long)]
        snr: Option<f64>,

        /// UTC second of the minute at stream start
        #[arg(long, default_value_t = 50)]
        start_second: u8,

        /// RNG seed for the noise
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    let cli_config = match &args.config {
        Some(path) => CliConfig::from_file(path)?,
        None => CliConfig::default(),
    };
    let mut logger = StructuredLogger::new(&cli_config.logging)?;

    match args.command {
        Command::Run { input } => {
            let control_from_stdin = input != "-";
            let reader: Box<dyn Read + Send> = if input == "-" {
                Box::new(std::io::stdin())
            } else {
                Box::new(
                    File::open(&input).wrap_err_with(|| format!("opening {input}"))?,
                )
            };
            logger.info(format!("decoding framed stream from {input}"))?;
            run_pipeline(reader, &cli_config, &mut logger, control_from_stdin)
        }
        Command::Demo {
            seconds,
            snr,
            start_second,
            seed,
        } => {
            logger.info(format!(
                "demo: {seconds} s synthetic WWV, snr {:?} dB, starting at :{start_second:02}",
                snr
            ))?;
            let synth = WwvSynthesizer::new(SynthConfig {
                station: cli_config.receiver.station,
                snr_db: snr,
                start_second,
                seed,
                ..Default::default()
            });
            let reader = FramedSynthReader::new(synth, seconds, rates::SOURCE as usize / 10);
            run_pipeline(Box::new(reader), &cli_config, &mut logger, false)
        }
    }
}

fn run_pipeline(
    reader: Box<dyn Read + Send>,
    cli_config: &CliConfig,
    logger: &mut StructuredLogger,
    control_from_stdin: bool,
) -> Result<()> {
    let receiver_config = ReceiverConfig {
        station: cli_config.receiver.station,
        reload: cli_config.receiver.reload,
        ..Default::default()
    };
    let pipeline = spawn_threaded(
        receiver_config,
        cli_config.receiver.param_file.clone(),
        reader,
    )?;

    let mut sink = TelemetrySink::attach(&pipeline.bus, &cli_config.telemetry)?;
    // The logger follows the channels it narrates regardless of the sink
    // filter
    let narration = pipeline
        .bus
        .subscribe_filtered([channels::SYNC, channels::RESP, channels::TIME], 256);

    if control_from_stdin {
        spawn_control_reader(&pipeline);
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}").expect("static template"));
    spinner.enable_steady_tick(Duration::from_millis(200));

    // Task F: drain telemetry until the source side winds down
    let mut idle_rounds = 0;
    loop {
        let drained = sink.drain()?;
        for record in narration.drain() {
            match record.channel.as_str() {
                "SYNC" => {
                    let state = record.body.split(',').next().unwrap_or("?").to_string();
                    logger.log(LogEvent::SyncTransition {
                        stream_ms: 0.0,
                        state,
                    })?;
                }
                "RESP" => logger.info(format!("control: {}", record.body))?,
                "TIME" => {
                    if let Some(decoded) = parse_time_record(&record.body) {
                        logger.log(LogEvent::Decoded(DecodedEvent::from_decoded(&decoded)))?;
                    }
                }
                _ => {}
            }
        }
        {
            let ft = *pipeline
                .frame_time
                .lock()
                .expect("frame time poisoned");
            spinner.set_message(format!(
                "{} second {} confidence {:.2}",
                ft.state.as_str(),
                ft.current_second,
                ft.confidence
            ));
        }
        if drained == 0 {
            idle_rounds += 1;
        } else {
            idle_rounds = 0;
        }
        // A few idle rounds after the source thread exits means done
        if idle_rounds > 20 {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    spinner.finish_and_clear();

    summarize(pipeline, logger, &sink)
}

fn spawn_control_reader(pipeline: &ThreadedPipeline) {
    let control_tx = pipeline.control_tx.clone();
    let stop = pipeline.stop.clone();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in BufReader::new(stdin).lines() {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if control_tx.send(l).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}

fn summarize(
    pipeline: ThreadedPipeline,
    logger: &mut StructuredLogger,
    sink: &TelemetrySink,
) -> Result<()> {
    let ft = *pipeline
        .frame_time
        .lock()
        .expect("frame time poisoned");
    logger.info(format!(
        "final sync state {} (confidence {:.2}); {} telemetry lines, {} dropped",
        ft.state.as_str(),
        ft.confidence,
        sink.lines_written(),
        sink.dropped()
    ))?;
    if ft.confidence < 0.1 {
        logger.warn("no usable signal found")?;
    }
    pipeline.shutdown();
    Ok(())
}

/// `TIME,hours,minutes,day_of_year,year,dut1_tenths,dst` body fields.
fn parse_time_record(body: &str) -> Option<wwvrx_core::DecodedTime> {
    let mut it = body.split(',');
    Some(wwvrx_core::DecodedTime {
        hours: it.next()?.parse().ok()?,
        minutes: it.next()?.parse().ok()?,
        day_of_year: it.next()?.parse().ok()?,
        year: it.next()?.parse().ok()?,
        dut1_tenths: it.next()?.parse().ok()?,
        dst: it.next()? == "1",
        leap_year: false,
        leap_second_pending: false,
    })
}
