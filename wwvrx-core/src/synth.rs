//! WWV/WWVH waveform synthesizer for tests and the demo mode.
//!
//! Generates complex baseband containing the carrier, the seconds ticks,
//! the 800 ms minute marker, and the 100 Hz BCD subcarrier with the frame
//! encoding shared with the decoder. The subcarrier honors the protected
//! zone (it starts 30 ms after the second; ticks and markers start at
//! 10 ms). Noise is complex AWGN at a configured SNR against the carrier,
//! seeded for reproducibility.
//!
//! The sample rate is configurable: full-stack tests synthesize the framed
//! 2 MHz stream, detector-stage tests feed 50 kHz baseband directly.

use std::f64::consts::TAU;

use num_complex::Complex32;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::config::Station;
use crate::decoder::{encode_frame, symbol_duration_ms};
use crate::events::{DecodedTime, Symbol};
use crate::source::{writer, StreamHeader, FORMAT_INT16_INTERLEAVED};

/// Tick/marker leading edge after the second boundary.
const EDGE_OFFSET_MS: f64 = 10.0;
/// BCD pulse start (after the protected zone).
const BCD_OFFSET_MS: f64 = 30.0;
const TICK_MS: f64 = 5.0;
const MARKER_MS: f64 = 800.0;
/// DUT1 doubled-tick spacing.
const DOUBLE_TICK_SPACING_MS: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub sample_rate: u32,
    pub station: Station,
    /// Encoded time of the first minute; minutes advance per frame
    pub time: DecodedTime,
    /// UTC second of the minute at stream start
    pub start_second: u8,
    /// `None` disables noise entirely
    pub snr_db: Option<f64>,
    pub seed: u64,
    pub carrier_level: f64,
    pub tone_level: f64,
    pub subcarrier_level: f64,
    /// Force every data second to this symbol (interference scenarios)
    pub bcd_override: Option<Symbol>,
    /// Transmit doubled ticks (DUT1 indication)
    pub double_ticks: bool,
    /// Blank the transmission entirely (dropout windows), seconds ranges
    pub dropout: Option<(f64, f64)>,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::config::rates::SOURCE,
            station: Station::Wwv,
            time: DecodedTime {
                minutes: 37,
                hours: 14,
                day_of_year: 200,
                year: 25,
                dut1_tenths: 0,
                leap_year: false,
                leap_second_pending: false,
                dst: false,
            },
            start_second: 56,
            snr_db: Some(20.0),
            seed: 1,
            carrier_level: 0.5,
            tone_level: 0.35,
            subcarrier_level: 0.25,
            bcd_override: None,
            double_ticks: false,
            dropout: None,
        }
    }
}

pub struct WwvSynthesizer {
    config: SynthConfig,
    rng: ChaCha8Rng,
    noise: Option<Normal<f64>>,
    /// Absolute sample index
    position: u64,
    /// BCD symbols of the current minute
    frame: [Symbol; 60],
    /// Minute the frame above encodes
    frame_minute_time: DecodedTime,
    /// Minute index (abs_second / 60) the frame belongs to
    frame_minute_index: u64,
}

impl WwvSynthesizer {
    /// `config.time` is the time of the first *full* minute in the stream;
    /// a partial leading minute encodes the minute before it.
    pub fn new(config: SynthConfig) -> Self {
        let noise = config.snr_db.map(|snr| {
            let noise_power = config.carrier_level * config.carrier_level / 10f64.powf(snr / 10.0);
            Normal::new(0.0, (noise_power / 2.0).sqrt()).expect("finite sigma")
        });
        let mut first = config.time;
        if config.start_second != 0 {
            if first.minutes == 0 {
                first.minutes = 59;
                first.hours = (first.hours + 23) % 24;
            } else {
                first.minutes -= 1;
            }
        }
        let mut synth = Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            noise,
            position: 0,
            frame: [Symbol::None; 60],
            frame_minute_time: first,
            frame_minute_index: 0,
            config,
        };
        synth.rebuild_frame();
        synth
    }

    fn rebuild_frame(&mut self) {
        self.frame = encode_frame(&self.frame_minute_time);
        if let Some(forced) = self.config.bcd_override {
            for (sec, slot) in self.frame.iter_mut().enumerate() {
                if !crate::decoder::P_MARKER_SECONDS.contains(&(sec as u8)) {
                    *slot = forced;
                }
            }
        }
    }

    fn advance_minute(&mut self) {
        let t = &mut self.frame_minute_time;
        t.minutes += 1;
        if t.minutes == 60 {
            t.minutes = 0;
            t.hours = (t.hours + 1) % 24;
        }
        self.rebuild_frame();
    }

    /// Synthesize the next `n` samples.
    pub fn fill(&mut self, out: &mut Vec<Complex32>, n: usize) {
        let rate = self.config.sample_rate as f64;
        out.reserve(n);
        for _ in 0..n {
            let pos = self.position;
            self.position += 1;
            let t_s = pos as f64 / rate;

            // UTC position within the minute
            let abs_second = t_s as u64 + self.config.start_second as u64;
            let utc_second = (abs_second % 60) as usize;
            let in_second_ms = (t_s - t_s.floor()) * 1000.0;
            while abs_second / 60 > self.frame_minute_index {
                self.frame_minute_index += 1;
                self.advance_minute();
            }

            let blanked = self
                .config
                .dropout
                .map(|(from, to)| t_s >= from && t_s < to)
                .unwrap_or(false);

            let mut sample = if blanked {
                Complex32::new(0.0, 0.0)
            } else {
                self.clean_sample(t_s, utc_second, in_second_ms)
            };

            if let Some(noise) = &self.noise {
                sample += Complex32::new(
                    noise.sample(&mut self.rng) as f32,
                    noise.sample(&mut self.rng) as f32,
                );
            }
            out.push(sample);
        }
    }

    fn clean_sample(&self, t_s: f64, utc_second: usize, in_second_ms: f64) -> Complex32 {
        let cfg = &self.config;
        let mut re = cfg.carrier_level;
        let im = 0.0;

        // Seconds tick or minute marker on the station tone
        let tone_phase = TAU * cfg.station.tick_freq_hz() * t_s;
        let tone = tone_phase.cos() * cfg.tone_level;
        if utc_second == 0 {
            if (EDGE_OFFSET_MS..EDGE_OFFSET_MS + MARKER_MS).contains(&in_second_ms) {
                re += tone;
            }
        } else if utc_second != 29 && utc_second != 59 {
            let in_tick = (EDGE_OFFSET_MS..EDGE_OFFSET_MS + TICK_MS).contains(&in_second_ms);
            let second_burst_start = EDGE_OFFSET_MS + DOUBLE_TICK_SPACING_MS;
            let in_double = cfg.double_ticks
                && (second_burst_start..second_burst_start + TICK_MS).contains(&in_second_ms);
            if in_tick || in_double {
                re += tone;
            }
        }

        // BCD subcarrier
        let symbol = self.frame[utc_second];
        let bcd_ms = symbol_duration_ms(symbol);
        if bcd_ms > 0.0 && (BCD_OFFSET_MS..BCD_OFFSET_MS + bcd_ms).contains(&in_second_ms) {
            re += (TAU * 100.0 * t_s).cos() * cfg.subcarrier_level;
        }

        Complex32::new(re as f32, im as f32)
    }

    /// Convenience: synthesize a whole run at once. Intended for the 50 kHz
    /// detector-stage tests; at 2 MHz prefer chunked `fill`.
    pub fn generate(&mut self, seconds: f64) -> Vec<Complex32> {
        let n = (seconds * self.config.sample_rate as f64) as usize;
        let mut out = Vec::with_capacity(n);
        self.fill(&mut out, n);
        out
    }

    /// Encode a run as the framed byte stream the source adapter consumes.
    pub fn generate_framed(&mut self, seconds: f64, samples_per_record: usize) -> Vec<u8> {
        let header = StreamHeader {
            version: 1,
            sample_rate: self.config.sample_rate,
            sample_format: FORMAT_INT16_INTERLEAVED,
            center_freq_hz: 10_000_000,
            gain_reduction: 40,
            lna_state: 0,
        };
        let mut bytes = writer::stream_header(&header);
        let total = (seconds * self.config.sample_rate as f64) as usize;
        let mut produced = 0usize;
        let mut sequence = 0u32;
        let mut chunk = Vec::with_capacity(samples_per_record);
        while produced < total {
            let n = samples_per_record.min(total - produced);
            chunk.clear();
            self.fill(&mut chunk, n);
            let iq: Vec<(i16, i16)> = chunk
                .iter()
                .map(|c| {
                    (
                        (c.re.clamp(-1.0, 0.99996) * 32768.0) as i16,
                        (c.im.clamp(-1.0, 0.99996) * 32768.0) as i16,
                    )
                })
                .collect();
            bytes.extend_from_slice(&writer::data_frame(sequence, 0, &iq));
            sequence = sequence.wrapping_add(1);
            produced += n;
        }
        bytes
    }
}

/// `Read` adapter producing the framed byte stream lazily, record by
/// record, so long demo runs never materialize the whole stream.
pub struct FramedSynthReader {
    synth: WwvSynthesizer,
    remaining_samples: usize,
    samples_per_record: usize,
    sequence: u32,
    buffer: Vec<u8>,
    offset: usize,
    header_sent: bool,
}

impl FramedSynthReader {
    pub fn new(synth: WwvSynthesizer, seconds: f64, samples_per_record: usize) -> Self {
        let total = (seconds * synth.config.sample_rate as f64) as usize;
        Self {
            synth,
            remaining_samples: total,
            samples_per_record: samples_per_record.max(1),
            sequence: 0,
            buffer: Vec::new(),
            offset: 0,
            header_sent: false,
        }
    }

    fn refill(&mut self) {
        self.buffer.clear();
        self.offset = 0;
        if !self.header_sent {
            self.header_sent = true;
            let header = StreamHeader {
                version: 1,
                sample_rate: self.synth.config.sample_rate,
                sample_format: FORMAT_INT16_INTERLEAVED,
                center_freq_hz: 10_000_000,
                gain_reduction: 40,
                lna_state: 0,
            };
            self.buffer = writer::stream_header(&header);
            return;
        }
        if self.remaining_samples == 0 {
            return;
        }
        let n = self.samples_per_record.min(self.remaining_samples);
        self.remaining_samples -= n;
        let mut chunk = Vec::with_capacity(n);
        self.synth.fill(&mut chunk, n);
        let iq: Vec<(i16, i16)> = chunk
            .iter()
            .map(|c| {
                (
                    (c.re.clamp(-1.0, 0.99996) * 32768.0) as i16,
                    (c.im.clamp(-1.0, 0.99996) * 32768.0) as i16,
                )
            })
            .collect();
        self.buffer = writer::data_frame(self.sequence, 0, &iq);
        self.sequence = self.sequence.wrapping_add(1);
    }
}

impl std::io::Read for FramedSynthReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.buffer.len() {
            self.refill();
            if self.buffer.is_empty() {
                return Ok(0);
            }
        }
        let n = (self.buffer.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
