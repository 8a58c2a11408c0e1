//! I/Q source adapter: framed byte stream to normalized complex frames.
//!
//! The external collaborator delivers magic-prefixed little-endian records:
//! one stream header, then data frames (interleaved int16 I/Q pairs) with
//! occasional metadata updates. The adapter converts to unit-scale
//! `Complex32`, tracks the monotonic sample index, and raises a
//! discontinuity flag on sequence jumps, metadata updates, and reconnects.

use std::io::{ErrorKind, Read};

use num_complex::Complex32;

use crate::errors::SourceError;

/// Stream header magic ("IXHP" little-endian).
pub const STREAM_MAGIC: u32 = 0x5048_5849;
/// Data frame magic ("QDQI").
pub const FRAME_MAGIC: u32 = 0x4951_4451;
/// Metadata update magic ("ATEM").
pub const META_MAGIC: u32 = 0x4D45_5441;

/// Only supported sample format: interleaved int16 I/Q.
pub const FORMAT_INT16_INTERLEAVED: u32 = 1;

/// Data-frame flag bits.
pub mod frame_flags {
    pub const OVERLOAD: u32 = 0x01;
    pub const FREQ_CHANGE: u32 = 0x02;
    pub const GAIN_CHANGE: u32 = 0x04;
}

/// Sanity cap on a single record; anything larger is a malformed stream.
const MAX_RECORD_SAMPLES: u32 = 1 << 22;

/// Parsed 32-byte stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u32,
    pub sample_rate: u32,
    pub sample_format: u32,
    pub center_freq_hz: u64,
    pub gain_reduction: u32,
    pub lna_state: u32,
}

/// One normalized frame handed to the decimation pipeline. Consumed exactly
/// once per path.
#[derive(Debug, Clone, PartialEq)]
pub struct IqFrame {
    pub samples: Vec<Complex32>,
    /// Monotonic index of `samples[0]` since stream start
    pub start_index: u64,
    pub sample_rate: u32,
    pub discontinuity: bool,
    pub overload: bool,
    pub metadata_changed: bool,
}

/// Result of one `pull`.
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    Frame(IqFrame),
    EndOfStream,
}

/// Framed-stream reader over any `Read`.
pub struct IqSourceAdapter<R: Read> {
    reader: R,
    header: StreamHeader,
    next_sequence: Option<u32>,
    sample_index: u64,
    /// Set by metadata records and reconnects, consumed by the next frame
    pending_discontinuity: bool,
    pending_metadata: bool,
    /// Record parsed past a discontinuity; heads the next frame
    stashed: Option<Stashed>,
}

struct Stashed {
    samples: Vec<Complex32>,
    start_index: u64,
    overload: bool,
}

impl<R: Read> IqSourceAdapter<R> {
    /// Read and validate the stream header.
    pub fn new(mut reader: R) -> Result<Self, SourceError> {
        let magic = read_u32(&mut reader)?;
        if magic != STREAM_MAGIC {
            return Err(SourceError::BadMagic {
                expected: STREAM_MAGIC,
                actual: magic,
            });
        }
        let version = read_u32(&mut reader)?;
        if version != 1 {
            return Err(SourceError::FormatError {
                reason: format!("unsupported stream version {version}"),
            });
        }
        let sample_rate = read_u32(&mut reader)?;
        let sample_format = read_u32(&mut reader)?;
        if sample_format != FORMAT_INT16_INTERLEAVED {
            return Err(SourceError::UnsupportedFormat {
                format: sample_format,
            });
        }
        let center_freq_hz = read_u64(&mut reader)?;
        let gain_reduction = read_u32(&mut reader)?;
        let lna_state = read_u32(&mut reader)?;

        Ok(Self {
            reader,
            header: StreamHeader {
                version,
                sample_rate,
                sample_format,
                center_freq_hz,
                gain_reduction,
                lna_state,
            },
            next_sequence: None,
            sample_index: 0,
            pending_discontinuity: false,
            pending_metadata: false,
            stashed: None,
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Mark the next frame discontinuous (reconnect path).
    pub fn note_reconnect(&mut self) {
        self.pending_discontinuity = true;
        self.next_sequence = None;
    }

    /// Read records until one data frame is available, coalescing up to
    /// `max_samples` I/Q pairs. Metadata updates are folded into the flags of
    /// the following frame. Never blocks past the underlying reader.
    pub fn pull(&mut self, max_samples: usize) -> Result<Pull, SourceError> {
        let mut samples: Vec<Complex32> = Vec::new();
        let mut start_index = self.sample_index;
        let mut overload = false;

        // A record held back from the previous pull heads this frame and
        // consumes the discontinuity/metadata flags that caused the split.
        if let Some(stash) = self.stashed.take() {
            start_index = stash.start_index;
            overload = stash.overload;
            samples = stash.samples;
            if samples.len() >= max_samples {
                return Ok(Pull::Frame(self.finish_frame(samples, start_index, overload)));
            }
        }

        loop {
            let magic = match read_u32(&mut self.reader) {
                Ok(m) => m,
                Err(SourceError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    // Clean end only at a record boundary
                    return if samples.is_empty() {
                        Ok(Pull::EndOfStream)
                    } else {
                        Ok(Pull::Frame(self.finish_frame(samples, start_index, overload)))
                    };
                }
                Err(e) => return Err(e),
            };

            match magic {
                FRAME_MAGIC => {
                    let sequence = read_u32(&mut self.reader)?;
                    let num_samples = read_u32(&mut self.reader)?;
                    let flags = read_u32(&mut self.reader)?;
                    if num_samples > MAX_RECORD_SAMPLES {
                        return Err(SourceError::FormatError {
                            reason: format!("data frame of {num_samples} samples"),
                        });
                    }
                    if let Some(expected) = self.next_sequence {
                        if sequence != expected {
                            self.pending_discontinuity = true;
                        }
                    }
                    self.next_sequence = Some(sequence.wrapping_add(1));
                    if flags & (frame_flags::FREQ_CHANGE | frame_flags::GAIN_CHANGE) != 0 {
                        self.pending_metadata = true;
                        self.pending_discontinuity = true;
                    }
                    let record_overload = flags & frame_flags::OVERLOAD != 0;

                    let record_start = self.sample_index;
                    let mut record = Vec::new();
                    self.read_payload(num_samples as usize, &mut record)?;
                    self.sample_index += num_samples as u64;

                    // A discontinuity must head its own frame: emit what we
                    // have (without the pending flags) and hold this record.
                    if !samples.is_empty() && self.pending_discontinuity {
                        self.stashed = Some(Stashed {
                            samples: record,
                            start_index: record_start,
                            overload: record_overload,
                        });
                        return Ok(Pull::Frame(self.plain_frame(samples, start_index, overload)));
                    }

                    if samples.is_empty() {
                        start_index = record_start;
                    }
                    overload |= record_overload;
                    samples.extend_from_slice(&record);

                    if samples.len() >= max_samples {
                        return Ok(Pull::Frame(self.finish_frame(samples, start_index, overload)));
                    }
                }
                META_MAGIC => {
                    self.read_metadata()?;
                    if !samples.is_empty() {
                        // The update applies to what follows, not to these
                        return Ok(Pull::Frame(self.plain_frame(samples, start_index, overload)));
                    }
                }
                other => {
                    return Err(SourceError::BadMagic {
                        expected: FRAME_MAGIC,
                        actual: other,
                    });
                }
            }
        }
    }

    fn finish_frame(&mut self, samples: Vec<Complex32>, start_index: u64, overload: bool) -> IqFrame {
        let discontinuity = std::mem::take(&mut self.pending_discontinuity);
        let metadata_changed = std::mem::take(&mut self.pending_metadata);
        IqFrame {
            samples,
            start_index,
            sample_rate: self.header.sample_rate,
            discontinuity,
            overload,
            metadata_changed,
        }
    }

    /// Frame that leaves the pending flags for the record that follows it.
    fn plain_frame(&self, samples: Vec<Complex32>, start_index: u64, overload: bool) -> IqFrame {
        IqFrame {
            samples,
            start_index,
            sample_rate: self.header.sample_rate,
            discontinuity: false,
            overload,
            metadata_changed: false,
        }
    }

    fn read_payload(&mut self, num_samples: usize, out: &mut Vec<Complex32>) -> Result<(), SourceError> {
        let mut raw = vec![0u8; num_samples * 4];
        self.reader.read_exact(&mut raw).map_err(truncated)?;
        out.reserve(num_samples);
        for pair in raw.chunks_exact(4) {
            let i = i16::from_le_bytes([pair[0], pair[1]]);
            let q = i16::from_le_bytes([pair[2], pair[3]]);
            out.push(Complex32::new(
                i as f32 / 32768.0,
                q as f32 / 32768.0,
            ));
        }
        Ok(())
    }

    /// 32-byte metadata update (magic already consumed): new rate/format,
    /// reserved word, center frequency, gain, LNA state.
    fn read_metadata(&mut self) -> Result<(), SourceError> {
        let sample_rate = read_u32(&mut self.reader).map_err(truncated_src)?;
        let sample_format = read_u32(&mut self.reader).map_err(truncated_src)?;
        let _reserved = read_u32(&mut self.reader).map_err(truncated_src)?;
        let center_freq_hz = read_u64(&mut self.reader).map_err(truncated_src)?;
        let gain_reduction = read_u32(&mut self.reader).map_err(truncated_src)?;
        let lna_state = read_u32(&mut self.reader).map_err(truncated_src)?;

        if sample_format != FORMAT_INT16_INTERLEAVED {
            return Err(SourceError::UnsupportedFormat {
                format: sample_format,
            });
        }
        self.header.sample_rate = sample_rate;
        self.header.sample_format = sample_format;
        self.header.center_freq_hz = center_freq_hz;
        self.header.gain_reduction = gain_reduction;
        self.header.lna_state = lna_state;
        self.pending_metadata = true;
        self.pending_discontinuity = true;
        Ok(())
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, SourceError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, SourceError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// EOF inside a record is a framing violation, not a clean end.
fn truncated(e: std::io::Error) -> SourceError {
    if e.kind() == ErrorKind::UnexpectedEof {
        SourceError::FormatError {
            reason: "truncated record".into(),
        }
    } else {
        SourceError::Io(e)
    }
}

fn truncated_src(e: SourceError) -> SourceError {
    match e {
        SourceError::Io(io) => truncated(io),
        other => other,
    }
}

/// Encoding half of the framing, used by the synthesizer and the tests.
pub mod writer {
    use super::*;

    pub fn stream_header(header: &StreamHeader) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&STREAM_MAGIC.to_le_bytes());
        out.extend_from_slice(&header.version.to_le_bytes());
        out.extend_from_slice(&header.sample_rate.to_le_bytes());
        out.extend_from_slice(&header.sample_format.to_le_bytes());
        out.extend_from_slice(&header.center_freq_hz.to_le_bytes());
        out.extend_from_slice(&header.gain_reduction.to_le_bytes());
        out.extend_from_slice(&header.lna_state.to_le_bytes());
        out
    }

    pub fn data_frame(sequence: u32, flags: u32, iq: &[(i16, i16)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + iq.len() * 4);
        out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&(iq.len() as u32).to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        for &(i, q) in iq {
            out.extend_from_slice(&i.to_le_bytes());
            out.extend_from_slice(&q.to_le_bytes());
        }
        out
    }

    pub fn metadata_update(header: &StreamHeader) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&META_MAGIC.to_le_bytes());
        out.extend_from_slice(&header.sample_rate.to_le_bytes());
        out.extend_from_slice(&header.sample_format.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&header.center_freq_hz.to_le_bytes());
        out.extend_from_slice(&header.gain_reduction.to_le_bytes());
        out.extend_from_slice(&header.lna_state.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_header() -> StreamHeader {
        StreamHeader {
            version: 1,
            sample_rate: 2_000_000,
            sample_format: FORMAT_INT16_INTERLEAVED,
            center_freq_hz: 10_000_000,
            gain_reduction: 40,
            lna_state: 0,
        }
    }

    fn stream_with(records: &[Vec<u8>]) -> Cursor<Vec<u8>> {
        let mut bytes = writer::stream_header(&test_header());
        for r in records {
            bytes.extend_from_slice(r);
        }
        Cursor::new(bytes)
    }

    #[test]
    fn test_header_roundtrip() {
        let adapter = IqSourceAdapter::new(stream_with(&[])).unwrap();
        assert_eq!(*adapter.header(), test_header());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = writer::stream_header(&test_header());
        bytes[0] = 0xff;
        assert!(matches!(
            IqSourceAdapter::new(Cursor::new(bytes)),
            Err(SourceError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_sample_normalization() {
        let frame = writer::data_frame(0, 0, &[(i16::MAX, i16::MIN), (0, 16384)]);
        let mut adapter = IqSourceAdapter::new(stream_with(&[frame])).unwrap();
        match adapter.pull(1024).unwrap() {
            Pull::Frame(f) => {
                assert_eq!(f.samples.len(), 2);
                assert!((f.samples[0].re - (32767.0 / 32768.0)).abs() < 1e-6);
                assert_eq!(f.samples[0].im, -1.0);
                assert_eq!(f.samples[1].im, 0.5);
                assert!(!f.discontinuity);
                assert_eq!(f.start_index, 0);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(adapter.pull(1024).unwrap(), Pull::EndOfStream);
    }

    #[test]
    fn test_sequence_jump_sets_discontinuity() {
        let records = [
            writer::data_frame(0, 0, &[(100, 100)]),
            writer::data_frame(5, 0, &[(100, 100)]),
        ];
        let mut adapter = IqSourceAdapter::new(stream_with(&records)).unwrap();
        // Both records coalesce only when contiguous; the jump splits them
        let first = match adapter.pull(8).unwrap() {
            Pull::Frame(f) => f,
            other => panic!("{other:?}"),
        };
        assert!(!first.discontinuity);
        let second = match adapter.pull(8).unwrap() {
            Pull::Frame(f) => f,
            other => panic!("{other:?}"),
        };
        assert!(second.discontinuity);
        assert_eq!(second.start_index, 1);
    }

    #[test]
    fn test_metadata_update_flags_next_frame() {
        let mut meta_header = test_header();
        meta_header.center_freq_hz = 15_000_000;
        let records = [
            writer::data_frame(0, 0, &[(0, 0); 4]),
            writer::metadata_update(&meta_header),
            writer::data_frame(1, 0, &[(0, 0); 4]),
        ];
        let mut adapter = IqSourceAdapter::new(stream_with(&records)).unwrap();

        let first = match adapter.pull(64).unwrap() {
            Pull::Frame(f) => f,
            other => panic!("{other:?}"),
        };
        assert!(!first.metadata_changed);

        let second = match adapter.pull(64).unwrap() {
            Pull::Frame(f) => f,
            other => panic!("{other:?}"),
        };
        assert!(second.metadata_changed);
        assert!(second.discontinuity);
        assert_eq!(adapter.header().center_freq_hz, 15_000_000);
    }

    #[test]
    fn test_overload_flag_propagates() {
        let frame = writer::data_frame(0, frame_flags::OVERLOAD, &[(0, 0); 2]);
        let mut adapter = IqSourceAdapter::new(stream_with(&[frame])).unwrap();
        match adapter.pull(16).unwrap() {
            Pull::Frame(f) => assert!(f.overload),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_truncated_payload_is_format_error() {
        let mut frame = writer::data_frame(0, 0, &[(1, 1); 8]);
        frame.truncate(frame.len() - 3);
        let mut adapter = IqSourceAdapter::new(stream_with(&[frame])).unwrap();
        assert!(matches!(
            adapter.pull(64),
            Err(SourceError::FormatError { .. })
        ));
    }

    #[test]
    fn test_reconnect_marks_discontinuity() {
        let frame = writer::data_frame(7, 0, &[(0, 0); 2]);
        let mut adapter = IqSourceAdapter::new(stream_with(&[frame])).unwrap();
        adapter.note_reconnect();
        match adapter.pull(16).unwrap() {
            Pull::Frame(f) => assert!(f.discontinuity),
            other => panic!("{other:?}"),
        }
    }
}
