//! wwvrx core library
//!
//! Real-time WWV/WWVH time-signal receiver core: dual-rate decimation of a
//! 2 MHz complex I/Q stream, five frequency-selective detectors, an
//! evidence-fusion sync state machine, the BCD time-code decoder, a
//! line-oriented control plane, and a lossy telemetry bus. The modules map
//! one-to-one onto the pipeline stages; `pipeline` wires them together for
//! both synchronous (batch/test) and threaded (live) operation.

pub mod config;
pub mod control;
pub mod decimation;
pub mod decoder;
pub mod detectors;
pub mod dsp;
pub mod errors;
pub mod events;
pub mod params_file;
pub mod pipeline;
pub mod source;
pub mod synth;
pub mod sync;
pub mod telemetry;

// The canonical entry points
pub use config::{ReceiverConfig, Station, TunableParams};
pub use errors::{Result, RxError};
pub use events::{DecodedTime, FrameTime, Symbol, SymbolEvent, SyncState};
pub use pipeline::{spawn_threaded, PipelineSummary, ReceiverPipeline, ThreadedPipeline};
