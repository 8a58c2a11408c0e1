//! Pipeline wiring: source, decimation, detector banks, fusion, control,
//! and telemetry.
//!
//! Two drivers share the same component structs:
//!
//! - [`ReceiverPipeline`] runs everything synchronously on the caller's
//!   thread, in stream time. Deterministic, used by the tests and by batch
//!   file processing.
//! - [`spawn_threaded`] runs the six cooperating tasks of the live receiver
//!   (source+decimation, detector path, display path, fusion, control,
//!   telemetry is the caller's subscription) over bounded queues with a
//!   shared stop flag.

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::ArrayQueue;
use num_complex::Complex32;

use crate::config::{rates, ParamId, ReceiverConfig, Station, TunableParams};
use crate::control::{ControlAction, ControlPlane};
use crate::decimation::DualDecimator;
use crate::decoder::BcdCorrelator;
use crate::detectors::{
    BcdDetector, BcdMode, MarkerDetector, PulseDetector, TickDetector, ToneTracker,
};
use crate::errors::{Result, RxError, SourceError};
use crate::events::{
    ChannelQuality, DecodedTime, DetectorEvent, EventKind, FrameTime, SymbolEvent,
};
use crate::source::{IqSourceAdapter, Pull};
use crate::sync::SyncDetector;
use crate::telemetry::{channels, Record, TelemetryBus};

/// Fusion periodic-check cadence.
const PERIODIC_MS: f64 = 100.0;

/// `TIME` channel body: `hours,minutes,day_of_year,year,dut1_tenths,dst`.
fn time_record_body(t: &DecodedTime) -> String {
    format!(
        "{},{},{},{},{},{}",
        t.hours,
        t.minutes,
        t.day_of_year,
        t.year,
        t.dut1_tenths,
        u8::from(t.dst)
    )
}
/// Channel-quality snapshot cadence.
const QUALITY_MS: f64 = 1000.0;
/// Samples coalesced per source pull.
const PULL_SAMPLES: usize = 65_536;

/// The 50 kHz detectors (task B).
pub struct DetectorBank {
    pub tick: TickDetector,
    pub marker: MarkerDetector,
    pub bcd_time: BcdDetector,
    pub bcd_freq: BcdDetector,
}

impl DetectorBank {
    pub fn new(station: Station, params: &TunableParams) -> Self {
        Self {
            tick: TickDetector::new(station, params.tick),
            marker: MarkerDetector::fast(station, params.marker),
            bcd_time: BcdDetector::new(BcdMode::Time),
            bcd_freq: BcdDetector::new(BcdMode::Freq),
        }
    }

    /// Run all four detectors over one batch; events come back sorted.
    pub fn process(&mut self, samples: &[Complex32]) -> Vec<DetectorEvent> {
        let mut events = self.tick.process_samples(samples);
        events.extend(self.marker.process_samples(samples));
        events.extend(self.bcd_time.process_samples(samples));
        events.extend(self.bcd_freq.process_samples(samples));
        events.sort_by(|a, b| a.timestamp_ms.total_cmp(&b.timestamp_ms));
        events
    }

    pub fn reset(&mut self) {
        self.tick.reset();
        self.marker.reset();
        self.bcd_time.reset();
        self.bcd_freq.reset();
    }

    pub fn qualities(&self) -> [(&'static str, ChannelQuality); 4] {
        [
            ("tick", self.tick.quality()),
            ("marker", self.marker.quality()),
            ("bcd_time", self.bcd_time.quality()),
            ("bcd_freq", self.bcd_freq.quality()),
        ]
    }
}

/// The 12.5 kHz display-path consumers (task C).
pub struct DisplayBank {
    pub marker_slow: MarkerDetector,
    pub trackers: Vec<ToneTracker>,
}

impl DisplayBank {
    pub fn new(station: Station, params: &TunableParams, reference_hz: f64) -> Self {
        Self {
            marker_slow: MarkerDetector::slow(station, params.marker),
            trackers: vec![
                ToneTracker::new(0.0, reference_hz),
                ToneTracker::new(500.0, 500.0),
                ToneTracker::new(600.0, 600.0),
            ],
        }
    }

    /// Returns slow-marker confirmations; tone readings go straight to the
    /// bus as their own channels.
    pub fn process(&mut self, samples: &[Complex32], bus: &TelemetryBus) -> Vec<DetectorEvent> {
        for tracker in &mut self.trackers {
            let channel = tracker.channel_name();
            for r in tracker.process_samples(samples) {
                bus.publish(Record::new(
                    channel.clone(),
                    format!(
                        "{:.1},{:.3},{:.3},{:.3},{:.1},{}",
                        r.timestamp_ms,
                        r.measured_hz,
                        r.offset_hz,
                        r.offset_ppm,
                        r.snr_db,
                        u8::from(r.valid)
                    ),
                ));
            }
        }
        self.marker_slow.process_samples(samples)
    }

    pub fn reset(&mut self) {
        self.marker_slow.reset();
        for t in &mut self.trackers {
            t.reset();
        }
    }
}

/// Sync detector plus BCD correlator (task D).
pub struct FusionStage {
    pub sync: SyncDetector,
    pub correlator: BcdCorrelator,
    next_periodic_ms: f64,
}

/// What fell out of one fusion advance.
#[derive(Debug, Default)]
pub struct FusionOutput {
    pub symbols: Vec<SymbolEvent>,
    pub decoded: Vec<DecodedTime>,
    pub transitions: Vec<(f64, crate::events::SyncState)>,
}

impl FusionStage {
    pub fn new(params: &TunableParams) -> Self {
        Self {
            sync: SyncDetector::new(params.sync),
            correlator: BcdCorrelator::new(),
            next_periodic_ms: PERIODIC_MS,
        }
    }

    /// Sorted-ingest of detector events plus slow-marker confirmations.
    pub fn ingest(&mut self, events: &[DetectorEvent], slow_markers: &[DetectorEvent]) {
        for event in events {
            self.sync.on_event(event);
            if event.kind == EventKind::BcdPulse {
                self.correlator.on_pulse(event);
            }
        }
        for confirmation in slow_markers {
            self.correlator.on_slow_marker(confirmation);
        }
    }

    /// Run periodic checks up to `now_ms` and close due symbol windows.
    pub fn advance(&mut self, now_ms: f64) -> FusionOutput {
        let mut out = FusionOutput::default();
        while self.next_periodic_ms <= now_ms {
            self.sync.periodic(self.next_periodic_ms);
            self.next_periodic_ms += PERIODIC_MS;
        }
        let frame_time = self.sync.frame_time();
        let result = self.correlator.advance(&frame_time, now_ms);
        out.symbols = result.symbols;
        if let Some(decoded) = result.decoded {
            // Decoded flags feed straight back into the tolerance logic
            self.sync.set_leap_second_pending(decoded.leap_second_pending);
            out.decoded.push(decoded);
        }
        out.transitions = self.sync.take_transitions();
        out
    }

    pub fn on_discontinuity(&mut self) {
        self.sync.on_discontinuity();
        self.correlator.reset();
    }
}

/// Summary returned by the offline driver.
#[derive(Debug, Default, Clone)]
pub struct PipelineSummary {
    pub seconds_processed: f64,
    pub tick_events: u64,
    pub marker_events: u64,
    pub decoded: Vec<DecodedTime>,
}

/// Synchronous full-path pipeline.
pub struct ReceiverPipeline {
    config: ReceiverConfig,
    decimator: DualDecimator,
    detectors: DetectorBank,
    display: DisplayBank,
    fusion: FusionStage,
    control: ControlPlane,
    bus: Arc<TelemetryBus>,
    now_ms: f64,
    next_quality_ms: f64,
    symbols: Vec<SymbolEvent>,
    decoded: Vec<DecodedTime>,
}

impl ReceiverPipeline {
    pub fn new(config: ReceiverConfig, param_path: Option<PathBuf>) -> Result<Self> {
        let (control, warnings) = match (&param_path, config.reload) {
            (Some(path), true) => ControlPlane::new_with_reload(path.clone()),
            _ => (ControlPlane::new(config.params, param_path), Vec::new()),
        };
        let params = *control.params();
        let bus = Arc::new(TelemetryBus::new());
        for w in &warnings {
            bus.publish(Record::new(channels::CTRL, format!("warn,{w}")));
        }

        let mut detectors = DetectorBank::new(config.station, &params);
        let fusion = FusionStage::new(&params);
        detectors.tick.attach_epoch_hint(fusion.sync.hint_cell());

        Ok(Self {
            display: DisplayBank::new(config.station, &params, 10_000_000.0),
            decimator: DualDecimator::new().map_err(RxError::Dsp)?,
            detectors,
            fusion,
            control,
            bus,
            config,
            now_ms: 0.0,
            next_quality_ms: QUALITY_MS,
            symbols: Vec::new(),
            decoded: Vec::new(),
        })
    }

    pub fn bus(&self) -> Arc<TelemetryBus> {
        Arc::clone(&self.bus)
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn frame_time(&self) -> FrameTime {
        self.fusion.sync.frame_time()
    }

    pub fn symbols(&self) -> &[SymbolEvent] {
        &self.symbols
    }

    pub fn decoded_times(&self) -> &[DecodedTime] {
        &self.decoded
    }

    pub fn detectors(&self) -> &DetectorBank {
        &self.detectors
    }

    pub fn correlator(&self) -> &BcdCorrelator {
        &self.fusion.correlator
    }

    /// Consume an entire framed byte stream.
    pub fn process_source<R: Read>(&mut self, reader: R) -> Result<PipelineSummary> {
        let mut adapter = IqSourceAdapter::new(reader).map_err(RxError::Source)?;
        loop {
            match adapter.pull(PULL_SAMPLES) {
                Ok(Pull::Frame(frame)) => {
                    if frame.discontinuity {
                        self.on_discontinuity();
                    }
                    let decimated = self.decimator.process(&frame);
                    self.ingest_decimated(&decimated.detector, &decimated.display);
                }
                Ok(Pull::EndOfStream) => break,
                Err(SourceError::Backpressure) => continue,
                Err(e) => return Err(RxError::Source(e)),
            }
        }
        Ok(self.summary())
    }

    /// Detector-stage entry for tests that synthesize 50 kHz baseband
    /// directly (the display path stays idle).
    pub fn process_detector_samples(&mut self, samples: &[Complex32]) {
        let now = self.now_ms + samples.len() as f64 * 1000.0 / rates::DETECTOR as f64;
        let events = self.detectors.process(samples);
        self.fuse(events, Vec::new(), now);
    }

    /// One control line, in stream time. The response is returned and also
    /// echoed on the bus.
    pub fn handle_control(&mut self, line: &str) -> String {
        self.bus.publish(Record::new(channels::CTRL, line.to_string()));
        let reply = self.control.handle_line(line, self.now_ms);
        let response = match reply.action {
            ControlAction::Status => self.status_line(),
            ControlAction::Apply(id, _) => {
                self.apply_param(id);
                reply.response
            }
            ControlAction::None => reply.response,
        };
        self.bus
            .publish(Record::new(channels::RESP, response.clone()));
        response
    }

    /// One line: sync state, position, confidence, and counters.
    pub fn status_line(&self) -> String {
        let ft = self.frame_time();
        let tick = self.detectors.tick.counters();
        let corr = self.fusion.correlator.counters();
        format!(
            "OK state={} second={} confidence={:.3} anchor={:.1} ticks={} markers={} symbols={} frames={} dropped={}",
            ft.state.as_str(),
            ft.current_second,
            ft.confidence,
            ft.second_start_ms,
            tick.emitted,
            self.detectors.marker.counters().emitted,
            corr.symbols_emitted,
            corr.frames_decoded,
            self.bus.dropped_total(),
        )
    }

    fn apply_param(&mut self, id: ParamId) {
        let params = *self.control.params();
        match id.spec().section {
            "tick_detector" => self.detectors.tick.set_params(params.tick),
            "marker_detector" => {
                self.detectors.marker.set_params(params.marker);
                self.display.marker_slow.set_params(params.marker);
            }
            "sync_detector" => self.fusion.sync.set_params(params.sync),
            _ => {}
        }
    }

    fn on_discontinuity(&mut self) {
        self.detectors.reset();
        self.display.reset();
        self.fusion.on_discontinuity();
    }

    fn ingest_decimated(&mut self, detector: &[Complex32], display: &[Complex32]) {
        let events = self.detectors.process(detector);
        let slow_markers = self.display.process(display, &self.bus);
        let now = self.decimator.detector_chain().next_output_ms();
        self.fuse(events, slow_markers, now);
    }

    fn fuse(&mut self, events: Vec<DetectorEvent>, slow_markers: Vec<DetectorEvent>, now: f64) {
        for event in &events {
            self.publish_event(event);
        }
        self.fusion.ingest(&events, &slow_markers);
        let out = self.fusion.advance(now);
        self.now_ms = now;

        for (ts, state) in &out.transitions {
            let ft = self.frame_time();
            self.bus.publish(Record::new(
                channels::SYNC,
                format!(
                    "{},{},{:.3},{:#04x},{:.1}",
                    state.as_str(),
                    ft.current_second,
                    ft.confidence,
                    ft.evidence_mask,
                    ts
                ),
            ));
        }
        for s in &out.symbols {
            self.bus.publish(Record::new(
                channels::SYM,
                format!(
                    "{},{},{:.1},{:.2},{}",
                    s.symbol.as_str(),
                    s.frame_second,
                    s.duration_ms,
                    s.confidence,
                    s.sync_state.as_str()
                ),
            ));
        }
        self.symbols.extend(out.symbols);
        for decoded in &out.decoded {
            self.bus
                .publish(Record::new(channels::TIME, time_record_body(decoded)));
        }
        self.decoded.extend(out.decoded);

        if now >= self.next_quality_ms {
            self.publish_quality(now);
            self.next_quality_ms = now + QUALITY_MS;
        }
    }

    fn publish_event(&self, event: &DetectorEvent) {
        match event.kind {
            EventKind::Tick => {
                let interval = self.detectors.tick.last_interval_ms().unwrap_or(0.0);
                self.bus.publish(Record::new(
                    channels::TICK,
                    format!(
                        "{:.1},{:.1},{:.3},{:.1},{}",
                        event.timestamp_ms,
                        event.duration_ms,
                        event.correlation.unwrap_or(0.0),
                        interval,
                        self.detectors.tick.counters().emitted
                    ),
                ));
            }
            EventKind::Marker => {
                self.bus.publish(Record::new(
                    channels::MARK,
                    format!(
                        "{:.1},{:.1},{:.3}",
                        event.timestamp_ms, event.duration_ms, event.peak_energy
                    ),
                ));
            }
            EventKind::BcdPulse => {
                let path = match event.bcd_path {
                    Some(crate::events::BcdPath::Time) => "time",
                    Some(crate::events::BcdPath::Freq) => "freq",
                    None => "?",
                };
                self.bus.publish(Record::new(
                    channels::BCDS,
                    format!(
                        "{:.1},{},{:.1},{:.3}",
                        event.timestamp_ms, path, event.duration_ms, event.peak_energy
                    ),
                ));
            }
        }
    }

    fn publish_quality(&self, now: f64) {
        for (name, q) in self.detectors.qualities() {
            self.bus.publish(Record::new(
                channels::CHAN,
                format!(
                    "{:.1},{},{:.3e},{:.1},{:.3e}",
                    now, name, q.noise_floor, q.snr_db, q.peak
                ),
            ));
        }
        let (variance, chain_len) = self.fusion.correlator.stats();
        self.bus.publish(Record::new(
            channels::CORR,
            format!("{:.1},{:.2},{}", now, variance, chain_len),
        ));
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            seconds_processed: self.now_ms / 1000.0,
            tick_events: self.detectors.tick.counters().emitted,
            marker_events: self.detectors.marker.counters().emitted,
            decoded: self.decoded.clone(),
        }
    }
}

// ----------------------------------------------------------------------
// Threaded runtime

/// Handles to the live six-task receiver.
pub struct ThreadedPipeline {
    pub stop: Arc<AtomicBool>,
    pub control_tx: Sender<String>,
    pub response_rx: Receiver<String>,
    pub bus: Arc<TelemetryBus>,
    pub frame_time: Arc<Mutex<FrameTime>>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadedPipeline {
    /// Signal stop and join every task.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

struct DetectorBatch {
    samples: Vec<Complex32>,
    discontinuity: bool,
    now_ms: f64,
}

/// Spawn the cooperative tasks over a framed byte source.
///
/// Task A drives source + decimation, B the 50 kHz detectors, C the display
/// path, D fusion, E control. Telemetry (task F) is the caller's
/// subscription on the returned bus. Detector-to-fusion queues are lossy
/// drop-oldest so no task ever blocks on a slow consumer.
pub fn spawn_threaded<R: Read + Send + 'static>(
    config: ReceiverConfig,
    param_path: Option<PathBuf>,
    reader: R,
) -> Result<ThreadedPipeline> {
    let (control, _warnings) = match (&param_path, config.reload) {
        (Some(path), true) => ControlPlane::new_with_reload(path.clone()),
        _ => (ControlPlane::new(config.params, param_path), Vec::new()),
    };
    let params = *control.params();
    let bus = Arc::new(TelemetryBus::new());
    let stop = Arc::new(AtomicBool::new(false));

    let mut detectors = DetectorBank::new(config.station, &params);
    let mut display = DisplayBank::new(config.station, &params, 10_000_000.0);
    let mut fusion = FusionStage::new(&params);
    detectors.tick.attach_epoch_hint(fusion.sync.hint_cell());

    let frame_time = Arc::new(Mutex::new(fusion.sync.frame_time()));

    // Task A -> B and A -> C sample queues (bounded, blocking: the source
    // must not outrun the detectors without bound)
    let (det_tx, det_rx) = bounded::<DetectorBatch>(8);
    let (disp_tx, disp_rx) = bounded::<DetectorBatch>(8);
    // Detector/display -> fusion event queues (lossy drop-oldest)
    let event_queue = Arc::new(ArrayQueue::<DetectorEvent>::new(1024));
    let slow_marker_queue = Arc::new(ArrayQueue::<DetectorEvent>::new(64));
    let fusion_disc = Arc::new(AtomicBool::new(false));
    let fusion_now = Arc::new(Mutex::new(0.0f64));
    // Control -> owning-task parameter updates
    let (tick_param_tx, tick_param_rx) = bounded::<TunableParams>(4);
    let (sync_param_tx, sync_param_rx) = bounded::<TunableParams>(4);
    let (control_tx, control_line_rx) = bounded::<String>(32);
    let (response_tx, response_rx) = bounded::<String>(32);

    let mut handles = Vec::new();

    // Task A: source + decimation
    {
        let stop = Arc::clone(&stop);
        let mut decimator = DualDecimator::new().map_err(RxError::Dsp)?;
        handles.push(std::thread::spawn(move || {
            let mut adapter = match IqSourceAdapter::new(reader) {
                Ok(a) => a,
                Err(_) => return,
            };
            while !stop.load(Ordering::Relaxed) {
                match adapter.pull(PULL_SAMPLES) {
                    Ok(Pull::Frame(frame)) => {
                        let out = decimator.process(&frame);
                        let now = decimator.detector_chain().next_output_ms();
                        let det = DetectorBatch {
                            samples: out.detector,
                            discontinuity: out.discontinuity,
                            now_ms: now,
                        };
                        let disp = DetectorBatch {
                            samples: out.display,
                            discontinuity: out.discontinuity,
                            now_ms: decimator.display_chain().next_output_ms(),
                        };
                        if det_tx.send(det).is_err() || disp_tx.send(disp).is_err() {
                            break;
                        }
                    }
                    Ok(Pull::EndOfStream) => break,
                    Err(SourceError::Backpressure) => continue,
                    Err(_) => break,
                }
            }
        }));
    }

    // Task B: 50 kHz detector path
    {
        let stop = Arc::clone(&stop);
        let bus = Arc::clone(&bus);
        let events = Arc::clone(&event_queue);
        let disc = Arc::clone(&fusion_disc);
        let now_cell = Arc::clone(&fusion_now);
        handles.push(std::thread::spawn(move || {
            let mut sequence = 0u64;
            let mut next_quality_ms = QUALITY_MS;
            while !stop.load(Ordering::Relaxed) {
                // Parameter snapshot swap between batches
                while let Ok(p) = tick_param_rx.try_recv() {
                    detectors.tick.set_params(p.tick);
                    detectors.marker.set_params(p.marker);
                }
                let batch = match det_rx.recv_timeout(std::time::Duration::from_millis(50)) {
                    Ok(b) => b,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                if batch.discontinuity {
                    detectors.reset();
                    disc.store(true, Ordering::Relaxed);
                }
                for event in detectors.process(&batch.samples) {
                    sequence += 1;
                    match event.kind {
                        EventKind::Tick => {
                            bus.publish(Record::new(
                                channels::TICK,
                                format!(
                                    "{:.1},{:.1},{:.3},{:.1},{}",
                                    event.timestamp_ms,
                                    event.duration_ms,
                                    event.correlation.unwrap_or(0.0),
                                    detectors.tick.last_interval_ms().unwrap_or(0.0),
                                    sequence
                                ),
                            ));
                        }
                        EventKind::Marker => {
                            bus.publish(Record::new(
                                channels::MARK,
                                format!(
                                    "{:.1},{:.1},{:.3}",
                                    event.timestamp_ms, event.duration_ms, event.peak_energy
                                ),
                            ));
                        }
                        EventKind::BcdPulse => {
                            let path = match event.bcd_path {
                                Some(crate::events::BcdPath::Time) => "time",
                                Some(crate::events::BcdPath::Freq) => "freq",
                                None => "?",
                            };
                            bus.publish(Record::new(
                                channels::BCDS,
                                format!(
                                    "{:.1},{},{:.1},{:.3}",
                                    event.timestamp_ms, path, event.duration_ms, event.peak_energy
                                ),
                            ));
                        }
                    }
                    // Lossy hand-off: fusion tolerates missing records
                    let _ = events.force_push(event);
                }
                if batch.now_ms >= next_quality_ms {
                    for (name, q) in detectors.qualities() {
                        bus.publish(Record::new(
                            channels::CHAN,
                            format!(
                                "{:.1},{},{:.3e},{:.1},{:.3e}",
                                batch.now_ms, name, q.noise_floor, q.snr_db, q.peak
                            ),
                        ));
                    }
                    next_quality_ms = batch.now_ms + QUALITY_MS;
                }
                *now_cell.lock().expect("fusion clock poisoned") = batch.now_ms;
            }
        }));
    }

    // Task C: display path
    {
        let stop = Arc::clone(&stop);
        let bus = Arc::clone(&bus);
        let slow = Arc::clone(&slow_marker_queue);
        handles.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let batch = match disp_rx.recv_timeout(std::time::Duration::from_millis(50)) {
                    Ok(b) => b,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                if batch.discontinuity {
                    display.reset();
                }
                for confirmation in display.process(&batch.samples, &bus) {
                    let _ = slow.force_push(confirmation);
                }
            }
        }));
    }

    // Task D: fusion
    {
        let stop = Arc::clone(&stop);
        let bus = Arc::clone(&bus);
        let events = Arc::clone(&event_queue);
        let slow = Arc::clone(&slow_marker_queue);
        let disc = Arc::clone(&fusion_disc);
        let now_cell = Arc::clone(&fusion_now);
        let frame_time = Arc::clone(&frame_time);
        handles.push(std::thread::spawn(move || {
            let mut next_corr_ms = QUALITY_MS;
            while !stop.load(Ordering::Relaxed) {
                while let Ok(p) = sync_param_rx.try_recv() {
                    fusion.sync.set_params(p.sync);
                }
                if disc.swap(false, Ordering::Relaxed) {
                    fusion.on_discontinuity();
                }
                let mut batch = Vec::new();
                while let Some(e) = events.pop() {
                    batch.push(e);
                }
                batch.sort_by(|a, b| a.timestamp_ms.total_cmp(&b.timestamp_ms));
                let mut confirmations = Vec::new();
                while let Some(e) = slow.pop() {
                    confirmations.push(e);
                }
                fusion.ingest(&batch, &confirmations);

                let now = *now_cell.lock().expect("fusion clock poisoned");
                let out = fusion.advance(now);
                let ft = fusion.sync.frame_time();
                *frame_time.lock().expect("frame time poisoned") = ft;
                for (ts, state) in &out.transitions {
                    bus.publish(Record::new(
                        channels::SYNC,
                        format!(
                            "{},{},{:.3},{:#04x},{:.1}",
                            state.as_str(),
                            ft.current_second,
                            ft.confidence,
                            ft.evidence_mask,
                            ts
                        ),
                    ));
                }
                for s in &out.symbols {
                    bus.publish(Record::new(
                        channels::SYM,
                        format!(
                            "{},{},{:.1},{:.2},{}",
                            s.symbol.as_str(),
                            s.frame_second,
                            s.duration_ms,
                            s.confidence,
                            s.sync_state.as_str()
                        ),
                    ));
                }
                for decoded in &out.decoded {
                    bus.publish(Record::new(channels::TIME, time_record_body(decoded)));
                }
                if now >= next_corr_ms {
                    let (variance, chain_len) = fusion.correlator.stats();
                    bus.publish(Record::new(
                        channels::CORR,
                        format!("{:.1},{:.2},{}", now, variance, chain_len),
                    ));
                    next_corr_ms = now + QUALITY_MS;
                }
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
        }));
    }

    // Task E: control
    {
        let stop = Arc::clone(&stop);
        let bus = Arc::clone(&bus);
        let now_cell = Arc::clone(&fusion_now);
        let frame_time = Arc::clone(&frame_time);
        let mut control = control;
        handles.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let line = match control_line_rx.recv_timeout(std::time::Duration::from_millis(50))
                {
                    Ok(l) => l,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                bus.publish(Record::new(channels::CTRL, line.clone()));
                let now = *now_cell.lock().expect("fusion clock poisoned");
                let reply = control.handle_line(&line, now);
                let response = match reply.action {
                    ControlAction::Status => {
                        let ft = *frame_time.lock().expect("frame time poisoned");
                        format!(
                            "OK state={} second={} confidence={:.3}",
                            ft.state.as_str(),
                            ft.current_second,
                            ft.confidence
                        )
                    }
                    ControlAction::Apply(_, _) => {
                        let p = *control.params();
                        let _ = tick_param_tx.try_send(p);
                        let _ = sync_param_tx.try_send(p);
                        reply.response
                    }
                    ControlAction::None => reply.response,
                };
                bus.publish(Record::new(channels::RESP, response.clone()));
                let _ = response_tx.try_send(response);
            }
        }));
    }

    Ok(ThreadedPipeline {
        stop,
        control_tx,
        response_rx,
        bus,
        frame_time,
        handles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{SynthConfig, WwvSynthesizer};

    #[test]
    fn test_offline_pipeline_processes_framed_stream() {
        let mut synth = WwvSynthesizer::new(SynthConfig {
            snr_db: None,
            start_second: 5,
            ..Default::default()
        });
        let bytes = synth.generate_framed(3.0, 262_144);
        let mut pipeline = ReceiverPipeline::new(ReceiverConfig::default(), None).unwrap();
        let summary = pipeline
            .process_source(std::io::Cursor::new(bytes))
            .unwrap();
        assert!((summary.seconds_processed - 3.0).abs() < 0.1);
        assert!(
            summary.tick_events >= 2,
            "ticks {} in 3 s",
            summary.tick_events
        );
    }

    #[test]
    fn test_control_roundtrip_through_pipeline() {
        let mut pipeline = ReceiverPipeline::new(ReceiverConfig::default(), None).unwrap();
        let response = pipeline.handle_control("SET_TICK_THRESHOLD 3.0");
        assert_eq!(response, "OK threshold_mult=3.000");
        assert_eq!(pipeline.detectors().tick.params().threshold_mult, 3.0);
        let response = pipeline.handle_control("GET_TICK_THRESHOLD");
        assert_eq!(response, "OK threshold_mult=3.000");
        let status = pipeline.handle_control("STATUS");
        assert!(status.starts_with("OK state="), "{status}");
    }

    #[test]
    fn test_detector_stage_entry_locks() {
        let mut synth = WwvSynthesizer::new(SynthConfig {
            sample_rate: rates::DETECTOR,
            snr_db: Some(30.0),
            start_second: 56,
            ..Default::default()
        });
        let mut pipeline = ReceiverPipeline::new(ReceiverConfig::default(), None).unwrap();
        for _ in 0..10 {
            let chunk = synth.generate(1.0);
            pipeline.process_detector_samples(&chunk);
        }
        let ft = pipeline.frame_time();
        assert_eq!(ft.state, crate::events::SyncState::Locked, "{ft:?}");
    }

    #[test]
    fn test_threaded_pipeline_starts_and_stops() {
        let mut synth = WwvSynthesizer::new(SynthConfig {
            snr_db: None,
            ..Default::default()
        });
        let bytes = synth.generate_framed(1.0, 262_144);
        let handle = spawn_threaded(
            ReceiverConfig::default(),
            None,
            std::io::Cursor::new(bytes),
        )
        .unwrap();
        let sub = handle.bus.subscribe(1024);
        handle
            .control_tx
            .send("GET_TICK_THRESHOLD".into())
            .unwrap();
        let response = handle
            .response_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(response, "OK threshold_mult=2.000");
        std::thread::sleep(std::time::Duration::from_millis(300));
        handle.shutdown();
        // The run produced some telemetry
        let _ = sub.drain();
    }
}
