use anyhow::Result;
use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use crossbeam_channel::{ bounded, Receiver, Sender };
use std::{
    sync::{ atomic::{ AtomicBool, Ordering }, Arc, Mutex },
    thread::{ self, JoinHandle },
    time::{ Duration, Instant },
};

use crate::logger::Logger;
use crate::mods::song::{ MusicalPosition, SongLayout };
use crate::mods::spectrum::{ find_peaks, PeakParams, SpectrumAnalyzer };
use crate::mods::theory::{ pitch_class_for, ChordDictionary, ChordMatch, TieBreak };
use crate::{ audio_sink_thread, build_input_stream, decode, loopback, maybe_rate_supported, SharedBuf };

// ───────────────────────────────────────────────────────────────────────────────
// Transport clock shared between the host mode and the scheduler thread
// ───────────────────────────────────────────────────────────────────────────────
struct TransportInner {
    playing: bool,
    base_s: f32,
    resumed_at: Option<Instant>,
}

/// Playback clock. Pausing holds the position; the detector keeps its timer
/// and simply skips ticks while the transport is stopped.
pub struct Transport {
    inner: Mutex<TransportInner>,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TransportInner {
                playing: false,
                base_s: 0.0,
                resumed_at: None,
            }),
        }
    }

    pub fn play(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.playing {
            inner.playing = true;
            inner.resumed_at = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.playing {
            if let Some(at) = inner.resumed_at.take() {
                inner.base_s += at.elapsed().as_secs_f32();
            }
            inner.playing = false;
        }
    }

    pub fn seek(&self, time_s: f32) {
        let mut inner = self.inner.lock().unwrap();
        inner.base_s = time_s.max(0.0);
        if inner.playing {
            inner.resumed_at = Some(Instant::now());
        }
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().playing
    }

    pub fn position_s(&self) -> f32 {
        let inner = self.inner.lock().unwrap();
        match (inner.playing, inner.resumed_at) {
            (true, Some(at)) => inner.base_s + at.elapsed().as_secs_f32(),
            _ => inner.base_s,
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Detection pipeline: samples → spectrum → peaks → pitch classes → template
// ───────────────────────────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub window_size: usize,
    pub smoothing: f32,
    pub peaks: PeakParams,
    pub tick_ms: u64,
    pub min_matches: usize,
    pub tie_break: TieBreak,
    pub input_path: Option<String>,
    pub capture_sample_rate_hz: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 4096,
            smoothing: 0.8,
            peaks: PeakParams::default(),
            tick_ms: 1000,
            min_matches: 2,
            tie_break: TieBreak::DictionaryOrder,
            input_path: None,
            capture_sample_rate_hz: 48000,
        }
    }
}

impl DetectorConfig {
    pub fn from_cli(cli: &crate::Config) -> Self {
        Self {
            window_size: cli.window_size,
            smoothing: cli.smoothing,
            peaks: PeakParams {
                band_low_hz: cli.band_low_hz,
                band_high_hz: cli.band_high_hz,
                threshold_db: cli.peak_threshold_db,
                max_peaks: cli.max_peaks,
            },
            tick_ms: cli.tick_ms,
            min_matches: cli.min_matches,
            tie_break: cli.tie_break,
            input_path: if cli.input_path.is_empty() {
                None
            } else {
                Some(cli.input_path.clone())
            },
            capture_sample_rate_hz: cli.mic_sample_rate_hz,
        }
    }
}

/// One tick's worth of analysis, independent of where the samples came from.
/// Offline mode drives this directly; the live scheduler wraps it.
pub struct DetectionPipeline {
    analyzer: SpectrumAnalyzer,
    peaks: PeakParams,
    dictionary: ChordDictionary,
    previous: Option<String>,
}

impl DetectionPipeline {
    pub fn new(sample_rate: f32, cfg: &DetectorConfig) -> Self {
        Self {
            analyzer: SpectrumAnalyzer::new(sample_rate, cfg.window_size, cfg.smoothing),
            peaks: cfg.peaks.clone(),
            dictionary: ChordDictionary::diatonic_default(cfg.min_matches, cfg.tie_break),
            previous: None,
        }
    }

    pub fn window_size(&self) -> usize {
        self.analyzer.window_size()
    }

    pub fn reset(&mut self) {
        self.analyzer.reset();
        self.previous = None;
    }

    /// None means "nothing to report this tick": not enough samples, not
    /// enough peaks, or no template reached the match floor.
    pub fn analyze(&mut self, samples: &[f32]) -> Option<ChordMatch> {
        let bin_hz = self.analyzer.bin_hz();
        let spectrum = self.analyzer.process(samples)?;
        let freqs = find_peaks(spectrum, bin_hz, &self.peaks);
        if freqs.len() < 2 {
            return None;
        }

        let mut classes: Vec<&'static str> = Vec::with_capacity(freqs.len());
        for f in freqs {
            if let Some(class) = pitch_class_for(f) {
                classes.push(class);
            }
        }

        let best = self.dictionary.best_match(&classes, self.previous.as_deref());
        if let Some(ref m) = best {
            self.previous = Some(m.label.clone());
        }
        best
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Source acquisition: file track → system loopback → microphone
// ───────────────────────────────────────────────────────────────────────────────
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    FileTrack,
    SystemLoopback,
    Microphone,
}

impl SourceKind {
    fn describe(&self) -> &'static str {
        match self {
            SourceKind::FileTrack => "file track",
            SourceKind::SystemLoopback => "system loopback",
            SourceKind::Microphone => "microphone",
        }
    }
}

/// A bound audio source feeding the shared ring. Every source owns its own
/// stop token, independent of the scheduler's flag: dropping the source sets
/// the token, drops the capture stream, and joins every thread it spawned,
/// so no producer from a previous bind can outlive a rebind.
struct ActiveSource {
    kind: SourceKind,
    sample_rate: f32,
    shared: SharedBuf,
    degraded: bool,
    stop: Arc<AtomicBool>,
    stream: Option<cpal::Stream>,
    threads: Vec<JoinHandle<()>>,
    logger: Arc<Logger>,
}

impl Drop for ActiveSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // ending the capture stream disconnects its sender, which in turn
        // unblocks the sink thread
        self.stream = None;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                let _ = self.logger.error(
                    &format!(
                        "{} source thread panicked during release; audio graph may be leaked",
                        self.kind.describe()
                    )
                );
            }
        }
    }
}

/// Wires a decoded track into a fresh ring: a sink thread drains the channel
/// and a feeder paces chunks in real time, as playback would. The feeder
/// polls the source token in short slices so release never waits a full tick.
fn bind_track_source(audio: decode::AudioData, tick_ms: u64, logger: Arc<Logger>) -> ActiveSource {
    let sr = audio.sr as f32;
    let stop = Arc::new(AtomicBool::new(false));
    let shared = SharedBuf::with_rate(sr);
    let (tx, rx) = bounded::<Vec<f32>>(8);
    let sink = {
        let shared_clone = shared.clone();
        thread::spawn(move || audio_sink_thread(rx, shared_clone))
    };

    let chunk = (((sr as usize) * (tick_ms as usize)) / 1000).max(1);
    let feeder_stop = stop.clone();
    let feeder = thread::spawn(move || {
        let mut next = Instant::now();
        for block in audio.samples.chunks(chunk) {
            if feeder_stop.load(Ordering::SeqCst) {
                break;
            }
            if tx.send(block.to_vec()).is_err() {
                break;
            }
            next += Duration::from_millis(tick_ms);
            let now = Instant::now();
            if next > now {
                sleep_until(next, &feeder_stop);
            } else {
                next = now;
            }
        }
    });

    ActiveSource {
        kind: SourceKind::FileTrack,
        sample_rate: sr,
        shared,
        degraded: false,
        stop,
        stream: None,
        threads: vec![feeder, sink],
        logger,
    }
}

fn acquire_file_track(path: &str, tick_ms: u64, logger: Arc<Logger>) -> Result<ActiveSource> {
    let audio = decode::load_track(path)?;
    let _ = logger.info(
        &format!(
            "decoded {}: sr={} Hz, channels={}, samples={}",
            path,
            audio.sr,
            audio.channels,
            audio.samples.len()
        )
    );
    Ok(bind_track_source(audio, tick_ms, logger))
}

fn acquire_loopback(
    target_sr: u32,
    tick_ms: u64,
    logger: Arc<Logger>
) -> Result<ActiveSource> {
    let stop = Arc::new(AtomicBool::new(false));
    let (rx, capture) = loopback::start(target_sr, logger.clone(), tick_ms, stop.clone())?;
    let shared = SharedBuf::with_rate(target_sr as f32);
    let sink = {
        let shared_clone = shared.clone();
        thread::spawn(move || audio_sink_thread(rx, shared_clone))
    };
    Ok(ActiveSource {
        kind: SourceKind::SystemLoopback,
        sample_rate: target_sr as f32,
        shared,
        degraded: false,
        stop,
        stream: None,
        threads: vec![capture, sink],
        logger,
    })
}

fn acquire_microphone(want_sr: u32, logger: Arc<Logger>) -> Result<ActiveSource> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow::anyhow!("no default input device (microphone) found"))?;
    let mut config = device.default_input_config()?.config();
    if let Some(sr) = maybe_rate_supported(&device, want_sr) {
        config.sample_rate.0 = sr;
    }
    let sr = config.sample_rate.0 as f32;
    let channels = config.channels.max(1) as usize;

    let _ = logger.info(
        &format!(
            "mic device: {} ({} Hz, {} ch)",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels
        )
    );

    let shared = SharedBuf::with_rate(sr);
    let (tx, rx) = bounded::<Vec<f32>>(8);
    let stream = build_input_stream(&device, &config, channels, tx, logger.clone())?;
    stream.play()?;
    let sink = {
        let shared_clone = shared.clone();
        thread::spawn(move || audio_sink_thread(rx, shared_clone))
    };

    Ok(ActiveSource {
        kind: SourceKind::Microphone,
        sample_rate: sr,
        shared,
        degraded: false,
        stop: Arc::new(AtomicBool::new(false)),
        stream: Some(stream),
        threads: vec![sink],
        logger,
    })
}

/// Walk the ordered strategy list. Ok(None) means stop was requested while
/// acquiring; Err means every leg failed, a recoverable "no audio access"
/// condition for the caller.
fn acquire_source(
    cfg: &DetectorConfig,
    stop: &Arc<AtomicBool>,
    logger: &Arc<Logger>
) -> Result<Option<ActiveSource>> {
    let mut legs: Vec<SourceKind> = Vec::new();
    if cfg.input_path.is_some() {
        legs.push(SourceKind::FileTrack);
    }
    legs.push(SourceKind::SystemLoopback);
    legs.push(SourceKind::Microphone);

    let mut last_err: Option<anyhow::Error> = None;
    for (leg, kind) in legs.iter().enumerate() {
        if stop.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let attempt = match kind {
            SourceKind::FileTrack =>
                acquire_file_track(
                    cfg.input_path.as_deref().unwrap_or_default(),
                    cfg.tick_ms,
                    logger.clone()
                ),
            SourceKind::SystemLoopback =>
                acquire_loopback(cfg.capture_sample_rate_hz, cfg.tick_ms, logger.clone()),
            SourceKind::Microphone =>
                acquire_microphone(cfg.capture_sample_rate_hz, logger.clone()),
        };
        match attempt {
            Ok(mut src) => {
                src.degraded = leg > 0;
                return Ok(Some(src));
            }
            Err(e) => {
                let _ = logger.warn(&format!("{} unavailable: {}", kind.describe(), e));
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no audio sources configured")))
}

// ───────────────────────────────────────────────────────────────────────────────
// Detector: Idle → Acquiring → Active → Idle
// ───────────────────────────────────────────────────────────────────────────────
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Acquiring,
    Active,
}

#[derive(Clone, Debug)]
pub struct DetectionEvent {
    pub chord: String,
    pub confidence: f32,
    pub position: MusicalPosition,
    pub timestamp_s: f32,
}

pub struct Detector {
    state: Arc<Mutex<DetectorState>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    logger: Arc<Logger>,
}

impl Detector {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DetectorState::Idle)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            logger,
        }
    }

    pub fn state(&self) -> DetectorState {
        *self.state.lock().unwrap()
    }

    /// Bind a source and start ticking. A running detector is stopped first
    /// so the previous audio graph is fully released before rebinding.
    pub fn start(
        &mut self,
        cfg: DetectorConfig,
        layout: SongLayout,
        transport: Arc<Transport>,
        auto_enabled: Arc<AtomicBool>
    ) -> Receiver<DetectionEvent> {
        if self.worker.is_some() {
            self.stop();
        }
        self.stop.store(false, Ordering::SeqCst);
        *self.state.lock().unwrap() = DetectorState::Acquiring;

        let (tx, rx) = bounded::<DetectionEvent>(32);
        let state = self.state.clone();
        let stop = self.stop.clone();
        let logger = self.logger.clone();

        self.worker = Some(
            thread::spawn(move || {
                worker_loop(cfg, layout, transport, auto_enabled, stop, state, tx, logger);
            })
        );

        rx
    }

    /// Idempotent: stopping an idle detector is a no-op. No event is
    /// delivered after this returns.
    pub fn stop(&mut self) {
        let worker = match self.worker.take() {
            Some(w) => w,
            None => {
                return;
            }
        };
        self.stop.store(true, Ordering::SeqCst);
        if worker.join().is_err() {
            // a panicked scheduler is a bug in this crate, not a permission problem
            let _ = self.logger.error("detection scheduler thread panicked during stop");
        }
        *self.state.lock().unwrap() = DetectorState::Idle;
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_until(deadline: Instant, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

fn worker_loop(
    cfg: DetectorConfig,
    layout: SongLayout,
    transport: Arc<Transport>,
    auto_enabled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<DetectorState>>,
    tx: Sender<DetectionEvent>,
    logger: Arc<Logger>
) {
    let source = match acquire_source(&cfg, &stop, &logger) {
        Ok(Some(src)) => src,
        Ok(None) => {
            *state.lock().unwrap() = DetectorState::Idle;
            return;
        }
        Err(e) => {
            let _ = logger.warn(&format!("no audio access, detection unavailable: {}", e));
            *state.lock().unwrap() = DetectorState::Idle;
            return;
        }
    };

    if source.degraded {
        let _ = logger.warn(
            &format!("preferred source unavailable, running degraded on {}", source.kind.describe())
        );
    }
    let _ = logger.info(
        &format!("detection active on {} at {:.0} Hz", source.kind.describe(), source.sample_rate)
    );
    *state.lock().unwrap() = DetectorState::Active;

    let mut pipeline = DetectionPipeline::new(source.sample_rate, &cfg);

    let mut next = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        next += Duration::from_millis(cfg.tick_ms);

        // gate, don't tear down: a paused transport or disabled detection
        // leaves the timer and the source untouched
        if transport.is_playing() && auto_enabled.load(Ordering::SeqCst) {
            let timestamp_s = transport.position_s();
            if let Some(position) = layout.resolve_position(timestamp_s) {
                if let Some(frame) = source.shared.tail(pipeline.window_size()) {
                    if let Some(m) = pipeline.analyze(&frame) {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let event = DetectionEvent {
                            chord: m.label,
                            confidence: m.confidence,
                            position,
                            timestamp_s,
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
        }

        let now = Instant::now();
        if next > now {
            sleep_until(next, &stop);
        } else {
            next = now;
        }
    }

    // release the audio graph before reporting Idle, so a rebind that joins
    // this thread never races a still-running producer
    drop(source);
    *state.lock().unwrap() = DetectorState::Idle;
    let _ = logger.info("detection stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_logger() -> Arc<Logger> {
        Arc::new(Logger::new("unused.log", false).unwrap())
    }

    fn triad_frame(freqs: &[f32], sr: f32, n: usize) -> Vec<f32> {
        let mut samples = vec![0.0f32; n];
        for f in freqs {
            for (i, s) in samples.iter_mut().enumerate() {
                *s += 0.03 * (2.0 * std::f32::consts::PI * f * (i as f32) / sr).sin();
            }
        }
        samples
    }

    #[test]
    fn transport_holds_position_while_paused() {
        let t = Transport::new();
        assert!(!t.is_playing());
        t.seek(5.0);
        assert_eq!(t.position_s(), 5.0);
        t.play();
        assert!(t.is_playing());
        t.pause();
        let held = t.position_s();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(t.position_s(), held);
    }

    #[test]
    fn pipeline_detects_a_c_major_triad() {
        let sr = 44100.0;
        let mut pipeline = DetectionPipeline::new(sr, &DetectorConfig::default());
        let frame = triad_frame(&[261.63, 329.63, 392.0], sr, 4096);
        let m = pipeline.analyze(&frame).unwrap();
        assert_eq!(m.label, "C");
        assert_eq!(m.matches, 3);
    }

    #[test]
    fn pipeline_skips_single_tones() {
        let sr = 44100.0;
        let mut pipeline = DetectionPipeline::new(sr, &DetectorConfig::default());
        let frame = triad_frame(&[440.0], sr, 4096);
        assert!(pipeline.analyze(&frame).is_none());
    }

    #[test]
    fn pipeline_skips_short_frames() {
        let sr = 44100.0;
        let mut pipeline = DetectionPipeline::new(sr, &DetectorConfig::default());
        assert!(pipeline.analyze(&vec![0.0; 1024]).is_none());
    }

    #[test]
    fn silence_produces_no_detection() {
        let sr = 44100.0;
        let mut pipeline = DetectionPipeline::new(sr, &DetectorConfig::default());
        assert!(pipeline.analyze(&vec![0.0; 4096]).is_none());
    }

    fn tone_track(sr: u32, len: usize) -> decode::AudioData {
        decode::AudioData {
            sr,
            channels: 1,
            samples: vec![0.25; len],
        }
    }

    #[test]
    fn dropping_a_track_source_stops_its_feeder() {
        let source = bind_track_source(tone_track(1000, 20_000), 10, quiet_logger());
        thread::sleep(Duration::from_millis(80));
        assert!(source.shared.buf.lock().unwrap().len() > 0);

        let ring = source.shared.clone();
        drop(source); // joins the feeder and the sink
        let settled = ring.buf.lock().unwrap().len();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(ring.buf.lock().unwrap().len(), settled);
    }

    #[test]
    fn rebinding_does_not_revive_the_previous_feeder() {
        let logger = quiet_logger();

        let old = bind_track_source(tone_track(1000, 20_000), 10, logger.clone());
        thread::sleep(Duration::from_millis(50));
        let old_ring = old.shared.clone();
        drop(old);
        let settled = old_ring.buf.lock().unwrap().len();

        // the new source carries its own stop token; the old ring stays frozen
        let new = bind_track_source(tone_track(1000, 20_000), 10, logger);
        thread::sleep(Duration::from_millis(80));
        assert!(new.shared.buf.lock().unwrap().len() > 0);
        assert_eq!(old_ring.buf.lock().unwrap().len(), settled);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut d = Detector::new(quiet_logger());
        assert_eq!(d.state(), DetectorState::Idle);
        d.stop();
        d.stop();
        assert_eq!(d.state(), DetectorState::Idle);
    }

    #[test]
    fn stop_is_idempotent_and_silences_events() {
        use crate::mods::song::Section;

        let logger = quiet_logger();
        let layout = SongLayout::new(
            120.0,
            "4/4",
            vec![Section {
                name: "A".to_string(),
                start_s: 0.0,
                end_s: 60.0,
                bar_count: 8,
                row_count: 1,
            }],
            &logger
        );
        let transport = Arc::new(Transport::new()); // never played
        let auto = Arc::new(AtomicBool::new(true));

        let mut d = Detector::new(logger);
        let cfg = DetectorConfig {
            input_path: Some("does-not-exist.wav".to_string()),
            tick_ms: 20,
            ..DetectorConfig::default()
        };
        let rx = d.start(cfg, layout, transport, auto);

        // the transport is paused, so no event may arrive regardless of
        // whether any acquisition leg succeeded on this machine
        match rx.recv_timeout(Duration::from_millis(200)) {
            Err(_) => {}
            Ok(ev) => panic!("unexpected event while paused: {:?}", ev),
        }

        d.stop();
        assert_eq!(d.state(), DetectorState::Idle);
        d.stop();
        assert_eq!(d.state(), DetectorState::Idle);

        // sender is gone after stop; nothing can be delivered late
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
