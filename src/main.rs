//! src/main.rs

use anyhow::Result;
use cpal::traits::DeviceTrait;
use crossbeam_channel::Receiver;
use std::{
    env,
    sync::{ Arc, Mutex },
};

mod logger;
use logger::Logger;

use crate::logger::LogLevel;
use crate::mods::theory::TieBreak;

// engine modules in src/mods/
mod mods;

// ───────────────────────────────────────────────────────────────────────────────
// CLI config + parsing
// ───────────────────────────────────────────────────────────────────────────────
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Live,
    Offline,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,

    // analysis parameters
    pub window_size: usize,
    pub smoothing: f32,
    pub peak_threshold_db: f32,
    pub band_low_hz: f32,
    pub band_high_hz: f32,
    pub max_peaks: usize,
    pub tick_ms: u64,
    pub min_matches: usize,
    pub tie_break: TieBreak,

    // song layout
    pub tempo: f32,
    pub time_signature: String,
    pub key: String,

    // paths
    pub layout_path: String,
    pub input_path: String,
    pub grid_path: String,
    pub log_path: String,

    // behavior
    pub auto_insert: bool,
    pub mic_sample_rate_hz: u32,

    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        let default_log = env
            ::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join("Detection.log")
            .to_string_lossy()
            .into_owned();

        Self {
            mode: Mode::Live,

            window_size: 4096,
            smoothing: 0.8,
            peak_threshold_db: -50.0,
            band_low_hz: 80.0,
            band_high_hz: 2000.0,
            max_peaks: 6,
            tick_ms: 1000,
            min_matches: 2,
            tie_break: TieBreak::DictionaryOrder,

            tempo: 120.0,
            time_signature: String::from("4/4"),
            key: String::new(),

            layout_path: String::new(),
            input_path: String::new(),
            grid_path: String::from("ChordGrid.csv"),
            log_path: default_log,

            auto_insert: true,
            mic_sample_rate_hz: 48000,

            log_level: LogLevel::Info,
        }
    }
}

fn print_usage(cfg: &Config) {
    println!("Usage: chordtrack [OPTIONS]\n");
    println!("General paths:");
    println!("  --layout-path <PATH>          Section layout CSV: name,start,end,bars,rows (required)");
    println!("  --grid-path <PATH>            Chord grid CSV output (default: {})", cfg.grid_path);
    println!("  --log-path <PATH>             Path to Detection.log (default: {})", cfg.log_path);
    println!(
        "  --log-level <LEVEL>           Log level: debug, info, warning, error (default: info)"
    );
    println!();
    println!("Modes:");
    println!("  --mode live           (default) Detect chords from a live source, tick by tick");
    println!("  --mode offline        Walk a local audio file against the layout (no playback)\n");
    println!("Song options:");
    println!("  --tempo <BPM>                 Song tempo in beats per minute (default: {:.0})", cfg.tempo);
    println!(
        "  --time-signature <N/M>        Time signature; only the numerator is used (default: {})",
        cfg.time_signature
    );
    println!("  --key <KEY>                   Song key for chord suggestions (optional)");
    println!();
    println!("Detection options:");
    println!(
        "  --window-size <N>             FFT window in samples (default: {})",
        cfg.window_size
    );
    println!(
        "  --smoothing <FRAC>            Spectrum smoothing constant [0..1) (default: {:.1})",
        cfg.smoothing
    );
    println!(
        "  --peak-threshold-db <DB>      Minimum peak level in dBFS (default: {:.0})",
        cfg.peak_threshold_db
    );
    println!(
        "  --band-low-hz <HZ>            Lower analysis band edge (default: {:.0})",
        cfg.band_low_hz
    );
    println!(
        "  --band-high-hz <HZ>           Upper analysis band edge (default: {:.0})",
        cfg.band_high_hz
    );
    println!("  --max-peaks <N>               Peaks kept per tick (default: {})", cfg.max_peaks);
    println!("  -tm, --tick-ms <MS>           Detection tick in ms (default: {})", cfg.tick_ms);
    println!(
        "  --min-matches <N>             Template notes required for a match (default: {})",
        cfg.min_matches
    );
    println!(
        "  --tie-break <POLICY>          dictionary | previous (default: dictionary)"
    );
    println!();
    println!("Source options:");
    println!("  --input <PATH>                Audio file (.wav/.mp3/.mp4/.m4a); first source tried in live mode, required in offline mode");
    println!(
        "  --sample-rate, --sr <HZ>      Preferred capture sample rate (default: {})",
        cfg.mic_sample_rate_hz
    );
    println!("  --no-auto-insert              Log detections as suggestions instead of filling the grid");
    println!("\nExamples:");
    println!("  chordtrack --layout-path song.csv --tempo 72 --time-signature 4/4");
    println!("  chordtrack --mode offline --layout-path song.csv --input track.mp3 --tempo 120");
    println!("  chordtrack --layout-path song.csv --key C --no-auto-insert");
}

fn parse_arguments() -> std::result::Result<Config, String> {
    let args: Vec<String> = env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--mode" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --mode".to_string());
                }
                match args[i + 1].to_lowercase().as_str() {
                    "live" => {
                        config.mode = Mode::Live;
                    }
                    "offline" => {
                        config.mode = Mode::Offline;
                    }
                    other => {
                        return Err(format!("Unknown mode: {}", other));
                    }
                }
                i += 2;
            }
            "--layout-path" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --layout-path".to_string());
                }
                config.layout_path = args[i + 1].to_string();
                i += 2;
            }
            "--grid-path" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --grid-path".to_string());
                }
                config.grid_path = args[i + 1].to_string();
                i += 2;
            }
            "--log-path" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --log-path".to_string());
                }
                config.log_path = args[i + 1].to_string();
                i += 2;
            }
            "--log-level" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --log-level".to_string());
                }
                match args[i + 1].to_lowercase().as_str() {
                    "debug" => {
                        config.log_level = LogLevel::Debug;
                    }
                    "info" => {
                        config.log_level = LogLevel::Info;
                    }
                    "warning" | "warn" => {
                        config.log_level = LogLevel::Warning;
                    }
                    "error" => {
                        config.log_level = LogLevel::Error;
                    }
                    other => {
                        return Err(
                            format!("Invalid log level: {}. Valid options: debug, info, warning, error", other)
                        );
                    }
                }
                i += 2;
            }
            "--tempo" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --tempo".to_string());
                }
                let v: f32 = args[i + 1].parse().map_err(|_| "Invalid tempo value".to_string())?;
                if v <= 0.0 {
                    return Err("tempo must be > 0".to_string());
                }
                config.tempo = v;
                i += 2;
            }
            "--time-signature" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --time-signature".to_string());
                }
                config.time_signature = args[i + 1].to_string();
                i += 2;
            }
            "--key" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --key".to_string());
                }
                config.key = args[i + 1].to_string();
                i += 2;
            }
            "--window-size" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --window-size".to_string());
                }
                let v: usize = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid window-size value".to_string())?;
                if v < 256 || !v.is_power_of_two() {
                    return Err("window-size must be a power of two >= 256".to_string());
                }
                config.window_size = v;
                i += 2;
            }
            "--smoothing" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --smoothing".to_string());
                }
                let v: f32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid smoothing value".to_string())?;
                config.smoothing = v.clamp(0.0, 0.99);
                i += 2;
            }
            "--peak-threshold-db" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --peak-threshold-db".to_string());
                }
                config.peak_threshold_db = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid peak-threshold-db value".to_string())?;
                i += 2;
            }
            "--band-low-hz" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --band-low-hz".to_string());
                }
                config.band_low_hz = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid band-low-hz value".to_string())?;
                i += 2;
            }
            "--band-high-hz" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --band-high-hz".to_string());
                }
                config.band_high_hz = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid band-high-hz value".to_string())?;
                i += 2;
            }
            "--max-peaks" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --max-peaks".to_string());
                }
                let v: usize = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid max-peaks value".to_string())?;
                config.max_peaks = v.max(1);
                i += 2;
            }
            "-tm" | "--tick-ms" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for tick-ms".to_string());
                }
                let v: u64 = args[i + 1].parse().map_err(|_| "Invalid tick-ms value".to_string())?;
                config.tick_ms = v.max(1);
                i += 2;
            }
            "--min-matches" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --min-matches".to_string());
                }
                let v: usize = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid min-matches value".to_string())?;
                config.min_matches = v.max(1);
                i += 2;
            }
            "--tie-break" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --tie-break".to_string());
                }
                match args[i + 1].to_lowercase().as_str() {
                    "dictionary" => {
                        config.tie_break = TieBreak::DictionaryOrder;
                    }
                    "previous" => {
                        config.tie_break = TieBreak::PreferPrevious;
                    }
                    other => {
                        return Err(
                            format!("Invalid tie-break: {}. Valid options: dictionary, previous", other)
                        );
                    }
                }
                i += 2;
            }
            "--input" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --input".to_string());
                }
                config.input_path = args[i + 1].to_string();
                i += 2;
            }
            "--sample-rate" | "--sr" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --sample-rate/--sr".to_string());
                }
                let v: u32 = args[i + 1].parse().map_err(|_| "Invalid sample rate".to_string())?;
                if v == 0 {
                    return Err("sample rate must be > 0".to_string());
                }
                config.mic_sample_rate_hz = v;
                i += 2;
            }
            "--no-auto-insert" => {
                config.auto_insert = false;
                i += 1;
            }
            "-h" | "--help" => {
                print_usage(&Config::default());
                std::process::exit(0);
            }
            _ => {
                return Err(format!("Unknown option: {}", args[i]));
            }
        }
    }

    Ok(config)
}

// ───────────────────────────────────────────────────────────────────────────────
// Windows WASAPI loopback (system audio capture)
// ───────────────────────────────────────────────────────────────────────────────
#[cfg(target_os = "windows")]
pub mod loopback {
    use super::Logger;
    use anyhow::Context;
    use crossbeam_channel::{ bounded, Receiver, Sender };
    use std::{
        sync::{ atomic::{ AtomicBool, Ordering }, Arc },
        thread::{ self, JoinHandle },
        time::Duration,
    };
    use windows::{
        core::GUID,
        Win32::{
            Media::Audio::{
                eConsole,
                eRender,
                IAudioCaptureClient,
                IAudioClient,
                IMMDevice,
                IMMDeviceEnumerator,
                AUDCLNT_BUFFERFLAGS_SILENT,
                AUDCLNT_SHAREMODE_SHARED,
                AUDCLNT_STREAMFLAGS_LOOPBACK,
                WAVEFORMATEX,
                WAVEFORMATEXTENSIBLE,
                MMDeviceEnumerator,
            },
            System::Com::{
                CoCreateInstance,
                CoInitializeEx,
                CoTaskMemFree,
                CoUninitialize,
                CLSCTX_ALL,
                COINIT_MULTITHREADED,
            },
        },
    };

    const WAVE_FORMAT_IEEE_FLOAT_TAG: u16 = 0x0003;
    const WAVE_FORMAT_EXTENSIBLE_TAG: u16 = 0xfffe;

    const KSDATAFORMAT_SUBTYPE_IEEE_FLOAT: GUID =
        GUID::from_u128(0x00000003_0000_0010_8000_00aa00389b71);

    /// Spawns the WASAPI capture thread. The thread exits when `stop` is set
    /// or when the receiver side disconnects; the returned handle lets the
    /// owner join it on release.
    pub fn start(
        target_sr: u32,
        logger: Arc<Logger>,
        tick_ms: u64,
        stop: Arc<AtomicBool>
    ) -> anyhow::Result<(Receiver<Vec<f32>>, JoinHandle<()>)> {
        let (tx, rx) = bounded::<Vec<f32>>(8);

        let err_logger = logger.clone();
        let worker = thread::spawn(move || {
            if let Err(e) = capture_thread(target_sr, tx, logger, tick_ms, stop) {
                let _ = err_logger.error(&format!("loopback capture thread error: {:?}", e));
            }
        });

        Ok((rx, worker))
    }

    fn capture_thread(
        target_sr: u32,
        tx: Sender<Vec<f32>>,
        logger: Arc<Logger>,
        tick_ms: u64,
        stop: Arc<AtomicBool>
    ) -> anyhow::Result<()> {
        unsafe {
            CoInitializeEx(None, COINIT_MULTITHREADED).ok()?;

            let enumerator: IMMDeviceEnumerator = CoCreateInstance(
                &MMDeviceEnumerator,
                None,
                CLSCTX_ALL
            )?;
            let device: IMMDevice = enumerator
                .GetDefaultAudioEndpoint(eRender, eConsole)
                .context("GetDefaultAudioEndpoint failed")?;
            let audio_client: IAudioClient = device
                .Activate::<IAudioClient>(CLSCTX_ALL, None)
                .context("Activate IAudioClient failed")?;

            let pwfx: *mut WAVEFORMATEX = audio_client.GetMixFormat()?;
            let mix = *pwfx;
            let channels = mix.nChannels.max(1) as usize;
            let is_float = {
                let tag = mix.wFormatTag;
                if tag == WAVE_FORMAT_EXTENSIBLE_TAG {
                    let wfxe = &*(pwfx as *const WAVEFORMATEXTENSIBLE);
                    wfxe.SubFormat == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT
                } else {
                    tag == WAVE_FORMAT_IEEE_FLOAT_TAG
                }
            };

            let _ = logger.info(
                &format!(
                    "loopback mix format: {} Hz, channels {}, {}",
                    mix.nSamplesPerSec,
                    channels,
                    if is_float {
                        "Float32"
                    } else {
                        "PCM"
                    }
                )
            )?;

            let hns_buffer_duration: i64 = 10_000_000 / 10; // 100ms

            audio_client.Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                AUDCLNT_STREAMFLAGS_LOOPBACK,
                hns_buffer_duration,
                0,
                pwfx,
                None
            )?;
            CoTaskMemFree(Some(pwfx as *const _ as _));

            let capture: IAudioCaptureClient = audio_client.GetService()?;
            audio_client.Start()?;

            let mut leftover: Vec<f32> = Vec::new();

            loop {
                if stop.load(Ordering::SeqCst) {
                    audio_client.Stop()?;
                    CoUninitialize();
                    return Ok(());
                }

                let mut p_data: *mut u8 = std::ptr::null_mut();
                let mut num_frames: u32 = 0;
                let mut flags: u32 = 0;
                let hr = capture.GetBuffer(&mut p_data, &mut num_frames, &mut flags, None, None);

                if hr.is_ok() && num_frames > 0 {
                    let frames = num_frames as usize;
                    let mut mono = Vec::with_capacity(frames);

                    if (flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32)) != 0 {
                        mono.resize(frames, 0.0);
                    } else if is_float {
                        let slice = std::slice::from_raw_parts(
                            p_data as *const f32,
                            frames * channels
                        );
                        for f in 0..frames {
                            // average all channels into a mono frame
                            let mut acc = 0.0f32;
                            for ch in 0..channels {
                                acc += slice[f * channels + ch];
                            }
                            mono.push(acc / (channels as f32));
                        }
                    } else {
                        let slice = std::slice::from_raw_parts(
                            p_data as *const i16,
                            frames * channels
                        );
                        for f in 0..frames {
                            let mut acc = 0.0f32;
                            for ch in 0..channels {
                                acc += (slice[f * channels + ch] as f32) / 32768.0;
                            }
                            mono.push(acc / (channels as f32));
                        }
                    }

                    capture.ReleaseBuffer(num_frames)?;

                    leftover.extend_from_slice(&mono);
                    let mut chunk = ((target_sr as usize) * (tick_ms as usize)) / 1000;
                    if chunk == 0 {
                        chunk = 1;
                    }
                    while leftover.len() >= chunk {
                        let out = leftover.drain(0..chunk).collect::<Vec<f32>>();
                        if tx.send(out).is_err() {
                            audio_client.Stop()?;
                            CoUninitialize();
                            return Ok(());
                        }
                    }
                } else {
                    thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }
}

#[cfg(not(target_os = "windows"))]
pub mod loopback {
    use anyhow::Result;
    use crossbeam_channel::Receiver;
    use std::{ sync::{ atomic::AtomicBool, Arc }, thread::JoinHandle };
    use super::Logger;

    pub fn start(
        _target_sr: u32,
        _logger: Arc<Logger>,
        _tick_ms: u64,
        _stop: Arc<AtomicBool>
    ) -> Result<(Receiver<Vec<f32>>, JoinHandle<()>)> {
        anyhow::bail!("system audio loopback is only available on Windows")
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Shared ring buffer (live sources append, the detector reads the tail)
// ───────────────────────────────────────────────────────────────────────────────
#[derive(Clone)]
pub struct SharedBuf {
    pub buf: Arc<Mutex<Vec<f32>>>, // mono ring buffer
    pub sr: Arc<Mutex<f32>>,
}

impl SharedBuf {
    pub fn with_rate(sr: f32) -> Self {
        SharedBuf {
            buf: Arc::new(Mutex::new(Vec::with_capacity((sr as usize) * 10))),
            sr: Arc::new(Mutex::new(sr)),
        }
    }

    /// Copy of the newest `len` samples, or None while the ring is still filling.
    pub fn tail(&self, len: usize) -> Option<Vec<f32>> {
        let b = self.buf.lock().unwrap();
        if b.len() < len {
            None
        } else {
            Some(b[b.len() - len..].to_vec())
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Decoder for WAV/MP3/MP4 (AAC) using symphonia (file source + offline mode)
// ───────────────────────────────────────────────────────────────────────────────
pub mod decode {
    use std::{ fs::File, path::Path };
    use symphonia::core::{
        audio::SampleBuffer,
        codecs::DecoderOptions,
        errors::Error,
        formats::FormatOptions,
        io::MediaSourceStream,
        meta::MetadataOptions,
        probe::Hint,
    };
    use symphonia::default::{ get_codecs, get_probe };

    #[derive(Debug)]
    pub struct AudioData {
        pub sr: u32,
        pub channels: u16,
        pub samples: Vec<f32>, // channel-averaged mono
    }

    pub fn load_track<P: AsRef<Path>>(path: P) -> anyhow::Result<AudioData> {
        let path_ref = path.as_ref();

        let file = File::open(path_ref)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path_ref.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default()
        )?;
        let mut format = probed.format;

        let (track_id, codec_params) = {
            let track = format
                .default_track()
                .ok_or_else(|| anyhow::anyhow!("no default audio track found"))?;
            (track.id, track.codec_params.clone())
        };

        let mut decoder = get_codecs().make(&codec_params, &DecoderOptions::default())?;

        let sr = codec_params.sample_rate.ok_or_else(|| anyhow::anyhow!("unknown sample rate"))?;
        let channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(1u16);

        let mut sample_buf: Option<SampleBuffer<f32>> = None;
        let mut mono = Vec::<f32>::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(Error::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(err) => {
                    return Err(err.into());
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::DecodeError(_)) => {
                    continue;
                }
                Err(err) => {
                    return Err(err.into());
                }
            };

            let spec = *decoded.spec();
            let chan_count = spec.channels.count();

            if
                sample_buf
                    .as_ref()
                    .map(|b| b.capacity() < decoded.capacity())
                    .unwrap_or(true)
            {
                sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            }
            let buf = sample_buf.as_mut().unwrap();

            buf.copy_interleaved_ref(decoded);
            let samples = buf.samples();

            for frame in samples.chunks_exact(chan_count) {
                let sum: f32 = frame.iter().sum();
                mono.push(sum / (chan_count as f32));
            }
        }

        Ok(AudioData { sr, channels, samples: mono })
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Shared helpers used by live sources
// ───────────────────────────────────────────────────────────────────────────────
pub fn audio_sink_thread(rx: Receiver<Vec<f32>>, shared: SharedBuf) {
    loop {
        match rx.recv() {
            Ok(block) => {
                let mut ring = shared.buf.lock().unwrap();
                ring.extend_from_slice(&block);
                let cap = (*shared.sr.lock().unwrap() as usize) * 10;
                if ring.len() > cap {
                    let drop = ring.len() - cap;
                    ring.drain(0..drop);
                }
            }
            Err(_) => {
                break;
            }
        }
    }
}

pub fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    tx: crossbeam_channel::Sender<Vec<f32>>,
    logger: Arc<Logger>
) -> Result<cpal::Stream> {
    let err_logger = logger.clone();
    let err_fn = move |e| {
        let _ = err_logger.error(&format!("audio stream error: {}", e));
    };

    match device.default_input_config()?.sample_format() {
        cpal::SampleFormat::F32 => {
            let tx = tx.clone();
            Ok(
                device.build_input_stream(
                    config,
                    move |data: &[f32], _| on_audio_input_mixdown(data, channels, &tx),
                    err_fn,
                    None
                )?
            )
        }
        cpal::SampleFormat::I16 => {
            let tx = tx.clone();
            Ok(
                device.build_input_stream(
                    config,
                    move |data: &[i16], _| {
                        let mut tmp = Vec::with_capacity(data.len());
                        for &s in data {
                            tmp.push((s as f32) / 32768.0);
                        }
                        on_audio_input_mixdown(&tmp, channels, &tx);
                    },
                    err_fn,
                    None
                )?
            )
        }
        cpal::SampleFormat::U16 => {
            let tx = tx.clone();
            Ok(
                device.build_input_stream(
                    config,
                    move |data: &[u16], _| {
                        let mut tmp = Vec::with_capacity(data.len());
                        for &s in data {
                            tmp.push(((s as f32) / 65535.0) * 2.0 - 1.0);
                        }
                        on_audio_input_mixdown(&tmp, channels, &tx);
                    },
                    err_fn,
                    None
                )?
            )
        }
        _ => anyhow::bail!("Unsupported sample format"),
    }
}

fn on_audio_input_mixdown<T: AsRef<[f32]>>(
    data: T,
    channels: usize,
    tx: &crossbeam_channel::Sender<Vec<f32>>
) {
    let data = data.as_ref();
    if channels <= 1 {
        let _ = tx.send(data.to_vec());
    } else {
        let frames = data.len() / channels;
        let mut mono = Vec::with_capacity(frames);
        for f in 0..frames {
            let mut acc = 0.0f32;
            for ch in 0..channels {
                acc += data[f * channels + ch];
            }
            mono.push(acc / (channels as f32));
        }
        let _ = tx.send(mono);
    }
}

pub fn maybe_rate_supported(device: &cpal::Device, want: u32) -> Option<u32> {
    if let Ok(mut configs) = device.supported_input_configs() {
        for c in configs.by_ref() {
            let r = c.min_sample_rate().0..=c.max_sample_rate().0;
            if r.contains(&want) {
                return Some(want);
            }
        }
    }
    None
}

// ───────────────────────────────────────────────────────────────────────────────
// main
// ───────────────────────────────────────────────────────────────────────────────
fn main() -> Result<()> {
    let cli = match parse_arguments() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}\n", e);
            print_usage(&Config::default());
            std::process::exit(1);
        }
    };

    let logger = Arc::new(Logger::new_with_level(&cli.log_path, true, cli.log_level)?);

    match cli.mode {
        Mode::Live => mods::live::run_live(&cli, logger),
        Mode::Offline => mods::offline::run_offline(&cli, logger),
    }
}
