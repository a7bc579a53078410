use anyhow::Result;
use crossbeam_channel::RecvTimeoutError;
use std::{
    sync::{ atomic::{ AtomicBool, Ordering }, Arc },
    time::Duration,
};

use crate::logger::Logger;
use crate::mods::detector::{ Detector, DetectorConfig, Transport };
use crate::mods::grid::ChordGrid;
use crate::mods::song::SongLayout;
use crate::mods::theory::suggestions_for_key;
use crate::Config;

/// Live mode: bind a source (file track if --input is given, else system
/// loopback, else microphone), tick against the wall clock, and fill the
/// chord grid until Ctrl-C.
pub fn run_live(cli: &Config, logger: Arc<Logger>) -> Result<()> {
    if cli.layout_path.is_empty() {
        anyhow::bail!("--layout-path <PATH> is required in live mode");
    }
    let layout = SongLayout::load(&cli.layout_path, cli.tempo, &cli.time_signature, &logger)?;
    logger.info(
        &format!(
            "chordtrack live starting…  sections={} tempo={:.0} beats/bar={} tick_ms={}",
            layout.sections.len(),
            layout.tempo,
            layout.beats_per_bar,
            cli.tick_ms
        )
    )?;

    // ctrl+c to quit
    let quit = Arc::new(AtomicBool::new(false));
    {
        let q = quit.clone();
        let _ = ctrlc::set_handler(move || {
            q.store(true, Ordering::SeqCst);
        });
    }

    let transport = Arc::new(Transport::new());
    let auto_enabled = Arc::new(AtomicBool::new(true));
    let beats_per_bar = layout.beats_per_bar;

    let mut detector = Detector::new(logger.clone());
    let rx = detector.start(
        DetectorConfig::from_cli(cli),
        layout,
        transport.clone(),
        auto_enabled
    );

    // the wall clock is the playhead in live mode
    transport.play();

    let mut grid = ChordGrid::new();

    while !quit.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                if cli.auto_insert {
                    match grid.insert_auto(&event.position, beats_per_bar, &event.chord) {
                        Some(coord) => {
                            let _ = logger.info(
                                &format!(
                                    "t={:.1}s chord={} conf={:.2} -> section {} bar {} beat {}",
                                    event.timestamp_s,
                                    event.chord,
                                    event.confidence,
                                    coord.section,
                                    coord.bar,
                                    coord.beat
                                )
                            );
                        }
                        None => {
                            let _ = logger.debug(
                                &format!(
                                    "t={:.1}s chord={} skipped, bar {} of section {} is full",
                                    event.timestamp_s,
                                    event.chord,
                                    event.position.bar_index,
                                    event.position.section_index
                                )
                            );
                        }
                    }
                } else {
                    let hint = suggestions_for_key(&cli.key)
                        .map(|s| format!(" (in {}: {})", cli.key, s.join(" ")))
                        .unwrap_or_default();
                    let _ = logger.info(
                        &format!(
                            "t={:.1}s suggestion: {} conf={:.2}{}",
                            event.timestamp_s,
                            event.chord,
                            event.confidence,
                            hint
                        )
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // scheduler exited on its own (no audio access)
                break;
            }
        }
    }

    transport.pause();
    detector.stop();

    grid.export_csv(&cli.grid_path)?;
    logger.info(
        &format!("chordtrack live stopped; wrote {} grid cell(s) to {}", grid.len(), cli.grid_path)
    )?;
    Ok(())
}
