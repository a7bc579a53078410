use anyhow::Result;
use std::{ path::Path, sync::Arc };

use crate::logger::Logger;
use crate::mods::detector::{ DetectionPipeline, DetectorConfig };
use crate::mods::grid::ChordGrid;
use crate::mods::song::SongLayout;
use crate::{ decode, Config };

/// Offline mode — walk a local audio file (WAV/MP3/MP4/M4A) against the
/// section layout in tick-sized hops, running the same pipeline the live
/// scheduler runs and filling the grid without any playback.
pub fn run_offline(cli: &Config, logger: Arc<Logger>) -> Result<()> {
    if cli.input_path.is_empty() {
        anyhow::bail!("--input <PATH> is required in offline mode");
    }
    if cli.layout_path.is_empty() {
        anyhow::bail!("--layout-path <PATH> is required in offline mode");
    }
    let path = Path::new(&cli.input_path);
    if !path.exists() {
        anyhow::bail!("Input file not found: {}", path.display());
    }

    let layout = SongLayout::load(&cli.layout_path, cli.tempo, &cli.time_signature, &logger)?;
    logger.info(
        &format!(
            "chordtrack offline starting…  sections={} tempo={:.0} beats/bar={} tick_ms={}",
            layout.sections.len(),
            layout.tempo,
            layout.beats_per_bar,
            cli.tick_ms
        )
    )?;

    logger.info(&format!("Decoding: {}", path.display()))?;
    let audio = decode::load_track(path)?;
    let sr = audio.sr as f32;
    logger.info(
        &format!(
            "Decoded: sr={} Hz, channels={}, samples={} ({:.1}s)",
            audio.sr,
            audio.channels,
            audio.samples.len(),
            (audio.samples.len() as f32) / sr
        )
    )?;

    let cfg = DetectorConfig::from_cli(cli);
    let mut pipeline = DetectionPipeline::new(sr, &cfg);
    let mut grid = ChordGrid::new();

    let hop = (((sr as usize) * (cli.tick_ms as usize)) / 1000).max(1);
    let window = pipeline.window_size();

    let mut detections = 0usize;
    let mut placed = 0usize;

    let mut end = window;
    while end <= audio.samples.len() {
        let t = (end as f32) / sr;
        if let Some(position) = layout.resolve_position(t) {
            let frame = &audio.samples[end - window..end];
            if let Some(m) = pipeline.analyze(frame) {
                detections += 1;
                if grid.insert_auto(&position, layout.beats_per_bar, &m.label).is_some() {
                    placed += 1;
                } else {
                    let _ = logger.debug(
                        &format!(
                            "t={:.1}s chord={} skipped, bar {} of section {} is full",
                            t,
                            m.label,
                            position.bar_index,
                            position.section_index
                        )
                    );
                }
            }
        }
        end += hop;
    }

    grid.export_csv(&cli.grid_path)?;
    logger.info(
        &format!(
            "chordtrack offline done: {} detection(s), {} placed, grid written to {}",
            detections,
            placed,
            cli.grid_path
        )
    )?;
    Ok(())
}
