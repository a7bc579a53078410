use anyhow::{ Context, Result };
use std::{ fs::File, io::{ BufRead, BufReader }, path::Path };

use crate::logger::Logger;

#[derive(Clone, Debug)]
pub struct Section {
    pub name: String,
    pub start_s: f32,
    pub end_s: f32,
    pub bar_count: usize,
    pub row_count: usize,
}

/// Where a playback time falls in the song layout. `section_index` is
/// positional; it shifts when earlier sections are deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MusicalPosition {
    pub section_index: usize,
    pub bar_index: usize,
    pub row_index: usize,
}

/// Parse "m:ss" / "mm:ss" into seconds.
pub fn parse_mm_ss(s: &str) -> Result<f32> {
    let (m, sec) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("bad time '{}': expected mm:ss", s))?;
    let m: f32 = m.parse().with_context(|| format!("bad minutes in '{}'", s))?;
    let sec: f32 = sec.parse().with_context(|| format!("bad seconds in '{}'", s))?;
    if m < 0.0 || sec < 0.0 || sec >= 60.0 {
        anyhow::bail!("bad time '{}': minutes >= 0, seconds in 0..60", s);
    }
    Ok(m * 60.0 + sec)
}

/// Numerator of a "N/M" time signature; None when the string is malformed.
pub fn parse_beats_per_bar(time_signature: &str) -> Option<usize> {
    let num = time_signature.split('/').next()?.trim();
    match num.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct SongLayout {
    pub tempo: f32,
    pub beats_per_bar: usize,
    pub sections: Vec<Section>,
}

impl SongLayout {
    /// Build a layout from parts. A malformed time signature falls back to
    /// 4 beats per bar; zero bar or row counts are clamped to one so lookups
    /// stay total; overlapping sections are reported once here and then
    /// resolved first-match-wins at lookup time.
    pub fn new(
        tempo: f32,
        time_signature: &str,
        mut sections: Vec<Section>,
        logger: &Logger
    ) -> Self {
        let beats_per_bar = match parse_beats_per_bar(time_signature) {
            Some(n) => n,
            None => {
                let _ = logger.warn(
                    &format!(
                        "malformed time signature '{}', falling back to 4 beats per bar",
                        time_signature
                    )
                );
                4
            }
        };

        for section in sections.iter_mut() {
            if section.bar_count == 0 {
                let _ = logger.warn(
                    &format!("section '{}' has zero bars; treating it as one bar", section.name)
                );
                section.bar_count = 1;
            }
            if section.row_count == 0 {
                let _ = logger.warn(
                    &format!("section '{}' has zero rows; treating it as one row", section.name)
                );
                section.row_count = 1;
            }
        }

        for i in 0..sections.len() {
            for j in i + 1..sections.len() {
                let (a, b) = (&sections[i], &sections[j]);
                if a.start_s < b.end_s && b.start_s < a.end_s {
                    let _ = logger.warn(
                        &format!(
                            "sections '{}' and '{}' overlap in time; earlier section wins lookups",
                            a.name,
                            b.name
                        )
                    );
                }
            }
        }

        Self { tempo, beats_per_bar, sections }
    }

    /// Load sections from a CSV with a `name,start,end,bars,rows` header.
    /// `start`/`end` are mm:ss.
    pub fn load<P: AsRef<Path>>(
        path: P,
        tempo: f32,
        time_signature: &str,
        logger: &Logger
    ) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref).with_context(||
            format!("cannot open layout file {}", path_ref.display())
        )?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header = lines
            .next()
            .ok_or_else(|| anyhow::anyhow!("layout file {} is empty", path_ref.display()))??;
        let cols: Vec<String> = header
            .split(',')
            .map(|c| c.trim().to_lowercase())
            .collect();
        let col = |name: &str| -> Result<usize> {
            cols
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| anyhow::anyhow!("layout header is missing column '{}'", name))
        };
        let i_name = col("name")?;
        let i_start = col("start")?;
        let i_end = col("end")?;
        let i_bars = col("bars")?;
        let i_rows = col("rows")?;

        let mut sections = Vec::new();
        for (lineno, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            let field = |i: usize| -> Result<&str> {
                fields
                    .get(i)
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("layout line {}: too few fields", lineno + 2))
            };

            let start_s = parse_mm_ss(field(i_start)?)?;
            let end_s = parse_mm_ss(field(i_end)?)?;
            if end_s <= start_s {
                anyhow::bail!("layout line {}: end must be after start", lineno + 2);
            }
            let bar_count: usize = field(i_bars)?
                .trim()
                .parse()
                .with_context(|| format!("layout line {}: bad bar count", lineno + 2))?;
            if bar_count == 0 {
                anyhow::bail!("layout line {}: bar count must be > 0", lineno + 2);
            }
            let row_count: usize = field(i_rows)?
                .trim()
                .parse()
                .with_context(|| format!("layout line {}: bad row count", lineno + 2))?;

            sections.push(Section {
                name: field(i_name)?.trim().to_string(),
                start_s,
                end_s,
                bar_count,
                row_count: row_count.max(1),
            });
        }

        if sections.is_empty() {
            anyhow::bail!("layout file {} has no sections", path_ref.display());
        }

        Ok(Self::new(tempo, time_signature, sections, logger))
    }

    pub fn seconds_per_bar(&self) -> f32 {
        (self.beats_per_bar as f32) / (self.tempo / 60.0)
    }

    /// First section containing `time_s` wins; the bar index is clamped to
    /// the section's bar count so drift at the boundary stays musical.
    pub fn resolve_position(&self, time_s: f32) -> Option<MusicalPosition> {
        let seconds_per_bar = self.seconds_per_bar();
        for (section_index, section) in self.sections.iter().enumerate() {
            if time_s < section.start_s || time_s > section.end_s {
                continue;
            }
            let raw = ((time_s - section.start_s) / seconds_per_bar).floor() as isize;
            let bar_index = raw.clamp(0, (section.bar_count as isize) - 1) as usize;
            let bars_per_row = section.bar_count.div_ceil(section.row_count);
            let row_index = bar_index / bars_per_row.max(1);
            return Some(MusicalPosition { section_index, bar_index, row_index });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;

    fn quiet_logger() -> Logger {
        Logger::new("unused.log", false).unwrap()
    }

    fn section(name: &str, start_s: f32, end_s: f32, bars: usize, rows: usize) -> Section {
        Section {
            name: name.to_string(),
            start_s,
            end_s,
            bar_count: bars,
            row_count: rows,
        }
    }

    #[test]
    fn mm_ss_parses() {
        assert_eq!(parse_mm_ss("0:00").unwrap(), 0.0);
        assert_eq!(parse_mm_ss("1:30").unwrap(), 90.0);
        assert_eq!(parse_mm_ss("10:05").unwrap(), 605.0);
        assert!(parse_mm_ss("90").is_err());
        assert!(parse_mm_ss("1:75").is_err());
    }

    #[test]
    fn beats_per_bar_is_the_numerator() {
        assert_eq!(parse_beats_per_bar("4/4"), Some(4));
        assert_eq!(parse_beats_per_bar("3/4"), Some(3));
        assert_eq!(parse_beats_per_bar("6/8"), Some(6));
        assert_eq!(parse_beats_per_bar("waltz"), None);
        assert_eq!(parse_beats_per_bar("0/4"), None);
    }

    #[test]
    fn malformed_time_signature_falls_back_to_four() {
        let layout = SongLayout::new(
            120.0,
            "not-a-signature",
            vec![section("A", 0.0, 10.0, 4, 1)],
            &quiet_logger()
        );
        assert_eq!(layout.beats_per_bar, 4);
    }

    #[test]
    fn last_bar_holds_until_section_end() {
        // 72 bpm, 4/4 -> 3.333 s per bar; a 4-bar section of 15 s leaves
        // t=10.0 inside bar 3, and the tail of the section clamps to bar 3
        let layout = SongLayout::new(
            72.0,
            "4/4",
            vec![section("Intro", 0.0, 15.0, 4, 1)],
            &quiet_logger()
        );
        let pos = layout.resolve_position(10.0).unwrap();
        assert_eq!(pos.section_index, 0);
        assert_eq!(pos.bar_index, 3);

        let tail = layout.resolve_position(14.9).unwrap();
        assert_eq!(tail.bar_index, 3);
    }

    #[test]
    fn gaps_between_sections_resolve_to_none() {
        let layout = SongLayout::new(
            120.0,
            "4/4",
            vec![section("A", 0.0, 10.0, 4, 1), section("B", 20.0, 30.0, 4, 1)],
            &quiet_logger()
        );
        assert!(layout.resolve_position(15.0).is_none());
        assert!(layout.resolve_position(35.0).is_none());
        assert_eq!(layout.resolve_position(25.0).unwrap().section_index, 1);
    }

    #[test]
    fn overlapping_sections_resolve_to_the_earlier_one() {
        let layout = SongLayout::new(
            120.0,
            "4/4",
            vec![section("A", 0.0, 12.0, 4, 1), section("B", 10.0, 20.0, 4, 1)],
            &quiet_logger()
        );
        assert_eq!(layout.resolve_position(11.0).unwrap().section_index, 0);
    }

    #[test]
    fn zero_bar_and_row_counts_are_clamped_to_one() {
        let layout = SongLayout::new(
            120.0,
            "4/4",
            vec![section("Empty", 0.0, 8.0, 0, 0)],
            &quiet_logger()
        );
        assert_eq!(layout.sections[0].bar_count, 1);
        assert_eq!(layout.sections[0].row_count, 1);

        let pos = layout.resolve_position(4.0).unwrap();
        assert_eq!(pos.bar_index, 0);
        assert_eq!(pos.row_index, 0);
    }

    #[test]
    fn rows_fill_top_to_bottom() {
        // 8 bars over 2 rows -> bars 0..4 on row 0, bars 4..8 on row 1
        let layout = SongLayout::new(
            120.0,
            "4/4",
            vec![section("Verse", 0.0, 16.0, 8, 2)],
            &quiet_logger()
        );
        assert_eq!(layout.resolve_position(1.0).unwrap().row_index, 0);
        let late = layout.resolve_position(15.0).unwrap();
        assert_eq!(late.bar_index, 7);
        assert_eq!(late.row_index, 1);
    }
}
