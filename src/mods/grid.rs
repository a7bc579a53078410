use anyhow::Result;
use std::{ collections::HashMap, fs::OpenOptions, io::Write, path::Path };

use crate::mods::song::MusicalPosition;

/// One cell of the chord grid. A composite key, not a formatted string, so
/// lookups cannot collide on ambiguous separators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCoordinate {
    pub section: usize,
    pub bar: usize,
    pub beat: usize,
    pub row: usize,
}

/// Sparse chord grid: at most one label per coordinate, O(1) membership.
#[derive(Clone, Debug, Default)]
pub struct ChordGrid {
    cells: HashMap<GridCoordinate, String>,
}

impl ChordGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn chord_at(&self, coord: &GridCoordinate) -> Option<&str> {
        self.cells.get(coord).map(|s| s.as_str())
    }

    /// Place a detected chord in the first empty beat of the bar, scanning
    /// beats 0..beats_per_bar in order. Existing entries are never
    /// overwritten; a full bar is a silent no-op returning None.
    pub fn insert_auto(
        &mut self,
        pos: &MusicalPosition,
        beats_per_bar: usize,
        label: &str
    ) -> Option<GridCoordinate> {
        for beat in 0..beats_per_bar {
            let coord = GridCoordinate {
                section: pos.section_index,
                bar: pos.bar_index,
                beat,
                row: pos.row_index,
            };
            if !self.cells.contains_key(&coord) {
                self.cells.insert(coord, label.to_string());
                return Some(coord);
            }
        }
        None
    }

    /// User-initiated placement: always writes, returning the displaced
    /// label if the cell was occupied.
    pub fn insert_manual(&mut self, coord: GridCoordinate, label: &str) -> Option<String> {
        self.cells.insert(coord, label.to_string())
    }

    pub fn remove(&mut self, coord: &GridCoordinate) -> Option<String> {
        self.cells.remove(coord)
    }

    /// Clear every beat of the addressed bar.
    pub fn clear_bar(&mut self, pos: &MusicalPosition, beats_per_bar: usize) {
        for beat in 0..beats_per_bar {
            self.cells.remove(
                &(GridCoordinate {
                    section: pos.section_index,
                    bar: pos.bar_index,
                    beat,
                    row: pos.row_index,
                })
            );
        }
    }

    /// Drop entries beyond a section's new bar count, e.g. after bars were
    /// removed from the section.
    pub fn truncate_bars(&mut self, section: usize, new_bar_count: usize) {
        self.cells.retain(|c, _| c.section != section || c.bar < new_bar_count);
    }

    /// Remove the deleted section's entries and shift every later section
    /// index down by one, keeping positional keys consistent.
    pub fn reindex_after_section_delete(&mut self, deleted: usize) {
        let old = std::mem::take(&mut self.cells);
        for (mut coord, label) in old {
            if coord.section == deleted {
                continue;
            }
            if coord.section > deleted {
                coord.section -= 1;
            }
            self.cells.insert(coord, label);
        }
    }

    /// Entries in (section, bar, beat, row) order for deterministic output.
    pub fn sorted_entries(&self) -> Vec<(GridCoordinate, &str)> {
        let mut entries: Vec<(GridCoordinate, &str)> = self.cells
            .iter()
            .map(|(c, l)| (*c, l.as_str()))
            .collect();
        entries.sort_by_key(|(c, _)| *c);
        entries
    }

    /// Write the grid as CSV. The file is rewritten whole; it mirrors the
    /// current grid, not an append history.
    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path.as_ref())?;
        writeln!(file, "section,bar,beat,row,chord")?;
        for (c, label) in self.sorted_entries() {
            writeln!(file, "{},{},{},{},{}", c.section, c.bar, c.beat, c.row, label)?;
        }
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(section: usize, bar: usize, row: usize) -> MusicalPosition {
        MusicalPosition { section_index: section, bar_index: bar, row_index: row }
    }

    fn coord(section: usize, bar: usize, beat: usize, row: usize) -> GridCoordinate {
        GridCoordinate { section, bar, beat, row }
    }

    #[test]
    fn auto_insert_takes_the_first_empty_beat() {
        let mut grid = ChordGrid::new();
        let p = pos(0, 0, 0);
        assert_eq!(grid.insert_auto(&p, 4, "C"), Some(coord(0, 0, 0, 0)));
        assert_eq!(grid.insert_auto(&p, 4, "F"), Some(coord(0, 0, 1, 0)));
        assert_eq!(grid.chord_at(&coord(0, 0, 0, 0)), Some("C"));
        assert_eq!(grid.chord_at(&coord(0, 0, 1, 0)), Some("F"));
    }

    #[test]
    fn auto_insert_never_overwrites_and_fills_gaps() {
        let mut grid = ChordGrid::new();
        let p = pos(0, 2, 0);
        grid.insert_manual(coord(0, 2, 0, 0), "Am");
        grid.insert_manual(coord(0, 2, 2, 0), "G");
        assert_eq!(grid.insert_auto(&p, 4, "C"), Some(coord(0, 2, 1, 0)));
        assert_eq!(grid.chord_at(&coord(0, 2, 0, 0)), Some("Am"));
        assert_eq!(grid.chord_at(&coord(0, 2, 2, 0)), Some("G"));
    }

    #[test]
    fn auto_insert_into_a_full_bar_is_a_no_op() {
        let mut grid = ChordGrid::new();
        let p = pos(1, 0, 0);
        for beat in 0..4 {
            grid.insert_manual(coord(1, 0, beat, 0), "C");
        }
        assert_eq!(grid.insert_auto(&p, 4, "G"), None);
        assert_eq!(grid.len(), 4);
        for beat in 0..4 {
            assert_eq!(grid.chord_at(&coord(1, 0, beat, 0)), Some("C"));
        }
    }

    #[test]
    fn manual_insert_returns_displaced_label() {
        let mut grid = ChordGrid::new();
        assert_eq!(grid.insert_manual(coord(0, 0, 0, 0), "C"), None);
        assert_eq!(grid.insert_manual(coord(0, 0, 0, 0), "G"), Some("C".to_string()));
        assert_eq!(grid.chord_at(&coord(0, 0, 0, 0)), Some("G"));
    }

    #[test]
    fn clear_bar_only_touches_that_bar() {
        let mut grid = ChordGrid::new();
        grid.insert_manual(coord(0, 0, 0, 0), "C");
        grid.insert_manual(coord(0, 0, 3, 0), "F");
        grid.insert_manual(coord(0, 1, 0, 0), "G");
        grid.clear_bar(&pos(0, 0, 0), 4);
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.chord_at(&coord(0, 1, 0, 0)), Some("G"));
    }

    #[test]
    fn deleting_a_section_shifts_later_indices() {
        // sections [A, B, C]; delete A, entries in B and C shift down
        let mut grid = ChordGrid::new();
        grid.insert_manual(coord(0, 0, 0, 0), "C");
        grid.insert_manual(coord(1, 1, 0, 0), "F");
        grid.insert_manual(coord(2, 0, 2, 1), "G");

        grid.reindex_after_section_delete(0);

        assert_eq!(grid.len(), 2);
        assert_eq!(grid.chord_at(&coord(0, 1, 0, 0)), Some("F"));
        assert_eq!(grid.chord_at(&coord(1, 0, 2, 1)), Some("G"));
        assert_eq!(grid.chord_at(&coord(2, 0, 2, 1)), None);
    }

    #[test]
    fn deleting_a_middle_section_keeps_earlier_entries() {
        let mut grid = ChordGrid::new();
        grid.insert_manual(coord(0, 0, 0, 0), "C");
        grid.insert_manual(coord(1, 0, 0, 0), "F");
        grid.insert_manual(coord(2, 0, 0, 0), "G");

        grid.reindex_after_section_delete(1);

        assert_eq!(grid.chord_at(&coord(0, 0, 0, 0)), Some("C"));
        assert_eq!(grid.chord_at(&coord(1, 0, 0, 0)), Some("G"));
        assert_eq!(grid.len(), 2);
    }

    #[test]
    fn truncating_bars_drops_out_of_range_entries() {
        let mut grid = ChordGrid::new();
        grid.insert_manual(coord(0, 1, 0, 0), "C");
        grid.insert_manual(coord(0, 5, 0, 1), "F");
        grid.insert_manual(coord(1, 5, 0, 1), "G");
        grid.truncate_bars(0, 4);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.chord_at(&coord(0, 1, 0, 0)), Some("C"));
        assert_eq!(grid.chord_at(&coord(1, 5, 0, 1)), Some("G"));
    }

    #[test]
    fn sorted_entries_are_deterministic() {
        let mut grid = ChordGrid::new();
        grid.insert_manual(coord(1, 0, 0, 0), "G");
        grid.insert_manual(coord(0, 2, 1, 0), "F");
        grid.insert_manual(coord(0, 2, 0, 0), "C");
        let entries = grid.sorted_entries();
        assert_eq!(entries[0].1, "C");
        assert_eq!(entries[1].1, "F");
        assert_eq!(entries[2].1, "G");
    }
}
