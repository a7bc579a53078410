//! Pitch classes and chord templates.

pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Pitch class for a frequency, octave discarded.
///
/// Reference C0 is derived from A4 = 440 Hz; frequencies that land outside
/// octaves 0..=9 (and anything non-positive) are rejected rather than folded.
pub fn pitch_class_for(freq: f32) -> Option<&'static str> {
    if freq <= 0.0 {
        return None;
    }
    let c0 = 440.0f32 * (2.0f32).powf(-4.75);
    let h = (12.0 * (freq / c0).log2()).round() as i32;
    let octave = h.div_euclid(12);
    if !(0..=9).contains(&octave) {
        return None;
    }
    Some(NOTE_NAMES[h.rem_euclid(12) as usize])
}

#[derive(Clone, Debug)]
pub struct ChordTemplate {
    pub label: String,
    pub notes: Vec<&'static str>,
}

impl ChordTemplate {
    pub fn new(label: &str, notes: &[&'static str]) -> Self {
        Self { label: label.to_string(), notes: notes.to_vec() }
    }
}

#[derive(Clone, Debug)]
pub struct ChordMatch {
    pub label: String,
    pub matches: usize,
    pub confidence: f32,
}

/// What wins when two templates share the best match count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieBreak {
    /// First template in dictionary order wins.
    DictionaryOrder,
    /// The previously detected chord wins its ties; falls back to
    /// dictionary order when the previous chord is not among the tied.
    PreferPrevious,
}

/// An ordered, closed set of chord templates. Matching never invents a
/// label that is not in the table.
#[derive(Clone, Debug)]
pub struct ChordDictionary {
    templates: Vec<ChordTemplate>,
    min_matches: usize,
    tie_break: TieBreak,
}

impl ChordDictionary {
    pub fn with_templates(
        templates: Vec<ChordTemplate>,
        min_matches: usize,
        tie_break: TieBreak
    ) -> Self {
        Self { templates, min_matches: min_matches.max(1), tie_break }
    }

    /// The stock triads, in their canonical order. Order matters: it is the
    /// default tie-break.
    pub fn diatonic_default(min_matches: usize, tie_break: TieBreak) -> Self {
        let templates = vec![
            ChordTemplate::new("C", &["C", "E", "G"]),
            ChordTemplate::new("Dm", &["D", "F", "A"]),
            ChordTemplate::new("Em", &["E", "G", "B"]),
            ChordTemplate::new("F", &["F", "A", "C"]),
            ChordTemplate::new("G", &["G", "B", "D"]),
            ChordTemplate::new("Am", &["A", "C", "E"]),
            ChordTemplate::new("Bb", &["A#", "D", "F"]),
            ChordTemplate::new("D", &["D", "F#", "A"]),
            ChordTemplate::new("A", &["A", "C#", "E"]),
            ChordTemplate::new("E", &["E", "G#", "B"])
        ];
        Self::with_templates(templates, min_matches, tie_break)
    }

    /// Best template for the observed pitch classes, or None when nothing
    /// reaches `min_matches`. `observed` may contain duplicates.
    pub fn best_match(&self, observed: &[&str], previous: Option<&str>) -> Option<ChordMatch> {
        let mut classes: Vec<&str> = Vec::with_capacity(observed.len());
        for c in observed {
            if !classes.contains(c) {
                classes.push(c);
            }
        }
        if classes.is_empty() {
            return None;
        }

        let mut best: Option<(usize, &ChordTemplate)> = None;
        for t in &self.templates {
            let matches = t.notes
                .iter()
                .filter(|n| classes.contains(n))
                .count();
            if matches < self.min_matches {
                continue;
            }
            match best {
                None => {
                    best = Some((matches, t));
                }
                Some((best_matches, best_t)) => {
                    if matches > best_matches {
                        best = Some((matches, t));
                    } else if
                        matches == best_matches &&
                        self.tie_break == TieBreak::PreferPrevious &&
                        previous == Some(t.label.as_str()) &&
                        previous != Some(best_t.label.as_str())
                    {
                        best = Some((matches, t));
                    }
                }
            }
        }

        best.map(|(matches, t)| ChordMatch {
            label: t.label.clone(),
            matches,
            confidence: (matches as f32) / (t.notes.len().max(1) as f32),
        })
    }
}

/// Diatonic chords for the common major keys, used when detections are
/// surfaced as suggestions instead of grid inserts.
pub fn suggestions_for_key(key: &str) -> Option<&'static [&'static str]> {
    match key {
        "C" => Some(&["C", "Dm", "Em", "F", "G", "Am"]),
        "G" => Some(&["G", "Am", "Bm", "C", "D", "Em"]),
        "D" => Some(&["D", "Em", "F#m", "G", "A", "Bm"]),
        "A" => Some(&["A", "Bm", "C#m", "D", "E", "F#m"]),
        "E" => Some(&["E", "F#m", "G#m", "A", "B", "C#m"]),
        "F" => Some(&["F", "Gm", "Am", "Bb", "C", "Dm"]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_classes_round_trip_in_octave_four() {
        // equal-tempered frequencies for C4..B4
        let c0 = 440.0f32 * (2.0f32).powf(-4.75);
        for (i, name) in NOTE_NAMES.iter().enumerate() {
            let freq = c0 * (2.0f32).powf(((48 + i) as f32) / 12.0);
            assert_eq!(pitch_class_for(freq), Some(*name));
        }
    }

    #[test]
    fn known_anchors_map_correctly() {
        assert_eq!(pitch_class_for(440.0), Some("A"));
        assert_eq!(pitch_class_for(261.63), Some("C"));
        assert_eq!(pitch_class_for(329.63), Some("E"));
    }

    #[test]
    fn out_of_range_frequencies_are_rejected() {
        assert_eq!(pitch_class_for(0.0), None);
        assert_eq!(pitch_class_for(-10.0), None);
        assert_eq!(pitch_class_for(4.0), None); // below octave 0
        assert_eq!(pitch_class_for(40_000.0), None); // above octave 9
    }

    #[test]
    fn full_triad_matches_with_count_three() {
        let dict = ChordDictionary::diatonic_default(2, TieBreak::DictionaryOrder);
        let m = dict.best_match(&["C", "E", "G"], None).unwrap();
        assert_eq!(m.label, "C");
        assert_eq!(m.matches, 3);
        assert!((m.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn duplicates_do_not_inflate_match_count() {
        let dict = ChordDictionary::diatonic_default(2, TieBreak::DictionaryOrder);
        let m = dict.best_match(&["C", "C", "E", "E"], None).unwrap();
        assert_eq!(m.label, "C");
        assert_eq!(m.matches, 2);
    }

    #[test]
    fn single_note_is_not_enough() {
        let dict = ChordDictionary::diatonic_default(2, TieBreak::DictionaryOrder);
        assert!(dict.best_match(&["C"], None).is_none());
        assert!(dict.best_match(&[], None).is_none());
    }

    #[test]
    fn dictionary_order_breaks_ties() {
        let dict = ChordDictionary::diatonic_default(2, TieBreak::DictionaryOrder);
        // {C, E} matches C and Am with two notes each; C comes first
        let m = dict.best_match(&["C", "E"], Some("Am")).unwrap();
        assert_eq!(m.label, "C");
    }

    #[test]
    fn previous_chord_wins_ties_when_configured() {
        let dict = ChordDictionary::diatonic_default(2, TieBreak::PreferPrevious);
        let m = dict.best_match(&["C", "E"], Some("Am")).unwrap();
        assert_eq!(m.label, "Am");
        // without a previous chord the dictionary order still holds
        let m = dict.best_match(&["C", "E"], None).unwrap();
        assert_eq!(m.label, "C");
    }

    #[test]
    fn higher_match_count_beats_tie_break() {
        let dict = ChordDictionary::diatonic_default(2, TieBreak::PreferPrevious);
        let m = dict.best_match(&["C", "E", "G"], Some("Am")).unwrap();
        assert_eq!(m.label, "C");
    }

    #[test]
    fn suggestions_cover_common_keys() {
        assert_eq!(suggestions_for_key("C").unwrap()[0], "C");
        assert_eq!(suggestions_for_key("F").unwrap()[3], "Bb");
        assert!(suggestions_for_key("H").is_none());
    }
}
