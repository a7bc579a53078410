use std::sync::Arc;

use realfft::{ num_complex::Complex, RealFftPlanner, RealToComplex };

const DB_FLOOR: f32 = -120.0;

#[inline]
fn hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let t = (std::f32::consts::PI * (i as f32)) / (n as f32);
            t.sin() * t.sin()
        })
        .collect()
}

/// Windowed FFT magnitudes in dBFS with exponential smoothing across ticks.
///
/// Smoothing runs over the linear magnitudes, so a constant of 0.8 keeps 80%
/// of the previous tick's spectrum and folds in 20% of the new one. The first
/// processed frame seeds the state directly.
pub struct SpectrumAnalyzer {
    sample_rate: f32,
    window_size: usize,
    smoothing: f32,
    window: Vec<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
    inbuf: Vec<f32>,
    outbuf: Vec<Complex<f32>>,
    smoothed_mag: Vec<f32>,
    out_db: Vec<f32>,
    primed: bool,
    // full-scale sine → ~0 dBFS after windowing
    scale: f32,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: f32, window_size: usize, smoothing: f32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(window_size);
        let inbuf = fft.make_input_vec();
        let outbuf = fft.make_output_vec();
        let window = hann(window_size);
        let scale = 2.0 / window.iter().sum::<f32>().max(1e-9);
        let bins = outbuf.len();

        Self {
            sample_rate,
            window_size,
            smoothing: smoothing.clamp(0.0, 0.99),
            window,
            fft,
            inbuf,
            outbuf,
            smoothed_mag: vec![0.0; bins],
            out_db: vec![DB_FLOOR; bins],
            primed: false,
            scale,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Hz covered by one spectrum bin.
    pub fn bin_hz(&self) -> f32 {
        self.sample_rate / (self.window_size as f32)
    }

    /// Drop the smoothing state; call when the audio source is rebound.
    pub fn reset(&mut self) {
        self.primed = false;
    }

    /// Analyze the newest `window_size` samples of `samples`. Returns None
    /// when fewer samples than one window are available; a tick with no data
    /// is skipped, not an error.
    pub fn process(&mut self, samples: &[f32]) -> Option<&[f32]> {
        if samples.len() < self.window_size {
            return None;
        }
        let tail = &samples[samples.len() - self.window_size..];
        for (i, s) in tail.iter().enumerate() {
            self.inbuf[i] = s * self.window[i];
        }

        self.fft.process(&mut self.inbuf, &mut self.outbuf).ok()?;

        for (i, c) in self.outbuf.iter().enumerate() {
            let mag = c.norm() * self.scale;
            if self.primed {
                self.smoothed_mag[i] =
                    self.smoothing * self.smoothed_mag[i] + (1.0 - self.smoothing) * mag;
            } else {
                self.smoothed_mag[i] = mag;
            }
            self.out_db[i] = (20.0 * self.smoothed_mag[i].log10()).max(DB_FLOOR);
        }
        self.primed = true;

        Some(&self.out_db)
    }
}

#[derive(Clone, Debug)]
pub struct PeakParams {
    pub band_low_hz: f32,
    pub band_high_hz: f32,
    pub threshold_db: f32,
    pub max_peaks: usize,
}

impl Default for PeakParams {
    fn default() -> Self {
        Self {
            band_low_hz: 80.0,
            band_high_hz: 2000.0,
            threshold_db: -50.0,
            max_peaks: 6,
        }
    }
}

/// Local maxima of the dB spectrum inside the analysis band, as frequencies.
///
/// The scan runs in ascending frequency order and stops after `max_peaks`
/// candidates, so when a tick is rich in peaks the lowest ones win even if
/// stronger peaks exist above them. Callers that need a different selection
/// should re-rank the full band themselves.
pub fn find_peaks(spectrum_db: &[f32], bin_hz: f32, p: &PeakParams) -> Vec<f32> {
    let mut peaks = Vec::new();
    if spectrum_db.len() < 3 || bin_hz <= 0.0 {
        return peaks;
    }

    for i in 1..spectrum_db.len() - 1 {
        let freq = (i as f32) * bin_hz;
        if freq < p.band_low_hz {
            continue;
        }
        if freq > p.band_high_hz {
            break;
        }
        let v = spectrum_db[i];
        if v > spectrum_db[i - 1] && v > spectrum_db[i + 1] && v > p.threshold_db {
            peaks.push(freq);
            if peaks.len() >= p.max_peaks {
                break;
            }
        }
    }

    peaks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sr: f32, n: usize, amp: f32) -> Vec<f32> {
        (0..n)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * (i as f32) / sr).sin())
            .collect()
    }

    #[test]
    fn short_input_yields_no_spectrum() {
        let mut an = SpectrumAnalyzer::new(44100.0, 4096, 0.8);
        assert!(an.process(&vec![0.0; 1000]).is_none());
    }

    #[test]
    fn single_tone_produces_one_band_peak() {
        let sr = 44100.0;
        let mut an = SpectrumAnalyzer::new(sr, 4096, 0.0);
        // quiet enough that window sidelobes stay under the -50 dB threshold
        let samples = sine(440.0, sr, 4096, 0.05);
        let bin_hz = an.bin_hz();
        let spectrum = an.process(&samples).unwrap();
        let peaks = find_peaks(spectrum, bin_hz, &PeakParams::default());
        assert_eq!(peaks.len(), 1);
        assert!((peaks[0] - 440.0).abs() < bin_hz);
    }

    #[test]
    fn smoothing_keeps_most_of_previous_frame() {
        let sr = 44100.0;
        let mut an = SpectrumAnalyzer::new(sr, 4096, 0.8);
        let loud = sine(440.0, sr, 4096, 0.8);
        let quiet = vec![0.0f32; 4096];

        let bin = (440.0 / an.bin_hz()).round() as usize;
        let first = an.process(&loud).unwrap()[bin];
        let second = an.process(&quiet).unwrap()[bin];

        // 80% of the linear magnitude survives one silent tick: about -2 dB
        assert!(second < first);
        assert!(second > first - 3.0);
    }

    #[test]
    fn reset_reseeds_smoothing_state() {
        let sr = 44100.0;
        let mut an = SpectrumAnalyzer::new(sr, 4096, 0.8);
        let loud = sine(440.0, sr, 4096, 0.8);
        let bin = (440.0 / an.bin_hz()).round() as usize;

        let _ = an.process(&loud);
        an.reset();
        let after = an.process(&vec![0.0f32; 4096]).unwrap()[bin];
        assert!(after <= DB_FLOOR + 1.0);
    }

    #[test]
    fn peaks_outside_band_are_ignored() {
        let sr = 44100.0;
        let mut an = SpectrumAnalyzer::new(sr, 4096, 0.0);
        let mut samples = sine(50.0, sr, 4096, 0.05);
        let high = sine(3000.0, sr, 4096, 0.05);
        for (a, b) in samples.iter_mut().zip(high.iter()) {
            *a += b;
        }
        let bin_hz = an.bin_hz();
        let spectrum = an.process(&samples).unwrap();
        let peaks = find_peaks(spectrum, bin_hz, &PeakParams::default());
        assert!(peaks.is_empty());
    }

    #[test]
    fn truncation_keeps_lowest_frequencies() {
        let sr = 44100.0;
        let mut an = SpectrumAnalyzer::new(sr, 4096, 0.0);
        // eight tones in band, extractor keeps the first six in ascending order
        let freqs = [110.0, 220.0, 330.0, 440.0, 550.0, 660.0, 880.0, 990.0];
        let mut samples = vec![0.0f32; 4096];
        for f in freqs {
            for (i, s) in samples.iter_mut().enumerate() {
                *s += 0.03 * (2.0 * std::f32::consts::PI * f * (i as f32) / sr).sin();
            }
        }
        let bin_hz = an.bin_hz();
        let spectrum = an.process(&samples).unwrap();
        let peaks = find_peaks(spectrum, bin_hz, &PeakParams::default());
        assert_eq!(peaks.len(), 6);
        for w in peaks.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!((peaks[5] - 660.0).abs() < bin_hz * 2.0);
    }
}
