//! Wavetable oscillator with unison lanes on fixed-point phases.

use rand::{rngs::SmallRng, Rng};

use crate::{
    utils::batch::{Batch, PhaseBatch, BATCH_SIZE},
    wavetable::{Waveform, WavetableBank},
};

// -------------------------------------------------------------------------------------------------

/// Highest number of unison sub-voices per oscillator: one batch lane each.
pub const MAX_UNISON: usize = BATCH_SIZE;

// -------------------------------------------------------------------------------------------------

/// Per-voice oscillator state.
///
/// Each unison sub-voice occupies one lane: a 32 bit fixed-point phase which wraps naturally
/// on overflow (no explicit modulo), with its own detuned phase increment and band-limited
/// harmonic level. Lane 0 is the center voice.
#[derive(Debug, Clone)]
pub struct OscillatorState {
    phases: PhaseBatch,
    lane_increments: [u32; MAX_UNISON],
    lane_levels: [usize; MAX_UNISON],
    lane_gains: Batch,
    base_increment: u32,
    amplitude: f32,
    waveform: Waveform,
    unison_voices: usize,
    detune_cents: f32,
    harmonize: bool,
    reset: bool,
}

impl OscillatorState {
    pub fn new() -> Self {
        Self {
            phases: PhaseBatch::splat(0),
            lane_increments: [0; MAX_UNISON],
            lane_levels: [0; MAX_UNISON],
            lane_gains: Batch::splat(0.0),
            base_increment: 0,
            amplitude: 1.0,
            waveform: Waveform::default(),
            unison_voices: 1,
            detune_cents: 0.0,
            harmonize: false,
            reset: false,
        }
    }

    #[inline(always)]
    pub fn waveform(&self) -> Waveform {
        self.waveform
    }
    pub fn set_waveform(&mut self, waveform: Waveform) {
        self.waveform = waveform;
    }

    #[inline(always)]
    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }
    pub fn set_amplitude(&mut self, amplitude: f32) {
        self.amplitude = amplitude.max(0.0);
    }

    /// Set the center frequency in Hz for the given sample rate.
    pub fn set_frequency(&mut self, frequency: f32, sample_rate: u32) {
        let ratio = (frequency.max(0.0) as f64 / sample_rate as f64).min(1.0);
        self.base_increment = (ratio * u32::MAX as f64) as u32;
    }

    /// The center fixed-point phase increment per sample.
    #[inline(always)]
    pub fn base_increment(&self) -> u32 {
        self.base_increment
    }

    /// Configure the unison spread. `voices` is clamped into `1..=MAX_UNISON`, `detune` is the
    /// total spread in cents.
    pub fn set_unison(&mut self, voices: usize, detune_cents: f32, harmonize: bool) {
        self.unison_voices = voices.clamp(1, MAX_UNISON);
        self.detune_cents = detune_cents;
        self.harmonize = harmonize;
    }

    /// Restart the waveform stream within the current block: the center lane returns to phase
    /// zero, secondary unison lanes scatter to fresh random phases so they don't comb-filter
    /// against each other.
    pub fn reset(&mut self) {
        self.reset = true;
    }

    /// Recompute per-lane increments, band-limit levels and gains for the next block.
    ///
    /// The detune ratio of lane `v` is `(harmonize ? v : 0) + detune_lookup(amount_v)` where
    /// `amount_v` grows with the lane pair index and alternates sign with lane parity, so
    /// detuned voices spread symmetrically around the center.
    pub fn prepare_block(&mut self, bank: &WavetableBank, rng: &mut SmallRng) {
        if self.reset {
            let mut phases = [0u32; MAX_UNISON];
            for phase in phases.iter_mut().skip(1) {
                *phase = rng.random::<u32>();
            }
            self.phases = PhaseBatch::from(phases);
            self.reset = false;
        }

        let voices = self.unison_voices;
        let harmonize_mult = if self.harmonize { 1.0 } else { 0.0 };
        for v in 0..MAX_UNISON {
            let mut amount =
                (self.detune_cents * ((v + 1) / 2) as f32) / ((voices + 1) / 2).max(1) as f32;
            if v % 2 == 1 {
                amount = -amount;
            }
            let ratio = harmonize_mult * v as f32 + bank.detune().ratio(amount);
            let increment = (ratio as f64 * self.base_increment as f64) as u64 as u32;
            self.lane_increments[v] = increment;
            self.lane_levels[v] = WavetableBank::harmonic_level(increment);
        }

        // silence lanes beyond the active voice count, normalize the rest
        let scale = self.amplitude * (1.0 / voices as f32).sqrt();
        let mut gains = [0.0f32; MAX_UNISON];
        for gain in gains.iter_mut().take(voices) {
            *gain = scale;
        }
        self.lane_gains = Batch::from(gains);
    }

    /// Advance all lanes by one sample and return their interpolated, gain-scaled samples.
    #[inline]
    pub fn tick(&mut self, bank: &WavetableBank) -> Batch {
        let lanes = self.phases.to_array();
        let mut samples = [0.0f32; MAX_UNISON];
        for v in 0..MAX_UNISON {
            samples[v] = bank.lookup(self.waveform, self.lane_levels[v], lanes[v]);
        }
        // wrapping lane adds: the phases' implicit modulo
        self.phases = self.phases + PhaseBatch::from(self.lane_increments);
        Batch::from(samples) * self.lane_gains
    }
}

impl Default for OscillatorState {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn test_rng() -> SmallRng {
        SmallRng::seed_from_u64(1234)
    }

    #[test]
    fn single_voice_produces_centered_sine() {
        let bank = WavetableBank::new();
        let mut rng = test_rng();
        let mut state = OscillatorState::new();
        state.set_waveform(Waveform::Sine);
        state.set_frequency(441.0, 44100);
        state.set_unison(1, 0.0, false);
        state.reset();
        state.prepare_block(&bank, &mut rng);

        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for _ in 0..200 {
            let value = state.tick(&bank).to_array()[0];
            min = min.min(value);
            max = max.max(value);
        }
        // one full cycle of a sine at full amplitude
        assert!(max > 0.95 && max <= 1.01, "max: {max}");
        assert!(min < -0.95 && min >= -1.01, "min: {min}");
    }

    #[test]
    fn inactive_lanes_are_silent() {
        let bank = WavetableBank::new();
        let mut rng = test_rng();
        let mut state = OscillatorState::new();
        state.set_frequency(441.0, 44100);
        state.set_unison(2, 10.0, false);
        state.prepare_block(&bank, &mut rng);

        for _ in 0..100 {
            let lanes = state.tick(&bank).to_array();
            for lane in lanes.iter().skip(2) {
                assert_eq!(*lane, 0.0);
            }
        }
    }

    #[test]
    fn detune_spreads_lane_increments_symmetrically() {
        let bank = WavetableBank::new();
        let mut rng = test_rng();
        let mut state = OscillatorState::new();
        state.set_frequency(441.0, 44100);
        state.set_unison(3, 30.0, false);
        state.prepare_block(&bank, &mut rng);

        let center = state.lane_increments[0];
        let down = state.lane_increments[1];
        let up = state.lane_increments[2];
        assert_eq!(center, state.base_increment());
        assert!(down < center, "odd lanes detune downward: {down} vs {center}");
        assert!(up > center, "even lanes detune upward: {up} vs {center}");
    }

    #[test]
    fn reset_scatters_secondary_phases() {
        let bank = WavetableBank::new();
        let mut rng = test_rng();
        let mut state = OscillatorState::new();
        state.set_frequency(441.0, 44100);
        state.set_unison(MAX_UNISON, 25.0, false);
        state.reset();
        state.prepare_block(&bank, &mut rng);

        let phases = state.phases.to_array();
        assert_eq!(phases[0], 0);
        // random phases, overwhelmingly unlikely to collide or stay zero
        for v in 1..MAX_UNISON {
            assert_ne!(phases[v], 0);
        }
    }

    #[test]
    fn harmonize_stacks_lane_harmonics() {
        let bank = WavetableBank::new();
        let mut rng = test_rng();
        let mut state = OscillatorState::new();
        state.set_frequency(100.0, 44100);
        state.set_unison(4, 0.0, true);
        state.prepare_block(&bank, &mut rng);

        let base = state.lane_increments[0] as f64;
        for v in 1..4 {
            let expected = (v + 1) as f64 * base;
            let actual = state.lane_increments[v] as f64;
            assert!(
                (actual - expected).abs() / expected < 1e-3,
                "lane {v}: {actual} vs {expected}"
            );
        }
    }

    #[test]
    fn amplitude_scales_output() {
        let bank = WavetableBank::new();
        let mut rng = test_rng();
        let mut state = OscillatorState::new();
        state.set_frequency(441.0, 44100);
        state.set_amplitude(0.0);
        state.prepare_block(&bank, &mut rng);
        for _ in 0..64 {
            assert_eq!(state.tick(&bank).to_array()[0], 0.0);
        }
    }
}
