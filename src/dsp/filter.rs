//! State variable filter, processing all unison lanes of a voice in one batch.

use crate::utils::batch::Batch;

// -------------------------------------------------------------------------------------------------

/// Available filter responses. All four are computed from the same internal state,
/// the type only selects which component is returned.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
pub enum FilterType {
    #[default]
    Lowpass,
    Highpass,
    Bandpass,
    Notch,
}

impl FilterType {
    const ALL: [Self; 4] = [Self::Lowpass, Self::Highpass, Self::Bandpass, Self::Notch];

    /// Number of available filter types.
    pub const COUNT: usize = Self::ALL.len();

    /// Filter type for a raw index. Out of range indices are clamped to the last valid type:
    /// the render path never rejects values.
    pub fn from_index(index: usize) -> Self {
        Self::ALL[index.min(Self::COUNT - 1)]
    }
}

// -------------------------------------------------------------------------------------------------

/// Per-voice filter state with one accumulator lane per unison sub-voice.
#[derive(Debug, Clone)]
pub struct FilterState {
    low: Batch,
    band: Batch,
    high: Batch,
    notch: Batch,
    frequency: f32,
    resonance: f32,
    filter_type: FilterType,
    reset: bool,
}

impl FilterState {
    pub fn new(frequency: f32, resonance: f32, filter_type: FilterType) -> Self {
        Self {
            low: Batch::splat(0.0),
            band: Batch::splat(0.0),
            high: Batch::splat(0.0),
            notch: Batch::splat(0.0),
            frequency,
            resonance,
            filter_type,
            reset: false,
        }
    }

    /// Target cutoff frequency in Hz.
    #[inline(always)]
    pub fn frequency(&self) -> f32 {
        self.frequency
    }
    pub fn set_frequency(&mut self, frequency: f32) {
        self.frequency = frequency.max(0.0);
    }

    /// Target resonance. The coefficient computation bounds values below 0.5 to keep the
    /// filter from running away into self oscillation.
    #[inline(always)]
    pub fn resonance(&self) -> f32 {
        self.resonance
    }
    pub fn set_resonance(&mut self, resonance: f32) {
        self.resonance = resonance;
    }

    #[inline(always)]
    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }
    pub fn set_filter_type(&mut self, filter_type: FilterType) {
        self.filter_type = filter_type;
    }

    /// Clear all accumulators before the next processed sample.
    pub fn reset(&mut self) {
        self.reset = true;
    }
}

impl Default for FilterState {
    fn default() -> Self {
        Self::new(1000.0, 0.707, FilterType::Lowpass)
    }
}

// -------------------------------------------------------------------------------------------------

/// State variable filter with the one-pole-per-stage topology:
/// `high = input - (band * res + low)`, `band += f * high`, `low += f * band`,
/// `notch = high + low`, with `f = 2 * sin(pi * cutoff / sample_rate)`.
///
/// This is a second-order filter with a 12 dB/octave slope. It stays stable when
/// modulated at high rates, which matters for per-block cutoff interpolation.
#[derive(Debug, Clone)]
pub struct StateVariableFilter {
    sample_rate: u32,
}

impl StateVariableFilter {
    pub fn new(sample_rate: u32) -> Self {
        debug_assert!(sample_rate > 0, "Invalid sample rate");
        Self { sample_rate }
    }

    /// Currently applied sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        debug_assert!(sample_rate > 0, "Invalid sample rate");
        self.sample_rate = sample_rate;
    }

    /// Apply the filter on a batch of lane samples and update the state.
    #[inline]
    pub fn process(&self, state: &mut FilterState, input: Batch) -> Batch {
        if state.reset {
            state.low = Batch::splat(0.0);
            state.band = Batch::splat(0.0);
            state.high = Batch::splat(0.0);
            state.notch = Batch::splat(0.0);
            state.reset = false;
        }

        let f = Batch::splat(self.frequency_coefficient(state.frequency));
        let q = Batch::splat(Self::resonance_factor(state.resonance));

        let high = input - (state.band * q + state.low);
        let band = f * high + state.band;
        let low = f * band + state.low;
        let notch = high + low;

        state.high = high;
        state.band = band;
        state.low = low;
        state.notch = notch;

        match state.filter_type {
            FilterType::Lowpass => low,
            FilterType::Highpass => high,
            FilterType::Bandpass => band,
            FilterType::Notch => notch,
        }
    }

    #[inline]
    fn frequency_coefficient(&self, frequency: f32) -> f32 {
        // the integrator pair diverges for f^2 + 2*f*q > 4, so with q bounded at 2 the
        // coefficient must stay below 0.8
        const MAX_COEFFICIENT: f32 = 0.8;
        let cutoff = frequency.clamp(0.0, self.sample_rate as f32 * 0.49);
        (2.0 * (std::f32::consts::PI * cutoff / self.sample_rate as f32).sin())
            .min(MAX_COEFFICIENT)
    }

    #[inline]
    fn resonance_factor(resonance: f32) -> f32 {
        1.0 / resonance.max(0.5)
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_type_index_clamping() {
        assert_eq!(FilterType::from_index(0), FilterType::Lowpass);
        assert_eq!(FilterType::from_index(3), FilterType::Notch);
        assert_eq!(FilterType::from_index(100), FilterType::Notch);
    }

    #[test]
    fn lowpass_passes_dc() {
        let filter = StateVariableFilter::new(44100);
        let mut state = FilterState::new(1000.0, 0.707, FilterType::Lowpass);
        let mut output = 0.0;
        for _ in 0..4000 {
            output = filter.process(&mut state, Batch::splat(1.0)).to_array()[0];
        }
        assert!((output - 1.0).abs() < 1e-3, "lowpass should settle at DC: {output}");
    }

    #[test]
    fn highpass_blocks_dc() {
        let filter = StateVariableFilter::new(44100);
        let mut state = FilterState::new(1000.0, 0.707, FilterType::Highpass);
        let mut output = 1.0;
        for _ in 0..4000 {
            output = filter.process(&mut state, Batch::splat(1.0)).to_array()[0];
        }
        assert!(output.abs() < 1e-3, "highpass should reject DC: {output}");
    }

    #[test]
    fn reset_clears_accumulators() {
        let filter = StateVariableFilter::new(44100);
        let mut state = FilterState::default();
        for _ in 0..100 {
            let _ = filter.process(&mut state, Batch::splat(1.0));
        }
        state.reset();
        let first = filter.process(&mut state, Batch::splat(0.0)).to_array()[0];
        assert_eq!(first, 0.0);
    }

    #[test]
    fn all_lanes_filter_independently() {
        let filter = StateVariableFilter::new(44100);
        let mut state = FilterState::new(500.0, 0.707, FilterType::Lowpass);
        let input = Batch::from([1.0, -1.0, 0.5, 0.0, 1.0, -1.0, 0.5, 0.0]);
        let mut output = Batch::splat(0.0);
        for _ in 0..4000 {
            output = filter.process(&mut state, input);
        }
        let lanes = output.to_array();
        assert!((lanes[0] - 1.0).abs() < 1e-2);
        assert!((lanes[1] + 1.0).abs() < 1e-2);
        assert!((lanes[2] - 0.5).abs() < 1e-2);
        assert!(lanes[3].abs() < 1e-2);
    }
}
