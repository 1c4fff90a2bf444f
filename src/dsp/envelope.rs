//! ADSR envelope generator producing a batched control signal.

use std::time::Duration;

use crate::utils::batch::Batch;

// -------------------------------------------------------------------------------------------------

/// Current processing stage of an [`EnvelopeState`].
///
/// Stages only ever advance `Attack -> Decay -> Sustain -> Release -> Off`: a release can not
/// be skipped, and `Off` is terminal until the envelope gets retriggered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    Attack,
    Decay,
    Sustain,
    Release,
    #[default]
    Off,
}

// -------------------------------------------------------------------------------------------------

/// Envelope shape: stage times and the sustain level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeParameters {
    pub attack_time: Duration,
    pub decay_time: Duration,
    pub sustain_level: f32,
    pub release_time: Duration,
}

impl Default for EnvelopeParameters {
    fn default() -> Self {
        Self {
            attack_time: Duration::from_millis(10),
            decay_time: Duration::from_millis(100),
            sustain_level: 0.7,
            release_time: Duration::from_millis(200),
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Per-voice envelope state. The value is a batch so it can be multiplied into lane
/// signals without broadcasting in the render loop.
#[derive(Debug, Clone)]
pub struct EnvelopeState {
    current: Batch,
    target: Batch,
    rate: Batch,
    stage: EnvelopeStage,
    triggered: bool,
    released: bool,
}

impl EnvelopeState {
    pub fn new() -> Self {
        Self {
            current: Batch::splat(0.0),
            target: Batch::splat(0.0),
            rate: Batch::splat(0.0),
            stage: EnvelopeStage::Off,
            triggered: false,
            released: false,
        }
    }

    #[inline(always)]
    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    /// The last processed control value.
    #[inline(always)]
    pub fn value(&self) -> f32 {
        self.current.to_array()[0]
    }

    /// True while a pending trigger has not been consumed by `process` yet.
    #[inline(always)]
    pub fn is_triggered(&self) -> bool {
        self.triggered
    }
}

impl Default for EnvelopeState {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------------------------------------------------------------------

/// Envelope processor holding the shared shape parameters and the per-sample rates
/// derived from them.
///
/// Each sample the value approaches its stage target exponentially:
/// `current += (target - current) * rate` with `rate = 1 / max(time_in_samples, 1)`.
/// The one sample minimum keeps zero length stages from dividing away and bounds the
/// rate at 1, which makes the approach monotonic.
#[derive(Debug, Clone)]
pub struct EnvelopeGenerator {
    parameters: EnvelopeParameters,
    attack_rate: f32,
    decay_rate: f32,
    release_rate: f32,
    sample_rate: u32,
}

impl EnvelopeGenerator {
    /// Convergence threshold for stage transitions.
    const THRESHOLD: f32 = 1e-3;

    pub fn new(sample_rate: u32, parameters: EnvelopeParameters) -> Self {
        debug_assert!(sample_rate > 0, "Invalid sample rate");
        let mut generator = Self {
            parameters,
            attack_rate: 0.0,
            decay_rate: 0.0,
            release_rate: 0.0,
            sample_rate,
        };
        generator.update_rates();
        generator
    }

    pub fn parameters(&self) -> &EnvelopeParameters {
        &self.parameters
    }
    /// Apply a new envelope shape. The sustain level is clamped into `[0, 1]`.
    pub fn set_parameters(&mut self, parameters: EnvelopeParameters) {
        self.parameters = parameters;
        self.parameters.sustain_level = parameters.sustain_level.clamp(0.0, 1.0);
        self.update_rates();
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        debug_assert!(sample_rate > 0, "Invalid sample rate");
        self.sample_rate = sample_rate;
        self.update_rates();
    }

    /// Schedule an attack for the next processed sample.
    pub fn trigger(&self, state: &mut EnvelopeState) {
        state.triggered = true;
        state.released = false;
    }

    /// Schedule a release for the next processed sample. Does nothing while already
    /// releasing or off.
    pub fn release(&self, state: &mut EnvelopeState) {
        state.released = true;
    }

    /// Advance the envelope by one sample and return the new control value batch.
    #[inline]
    pub fn process(&self, state: &mut EnvelopeState) -> Batch {
        if state.triggered {
            self.start_attack(state);
            state.triggered = false;
        } else if state.released
            && !matches!(state.stage, EnvelopeStage::Release | EnvelopeStage::Off)
        {
            self.start_release(state);
        }

        self.update_value(state);
        state.current
    }

    fn start_attack(&self, state: &mut EnvelopeState) {
        state.stage = EnvelopeStage::Attack;
        state.target = Batch::splat(1.0);
        state.rate = Batch::splat(self.attack_rate);
    }

    fn start_decay(&self, state: &mut EnvelopeState) {
        state.stage = EnvelopeStage::Decay;
        state.target = Batch::splat(self.parameters.sustain_level);
        state.rate = Batch::splat(self.decay_rate);
    }

    fn start_release(&self, state: &mut EnvelopeState) {
        state.stage = EnvelopeStage::Release;
        state.target = Batch::splat(0.0);
        state.rate = Batch::splat(self.release_rate);
    }

    #[inline]
    fn update_value(&self, state: &mut EnvelopeState) {
        if state.stage == EnvelopeStage::Off {
            // terminal: value stays pinned at zero until retriggered
            return;
        }

        let difference = state.target - state.current;
        state.current += difference * state.rate;

        let reached_target = difference.to_array()[0].abs() < Self::THRESHOLD;
        match state.stage {
            EnvelopeStage::Attack if reached_target => self.start_decay(state),
            EnvelopeStage::Decay if reached_target => {
                state.current = state.target;
                state.stage = EnvelopeStage::Sustain;
            }
            EnvelopeStage::Release if reached_target => {
                state.current = Batch::splat(0.0);
                state.stage = EnvelopeStage::Off;
            }
            _ => (),
        }
    }

    fn update_rates(&mut self) {
        self.attack_rate = self.rate_for(self.parameters.attack_time);
        self.decay_rate = self.rate_for(self.parameters.decay_time);
        self.release_rate = self.rate_for(self.parameters.release_time);
    }

    fn rate_for(&self, time: Duration) -> f32 {
        1.0 / (time.as_secs_f32() * self.sample_rate as f32).max(1.0)
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> EnvelopeGenerator {
        EnvelopeGenerator::new(
            44100,
            EnvelopeParameters {
                attack_time: Duration::from_millis(10),
                decay_time: Duration::from_millis(10),
                sustain_level: 0.5,
                release_time: Duration::from_millis(10),
            },
        )
    }

    #[test]
    fn trigger_starts_attack() {
        let generator = generator();
        let mut state = EnvelopeState::new();
        generator.trigger(&mut state);
        let _ = generator.process(&mut state);
        assert_eq!(state.stage(), EnvelopeStage::Attack);
    }

    #[test]
    fn attack_is_monotonic() {
        let generator = generator();
        let mut state = EnvelopeState::new();
        generator.trigger(&mut state);
        let mut last = 0.0;
        for _ in 0..2000 {
            let value = generator.process(&mut state).to_array()[0];
            if state.stage() != EnvelopeStage::Attack {
                break;
            }
            assert!(value >= last, "attack must not fall: {value} < {last}");
            assert!(value <= 1.0);
            last = value;
        }
    }

    #[test]
    fn decay_settles_at_sustain() {
        let generator = generator();
        let mut state = EnvelopeState::new();
        generator.trigger(&mut state);
        for _ in 0..10000 {
            let _ = generator.process(&mut state);
        }
        assert_eq!(state.stage(), EnvelopeStage::Sustain);
        assert!((state.value() - 0.5).abs() < 1e-2);
    }

    #[test]
    fn release_is_monotonic_and_ends_off() {
        let generator = generator();
        let mut state = EnvelopeState::new();
        generator.trigger(&mut state);
        for _ in 0..10000 {
            let _ = generator.process(&mut state);
        }
        generator.release(&mut state);
        let mut last = state.value();
        for _ in 0..10000 {
            let value = generator.process(&mut state).to_array()[0];
            assert!(value <= last + 1e-6, "release must not rise");
            last = value;
            if state.stage() == EnvelopeStage::Off {
                break;
            }
        }
        assert_eq!(state.stage(), EnvelopeStage::Off);
        assert_eq!(state.value(), 0.0);
    }

    #[test]
    fn off_is_terminal_until_retriggered() {
        let generator = generator();
        let mut state = EnvelopeState::new();
        generator.trigger(&mut state);
        for _ in 0..10000 {
            let _ = generator.process(&mut state);
        }
        generator.release(&mut state);
        for _ in 0..10000 {
            let _ = generator.process(&mut state);
        }
        assert_eq!(state.stage(), EnvelopeStage::Off);

        // further processing or another release keeps it off at zero
        generator.release(&mut state);
        for _ in 0..100 {
            assert_eq!(generator.process(&mut state).to_array()[0], 0.0);
        }
        assert_eq!(state.stage(), EnvelopeStage::Off);

        generator.trigger(&mut state);
        let _ = generator.process(&mut state);
        assert_eq!(state.stage(), EnvelopeStage::Attack);
    }

    #[test]
    fn zero_length_stages_are_one_sample() {
        let generator = EnvelopeGenerator::new(
            44100,
            EnvelopeParameters {
                attack_time: Duration::ZERO,
                decay_time: Duration::ZERO,
                sustain_level: 0.5,
                release_time: Duration::ZERO,
            },
        );
        let mut state = EnvelopeState::new();
        generator.trigger(&mut state);
        let value = generator.process(&mut state).to_array()[0];
        assert!((value - 1.0).abs() < 1e-6, "zero attack reaches full level in one sample");
    }
}
