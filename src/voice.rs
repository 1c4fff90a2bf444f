//! Fixed voice pool and polyphonic block rendering.

use std::sync::Arc;

use rand::{rngs::SmallRng, SeedableRng};

use crate::{
    dsp::{
        envelope::{EnvelopeGenerator, EnvelopeParameters, EnvelopeStage, EnvelopeState},
        filter::{FilterState, FilterType, StateVariableFilter},
        oscillator::OscillatorState,
    },
    utils::{
        batch::{self, Batch},
        frequency_from_note, ratio_from_semitones,
    },
    wavetable::{Waveform, WavetableBank},
};

// -------------------------------------------------------------------------------------------------

/// Size of the voice pool and thus the maximum polyphony.
pub const MAX_VOICES: usize = 32;

/// Oscillators per voice.
pub const OSCILLATORS_PER_VOICE: usize = 2;

/// Filters per voice, applied in series.
pub const FILTERS_PER_VOICE: usize = 2;

/// Pitch bend range in semitones for a full wheel deflection.
const PITCH_BEND_SEMITONES: f32 = 2.0;

/// Per block approach factor of voice filters towards their shared target settings.
const FILTER_SMOOTHING: f32 = 0.25;

// -------------------------------------------------------------------------------------------------

/// One unit of polyphony: a note's complete signal chain.
///
/// Voices are created once with the pool and only ever get activated and recycled, never
/// reallocated. A voice stays active after note-off until its amplitude envelope reaches
/// the `Off` stage.
#[derive(Debug, Clone)]
pub struct Voice {
    note: u8,
    channel: u8,
    active: bool,
    gain: f32,
    pending_release: bool,
    oscillators: [OscillatorState; OSCILLATORS_PER_VOICE],
    filters: [FilterState; FILTERS_PER_VOICE],
    amp_envelope: EnvelopeState,
    filter_envelope: EnvelopeState,
}

impl Voice {
    fn new() -> Self {
        Self {
            note: 0,
            channel: 0,
            active: false,
            gain: 0.0,
            pending_release: false,
            oscillators: [OscillatorState::new(), OscillatorState::new()],
            filters: [FilterState::default(), FilterState::default()],
            amp_envelope: EnvelopeState::new(),
            filter_envelope: EnvelopeState::new(),
        }
    }

    /// Is this voice currently playing a note?
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The note this voice is (or was last) playing.
    #[inline(always)]
    pub fn note(&self) -> u8 {
        self.note
    }
}

// -------------------------------------------------------------------------------------------------

/// Shared oscillator settings, applied to all voices.
#[derive(Debug, Clone, Copy)]
struct OscillatorSettings {
    tuning: f32, // frequency ratio relative to the played note
    amplitude: f32,
    waveform: Waveform,
    unison_voices: usize,
    unison_detune: f32,
    harmonize: bool,
}

impl Default for OscillatorSettings {
    fn default() -> Self {
        Self {
            tuning: 1.0,
            amplitude: 0.5,
            waveform: Waveform::Sine,
            unison_voices: 1,
            unison_detune: 0.0,
            harmonize: false,
        }
    }
}

/// Shared filter settings, applied to all voices.
#[derive(Debug, Clone, Copy)]
struct FilterSettings {
    frequency: f32,
    resonance: f32,
    filter_type: FilterType,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            frequency: 2000.0,
            resonance: 0.707,
            filter_type: FilterType::Lowpass,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Owns the fixed voice pool, dispatches note events onto it and renders all active voices
/// into a stereo mix.
///
/// Note-ons activate the first inactive voice; when the pool is exhausted the note is dropped
/// (no voice stealing). All voice state is owned here and only ever touched from the audio
/// thread - parameter setters store shared target settings which active voices approach at
/// block rate.
pub struct VoiceHandler {
    sample_rate: u32,
    bank: Arc<WavetableBank>,
    voices: Vec<Voice>,
    oscillator_settings: [OscillatorSettings; OSCILLATORS_PER_VOICE],
    filter_settings: [FilterSettings; FILTERS_PER_VOICE],
    amp_envelope: EnvelopeGenerator,
    filter_envelope: EnvelopeGenerator,
    filter: StateVariableFilter,
    pitch_bend: f32,
    sustain: bool,
    pan_left: Batch,
    pan_right: Batch,
    rng: SmallRng,
}

impl VoiceHandler {
    pub fn new(sample_rate: u32, bank: Arc<WavetableBank>) -> Self {
        let voices = vec![Voice::new(); MAX_VOICES];

        let amp_envelope = EnvelopeGenerator::new(
            sample_rate,
            EnvelopeParameters {
                attack_time: std::time::Duration::from_millis(10),
                decay_time: std::time::Duration::from_millis(100),
                sustain_level: 0.7,
                release_time: std::time::Duration::from_millis(200),
            },
        );
        let filter_envelope = EnvelopeGenerator::new(
            sample_rate,
            EnvelopeParameters {
                attack_time: std::time::Duration::from_millis(100),
                decay_time: std::time::Duration::from_millis(200),
                sustain_level: 0.5,
                release_time: std::time::Duration::from_millis(300),
            },
        );

        // unison lanes alternate left/right around the center
        let pan_left = Batch::from([0.7, 0.3, 0.7, 0.3, 0.7, 0.3, 0.7, 0.3]);
        let pan_right = Batch::from([0.3, 0.7, 0.3, 0.7, 0.3, 0.7, 0.3, 0.7]);

        Self {
            sample_rate,
            bank,
            voices,
            oscillator_settings: [OscillatorSettings::default(); OSCILLATORS_PER_VOICE],
            filter_settings: [FilterSettings::default(); FILTERS_PER_VOICE],
            amp_envelope,
            filter_envelope,
            filter: StateVariableFilter::new(sample_rate),
            pitch_bend: 1.0,
            sustain: false,
            pan_left,
            pan_right,
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Number of currently active voices.
    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|voice| voice.active).count()
    }

    /// Access to the voice pool, e.g. for tests and debugging views.
    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    /// The wavetable bank all voices read from.
    pub fn bank(&self) -> &Arc<WavetableBank> {
        &self.bank
    }

    /// Activate a free voice for the given note. Velocity is normalized to `[0, 1]`.
    /// Returns false when the pool is exhausted and the note got dropped.
    #[must_use]
    pub fn note_on(&mut self, note: u8, velocity: f32, channel: u8) -> bool {
        let settings = self.oscillator_settings;
        let filter_settings = self.filter_settings;
        let Some(voice) = self.voices.iter_mut().find(|voice| !voice.active) else {
            return false;
        };

        voice.note = note;
        voice.channel = channel;
        voice.active = true;
        voice.gain = velocity.clamp(0.0, 1.0);
        voice.pending_release = false;

        for (oscillator, settings) in voice.oscillators.iter_mut().zip(settings.iter()) {
            oscillator.set_waveform(settings.waveform);
            oscillator.set_unison(
                settings.unison_voices,
                settings.unison_detune,
                settings.harmonize,
            );
            oscillator.reset();
        }
        for (filter, settings) in voice.filters.iter_mut().zip(filter_settings.iter()) {
            filter.set_frequency(settings.frequency);
            filter.set_resonance(settings.resonance);
            filter.set_filter_type(settings.filter_type);
            filter.reset();
        }

        self.amp_envelope.trigger(&mut voice.amp_envelope);
        self.filter_envelope.trigger(&mut voice.filter_envelope);
        true
    }

    /// Release all active voices playing the given note on the given channel. While the
    /// sustain pedal is held the release is deferred until the pedal lifts.
    pub fn note_off(&mut self, note: u8, channel: u8) {
        let sustain = self.sustain;
        for voice in self
            .voices
            .iter_mut()
            .filter(|voice| voice.active && voice.note == note && voice.channel == channel)
        {
            if sustain {
                voice.pending_release = true;
            } else {
                self.amp_envelope.release(&mut voice.amp_envelope);
                self.filter_envelope.release(&mut voice.filter_envelope);
            }
        }
    }

    /// Hold the sustain pedal: subsequent note-offs are deferred.
    pub fn sustain_on(&mut self) {
        self.sustain = true;
    }

    /// Lift the sustain pedal and release all deferred note-offs.
    pub fn sustain_off(&mut self) {
        self.sustain = false;
        for voice in self
            .voices
            .iter_mut()
            .filter(|voice| voice.active && voice.pending_release)
        {
            voice.pending_release = false;
            self.amp_envelope.release(&mut voice.amp_envelope);
            self.filter_envelope.release(&mut voice.filter_envelope);
        }
    }

    /// Apply a pitch bend to all voices. `value` is the normalized wheel deflection in
    /// `[-1, 1]` for a bend of +-2 semitones.
    pub fn set_pitch_bend(&mut self, value: f32) {
        self.pitch_bend = ratio_from_semitones(value.clamp(-1.0, 1.0) * PITCH_BEND_SEMITONES);
    }

    /// Polyphonic aftertouch: raise the matching voices' gain up to the pressure value.
    pub fn set_aftertouch(&mut self, note: u8, channel: u8, pressure: f32) {
        for voice in self
            .voices
            .iter_mut()
            .filter(|voice| voice.active && voice.note == note && voice.channel == channel)
        {
            voice.gain = voice.gain.max(pressure.clamp(0.0, 1.0));
        }
    }

    /// Channel aftertouch: raise all of the channel's voice gains up to the pressure value.
    pub fn set_channel_aftertouch(&mut self, channel: u8, pressure: f32) {
        for voice in self
            .voices
            .iter_mut()
            .filter(|voice| voice.active && voice.channel == channel)
        {
            voice.gain = voice.gain.max(pressure.clamp(0.0, 1.0));
        }
    }

    /// Update the shared settings of one of the two oscillators. `frequency` tunes the
    /// oscillator as the frequency played for A4 (440 Hz keeps notes at concert pitch).
    /// Out of range indices and values are clamped.
    pub fn set_oscillator_parameters(
        &mut self,
        oscillator_index: usize,
        frequency: f32,
        amplitude: f32,
        waveform: Waveform,
    ) {
        let settings =
            &mut self.oscillator_settings[oscillator_index.min(OSCILLATORS_PER_VOICE - 1)];
        settings.tuning = (frequency / 440.0).clamp(0.0, 16.0);
        settings.amplitude = amplitude.clamp(0.0, 1.0);
        settings.waveform = waveform;
    }

    /// Update the unison spread of one of the two oscillators.
    pub fn set_unison(
        &mut self,
        oscillator_index: usize,
        voices: usize,
        detune_cents: f32,
        harmonize: bool,
    ) {
        let settings =
            &mut self.oscillator_settings[oscillator_index.min(OSCILLATORS_PER_VOICE - 1)];
        settings.unison_voices = voices.clamp(1, crate::dsp::oscillator::MAX_UNISON);
        settings.unison_detune = detune_cents;
        settings.harmonize = harmonize;
    }

    /// Update the shared settings of one of the two filters. Out of range indices and values
    /// are clamped; active voices approach the new targets at block rate.
    pub fn set_filter_parameters(
        &mut self,
        filter_index: usize,
        frequency: f32,
        resonance: f32,
        filter_type: FilterType,
    ) {
        let settings = &mut self.filter_settings[filter_index.min(FILTERS_PER_VOICE - 1)];
        settings.frequency = frequency.clamp(0.0, self.sample_rate as f32 * 0.49);
        settings.resonance = resonance.max(0.1);
        settings.filter_type = filter_type;
    }

    /// Update the amplitude or filter modulation envelope shape for all voices.
    pub fn set_envelope_parameters(&mut self, is_amp_envelope: bool, params: EnvelopeParameters) {
        if is_amp_envelope {
            self.amp_envelope.set_parameters(params);
        } else {
            self.filter_envelope.set_parameters(params);
        }
    }

    /// Current cutoff target of the first filter, for the post-processing parameter record.
    pub fn current_cutoff(&self) -> f32 {
        self.filter_settings[0].frequency
    }

    /// Current resonance target of the first filter.
    pub fn current_resonance(&self) -> f32 {
        self.filter_settings[0].resonance
    }

    /// Render all active voices added into the given stereo buffers.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        debug_assert!(left.len() == right.len(), "Unbalanced output buffers");

        left.fill(0.0);
        right.fill(0.0);
        if left.is_empty() {
            return;
        }

        self.prepare_voices();

        let frames = left.len();
        for i in 0..frames {
            let mut left_sample = 0.0;
            let mut right_sample = 0.0;

            for voice in self.voices.iter_mut().filter(|voice| voice.active) {
                let mut mixed = Batch::splat(0.0);
                for oscillator in voice.oscillators.iter_mut() {
                    mixed += oscillator.tick(&self.bank);
                }

                let mut filtered = mixed;
                for filter in voice.filters.iter_mut() {
                    filtered = self.filter.process(filter, filtered);
                }

                let filter_env = self.filter_envelope.process(&mut voice.filter_envelope);
                let amp_env = self.amp_envelope.process(&mut voice.amp_envelope);
                let shaped = filtered * filter_env * amp_env;

                left_sample += batch::horizontal_sum(shaped * self.pan_left);
                right_sample += batch::horizontal_sum(shaped * self.pan_right);
            }

            left[i] = left_sample;
            right[i] = right_sample;
        }

        self.recycle_finished_voices();
    }

    /// Update per-voice oscillator increments and approach the shared filter targets.
    fn prepare_voices(&mut self) {
        let sample_rate = self.sample_rate;
        let pitch_bend = self.pitch_bend;
        let oscillator_settings = self.oscillator_settings;
        let filter_settings = self.filter_settings;
        let bank = Arc::clone(&self.bank);

        for voice in self.voices.iter_mut().filter(|voice| voice.active) {
            let note_frequency = frequency_from_note(voice.note) * pitch_bend;

            for (oscillator, settings) in
                voice.oscillators.iter_mut().zip(oscillator_settings.iter())
            {
                oscillator.set_waveform(settings.waveform);
                oscillator.set_amplitude(settings.amplitude * voice.gain);
                oscillator.set_unison(
                    settings.unison_voices,
                    settings.unison_detune,
                    settings.harmonize,
                );
                oscillator.set_frequency(note_frequency * settings.tuning, sample_rate);
                oscillator.prepare_block(&bank, &mut self.rng);
            }

            for (filter, settings) in voice.filters.iter_mut().zip(filter_settings.iter()) {
                let frequency = filter.frequency()
                    + (settings.frequency - filter.frequency()) * FILTER_SMOOTHING;
                let resonance = filter.resonance()
                    + (settings.resonance - filter.resonance()) * FILTER_SMOOTHING;
                filter.set_frequency(frequency);
                filter.set_resonance(resonance);
                filter.set_filter_type(settings.filter_type);
            }
        }
    }

    /// Free voices whose amplitude envelope finished its release.
    fn recycle_finished_voices(&mut self) {
        for voice in self.voices.iter_mut().filter(|voice| voice.active) {
            if voice.amp_envelope.stage() == EnvelopeStage::Off && !voice.amp_envelope.is_triggered()
            {
                voice.active = false;
                voice.pending_release = false;
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
