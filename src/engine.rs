//! The synthesizer engine: event interpretation, voice rendering and post-processing.

use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_channel::Sender;
use crossbeam_queue::ArrayQueue;

use crate::{
    dsp::{envelope::EnvelopeParameters, filter::FilterType, lfo::Lfo},
    error::Error,
    midi::{MidiEvent, MidiEventQueue},
    pipeline::{PipelineManager, ProcessingParams, BLOCK_SIZE},
    utils::random::synced_random_sequence,
    voice::VoiceHandler,
    wavetable::{Waveform, WavetableBank},
};

// -------------------------------------------------------------------------------------------------

const MOD_WHEEL_CONTROLLER: u8 = 1;
const SUSTAIN_CONTROLLER: u8 = 64;

const CONTROL_QUEUE_CAPACITY: usize = 256;

// -------------------------------------------------------------------------------------------------

/// Diagnostics events, emitted from the engine over an optional channel.
///
/// Resource exhaustion is never fatal for the engine itself: dropped notes and full queues
/// only surface here so hosts can count and report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// A note-on found no free voice and got dropped.
    NoteDropped { note: u8, channel: u8 },
    /// A MIDI event got dropped because the event queue was full.
    MidiQueueFull,
    /// A parameter change got dropped because the control queue was full.
    ControlQueueFull,
}

// -------------------------------------------------------------------------------------------------

/// Parameter changes routed from other threads onto the audio thread.
#[derive(Debug, Clone, Copy)]
enum ControlMessage {
    Oscillator {
        index: usize,
        frequency: f32,
        amplitude: f32,
        waveform: Waveform,
    },
    Unison {
        index: usize,
        voices: usize,
        detune_cents: f32,
        harmonize: bool,
    },
    Filter {
        index: usize,
        frequency: f32,
        resonance: f32,
        filter_type: FilterType,
    },
    Envelope {
        is_amp_envelope: bool,
        parameters: EnvelopeParameters,
    },
    Lfo {
        waveform: Waveform,
        frequency: f32,
        phase_offset: f32,
    },
    LfoReset,
}

// -------------------------------------------------------------------------------------------------

/// Real-time polyphonic synthesizer engine.
///
/// One instance drives one synth: MIDI events get queued from any thread, parameter changes
/// either applied directly (same-thread hosts) or routed through an [`EngineHandle`], and the
/// host pulls stereo blocks with [`Self::process_block`] once per audio callback. The render
/// path never allocates, blocks or panics; with the `assert-allocs` feature debug builds
/// abort should an allocation slip in.
pub struct SynthEngine {
    sample_rate: u32,
    voice_handler: VoiceHandler,
    lfo: Lfo,
    lfo_depth: f32,
    envelope_amount: f32,
    midi_queue: Arc<MidiEventQueue>,
    control_queue: Arc<ArrayQueue<ControlMessage>>,
    pipeline: PipelineManager,
    event_sender: Option<Sender<EngineEvent>>,
    lfo_seed: Arc<AtomicU32>,
    lfo_resolution: Arc<AtomicUsize>,
    total_frames: u64,
    scratch_left: [f32; BLOCK_SIZE],
    scratch_right: [f32; BLOCK_SIZE],
    lfo_scratch: [f32; BLOCK_SIZE],
}

impl SynthEngine {
    /// Create a new engine for the given sample rate, building the wavetable bank and
    /// preallocating the voice pool and pipeline.
    pub fn new(sample_rate: u32) -> Result<Self, Error> {
        if sample_rate == 0 {
            return Err(Error::ParameterError(format!(
                "Invalid sample rate: must be > 0, but is {sample_rate}"
            )));
        }
        log::debug!("creating synth engine with sample rate {sample_rate}");

        let bank = Arc::new(WavetableBank::new());
        let voice_handler = VoiceHandler::new(sample_rate, bank);
        let lfo = Lfo::new(sample_rate, 1.0, Waveform::Sine);
        let lfo_seed = Arc::new(AtomicU32::new(lfo.cycle_seed()));
        let lfo_resolution = Arc::new(AtomicUsize::new(lfo.cycle_resolution()));

        Ok(Self {
            sample_rate,
            voice_handler,
            lfo,
            lfo_depth: 0.0,
            envelope_amount: 1.0,
            midi_queue: Arc::new(MidiEventQueue::default()),
            control_queue: Arc::new(ArrayQueue::new(CONTROL_QUEUE_CAPACITY)),
            pipeline: PipelineManager::new(sample_rate),
            event_sender: None,
            lfo_seed,
            lfo_resolution,
            total_frames: 0,
            scratch_left: [0.0; BLOCK_SIZE],
            scratch_right: [0.0; BLOCK_SIZE],
            lfo_scratch: [0.0; BLOCK_SIZE],
        })
    }

    /// The engine's sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of currently playing voices.
    pub fn active_voices(&self) -> usize {
        self.voice_handler.active_voices()
    }

    /// Access to the voice handler, e.g. for tests and debugging views.
    pub fn voice_handler(&self) -> &VoiceHandler {
        &self.voice_handler
    }

    /// The engine's modulation LFO.
    pub fn lfo(&self) -> &Lfo {
        &self.lfo
    }

    /// Install a diagnostics event channel. Create [`EngineHandle`]s after setting this,
    /// handles keep their own clone of the sender.
    pub fn set_event_sender(&mut self, sender: Option<Sender<EngineEvent>>) {
        self.event_sender = sender;
    }

    /// A cloneable control-side handle for use from other threads.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            midi_queue: Arc::clone(&self.midi_queue),
            control_queue: Arc::clone(&self.control_queue),
            event_sender: self.event_sender.clone(),
            lfo_seed: Arc::clone(&self.lfo_seed),
            lfo_resolution: Arc::clone(&self.lfo_resolution),
        }
    }

    /// Enqueue a MIDI event without blocking. Returns false when the queue was full and the
    /// event got dropped.
    #[must_use]
    pub fn push_midi_event(&self, event: MidiEvent) -> bool {
        let pushed = self.midi_queue.push(event);
        if !pushed {
            self.emit_event(EngineEvent::MidiQueueFull);
        }
        pushed
    }

    /// Update one oscillator's shared settings. `frequency` tunes the oscillator as the
    /// frequency played for A4. Out of range values are clamped, never rejected.
    pub fn set_oscillator_parameters(
        &mut self,
        oscillator_index: usize,
        frequency: f32,
        amplitude: f32,
        waveform: Waveform,
    ) {
        self.voice_handler
            .set_oscillator_parameters(oscillator_index, frequency, amplitude, waveform);
    }

    /// Update one oscillator's unison spread.
    pub fn set_unison(
        &mut self,
        oscillator_index: usize,
        voices: usize,
        detune_cents: f32,
        harmonize: bool,
    ) {
        self.voice_handler
            .set_unison(oscillator_index, voices, detune_cents, harmonize);
    }

    /// Update one filter's shared settings. Out of range values are clamped, never rejected.
    pub fn set_filter_parameters(
        &mut self,
        filter_index: usize,
        frequency: f32,
        resonance: f32,
        filter_type: FilterType,
    ) {
        self.voice_handler
            .set_filter_parameters(filter_index, frequency, resonance, filter_type);
    }

    /// Update the amplitude or filter modulation envelope shape.
    pub fn set_envelope_parameters(
        &mut self,
        is_amp_envelope: bool,
        parameters: EnvelopeParameters,
    ) {
        self.voice_handler
            .set_envelope_parameters(is_amp_envelope, parameters);
    }

    /// Update the modulation LFO.
    pub fn set_lfo_parameters(&mut self, waveform: Waveform, frequency: f32, phase_offset: f32) {
        self.lfo.set_waveform(waveform);
        self.lfo.set_frequency(frequency);
        self.lfo.set_phase_offset(phase_offset);
    }

    /// Retrigger the modulation LFO at the start of the next block.
    pub fn reset_lfo(&mut self) {
        self.lfo.reset();
    }

    /// Render exactly `left.len()` stereo frames: drains all pending control and MIDI
    /// events, renders the polyphony and post-processes the mix through the pipeline.
    /// Arbitrary host block sizes are handled by chunking internally.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        debug_assert!(left.len() == right.len(), "Unbalanced output buffers");
        let frames = left.len().min(right.len());

        Self::assert_no_alloc(|| {
            self.apply_control_messages();
            self.process_midi_events();

            let mut offset = 0;
            while offset < frames {
                let chunk = (frames - offset).min(BLOCK_SIZE);
                self.render_chunk(
                    &mut left[offset..offset + chunk],
                    &mut right[offset..offset + chunk],
                );
                offset += chunk;
            }
        });
    }

    fn render_chunk(&mut self, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len();
        if frames == 0 {
            return;
        }

        self.voice_handler.process_block(
            &mut self.scratch_left[..frames],
            &mut self.scratch_right[..frames],
        );

        self.lfo.process(&mut self.lfo_scratch[..frames]);
        self.lfo_seed.store(self.lfo.cycle_seed(), Ordering::Relaxed);
        self.lfo_resolution
            .store(self.lfo.cycle_resolution(), Ordering::Relaxed);

        // fold the block's last LFO value into the pipeline's envelope amount, scaled by
        // the mod wheel depth
        let lfo_value = self.lfo_scratch[frames - 1];
        let envelope_amount =
            (self.envelope_amount * (1.0 + lfo_value * self.lfo_depth)).max(0.0);

        self.pipeline.update_parameters(ProcessingParams {
            cutoff: self.voice_handler.current_cutoff(),
            resonance: self.voice_handler.current_resonance(),
            envelope_amount,
            lfo_rate: self.lfo.frequency(),
            frame_count: frames as u32,
        });

        let timestamp = self.total_frames as f64 / self.sample_rate as f64;
        let processed = self.pipeline.process_audio_block(
            &self.scratch_left[..frames],
            &self.scratch_right[..frames],
            left,
            right,
            timestamp,
        );
        debug_assert!(processed == frames, "Pipeline truncated a block");

        self.total_frames += frames as u64;
    }

    fn apply_control_messages(&mut self) {
        let queue = Arc::clone(&self.control_queue);
        while let Some(message) = queue.pop() {
            match message {
                ControlMessage::Oscillator {
                    index,
                    frequency,
                    amplitude,
                    waveform,
                } => self.set_oscillator_parameters(index, frequency, amplitude, waveform),
                ControlMessage::Unison {
                    index,
                    voices,
                    detune_cents,
                    harmonize,
                } => self.set_unison(index, voices, detune_cents, harmonize),
                ControlMessage::Filter {
                    index,
                    frequency,
                    resonance,
                    filter_type,
                } => self.set_filter_parameters(index, frequency, resonance, filter_type),
                ControlMessage::Envelope {
                    is_amp_envelope,
                    parameters,
                } => self.set_envelope_parameters(is_amp_envelope, parameters),
                ControlMessage::Lfo {
                    waveform,
                    frequency,
                    phase_offset,
                } => self.set_lfo_parameters(waveform, frequency, phase_offset),
                ControlMessage::LfoReset => self.reset_lfo(),
            }
        }
    }

    fn process_midi_events(&mut self) {
        let queue = Arc::clone(&self.midi_queue);
        queue.process_events(|event| self.handle_midi_event(event));
    }

    fn handle_midi_event(&mut self, event: MidiEvent) {
        match event {
            MidiEvent::NoteOn {
                note,
                velocity,
                channel,
                ..
            } => {
                if velocity == 0 {
                    // running status note-off
                    self.voice_handler.note_off(note, channel);
                } else if !self
                    .voice_handler
                    .note_on(note, velocity as f32 / 127.0, channel)
                {
                    self.emit_event(EngineEvent::NoteDropped { note, channel });
                }
            }
            MidiEvent::NoteOff { note, channel, .. } => {
                self.voice_handler.note_off(note, channel);
            }
            MidiEvent::ControlChange {
                controller, value, ..
            } => match controller {
                MOD_WHEEL_CONTROLLER => self.lfo_depth = value as f32 / 127.0,
                SUSTAIN_CONTROLLER => {
                    if value >= 64 {
                        self.voice_handler.sustain_on();
                    } else {
                        self.voice_handler.sustain_off();
                    }
                }
                _ => (),
            },
            MidiEvent::PitchBend { value, .. } => {
                self.voice_handler.set_pitch_bend(value as f32 / 8192.0);
            }
            MidiEvent::Aftertouch {
                note,
                pressure,
                channel,
                ..
            } => {
                self.voice_handler
                    .set_aftertouch(note, channel, pressure as f32 / 127.0);
            }
            MidiEvent::ChannelAftertouch {
                pressure, channel, ..
            } => {
                self.voice_handler
                    .set_channel_aftertouch(channel, pressure as f32 / 127.0);
            }
        }
    }

    fn emit_event(&self, event: EngineEvent) {
        if let Some(sender) = &self.event_sender {
            Self::permit_alloc(|| {
                // NB: try_send: never block the audio thread on a stuffed diagnostics channel
                if let Err(err) = sender.try_send(event) {
                    log::warn!("failed to send engine event: {err}");
                }
            });
        }
    }

    #[inline(always)]
    fn assert_no_alloc<T, F: FnOnce() -> T>(func: F) -> T {
        #[cfg(feature = "assert-allocs")]
        return assert_no_alloc::assert_no_alloc::<T, F>(func);
        #[cfg(not(feature = "assert-allocs"))]
        return func();
    }

    #[inline(always)]
    fn permit_alloc<T, F: FnOnce() -> T>(func: F) -> T {
        #[cfg(feature = "assert-allocs")]
        return assert_no_alloc::permit_alloc::<T, F>(func);
        #[cfg(not(feature = "assert-allocs"))]
        return func();
    }
}

// -------------------------------------------------------------------------------------------------

/// Cloneable control-side view of a [`SynthEngine`] for use from non-audio threads.
///
/// All methods are non-blocking: MIDI events and parameter changes get queued and are applied
/// on the audio thread at the start of its next block. The LFO cycle state is mirrored through
/// atomics, so a GUI can reconstruct the engine's current synchronized random sequence without
/// touching audio state.
#[derive(Clone)]
pub struct EngineHandle {
    midi_queue: Arc<MidiEventQueue>,
    control_queue: Arc<ArrayQueue<ControlMessage>>,
    event_sender: Option<Sender<EngineEvent>>,
    lfo_seed: Arc<AtomicU32>,
    lfo_resolution: Arc<AtomicUsize>,
}

impl EngineHandle {
    /// Enqueue a MIDI event without blocking. Returns false when the queue was full and the
    /// event got dropped.
    #[must_use]
    pub fn push_midi_event(&self, event: MidiEvent) -> bool {
        let pushed = self.midi_queue.push(event);
        if !pushed {
            self.emit_event(EngineEvent::MidiQueueFull);
        }
        pushed
    }

    /// Queue an oscillator parameter change. See [`SynthEngine::set_oscillator_parameters`].
    pub fn set_oscillator_parameters(
        &self,
        oscillator_index: usize,
        frequency: f32,
        amplitude: f32,
        waveform: Waveform,
    ) -> bool {
        self.send(ControlMessage::Oscillator {
            index: oscillator_index,
            frequency,
            amplitude,
            waveform,
        })
    }

    /// Queue a unison change. See [`SynthEngine::set_unison`].
    pub fn set_unison(
        &self,
        oscillator_index: usize,
        voices: usize,
        detune_cents: f32,
        harmonize: bool,
    ) -> bool {
        self.send(ControlMessage::Unison {
            index: oscillator_index,
            voices,
            detune_cents,
            harmonize,
        })
    }

    /// Queue a filter parameter change. See [`SynthEngine::set_filter_parameters`].
    pub fn set_filter_parameters(
        &self,
        filter_index: usize,
        frequency: f32,
        resonance: f32,
        filter_type: FilterType,
    ) -> bool {
        self.send(ControlMessage::Filter {
            index: filter_index,
            frequency,
            resonance,
            filter_type,
        })
    }

    /// Queue an envelope shape change. See [`SynthEngine::set_envelope_parameters`].
    pub fn set_envelope_parameters(
        &self,
        is_amp_envelope: bool,
        parameters: EnvelopeParameters,
    ) -> bool {
        self.send(ControlMessage::Envelope {
            is_amp_envelope,
            parameters,
        })
    }

    /// Queue an LFO change. See [`SynthEngine::set_lfo_parameters`].
    pub fn set_lfo_parameters(&self, waveform: Waveform, frequency: f32, phase_offset: f32) -> bool {
        self.send(ControlMessage::Lfo {
            waveform,
            frequency,
            phase_offset,
        })
    }

    /// Queue an LFO retrigger.
    pub fn reset_lfo(&self) -> bool {
        self.send(ControlMessage::LfoReset)
    }

    /// Seed of the LFO's current synchronized random cycle.
    pub fn lfo_cycle_seed(&self) -> u32 {
        self.lfo_seed.load(Ordering::Relaxed)
    }

    /// Resolution of the LFO's current synchronized random cycle.
    pub fn lfo_cycle_resolution(&self) -> usize {
        self.lfo_resolution.load(Ordering::Relaxed)
    }

    /// Reconstruct the LFO's current random sequence into `out` and return the number of
    /// values written. An external renderer calling this draws the exact same values the
    /// audio thread plays.
    pub fn lfo_cycle_sequence(&self, out: &mut [f32]) -> usize {
        let length = self.lfo_cycle_resolution().min(out.len());
        synced_random_sequence(self.lfo_cycle_seed(), &mut out[..length]);
        length
    }

    fn send(&self, message: ControlMessage) -> bool {
        let sent = self.control_queue.push(message).is_ok();
        if !sent {
            self.emit_event(EngineEvent::ControlQueueFull);
        }
        sent
    }

    fn emit_event(&self, event: EngineEvent) {
        if let Some(sender) = &self.event_sender {
            if let Err(err) = sender.try_send(event) {
                log::warn!("failed to send engine event: {err}");
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(note: u8) -> MidiEvent {
        MidiEvent::NoteOn {
            note,
            velocity: 100,
            channel: 0,
            sample_offset: 0,
        }
    }

    #[test]
    fn invalid_sample_rate_is_rejected() {
        assert!(SynthEngine::new(0).is_err());
    }

    #[test]
    fn renders_silence_without_notes() {
        let mut engine = SynthEngine::new(44100).unwrap();
        let mut left = [1.0f32; 256];
        let mut right = [1.0f32; 256];
        engine.process_block(&mut left, &mut right);
        assert!(left.iter().all(|s| *s == 0.0));
        assert!(right.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn queued_notes_produce_audio() {
        let mut engine = SynthEngine::new(44100).unwrap();
        assert!(engine.push_midi_event(note_on(69)));

        let mut left = [0.0f32; 512];
        let mut right = [0.0f32; 512];
        engine.process_block(&mut left, &mut right);

        assert_eq!(engine.active_voices(), 1);
        let energy: f32 = left.iter().map(|s| s * s).sum();
        assert!(energy > 0.0, "a queued note must be audible");
        assert!(left.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn chunked_rendering_handles_any_block_size() {
        let mut engine = SynthEngine::new(44100).unwrap();
        assert!(engine.push_midi_event(note_on(60)));

        // longer than the internal block capacity and not a multiple of it
        let mut left = [0.0f32; 3 * BLOCK_SIZE + 37];
        let mut right = [0.0f32; 3 * BLOCK_SIZE + 37];
        engine.process_block(&mut left, &mut right);
        assert!(left.iter().all(|s| s.is_finite()));
        assert!(right.iter().all(|s| s.is_finite()));

        let tail_energy: f32 = left[3 * BLOCK_SIZE..].iter().map(|s| s * s).sum();
        assert!(tail_energy > 0.0, "the trailing partial chunk must be rendered too");
    }

    #[test]
    fn note_off_silences_after_release() {
        let mut engine = SynthEngine::new(44100).unwrap();
        engine.set_envelope_parameters(
            true,
            EnvelopeParameters {
                attack_time: std::time::Duration::ZERO,
                decay_time: std::time::Duration::from_millis(1),
                sustain_level: 0.8,
                release_time: std::time::Duration::from_millis(1),
            },
        );
        assert!(engine.push_midi_event(note_on(60)));
        let mut left = [0.0f32; 256];
        let mut right = [0.0f32; 256];
        engine.process_block(&mut left, &mut right);
        assert_eq!(engine.active_voices(), 1);

        assert!(engine.push_midi_event(MidiEvent::NoteOff {
            note: 60,
            channel: 0,
            sample_offset: 0,
        }));
        for _ in 0..40 {
            engine.process_block(&mut left, &mut right);
        }
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn dropped_notes_are_reported() {
        let (sender, receiver) = crossbeam_channel::bounded(64);
        let mut engine = SynthEngine::new(44100).unwrap();
        engine.set_event_sender(Some(sender));

        for note in 0..(crate::voice::MAX_VOICES + 4) as u8 {
            assert!(engine.push_midi_event(note_on(note)));
        }
        let mut left = [0.0f32; 64];
        let mut right = [0.0f32; 64];
        engine.process_block(&mut left, &mut right);

        let dropped: Vec<_> = receiver.try_iter().collect();
        assert_eq!(dropped.len(), 4);
        assert!(dropped
            .iter()
            .all(|event| matches!(event, EngineEvent::NoteDropped { .. })));
    }

    #[test]
    fn handle_routes_parameter_changes() {
        let mut engine = SynthEngine::new(44100).unwrap();
        let handle = engine.handle();
        assert!(handle.set_filter_parameters(0, 555.0, 1.0, FilterType::Bandpass));
        assert!(handle.set_oscillator_parameters(0, 440.0, 0.25, Waveform::SawDown));

        let mut left = [0.0f32; 64];
        let mut right = [0.0f32; 64];
        engine.process_block(&mut left, &mut right);
        assert_eq!(engine.voice_handler().current_cutoff(), 555.0);
    }

    #[test]
    fn handle_mirrors_the_lfo_cycle() {
        let mut engine = SynthEngine::new(44100).unwrap();
        engine.set_lfo_parameters(Waveform::SampleAndHold, 2.0, 0.0);
        let handle = engine.handle();

        let mut left = [0.0f32; 128];
        let mut right = [0.0f32; 128];
        engine.process_block(&mut left, &mut right);

        assert_eq!(handle.lfo_cycle_seed(), engine.lfo().cycle_seed());
        assert_eq!(handle.lfo_cycle_resolution(), engine.lfo().cycle_resolution());

        let mut sequence = [0.0f32; 16];
        assert_eq!(handle.lfo_cycle_sequence(&mut sequence), 16);
    }

    #[test]
    fn sustain_pedal_via_midi() {
        let mut engine = SynthEngine::new(44100).unwrap();
        engine.set_envelope_parameters(
            true,
            EnvelopeParameters {
                attack_time: std::time::Duration::ZERO,
                decay_time: std::time::Duration::from_millis(1),
                sustain_level: 0.8,
                release_time: std::time::Duration::from_millis(1),
            },
        );
        assert!(engine.push_midi_event(note_on(60)));
        assert!(engine.push_midi_event(MidiEvent::ControlChange {
            controller: SUSTAIN_CONTROLLER,
            value: 127,
            channel: 0,
        }));
        assert!(engine.push_midi_event(MidiEvent::NoteOff {
            note: 60,
            channel: 0,
            sample_offset: 0,
        }));

        let mut left = [0.0f32; 256];
        let mut right = [0.0f32; 256];
        for _ in 0..20 {
            engine.process_block(&mut left, &mut right);
        }
        assert_eq!(engine.active_voices(), 1, "pedal must defer the release");

        assert!(engine.push_midi_event(MidiEvent::ControlChange {
            controller: SUSTAIN_CONTROLLER,
            value: 0,
            channel: 0,
        }));
        for _ in 0..40 {
            engine.process_block(&mut left, &mut right);
        }
        assert_eq!(engine.active_voices(), 0);
    }
}
