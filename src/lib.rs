#![doc = include_str!("../README.md")]
#![cfg_attr(all(doc, docsrs), feature(doc_auto_cfg))]

// private mods (will be partly re-exported)
mod engine;
mod error;
mod midi;
mod parameter;
mod pipeline;
mod voice;
mod wavetable;

// public, flat re-exports
pub use error::Error;

pub use engine::{EngineEvent, EngineHandle, SynthEngine};

pub use midi::{MidiEvent, MidiEventQueue};

pub use parameter::{ParameterBatchInterpolator, ParameterInterpolator};

pub use pipeline::{
    parameter_slot, AudioBlock, LockFreePipeline, PipelineConsumer, PipelineManager,
    PipelineProducer, PipelineStage, ProcessingParams, BLOCK_SIZE, CUTOFF_PARAMETER,
    ENVELOPE_AMOUNT_PARAMETER, MODULATED_PARAMETERS, RING_SIZE,
};

pub use voice::{Voice, VoiceHandler, MAX_VOICES};

pub use wavetable::{DetuneTable, WaveTable, Waveform, WavetableBank, MAX_HARMONICS, TABLE_SIZE};

// public mods
pub mod dsp;
pub mod utils;

pub mod processors {
    //! Flat re-exports of the per-voice DSP processor types.

    pub use super::dsp::{
        envelope::{EnvelopeGenerator, EnvelopeParameters, EnvelopeStage, EnvelopeState},
        filter::{FilterState, FilterType, StateVariableFilter},
        lfo::Lfo,
        oscillator::{OscillatorState, MAX_UNISON},
    };
}
