//! Lock-free staged post-processing pipeline between the render and consumption side.

use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use four_cc::FourCC;

use crate::{
    dsp::filter::{FilterState, FilterType, StateVariableFilter},
    parameter::ParameterBatchInterpolator,
    utils::batch::{self, Batch, BATCH_SIZE},
};

// -------------------------------------------------------------------------------------------------

/// Frame capacity of a pipeline [`AudioBlock`].
pub const BLOCK_SIZE: usize = 128;

/// Number of preallocated audio block and parameter record slots in the ring.
pub const RING_SIZE: usize = 16;

// -------------------------------------------------------------------------------------------------

/// A fixed-capacity stereo sample block, recycled from the pipeline's ring.
///
/// Contents get overwritten on each submission and are never individually freed.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub left: [f32; BLOCK_SIZE],
    pub right: [f32; BLOCK_SIZE],
    pub timestamp: f64,
    pub frame_count: usize,
}

impl AudioBlock {
    fn new() -> Self {
        Self {
            left: [0.0; BLOCK_SIZE],
            right: [0.0; BLOCK_SIZE],
            timestamp: 0.0,
            frame_count: 0,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Plain value record of the parameters a processing stage may depend on, copied wholesale
/// into the pipeline each block. There are no partial updates.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProcessingParams {
    pub cutoff: f32,
    pub resonance: f32,
    pub envelope_amount: f32,
    pub lfo_rate: f32,
    pub frame_count: u32,
}

// -------------------------------------------------------------------------------------------------

/// A single processing step, run in place over the current block in registration order.
pub type PipelineStage = Box<dyn FnMut(&mut AudioBlock, &ProcessingParams) + Send>;

// -------------------------------------------------------------------------------------------------

struct PipelineShared {
    audio_blocks: Vec<UnsafeCell<AudioBlock>>,
    param_blocks: Vec<UnsafeCell<ProcessingParams>>,
    // write indices point at the slot which gets filled *next*; the most recently completed
    // slot is one behind them
    block_index: AtomicUsize,
    param_index: AtomicUsize,
    running: AtomicBool,
}

// Safety: the split into a single `PipelineProducer` and a single `PipelineConsumer` is the
// whole synchronization contract. The producer only ever writes the slots at the current
// write indices and publishes them with a release store; the consumer only touches slots
// behind the indices it acquired. Neither half can be cloned.
unsafe impl Sync for PipelineShared {}

impl PipelineShared {
    fn completed_block_slot(&self) -> usize {
        let index = self.block_index.load(Ordering::Acquire);
        (index + RING_SIZE - 1) % RING_SIZE
    }

    fn completed_param_slot(&self) -> usize {
        let index = self.param_index.load(Ordering::Acquire);
        (index + RING_SIZE - 1) % RING_SIZE
    }
}

// -------------------------------------------------------------------------------------------------

/// Ring-buffered handoff of audio blocks and parameter records between a submission side and
/// a processing/consumption side.
///
/// All `RING_SIZE` blocks are preallocated up front; submission copies into a recycled slot
/// and advances an atomic index with release ordering, processing acquires the most recently
/// completed slot and runs the registered stages over it in place. The pipeline decouples
/// producer and consumer *timing* only - stages always execute sequentially on the consumer's
/// thread, and the index protocol is strictly single-producer/single-consumer, which the
/// [`Self::split`] halves enforce by type.
pub struct LockFreePipeline {
    shared: Arc<PipelineShared>,
}

impl LockFreePipeline {
    pub fn new() -> Self {
        let audio_blocks = (0..RING_SIZE)
            .map(|_| UnsafeCell::new(AudioBlock::new()))
            .collect();
        let param_blocks = (0..RING_SIZE)
            .map(|_| UnsafeCell::new(ProcessingParams::default()))
            .collect();
        Self {
            shared: Arc::new(PipelineShared {
                audio_blocks,
                param_blocks,
                block_index: AtomicUsize::new(0),
                param_index: AtomicUsize::new(0),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Split into the two halves of the single-producer/single-consumer contract.
    pub fn split(self) -> (PipelineProducer, PipelineConsumer) {
        let producer = PipelineProducer {
            shared: Arc::clone(&self.shared),
        };
        let consumer = PipelineConsumer {
            shared: self.shared,
            stages: Vec::new(),
        };
        (producer, consumer)
    }
}

impl Default for LockFreePipeline {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------------------------------------------------------------------

/// Submission half of the pipeline.
pub struct PipelineProducer {
    shared: Arc<PipelineShared>,
}

impl PipelineProducer {
    /// Copy caller samples into the block at the current write slot and publish it.
    /// Returns false when more than [`BLOCK_SIZE`] frames were passed.
    #[must_use]
    pub fn submit_audio_block(&mut self, left: &[f32], right: &[f32], timestamp: f64) -> bool {
        let frames = left.len();
        if frames > BLOCK_SIZE || right.len() != frames {
            return false;
        }

        let index = self.shared.block_index.load(Ordering::Relaxed);
        // Safety: single producer; this slot is unpublished until the store below
        let block = unsafe { &mut *self.shared.audio_blocks[index].get() };
        block.left[..frames].copy_from_slice(left);
        block.right[..frames].copy_from_slice(right);
        block.timestamp = timestamp;
        block.frame_count = frames;

        self.shared
            .block_index
            .store((index + 1) % RING_SIZE, Ordering::Release);
        true
    }

    /// Publish a new parameter record.
    pub fn update_params(&mut self, params: ProcessingParams) {
        let index = self.shared.param_index.load(Ordering::Relaxed);
        // Safety: single producer; this slot is unpublished until the store below
        unsafe { *self.shared.param_blocks[index].get() = params };
        self.shared
            .param_index
            .store((index + 1) % RING_SIZE, Ordering::Release);
    }
}

// -------------------------------------------------------------------------------------------------

/// Processing and consumption half of the pipeline.
pub struct PipelineConsumer {
    shared: Arc<PipelineShared>,
    stages: Vec<PipelineStage>,
}

impl PipelineConsumer {
    /// Append a processing stage. Stages run in registration order.
    pub fn add_stage(&mut self, stage: PipelineStage) {
        self.stages.push(stage);
    }

    pub fn start(&mut self) {
        self.shared.running.store(true, Ordering::Release);
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Run all registered stages, in order, over the most recently completed block with the
    /// most recently completed parameter record. Does nothing while stopped.
    pub fn process(&mut self) {
        if !self.shared.running.load(Ordering::Relaxed) {
            return;
        }

        let block_slot = self.shared.completed_block_slot();
        let param_slot = self.shared.completed_param_slot();
        // Safety: single consumer, and the producer never writes a completed slot
        let block = unsafe { &mut *self.shared.audio_blocks[block_slot].get() };
        let params = unsafe { &*self.shared.param_blocks[param_slot].get() };

        for stage in self.stages.iter_mut() {
            stage(block, params);
        }
    }

    /// Copy the most recently completed block into the given output buffers and return the
    /// copied frame count and the block's timestamp.
    pub fn processed_block(&self, left: &mut [f32], right: &mut [f32]) -> (usize, f64) {
        let block_slot = self.shared.completed_block_slot();
        // Safety: single consumer, and the producer never writes a completed slot
        let block = unsafe { &*self.shared.audio_blocks[block_slot].get() };

        let frames = block.frame_count.min(left.len()).min(right.len());
        left[..frames].copy_from_slice(&block.left[..frames]);
        right[..frames].copy_from_slice(&block.right[..frames]);
        (frames, block.timestamp)
    }
}

// -------------------------------------------------------------------------------------------------

/// Parameter slot ids of the batch-interpolated modulation stage.
pub const ENVELOPE_AMOUNT_PARAMETER: FourCC = FourCC(*b"enva");
pub const CUTOFF_PARAMETER: FourCC = FourCC(*b"cutf");

/// Slot order of the interpolated parameters, matching the batch interpolator layout.
pub const MODULATED_PARAMETERS: [FourCC; 2] = [ENVELOPE_AMOUNT_PARAMETER, CUTOFF_PARAMETER];

/// Batch interpolator slot of an interpolated parameter id.
pub fn parameter_slot(id: FourCC) -> Option<usize> {
    MODULATED_PARAMETERS.iter().position(|known| *known == id)
}

// -------------------------------------------------------------------------------------------------

/// Owns a [`LockFreePipeline`] wired up with the engine's post-processing chain:
/// soft-limit preconditioning, low-pass filtering, interpolated parameter modulation and a
/// final hard clamp to `[-1, 1]`.
pub struct PipelineManager {
    producer: PipelineProducer,
    consumer: PipelineConsumer,
}

impl PipelineManager {
    pub fn new(sample_rate: u32) -> Self {
        let (producer, mut consumer) = LockFreePipeline::new().split();

        // stage 1: SIMD soft-limit preconditioning
        consumer.add_stage(Box::new(|block, _params| {
            let frames = block.frame_count;
            soft_limit_buffer(&mut block.left[..frames]);
            soft_limit_buffer(&mut block.right[..frames]);
        }));

        // stage 2: low-pass filtering with the submitted cutoff/resonance
        let filter = StateVariableFilter::new(sample_rate);
        let mut filter_states = [
            FilterState::new(2000.0, 0.707, FilterType::Lowpass),
            FilterState::new(2000.0, 0.707, FilterType::Lowpass),
        ];
        consumer.add_stage(Box::new(move |block, params| {
            for state in filter_states.iter_mut() {
                state.set_frequency(params.cutoff);
                state.set_resonance(params.resonance);
            }
            let frames = block.frame_count;
            let [left_state, right_state] = &mut filter_states;
            for sample in block.left[..frames].iter_mut() {
                *sample = filter.process(left_state, Batch::splat(*sample)).to_array()[0];
            }
            for sample in block.right[..frames].iter_mut() {
                *sample = filter.process(right_state, Batch::splat(*sample)).to_array()[0];
            }
        }));

        // stage 3: envelope/parameter modulation via the batch interpolator, applied per
        // sample across the block
        let mut interpolator = ParameterBatchInterpolator::new();
        let mut envelope_scratch = [0.0f32; BLOCK_SIZE];
        let mut cutoff_scratch = [0.0f32; BLOCK_SIZE];
        let nyquist = sample_rate as f32 / 2.0;
        let envelope_slot = parameter_slot(ENVELOPE_AMOUNT_PARAMETER).unwrap_or(0);
        let cutoff_slot = parameter_slot(CUTOFF_PARAMETER).unwrap_or(1);
        consumer.add_stage(Box::new(move |block, params| {
            let frames = block.frame_count;
            interpolator.set_target(envelope_slot, params.envelope_amount, frames);
            interpolator.set_target(cutoff_slot, params.cutoff, frames);
            {
                let mut outputs = [&mut envelope_scratch[..], &mut cutoff_scratch[..]];
                interpolator.fill_block_all(&mut outputs, frames);
            }

            batch::multiply_buffer(&mut block.left[..frames], &envelope_scratch[..frames]);
            batch::multiply_buffer(&mut block.right[..frames], &envelope_scratch[..frames]);

            // brightness dependent attenuation, driven by the ramped cutoff
            for i in 0..frames {
                let attenuation = 1.0 - 0.05 * (cutoff_scratch[i] / nyquist).clamp(0.0, 1.0);
                block.left[i] *= attenuation;
                block.right[i] *= attenuation;
            }
        }));

        // stage 4: final hard clamp
        consumer.add_stage(Box::new(|block, _params| {
            let frames = block.frame_count;
            batch::clamp_buffer(&mut block.left[..frames], -1.0, 1.0);
            batch::clamp_buffer(&mut block.right[..frames], -1.0, 1.0);
        }));

        consumer.start();
        Self { producer, consumer }
    }

    pub fn start(&mut self) {
        self.consumer.start();
    }

    pub fn stop(&mut self) {
        self.consumer.stop();
    }

    /// Publish a new parameter record for the next processed block.
    pub fn update_parameters(&mut self, params: ProcessingParams) {
        self.producer.update_params(params);
    }

    /// Submit a block, process it through all stages and copy the result back out.
    /// Returns the number of processed frames.
    pub fn process_audio_block(
        &mut self,
        left_in: &[f32],
        right_in: &[f32],
        left_out: &mut [f32],
        right_out: &mut [f32],
        timestamp: f64,
    ) -> usize {
        if !self
            .producer
            .submit_audio_block(left_in, right_in, timestamp)
        {
            return 0;
        }
        self.consumer.process();
        let (frames, _timestamp) = self.consumer.processed_block(left_out, right_out);
        frames
    }
}

// -------------------------------------------------------------------------------------------------

/// Rational soft clip, hard bounded into `[-1, 1]`.
#[inline]
fn soft_limit(value: Batch) -> Batch {
    let squared = value * value;
    let numerator = value * (Batch::splat(27.0) + squared);
    let denominator = Batch::splat(27.0) + Batch::splat(9.0) * squared;
    batch::clamp(numerator / denominator, -1.0, 1.0)
}

fn soft_limit_buffer(buffer: &mut [f32]) {
    let mut chunks = buffer.chunks_exact_mut(BATCH_SIZE);
    for chunk in &mut chunks {
        let limited = soft_limit(batch::from_slice(chunk));
        chunk.copy_from_slice(&limited.to_array());
    }
    for sample in chunks.into_remainder() {
        let squared = *sample * *sample;
        *sample = (*sample * (27.0 + squared) / (27.0 + 9.0 * squared)).clamp(-1.0, 1.0);
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_process_retrieve_roundtrip() {
        let (mut producer, mut consumer) = LockFreePipeline::new().split();
        consumer.start();

        let left = [0.25f32; 128];
        let right = [-0.25f32; 128];
        assert!(producer.submit_audio_block(&left, &right, 1.5));
        consumer.process();

        let mut left_out = [0.0f32; 128];
        let mut right_out = [0.0f32; 128];
        let (frames, timestamp) = consumer.processed_block(&mut left_out, &mut right_out);
        assert_eq!(frames, 128, "retrieved frame count must match the submission");
        assert_eq!(timestamp, 1.5);
        assert_eq!(left_out, left);
        assert_eq!(right_out, right);
    }

    #[test]
    fn oversized_blocks_are_rejected() {
        let (mut producer, _consumer) = LockFreePipeline::new().split();
        let samples = [0.0f32; BLOCK_SIZE + 1];
        assert!(!producer.submit_audio_block(&samples, &samples, 0.0));
    }

    #[test]
    fn stages_run_in_registration_order() {
        let (mut producer, mut consumer) = LockFreePipeline::new().split();
        consumer.add_stage(Box::new(|block, _| {
            for sample in block.left[..block.frame_count].iter_mut() {
                *sample += 1.0;
            }
        }));
        consumer.add_stage(Box::new(|block, _| {
            for sample in block.left[..block.frame_count].iter_mut() {
                *sample *= 2.0;
            }
        }));
        consumer.start();

        let input = [0.5f32; 16];
        assert!(producer.submit_audio_block(&input, &input, 0.0));
        consumer.process();

        let mut left = [0.0f32; 16];
        let mut right = [0.0f32; 16];
        let (frames, _) = consumer.processed_block(&mut left, &mut right);
        assert_eq!(frames, 16);
        // (0.5 + 1) * 2, not 0.5 * 2 + 1
        assert!(left.iter().all(|v| (*v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn stages_see_the_latest_params() {
        let (mut producer, mut consumer) = LockFreePipeline::new().split();
        consumer.add_stage(Box::new(|block, params| {
            for sample in block.left[..block.frame_count].iter_mut() {
                *sample *= params.envelope_amount;
            }
        }));
        consumer.start();

        producer.update_params(ProcessingParams {
            envelope_amount: 0.5,
            ..Default::default()
        });
        let input = [1.0f32; 8];
        assert!(producer.submit_audio_block(&input, &input, 0.0));
        consumer.process();

        let mut left = [0.0f32; 8];
        let mut right = [0.0f32; 8];
        consumer.processed_block(&mut left, &mut right);
        assert!(left.iter().all(|v| *v == 0.5));
    }

    #[test]
    fn process_is_gated_by_running() {
        let (mut producer, mut consumer) = LockFreePipeline::new().split();
        consumer.add_stage(Box::new(|block, _| {
            block.left[..block.frame_count].fill(9.0);
        }));
        // never started: stages must not run
        let input = [1.0f32; 8];
        assert!(producer.submit_audio_block(&input, &input, 0.0));
        consumer.process();

        let mut left = [0.0f32; 8];
        let mut right = [0.0f32; 8];
        consumer.processed_block(&mut left, &mut right);
        assert!(left.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn ring_slots_recycle() {
        let (mut producer, mut consumer) = LockFreePipeline::new().split();
        consumer.start();
        let mut left_out = [0.0f32; 4];
        let mut right_out = [0.0f32; 4];
        for round in 0..(3 * RING_SIZE) {
            let value = round as f32;
            let input = [value; 4];
            assert!(producer.submit_audio_block(&input, &input, round as f64));
            consumer.process();
            let (frames, timestamp) = consumer.processed_block(&mut left_out, &mut right_out);
            assert_eq!(frames, 4);
            assert_eq!(timestamp, round as f64);
            assert!(left_out.iter().all(|v| *v == value));
        }
    }

    #[test]
    fn manager_preserves_frame_counts() {
        let mut manager = PipelineManager::new(44100);
        manager.update_parameters(ProcessingParams {
            cutoff: 20000.0,
            resonance: 0.707,
            envelope_amount: 1.0,
            lfo_rate: 1.0,
            frame_count: 128,
        });

        let left_in = [0.1f32; 128];
        let right_in = [0.1f32; 128];
        let mut left_out = [0.0f32; 128];
        let mut right_out = [0.0f32; 128];
        let frames =
            manager.process_audio_block(&left_in, &right_in, &mut left_out, &mut right_out, 0.0);
        assert_eq!(frames, 128);
        assert!(left_out.iter().all(|v| v.is_finite() && v.abs() <= 1.0));
    }

    #[test]
    fn manager_output_is_hard_bounded() {
        let mut manager = PipelineManager::new(44100);
        manager.update_parameters(ProcessingParams {
            cutoff: 20000.0,
            resonance: 0.707,
            envelope_amount: 1.0,
            lfo_rate: 1.0,
            frame_count: 64,
        });

        // badly overdriven input must come out inside [-1, 1]
        let left_in = [10.0f32; 64];
        let right_in = [-10.0f32; 64];
        let mut left_out = [0.0f32; 64];
        let mut right_out = [0.0f32; 64];
        let frames =
            manager.process_audio_block(&left_in, &right_in, &mut left_out, &mut right_out, 0.0);
        assert_eq!(frames, 64);
        assert!(left_out.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!(right_out.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn parameter_ids_map_to_interpolator_slots() {
        assert_eq!(parameter_slot(ENVELOPE_AMOUNT_PARAMETER), Some(0));
        assert_eq!(parameter_slot(CUTOFF_PARAMETER), Some(1));
        assert_eq!(parameter_slot(FourCC(*b"none")), None);
    }

    #[test]
    fn soft_limit_is_transparent_for_small_signals() {
        let mut buffer = [0.01f32; 32];
        soft_limit_buffer(&mut buffer);
        assert!(buffer.iter().all(|v| (*v - 0.01).abs() < 1e-4));

        let mut loud = [100.0f32; 32];
        soft_limit_buffer(&mut loud);
        assert!(loud.iter().all(|v| *v <= 1.0));
    }
}
