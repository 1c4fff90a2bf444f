//! Fixed-width SIMD batch types shared by all DSP processors.
//!
//! All vectorized code in this crate is written against the aliases and helpers below instead of
//! a concrete instruction set, so the batch width can be changed in one place and the DSP code
//! stays portable across architectures (wide falls back to scalar emulation where needed).

use wide::{f32x8, u32x8};

// -------------------------------------------------------------------------------------------------

/// Number of lanes processed by one batch operation.
pub const BATCH_SIZE: usize = 8;

/// A batch of audio or control samples.
pub type Batch = f32x8;

/// A batch of fixed-point oscillator phases. Integer lane arithmetic wraps on overflow,
/// which gives the phase accumulators their implicit modulo for free.
pub type PhaseBatch = u32x8;

// -------------------------------------------------------------------------------------------------

/// A batch holding the lane indices `[0.0, 1.0, .. BATCH_SIZE-1]`.
#[inline]
pub fn lane_ramp() -> Batch {
    Batch::from([0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0])
}

/// Load a batch from the first `BATCH_SIZE` values of a slice.
#[inline]
pub fn from_slice(slice: &[f32]) -> Batch {
    let mut lanes = [0.0; BATCH_SIZE];
    lanes.copy_from_slice(&slice[..BATCH_SIZE]);
    Batch::from(lanes)
}

/// Sum all lanes into a single value.
#[inline]
pub fn horizontal_sum(value: Batch) -> f32 {
    value.reduce_add()
}

/// Per-lane linear interpolation: `a + (b - a) * t`.
#[inline]
pub fn interpolate(a: Batch, b: Batch, t: Batch) -> Batch {
    a + (b - a) * t
}

/// Clamp all lanes into `[min, max]`.
#[inline]
pub fn clamp(value: Batch, min: f32, max: f32) -> Batch {
    value.max(Batch::splat(min)).min(Batch::splat(max))
}

// -------------------------------------------------------------------------------------------------

/// Clamp a sample buffer into `[min, max]`, processing full batches where possible.
pub fn clamp_buffer(buffer: &mut [f32], min: f32, max: f32) {
    let mut chunks = buffer.chunks_exact_mut(BATCH_SIZE);
    for chunk in &mut chunks {
        let clamped = clamp(from_slice(chunk), min, max);
        chunk.copy_from_slice(&clamped.to_array());
    }
    for sample in chunks.into_remainder() {
        *sample = sample.clamp(min, max);
    }
}

/// Multiply a sample buffer in-place with a control signal buffer of the same length.
pub fn multiply_buffer(buffer: &mut [f32], control: &[f32]) {
    debug_assert!(control.len() >= buffer.len(), "Control buffer too small");
    let mut chunks = buffer.chunks_exact_mut(BATCH_SIZE);
    let mut control_chunks = control.chunks_exact(BATCH_SIZE);
    for (chunk, control_chunk) in (&mut chunks).zip(&mut control_chunks) {
        let scaled = from_slice(chunk) * from_slice(control_chunk);
        chunk.copy_from_slice(&scaled.to_array());
    }
    for (sample, value) in chunks
        .into_remainder()
        .iter_mut()
        .zip(control_chunks.remainder())
    {
        *sample *= value;
    }
}

// -------------------------------------------------------------------------------------------------
