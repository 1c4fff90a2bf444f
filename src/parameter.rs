//! Sample-accurate linear parameter ramps for block processing.

use crate::utils::batch::{self, Batch, BATCH_SIZE};

// -------------------------------------------------------------------------------------------------

/// Write a linear ramp `current + step * i` into `ramp`, then pin the rest of `out` to `target`.
fn fill_ramp(out: &mut [f32], current: f32, step: f32, ramp_len: usize, target: f32) {
    let (ramp, tail) = out.split_at_mut(ramp_len);

    let mut value = Batch::splat(current) + Batch::splat(step) * batch::lane_ramp();
    let batch_step = Batch::splat(step * BATCH_SIZE as f32);
    let mut chunks = ramp.chunks_exact_mut(BATCH_SIZE);
    for chunk in &mut chunks {
        chunk.copy_from_slice(&value.to_array());
        value += batch_step;
    }
    let remainder = chunks.into_remainder();
    let start = ramp_len - remainder.len();
    for (offset, sample) in remainder.iter_mut().enumerate() {
        *sample = current + step * (start + offset) as f32;
    }

    tail.fill(target);
}

// -------------------------------------------------------------------------------------------------

/// Linear interpolator which ramps one control parameter towards a target over a duration in
/// samples, snapping exactly to the target when the ramp completes.
///
/// Unlike the smoothed values used for UI-driven gain changes, ramps here are sample-accurate:
/// a `(target, duration)` pair always produces the same per-sample values, which post-processing
/// stages rely on when modulating a whole block at once.
#[derive(Debug, Default, Clone)]
pub struct ParameterInterpolator {
    current: f32,
    target: f32,
    step: f32,
    remaining: usize,
}

impl ParameterInterpolator {
    pub fn new(value: f32) -> Self {
        Self {
            current: value,
            target: value,
            step: 0.0,
            remaining: 0,
        }
    }

    /// The current, possibly mid-ramp value.
    #[inline(always)]
    pub fn current(&self) -> f32 {
        self.current
    }

    /// The ramp target value.
    #[inline(always)]
    pub fn target(&self) -> f32 {
        self.target
    }

    /// True while a ramp is still in progress.
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }

    /// Start a linear ramp from the current value. A zero duration applies the target
    /// immediately.
    pub fn set_target(&mut self, target: f32, duration_samples: usize) {
        self.target = target;
        if duration_samples == 0 {
            self.current = target;
            self.remaining = 0;
            self.step = 0.0;
        } else {
            self.remaining = duration_samples;
            self.step = (target - self.current) / duration_samples as f32;
        }
    }

    /// Fill `out` with interpolated values and advance the ramp state by `out.len()` steps
    /// (at most the remaining ramp length). Samples past the ramp end are the exact target.
    pub fn fill_block(&mut self, out: &mut [f32]) {
        if out.is_empty() {
            return;
        }
        let ramp_len = out.len().min(self.remaining);
        fill_ramp(out, self.current, self.step, ramp_len, self.target);

        self.current += self.step * ramp_len as f32;
        self.remaining -= ramp_len;
        if self.remaining == 0 {
            self.current = self.target;
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Batch interpolator for multiple parameters with structure-of-arrays output, so one
/// post-processing stage can produce several per-sample control signals in a single pass.
#[derive(Debug, Clone)]
pub struct ParameterBatchInterpolator {
    current: [f32; Self::MAX_PARAMS],
    target: [f32; Self::MAX_PARAMS],
    step: [f32; Self::MAX_PARAMS],
    remaining: [usize; Self::MAX_PARAMS],
}

impl ParameterBatchInterpolator {
    /// Number of independently ramped parameter slots.
    pub const MAX_PARAMS: usize = 8;

    pub fn new() -> Self {
        Self {
            current: [0.0; Self::MAX_PARAMS],
            target: [0.0; Self::MAX_PARAMS],
            step: [0.0; Self::MAX_PARAMS],
            remaining: [0; Self::MAX_PARAMS],
        }
    }

    /// Current value of a parameter slot. Out of range indices read as 0.
    pub fn current_value(&self, param_index: usize) -> f32 {
        self.current.get(param_index).copied().unwrap_or(0.0)
    }

    /// Start a linear ramp for one parameter slot. Out of range indices are ignored:
    /// this runs on the render path and must not fail.
    pub fn set_target(&mut self, param_index: usize, target: f32, duration_samples: usize) {
        if param_index >= Self::MAX_PARAMS {
            return;
        }
        self.target[param_index] = target;
        if duration_samples == 0 {
            self.current[param_index] = target;
            self.remaining[param_index] = 0;
            self.step[param_index] = 0.0;
        } else {
            self.remaining[param_index] = duration_samples;
            self.step[param_index] =
                (target - self.current[param_index]) / duration_samples as f32;
        }
    }

    /// Fill the first `count` samples of every output slice with its parameter's interpolated
    /// values and advance all ramps. One output slice per parameter slot, in slot order.
    pub fn fill_block_all(&mut self, outputs: &mut [&mut [f32]], count: usize) {
        let params = outputs.len().min(Self::MAX_PARAMS);
        for (param, out) in outputs.iter_mut().take(params).enumerate() {
            debug_assert!(out.len() >= count, "Output buffer too small");
            let out = &mut out[..count];

            let ramp_len = count.min(self.remaining[param]);
            fill_ramp(
                out,
                self.current[param],
                self.step[param],
                ramp_len,
                self.target[param],
            );

            self.current[param] += self.step[param] * ramp_len as f32;
            self.remaining[param] -= ramp_len;
            if self.remaining[param] == 0 {
                self.current[param] = self.target[param];
            }
        }
    }
}

impl Default for ParameterBatchInterpolator {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------------------------------------------------------------------
