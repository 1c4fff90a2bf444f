//! Deterministic random sequences, shared by audio synthesis and visualization.

use rand::{rngs::SmallRng, Rng, SeedableRng};

// -------------------------------------------------------------------------------------------------

/// Fill `out` with a deterministic pseudo-random sequence of values in `[-1.0, 1.0]`, drawn from
/// the given seed.
///
/// The audio thread and any UI that wants to mirror a modulation waveform both derive the same
/// values from the same `(seed, length)` pair, so a cycle's random shape can be reconstructed
/// for display without touching audio state.
pub fn synced_random_sequence(seed: u32, out: &mut [f32]) {
    let mut rng = SmallRng::seed_from_u64(seed as u64);
    for value in out.iter_mut() {
        *value = rng.random_range(-1.0..=1.0);
    }
}

/// A single deterministic pseudo-random value in `[-1.0, 1.0]` for the given seed and index,
/// equal to `synced_random_sequence(seed, ..)[index]`.
pub fn synced_random_value(seed: u32, index: usize) -> f32 {
    let mut rng = SmallRng::seed_from_u64(seed as u64);
    let mut value = 0.0;
    for _ in 0..=index {
        value = rng.random_range(-1.0..=1.0);
    }
    value
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_deterministic() {
        let mut a = [0.0f32; 16];
        let mut b = [0.0f32; 16];
        synced_random_sequence(42, &mut a);
        synced_random_sequence(42, &mut b);
        assert_eq!(a, b);

        let mut c = [0.0f32; 16];
        synced_random_sequence(43, &mut c);
        assert_ne!(a, c);
    }

    #[test]
    fn sequences_are_in_range() {
        let mut values = [0.0f32; 512];
        synced_random_sequence(123, &mut values);
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn single_values_match_sequences() {
        let mut sequence = [0.0f32; 8];
        synced_random_sequence(7, &mut sequence);
        for (index, value) in sequence.iter().enumerate() {
            assert_eq!(*value, synced_random_value(7, index));
        }
    }
}
