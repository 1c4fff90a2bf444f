//! Band-limited wavetables with fixed-point phase lookup.

use std::sync::Arc;

use assume::assume;

// -------------------------------------------------------------------------------------------------

/// Number of phase steps per wavetable row. Must be a power of two: the integer part of a
/// fixed-point phase indexes the row directly, the remaining low bits are the fraction.
pub const TABLE_SIZE: usize = 2048;

/// Bits of a fixed-point phase below the table index.
pub const FRACTION_BITS: u32 = 32 - TABLE_SIZE.trailing_zeros();
const FRACTION_MASK: u32 = (1 << FRACTION_BITS) - 1;
const FRACTION_SCALE: f32 = 1.0 / (1u32 << FRACTION_BITS) as f32;

/// Highest number of partials a band-limited row can hold. Row 0 holds the raw, non band-limited
/// waveform, row `h` for `h >= 1` holds `MAX_HARMONICS + 1 - h` partials.
pub const MAX_HARMONICS: usize = 63;

const NUM_ROWS: usize = MAX_HARMONICS + 1;

// -------------------------------------------------------------------------------------------------

/// All waveform shapes known to the oscillators and LFOs.
///
/// `SampleAndHold`, `SampleAndGlide` and `WhiteNoise` can't be expressed as static band-limited
/// tables. They are generated dynamically by the LFO and only carry placeholder tables here so
/// table access stays uniform for all shapes.
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
pub enum Waveform {
    #[default]
    Sine,
    Triangle,
    Square,
    SawUp,
    SawDown,
    Pulse25,
    SawSquare,
    TriangleSquare,
    SampleAndHold,
    SampleAndGlide,
    WhiteNoise,
}

impl Waveform {
    const ALL: [Self; 11] = [
        Self::Sine,
        Self::Triangle,
        Self::Square,
        Self::SawUp,
        Self::SawDown,
        Self::Pulse25,
        Self::SawSquare,
        Self::TriangleSquare,
        Self::SampleAndHold,
        Self::SampleAndGlide,
        Self::WhiteNoise,
    ];

    /// Number of available waveforms.
    pub const COUNT: usize = Self::ALL.len();

    /// Waveform for a raw index. Out of range indices are clamped to the last valid waveform:
    /// the render path never rejects values.
    pub fn from_index(index: usize) -> Self {
        Self::ALL[index.min(Self::COUNT - 1)]
    }

    /// True when this shape is backed by a real band-limited table.
    pub fn is_table_backed(&self) -> bool {
        !matches!(
            self,
            Self::SampleAndHold | Self::SampleAndGlide | Self::WhiteNoise
        )
    }

    /// The closed-form (non band-limited) definition of this waveform at phase `t` in `[0, 1)`.
    ///
    /// The random shapes have no closed form and evaluate to silence here; the LFO generates
    /// them from its synchronized random sequence instead.
    pub fn reference(&self, t: f32) -> f32 {
        use std::f32::consts::TAU;
        match self {
            Self::Sine => (TAU * t).sin(),
            Self::Triangle => (2.0 - 4.0 * (t + 0.75).fract()).abs() - 1.0,
            Self::Square => {
                if t < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Self::SawUp => 2.0 * t - 1.0,
            Self::SawDown => 1.0 - 2.0 * t,
            Self::Pulse25 => {
                if t < 0.25 {
                    1.0
                } else {
                    -1.0
                }
            }
            Self::SawSquare => 0.6 * Self::SawDown.reference(t) + 0.4 * Self::Square.reference(t),
            Self::TriangleSquare => {
                0.7 * Self::Triangle.reference(t) + 0.3 * Self::Square.reference(t)
            }
            Self::SampleAndHold | Self::SampleAndGlide | Self::WhiteNoise => 0.0,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// One waveform's band-limited table set: `NUM_ROWS` rows of `TABLE_SIZE` values, each followed
/// by `TABLE_SIZE` forward-difference slopes.
///
/// Slopes are pre-multiplied with the fixed-point fraction scale, so interpolation needs a single
/// multiply-add and no runtime subtraction:
/// `sample = values[index] + fraction_bits * slopes[index]`.
pub struct WaveTable {
    rows: Vec<Box<[f32]>>,
}

impl WaveTable {
    fn with_rows(rows: Vec<Box<[f32]>>) -> Self {
        debug_assert!(rows.len() == NUM_ROWS);
        debug_assert!(rows.iter().all(|r| r.len() == 2 * TABLE_SIZE));
        Self { rows }
    }

    /// Interpolated sample for a fixed-point phase at the given harmonic row.
    #[inline]
    pub fn lookup(&self, harmonic_level: usize, phase: u32) -> f32 {
        let row = &self.rows[harmonic_level.min(MAX_HARMONICS)];
        let index = (phase >> FRACTION_BITS) as usize;
        let fraction = (phase & FRACTION_MASK) as f32;
        assume!(unsafe: row.len() == 2 * TABLE_SIZE, "Row size is asserted in the constructor");
        assume!(unsafe: index < TABLE_SIZE);
        row[index] + fraction * row[index + TABLE_SIZE]
    }
}

// -------------------------------------------------------------------------------------------------

/// Eagerly built lookup for unison detune ratios: cents offset -> frequency ratio.
///
/// Replaces a per-use `2^(cents/1200)` with an interpolated table read on the per-block path.
pub struct DetuneTable {
    ratios: Vec<f32>,
}

impl DetuneTable {
    /// Largest representable detune offset, in cents. Inputs beyond it are clamped.
    pub const MAX_CENTS: f32 = 100.0;

    const RESOLUTION: usize = 2048;

    fn new() -> Self {
        let mut ratios = Vec::with_capacity(Self::RESOLUTION + 1);
        for i in 0..=Self::RESOLUTION {
            let cents =
                -Self::MAX_CENTS + 2.0 * Self::MAX_CENTS * (i as f32 / Self::RESOLUTION as f32);
            ratios.push(f32::powf(2.0, cents / 1200.0));
        }
        Self { ratios }
    }

    /// Frequency ratio for a detune offset in cents, clamped into `[-MAX_CENTS, MAX_CENTS]`.
    #[inline]
    pub fn ratio(&self, cents: f32) -> f32 {
        let cents = cents.clamp(-Self::MAX_CENTS, Self::MAX_CENTS);
        let position =
            (cents + Self::MAX_CENTS) / (2.0 * Self::MAX_CENTS) * Self::RESOLUTION as f32;
        let index = (position as usize).min(Self::RESOLUTION - 1);
        let fraction = position - index as f32;
        let a = self.ratios[index];
        let b = self.ratios[index + 1];
        a + (b - a) * fraction
    }
}

// -------------------------------------------------------------------------------------------------

/// The process-wide bank of band-limited wavetables and derived lookups.
///
/// Built once at engine construction and then shared read-only by all voices. There is
/// deliberately no hidden lazily-initialized global here: ownership and lifetime are explicit,
/// and steady-state reads need no synchronization at all.
pub struct WavetableBank {
    tables: Vec<Arc<WaveTable>>,
    detune: DetuneTable,
}

impl WavetableBank {
    /// Build tables for all waveforms.
    pub fn new() -> Self {
        let builder = TableBuilder::new();

        let sine = Arc::new(builder.sine());
        let triangle = Arc::new(builder.triangle());
        let square = Arc::new(builder.square());
        let saw_up = Arc::new(builder.saw_up());
        let saw_down = Arc::new(WaveTable::with_rows(negated_rows(&saw_up)));
        let pulse25 = Arc::new(builder.pulse(0.25));
        let saw_square = Arc::new(WaveTable::with_rows(mixed_rows(&saw_down, 0.6, &square, 0.4)));
        let triangle_square =
            Arc::new(WaveTable::with_rows(mixed_rows(&triangle, 0.7, &square, 0.3)));

        // random shapes share the sine rows as placeholders, the LFO renders them dynamically
        let tables = vec![
            Arc::clone(&sine),
            triangle,
            square,
            saw_up,
            saw_down,
            pulse25,
            saw_square,
            triangle_square,
            Arc::clone(&sine),
            Arc::clone(&sine),
            sine,
        ];
        let detune = DetuneTable::new();
        Self { tables, detune }
    }

    /// Interpolated sample for a waveform at the given harmonic level and fixed-point phase.
    #[inline]
    pub fn lookup(&self, waveform: Waveform, harmonic_level: usize, phase: u32) -> f32 {
        self.tables[waveform as usize].lookup(harmonic_level, phase)
    }

    /// Table set of a single waveform.
    pub fn table(&self, waveform: Waveform) -> &Arc<WaveTable> {
        &self.tables[waveform as usize]
    }

    /// The detune ratio lookup shared by all oscillators.
    pub fn detune(&self) -> &DetuneTable {
        &self.detune
    }

    /// Pick the band-limited row for an oscillator phase increment.
    ///
    /// The increment is the per-sample phase step, so `2^31 / increment` is the number of
    /// partials that still fit below Nyquist. When more partials fit than rows can hold,
    /// band-limiting is unnecessary and the raw row 0 is used.
    #[inline]
    pub fn harmonic_level(phase_increment: u32) -> usize {
        if phase_increment == 0 {
            return 0;
        }
        let partials = ((1u32 << 31) / phase_increment).max(1) as usize;
        if partials > MAX_HARMONICS {
            0
        } else {
            NUM_ROWS - partials
        }
    }
}

impl Default for WavetableBank {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------------------------------------------------------------------

/// Additive partial-sum table construction.
///
/// Every waveform's rows are built top-down: the last row holds the fundamental only, each row
/// below it adds the next partial according to the waveform's spectral rule, and row 0 is
/// overwritten with the raw closed-form shape. The `phase = (phase + i) % TABLE_SIZE` stepping
/// evaluates partial `h + 1` of table position `i` from the base sine table.
struct TableBuilder {
    sine: Vec<f32>,
}

impl TableBuilder {
    fn new() -> Self {
        use std::f64::consts::TAU;
        let mut sine = vec![0.0f32; TABLE_SIZE];
        for (i, value) in sine.iter_mut().enumerate() {
            *value = (TAU * i as f64 / TABLE_SIZE as f64).sin() as f32;
        }
        Self { sine }
    }

    fn empty_rows() -> Vec<Box<[f32]>> {
        (0..NUM_ROWS)
            .map(|_| vec![0.0f32; 2 * TABLE_SIZE].into_boxed_slice())
            .collect()
    }

    fn sine(&self) -> WaveTable {
        let mut rows = Self::empty_rows();
        for row in rows.iter_mut() {
            row[..TABLE_SIZE].copy_from_slice(&self.sine);
        }
        preprocess_slopes(&mut rows);
        WaveTable::with_rows(rows)
    }

    fn triangle(&self) -> WaveTable {
        let mut rows = Self::empty_rows();
        let scale = 8.0 / (std::f32::consts::PI * std::f32::consts::PI);
        for i in 0..TABLE_SIZE {
            rows[0][i] = Waveform::Triangle.reference(i as f32 / TABLE_SIZE as f32);

            let mut p = i;
            rows[MAX_HARMONICS][i] = scale * self.sine[p];
            for h in 1..MAX_HARMONICS {
                p = (p + i) % TABLE_SIZE;
                let previous = rows[MAX_HARMONICS - h + 1][i];
                let harmonic = scale * self.sine[p] / ((h + 1) * (h + 1)) as f32;
                rows[MAX_HARMONICS - h][i] = if h % 4 == 0 {
                    previous + harmonic
                } else if h % 2 == 0 {
                    previous - harmonic
                } else {
                    previous
                };
            }
        }
        preprocess_slopes(&mut rows);
        WaveTable::with_rows(rows)
    }

    fn square(&self) -> WaveTable {
        let mut rows = Self::empty_rows();
        let scale = 4.0 / std::f32::consts::PI;
        for i in 0..TABLE_SIZE {
            rows[0][i] = Waveform::Square.reference(i as f32 / TABLE_SIZE as f32);

            let mut p = i;
            rows[MAX_HARMONICS][i] = scale * self.sine[p];
            for h in 1..MAX_HARMONICS {
                p = (p + i) % TABLE_SIZE;
                let previous = rows[MAX_HARMONICS - h + 1][i];
                rows[MAX_HARMONICS - h][i] = if h % 2 == 0 {
                    previous + scale * self.sine[p] / (h + 1) as f32
                } else {
                    previous
                };
            }
        }
        preprocess_slopes(&mut rows);
        WaveTable::with_rows(rows)
    }

    fn saw_up(&self) -> WaveTable {
        let mut rows = Self::empty_rows();
        let scale = 2.0 / std::f32::consts::PI;
        for i in 0..TABLE_SIZE {
            rows[0][i] = Waveform::SawUp.reference(i as f32 / TABLE_SIZE as f32);

            // partial sums land a half period off center
            let index = (i + TABLE_SIZE / 2) % TABLE_SIZE;
            let mut p = i;
            rows[MAX_HARMONICS][index] = scale * self.sine[p];
            for h in 1..MAX_HARMONICS {
                p = (p + i) % TABLE_SIZE;
                let previous = rows[MAX_HARMONICS - h + 1][index];
                let harmonic = scale * self.sine[p] / (h + 1) as f32;
                rows[MAX_HARMONICS - h][index] = if h % 2 == 0 {
                    previous + harmonic
                } else {
                    previous - harmonic
                };
            }
        }
        preprocess_slopes(&mut rows);
        WaveTable::with_rows(rows)
    }

    fn pulse(&self, duty: f32) -> WaveTable {
        let mut rows = Self::empty_rows();
        let scale = 4.0 / std::f32::consts::PI;
        for i in 0..TABLE_SIZE {
            rows[0][i] = if (i as f32 / TABLE_SIZE as f32) < duty {
                1.0
            } else {
                -1.0
            };

            let mut p = i;
            rows[MAX_HARMONICS][i] = scale * self.sine[p];
            for h in 1..MAX_HARMONICS {
                p = (p + i) % TABLE_SIZE;
                let previous = rows[MAX_HARMONICS - h + 1][i];
                let harmonic_mult = ((h + 1) as f32 * std::f32::consts::PI * duty).sin()
                    / (h + 1) as f32;
                rows[MAX_HARMONICS - h][i] = previous + 2.0 * scale * harmonic_mult * self.sine[p];
            }
        }
        preprocess_slopes(&mut rows);
        WaveTable::with_rows(rows)
    }
}

fn negated_rows(table: &WaveTable) -> Vec<Box<[f32]>> {
    let mut rows = TableBuilder::empty_rows();
    for (row, source) in rows.iter_mut().zip(&table.rows) {
        for i in 0..TABLE_SIZE {
            row[i] = -source[i];
        }
    }
    preprocess_slopes(&mut rows);
    rows
}

fn mixed_rows(a: &WaveTable, a_amount: f32, b: &WaveTable, b_amount: f32) -> Vec<Box<[f32]>> {
    let mut rows = TableBuilder::empty_rows();
    for ((row, a_row), b_row) in rows.iter_mut().zip(&a.rows).zip(&b.rows) {
        for i in 0..TABLE_SIZE {
            row[i] = a_amount * a_row[i] + b_amount * b_row[i];
        }
    }
    preprocess_slopes(&mut rows);
    rows
}

/// Fill the upper half of every row with the forward differences of the lower half,
/// pre-multiplied with the fixed-point fraction scale.
fn preprocess_slopes(rows: &mut [Box<[f32]>]) {
    for row in rows.iter_mut() {
        for i in 0..TABLE_SIZE - 1 {
            row[i + TABLE_SIZE] = FRACTION_SCALE * (row[i + 1] - row[i]);
        }
        let last_delta = row[0] - row[TABLE_SIZE - 1];
        row[2 * TABLE_SIZE - 1] = FRACTION_SCALE * last_delta;
    }
}

// -------------------------------------------------------------------------------------------------
