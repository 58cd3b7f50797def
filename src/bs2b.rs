//! Bauer stereophonic-to-binaural crossfeed
//!
//! Each ear receives its own channel through a high-shelf boost plus the
//! opposite channel through a low-pass, which softens hard-panned content
//! on headphones.

use std::f64::consts::PI;

/// (low-pass cutoff Hz, high-boost cutoff Hz, low-pass gain, high-boost gain)
/// per crossfeed level, 1-based.
const LEVELS: [(f64, f64, f64, f64); 6] = [
    (360.0, 501.0, 0.398107170553497, 0.205671765275719),
    (500.0, 711.0, 0.459726988530872, 0.228208484414988),
    (700.0, 1021.0, 0.530884444230988, 0.250105790667544),
    (360.0, 494.0, 0.316227766016838, 0.168236228897329),
    (500.0, 689.0, 0.354813389233575, 0.187169483835901),
    (700.0, 975.0, 0.398107170553497, 0.205671765275719),
];

const MIN_SAMPLE_RATE: u32 = 2000;
const MAX_SAMPLE_RATE: u32 = 192_000;
const DEFAULT_SAMPLE_RATE: u32 = 44100;

#[derive(Debug, Clone, PartialEq)]
pub struct Bs2b {
    level: u32,
    sample_rate: u32,
    a0_lo: f64,
    b1_lo: f64,
    a0_hi: f64,
    a1_hi: f64,
    b1_hi: f64,
    /// Previous input frame.
    asis: [f64; 2],
    lo: [f64; 2],
    hi: [f64; 2],
}

impl Bs2b {
    /// Crossfeed at `level` (1..=6). Level 0 or anything above 6 means no
    /// crossfeed. Sample rates outside 2..192 kHz fall back to 44.1 kHz.
    pub fn new(level: u32, sample_rate: u32) -> Option<Self> {
        if level == 0 || level as usize > LEVELS.len() {
            return None;
        }
        let sample_rate = if (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            sample_rate
        } else {
            DEFAULT_SAMPLE_RATE
        };

        let (fc_lo, fc_hi, g_lo, g_hi) = LEVELS[level as usize - 1];
        let g = 1.0 / (1.0 - g_hi + g_lo);

        let x = (-2.0 * PI * fc_lo / sample_rate as f64).exp();
        let b1_lo = x;
        let a0_lo = g_lo * (1.0 - x) * g;

        let x = (-2.0 * PI * fc_hi / sample_rate as f64).exp();
        let b1_hi = x;
        let a0_hi = (1.0 - g_hi * (1.0 - x)) * g;
        let a1_hi = -x * g;

        Some(Self {
            level,
            sample_rate,
            a0_lo,
            b1_lo,
            a0_hi,
            a1_hi,
            b1_hi,
            asis: [0.0; 2],
            lo: [0.0; 2],
            hi: [0.0; 2],
        })
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn clear(&mut self) {
        self.asis = [0.0; 2];
        self.lo = [0.0; 2];
        self.hi = [0.0; 2];
    }

    /// Processes one left/right frame in place.
    pub fn cross_feed(&mut self, frame: &mut [f32; 2]) {
        let input = [frame[0] as f64, frame[1] as f64];
        for k in 0..2 {
            self.lo[k] = self.a0_lo * input[k] + self.b1_lo * self.lo[k];
            self.hi[k] = self.a0_hi * input[k] + self.a1_hi * self.asis[k] + self.b1_hi * self.hi[k];
        }
        self.asis = input;

        frame[0] = (self.hi[0] + self.lo[1]) as f32;
        frame[1] = (self.hi[1] + self.lo[0]) as f32;
    }
}
