//! Math types and numeric helpers for the mixer
//!
//! All mixing runs on plain `f32`. The resampler position uses a 14-bit
//! fixed-point fraction so that stepping through source data is exact and
//! never drifts.

pub use glam::{Quat, Vec3};

/// Number of fractional bits in a resampling step.
pub const FRACTION_BITS: u32 = 14;
/// A step of exactly one source frame per output frame.
pub const FRACTION_ONE: u32 = 1 << FRACTION_BITS;
pub const FRACTION_MASK: u32 = FRACTION_ONE - 1;

/// Speed of sound used by the reverb-related distance terms, in m/s.
pub const SPEED_OF_SOUND_METRES_PER_SEC: f32 = 343.3;

/// Cutoff of every "HF" low-pass filter in the engine.
pub const LOWPASS_FREQ_CUTOFF: f32 = 5000.0;

/// Air absorption per metre, in dB, at the HF reference.
pub const AIR_ABSORB_GAIN_DB_HF: f32 = -0.05;

/// Position and orientation of an object, used to aim the listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    /// Facing direction; the identity pose looks down -Z.
    pub fn forward(&self) -> Vec3 {
        self.rotation * (-Vec3::Z)
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Quat::IDENTITY)
    }
}

#[inline]
pub fn lerp(a: f32, b: f32, mu: f32) -> f32 {
    a + (b - a) * mu
}

/// Catmull-Rom style cubic through `v1..v2`, with `v0`/`v3` as outer support.
#[inline]
pub fn cubic(v0: f32, v1: f32, v2: f32, v3: f32, mu: f32) -> f32 {
    let mu2 = mu * mu;
    let a0 = -0.5 * v0 + 1.5 * v1 - 1.5 * v2 + 0.5 * v3;
    let a1 = v0 - 2.5 * v1 + 2.0 * v2 - 0.5 * v3;
    let a2 = -0.5 * v0 + 0.5 * v2;
    let a3 = v1;
    a0 * mu * mu2 + a1 * mu2 + a2 * mu + a3
}

/// Smallest power of two `>= value` (1 for 0).
pub fn next_power_of_2(value: u32) -> u32 {
    value.max(1).next_power_of_two()
}

/// Unit vector along `v`; a zero-length vector comes back unchanged.
#[inline]
pub fn normalize_or_keep(v: Vec3) -> Vec3 {
    let len = v.length();
    if len > 0.0 { v / len } else { v }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cubic_passes_through_inner_points() {
        assert_relative_eq!(cubic(0.3, 1.0, -2.0, 5.0, 0.0), 1.0);
        assert_relative_eq!(cubic(0.3, 1.0, -2.0, 5.0, 1.0), -2.0, epsilon = 1e-6);
        // a constant signal stays constant between the samples
        assert_relative_eq!(cubic(0.5, 0.5, 0.5, 0.5, 0.37), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn lerp_endpoints() {
        assert_eq!(lerp(2.0, 4.0, 0.0), 2.0);
        assert_eq!(lerp(2.0, 4.0, 1.0), 4.0);
        assert_eq!(lerp(2.0, 4.0, 0.5), 3.0);
    }

    #[test]
    fn power_of_two_rounding() {
        assert_eq!(next_power_of_2(0), 1);
        assert_eq!(next_power_of_2(1), 1);
        assert_eq!(next_power_of_2(3), 4);
        assert_eq!(next_power_of_2(4096), 4096);
        assert_eq!(next_power_of_2(4097), 8192);
    }

    #[test]
    fn zero_vector_is_not_normalized() {
        assert_eq!(normalize_or_keep(Vec3::ZERO), Vec3::ZERO);
        assert_relative_eq!(normalize_or_keep(Vec3::new(0.0, 3.0, 4.0)).length(), 1.0);
    }

    #[test]
    fn identity_pose_faces_negative_z() {
        let pose = Pose::default();
        assert_eq!(pose.forward(), Vec3::new(0.0, 0.0, -1.0));
        assert_eq!(pose.up(), Vec3::Y);
    }
}
