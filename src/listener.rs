//! Listener state of a context

use crate::error::{PetalSonicError, Result, check_range};
use crate::math::{Pose, Vec3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Listener {
    pub(crate) position: Vec3,
    pub(crate) velocity: Vec3,
    pub(crate) forward: Vec3,
    pub(crate) up: Vec3,
    pub(crate) gain: f32,
    pub(crate) meters_per_unit: f32,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            forward: Vec3::new(0.0, 0.0, -1.0),
            up: Vec3::Y,
            gain: 1.0,
            meters_per_unit: 1.0,
        }
    }
}

impl Listener {
    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn forward(&self) -> Vec3 {
        self.forward
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn meters_per_unit(&self) -> f32 {
        self.meters_per_unit
    }

    pub(crate) fn set_position(&mut self, position: Vec3) -> Result<()> {
        ensure_finite("listener position", position)?;
        self.position = position;
        Ok(())
    }

    pub(crate) fn set_velocity(&mut self, velocity: Vec3) -> Result<()> {
        ensure_finite("listener velocity", velocity)?;
        self.velocity = velocity;
        Ok(())
    }

    pub(crate) fn set_orientation(&mut self, forward: Vec3, up: Vec3) -> Result<()> {
        ensure_finite("listener forward", forward)?;
        ensure_finite("listener up", up)?;
        self.forward = forward;
        self.up = up;
        Ok(())
    }

    /// Position and orientation from a pose (forward is the pose's -Z).
    pub(crate) fn set_pose(&mut self, pose: Pose) -> Result<()> {
        self.set_position(pose.position)?;
        self.set_orientation(pose.forward(), pose.up())
    }

    pub(crate) fn set_gain(&mut self, gain: f32) -> Result<()> {
        check_range("listener gain", gain, 0.0, f32::MAX)?;
        self.gain = gain;
        Ok(())
    }

    pub(crate) fn set_meters_per_unit(&mut self, meters: f32) -> Result<()> {
        if !(meters > 0.0 && meters.is_finite()) {
            return Err(PetalSonicError::InvalidValue(format!(
                "meters per unit must be positive, got {}",
                meters
            )));
        }
        self.meters_per_unit = meters;
        Ok(())
    }
}

pub(crate) fn ensure_finite(name: &str, v: Vec3) -> Result<()> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(PetalSonicError::InvalidValue(format!("{} is not finite: {}", name, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Quat;

    #[test]
    fn default_orientation() {
        let listener = Listener::default();
        assert_eq!(listener.forward(), Vec3::new(0.0, 0.0, -1.0));
        assert_eq!(listener.up(), Vec3::Y);
        assert_eq!(listener.gain(), 1.0);
    }

    #[test]
    fn pose_sets_orientation() {
        let mut listener = Listener::default();
        let pose = Pose::new(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
        );
        listener.set_pose(pose).unwrap();
        assert_eq!(listener.position(), Vec3::new(1.0, 2.0, 3.0));
        assert!((listener.forward() - Vec3::new(-1.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn rejects_bad_values() {
        let mut listener = Listener::default();
        assert!(listener.set_gain(-1.0).is_err());
        assert!(listener.set_meters_per_unit(0.0).is_err());
        assert!(listener.set_position(Vec3::new(f32::NAN, 0.0, 0.0)).is_err());
    }
}
