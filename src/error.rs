//! Error types for PetalSonic

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PetalSonicError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Delay-line or effect state storage could not be allocated.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// An id that does not name a live source, slot or context.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, PetalSonicError>;

/// Fails with [`PetalSonicError::InvalidValue`] unless `min <= value <= max`.
pub(crate) fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(PetalSonicError::InvalidValue(format!(
            "{} = {} is outside [{}, {}]",
            name, value, min, max
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_is_inclusive() {
        assert!(check_range("gain", 0.0, 0.0, 1.0).is_ok());
        assert!(check_range("gain", 1.0, 0.0, 1.0).is_ok());
        assert!(matches!(
            check_range("gain", 1.5, 0.0, 1.0),
            Err(PetalSonicError::InvalidValue(_))
        ));
        assert!(check_range("gain", f32::NAN, 0.0, 1.0).is_err());
    }
}
