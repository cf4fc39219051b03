//! Machine-level configuration.

use serde::{Deserialize, Serialize};

use crate::clock::MasterClock;
use crate::error::EmuError;
use crate::scheduler::FrameTiming;

/// Clock and decode parameters for one machine.
///
/// Every field has a default, so a JSON document only needs to name the
/// values that differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Primary CPU clock in Hz.
    pub cpu_clock_hz: u64,
    pub frames_per_sec: f64,
    pub lines_per_frame: u32,
    /// Width of the I/O address decode (1..=16 bits).
    pub io_addr_bits: u8,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpu_clock_hz: 4_000_000,
            frames_per_sec: 60.0,
            lines_per_frame: 262,
            io_addr_bits: 8,
        }
    }
}

impl MachineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, EmuError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EmuError> {
        if self.cpu_clock_hz == 0 {
            return Err(EmuError::InvalidConfig("cpu_clock_hz must be non-zero".into()));
        }
        if !self.frames_per_sec.is_finite() || self.frames_per_sec <= 0.0 {
            return Err(EmuError::InvalidConfig(format!(
                "frames_per_sec must be positive, got {}",
                self.frames_per_sec
            )));
        }
        if self.lines_per_frame == 0 {
            return Err(EmuError::InvalidConfig("lines_per_frame must be at least 1".into()));
        }
        if !(1..=16).contains(&self.io_addr_bits) {
            return Err(EmuError::InvalidConfig(format!(
                "io_addr_bits must be 1..=16, got {}",
                self.io_addr_bits
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn clock(&self) -> MasterClock {
        MasterClock::new(self.cpu_clock_hz)
    }

    #[must_use]
    pub fn timing(&self) -> FrameTiming {
        FrameTiming {
            frames_per_sec: self.frames_per_sec,
            lines_per_frame: self.lines_per_frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config = MachineConfig::from_json(r#"{ "cpu_clock_hz": 3500000 }"#).unwrap();
        assert_eq!(config.cpu_clock_hz, 3_500_000);
        assert_eq!(config.lines_per_frame, 262);
    }

    #[test]
    fn rejects_zero_frame_rate() {
        let err = MachineConfig::from_json(r#"{ "frames_per_sec": 0.0 }"#).unwrap_err();
        assert!(matches!(err, EmuError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = MachineConfig::from_json("{ cpu_clock_hz: }").unwrap_err();
        assert!(matches!(err, EmuError::ConfigParse(_)));
    }

    #[test]
    fn rejects_wide_io_decode() {
        let config = MachineConfig {
            io_addr_bits: 17,
            ..MachineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
