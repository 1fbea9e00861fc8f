//! Position and speed value types.
//!
//! The desk reports positions in its own raw unit (1/100 cm, relative to
//! the lowest physical position) and speed as a signed raw value whose
//! magnitude scales to a float. Both are carried on the wire as
//! little-endian signed 16-bit fields.

use std::fmt;

/// Raw position units per centimeter.
pub const RAW_PER_CM: f32 = 100.0;

/// Divisor turning a raw speed reading into its float magnitude.
pub const SPEED_SCALE: f32 = 1000.0;

/// Speed magnitudes below this count as "not moving".
pub const SPEED_STOP_THRESHOLD: f32 = 0.001;

/// A desk position in raw device units. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeskPosition {
    raw: i32,
}

impl DeskPosition {
    pub fn new(raw: i32) -> Self {
        Self { raw }
    }

    pub fn from_cm(cm: f32) -> Self {
        Self::new((cm * RAW_PER_CM).round() as i32)
    }

    pub fn raw(&self) -> i32 {
        self.raw
    }

    pub fn cm(&self) -> f32 {
        self.raw as f32 / RAW_PER_CM
    }

    /// Rounded human-readable form, e.g. `"64 cm"`.
    pub fn human_cm(&self) -> String {
        format!("{} cm", self.cm().round() as i32)
    }

    /// Wire form: little-endian signed 16-bit raw value.
    pub fn to_bytes(&self) -> [u8; 2] {
        (self.raw as i16).to_le_bytes()
    }

    /// Shift by another position's raw units (used to apply the
    /// persisted desk offset to a relative reading).
    pub fn with_offset(&self, offset: DeskPosition) -> DeskPosition {
        DeskPosition::new(self.raw + offset.raw)
    }
}

impl fmt::Display for DeskPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.human_cm())
    }
}

/// A raw speed reading from the reference-output characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Speed {
    raw: i16,
}

impl Speed {
    pub fn new(raw: i16) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> i16 {
        self.raw
    }

    /// Unsigned float magnitude of the speed.
    pub fn magnitude(&self) -> f32 {
        (self.raw as f32 / SPEED_SCALE).abs()
    }

    pub fn is_stopped(&self) -> bool {
        self.magnitude() < SPEED_STOP_THRESHOLD
    }
}

/// One atomic height/speed telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeightSpeed {
    pub height: DeskPosition,
    pub speed: Speed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_cm_round_trip() {
        for raw in -1000..=7000 {
            let position = DeskPosition::new(raw);
            assert_eq!(DeskPosition::from_cm(position.cm()).raw(), raw);
        }
    }

    #[test]
    fn from_cm_rounds_to_nearest_raw_unit() {
        assert_eq!(DeskPosition::from_cm(64.0).raw(), 6400);
        assert_eq!(DeskPosition::from_cm(0.551).raw(), 55);
    }

    #[test]
    fn human_cm_rounds() {
        assert_eq!(DeskPosition::new(6449).human_cm(), "64 cm");
        assert_eq!(DeskPosition::new(6450).human_cm(), "65 cm");
    }

    #[test]
    fn wire_bytes_are_little_endian() {
        assert_eq!(DeskPosition::new(0x0129).to_bytes(), [0x29, 0x01]);
        assert_eq!(DeskPosition::new(-10).to_bytes(), [0xF6, 0xFF]);
    }

    #[test]
    fn offset_applies_in_raw_units() {
        let height = DeskPosition::new(1200);
        let offset = DeskPosition::new(6210);
        assert_eq!(height.with_offset(offset).raw(), 7410);
    }

    #[test]
    fn speed_threshold() {
        assert!(Speed::new(0).is_stopped());
        assert!(!Speed::new(1).is_stopped());
        assert!(!Speed::new(-1).is_stopped());
        assert_eq!(Speed::new(-500).magnitude(), 0.5);
    }
}
