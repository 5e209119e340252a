//! Pixel storage types.
//!
//! Bands always hold `f64` samples in memory; [`PixelType`] records the
//! numeric type the values are meant to have on disk so that stages which
//! change the type (e.g. a float-to-8-bit rescale) round and clamp exactly
//! once, and writers know which type to emit.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    U8,
    U16,
    I16,
    U32,
    I32,
    F32,
    #[default]
    F64,
}

impl PixelType {
    pub fn is_integer(self) -> bool {
        !matches!(self, PixelType::F32 | PixelType::F64)
    }

    /// Inclusive range of representable values.
    pub fn value_range(self) -> (f64, f64) {
        match self {
            PixelType::U8 => (u8::MIN as f64, u8::MAX as f64),
            PixelType::U16 => (u16::MIN as f64, u16::MAX as f64),
            PixelType::I16 => (i16::MIN as f64, i16::MAX as f64),
            PixelType::U32 => (u32::MIN as f64, u32::MAX as f64),
            PixelType::I32 => (i32::MIN as f64, i32::MAX as f64),
            PixelType::F32 => (f32::MIN as f64, f32::MAX as f64),
            PixelType::F64 => (f64::MIN, f64::MAX),
        }
    }

    /// Convert a sample to this type's value set (round + saturate for
    /// integer types, single precision for `F32`). NaN passes through.
    #[inline]
    pub fn cast(self, value: f64) -> f64 {
        if value.is_nan() {
            return value;
        }
        match self {
            PixelType::F64 => value,
            PixelType::F32 => value as f32 as f64,
            _ => {
                let (lo, hi) = self.value_range();
                value.round().clamp(lo, hi)
            }
        }
    }

    /// Whether `value` survives a cast to this type unchanged.
    pub fn can_represent(self, value: f64) -> bool {
        if value.is_nan() {
            return !self.is_integer();
        }
        self.cast(value) == value
    }

    /// The wider of two types, used when bands of different types meet in
    /// one output band.
    pub fn widen(self, other: PixelType) -> PixelType {
        if self == other {
            return self;
        }
        match (self.is_integer(), other.is_integer()) {
            (true, true) => {
                let (a_lo, a_hi) = self.value_range();
                let (b_lo, b_hi) = other.value_range();
                if a_lo <= b_lo && a_hi >= b_hi {
                    self
                } else if b_lo <= a_lo && b_hi >= a_hi {
                    other
                } else {
                    PixelType::I32.widen_signed(a_hi.max(b_hi))
                }
            }
            _ => {
                if self == PixelType::F64 || other == PixelType::F64 {
                    PixelType::F64
                } else if self == PixelType::F32 || other == PixelType::F32 {
                    // F32 holds every 8/16-bit integer exactly, not 32-bit ones
                    match (self, other) {
                        (PixelType::U32 | PixelType::I32, _) | (_, PixelType::U32 | PixelType::I32) => {
                            PixelType::F64
                        }
                        _ => PixelType::F32,
                    }
                } else {
                    PixelType::F64
                }
            }
        }
    }

    fn widen_signed(self, max: f64) -> PixelType {
        if max <= i32::MAX as f64 {
            self
        } else {
            PixelType::F64
        }
    }
}
