use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Brain-float16 (BF16) scalar storage.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable)]
pub struct BF16 {
    pub bits: u16,
}

impl BF16 {
    /// Convert from f32 to BF16 (round to nearest even).
    pub fn from_f32(value: f32) -> Self {
        if value.is_nan() {
            return Self { bits: 0x7fc0 };
        }
        let bits = value.to_bits();
        let rounding = 0x7fff + ((bits >> 16) & 1);
        let rounded = bits.wrapping_add(rounding);
        Self {
            bits: (rounded >> 16) as u16,
        }
    }

    /// Convert BF16 to f32.
    pub fn to_f32(self) -> f32 {
        f32::from_bits((self.bits as u32) << 16)
    }
}

/// IEEE 754 half-precision (F16) scalar storage.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable)]
pub struct F16 {
    pub bits: u16,
}

impl F16 {
    /// Convert from f32 to F16.
    pub fn from_f32(value: f32) -> Self {
        let bits = value.to_bits();
        let sign = ((bits >> 16) & 0x8000) as u16;
        let exp = ((bits >> 23) & 0xff) as i32;
        let mant = bits & 0x7fffff;
        let f16_bits = match exp {
            0 => sign,
            255 => {
                if mant == 0 {
                    sign | 0x7c00
                } else {
                    sign | 0x7e00
                }
            }
            _ => {
                let exp16 = exp - 127 + 15;
                if exp16 >= 0x1f {
                    sign | 0x7c00
                } else if exp16 <= 0 {
                    if exp16 < -10 {
                        sign
                    } else {
                        let mant16 = mant | 0x800000;
                        let shift = (14 - exp16) as u32;
                        let mut half = (mant16 >> shift) as u16;
                        if (mant16 >> (shift - 1)) & 1 != 0 {
                            half = half.wrapping_add(1);
                        }
                        sign | half
                    }
                } else {
                    let mut half = ((exp16 as u16) << 10) | ((mant >> 13) as u16);
                    if (mant >> 12) & 1 != 0 {
                        half = half.wrapping_add(1);
                    }
                    sign | half
                }
            }
        };
        Self { bits: f16_bits }
    }

    /// Convert F16 to f32.
    pub fn to_f32(self) -> f32 {
        let sign = ((self.bits & 0x8000) as u32) << 16;
        let exp = (self.bits >> 10) & 0x1f;
        let mant = (self.bits & 0x03ff) as u32;
        let bits = if exp == 0 {
            if mant == 0 {
                sign
            } else {
                let mut mant = mant;
                let mut exp = -1i32;
                while (mant & 0x0400) == 0 {
                    mant <<= 1;
                    exp -= 1;
                }
                mant &= 0x03ff;
                let exp32 = (exp + 1 + 127 - 15) as u32;
                sign | (exp32 << 23) | (mant << 13)
            }
        } else if exp == 0x1f {
            sign | 0x7f800000 | (mant << 13)
        } else {
            let exp32 = (exp as u32) + (127 - 15);
            sign | (exp32 << 23) | (mant << 13)
        };
        f32::from_bits(bits)
    }
}

/// Floating-point element kinds the float kernels are instantiated for.
///
/// Arithmetic happens in `f64`; narrow formats round on the way back.
pub trait FloatElement: Copy + Send + Sync + 'static {
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

impl FloatElement for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl FloatElement for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

impl FloatElement for F16 {
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }

    fn from_f64(value: f64) -> Self {
        F16::from_f32(value as f32)
    }
}

impl FloatElement for BF16 {
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }

    fn from_f64(value: f64) -> Self {
        BF16::from_f32(value as f32)
    }
}
