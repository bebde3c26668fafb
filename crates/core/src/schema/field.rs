use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Fixed-point float over `[min, max]` in steps of `precision`.
    Quantized { min: f32, max: f32, precision: f32 },
    /// Raw unsigned integer stored in 1, 2 or 4 bytes.
    Unsigned { bytes: u8 },
    Flag,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f32),
    UInt(u32),
    Bool(bool),
}

impl FieldValue {
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Self::UInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl FieldKind {
    pub fn quantized(min: f32, max: f32, precision: f32) -> Result<Self, RegistryError> {
        let kind = Self::Quantized {
            min,
            max,
            precision,
        };
        kind.validate()?;
        Ok(kind)
    }

    pub fn unsigned(bytes: u8) -> Result<Self, RegistryError> {
        let kind = Self::Unsigned { bytes };
        kind.validate()?;
        Ok(kind)
    }

    pub(crate) fn validate(&self) -> Result<(), RegistryError> {
        match *self {
            Self::Quantized {
                min,
                max,
                precision,
            } => {
                let steps = ((max - min) / precision).round();
                if !(min.is_finite() && max.is_finite() && precision > 0.0)
                    || min >= max
                    || !(steps >= 1.0 && steps <= u32::MAX as f32)
                {
                    return Err(RegistryError::InvalidRange {
                        min,
                        max,
                        precision,
                    });
                }
                Ok(())
            }
            Self::Unsigned { bytes } => match bytes {
                1 | 2 | 4 => Ok(()),
                other => Err(RegistryError::InvalidWidth(other)),
            },
            Self::Flag => Ok(()),
        }
    }

    /// Largest encodable raw value.
    pub fn steps(&self) -> u32 {
        match *self {
            Self::Quantized {
                min,
                max,
                precision,
            } => ((max - min) / precision).round() as u32,
            Self::Unsigned { bytes: 1 } => u8::MAX as u32,
            Self::Unsigned { bytes: 2 } => u16::MAX as u32,
            Self::Unsigned { .. } => u32::MAX,
            Self::Flag => 1,
        }
    }

    /// Stored width in bytes: the smallest of 1, 2 or 4 that holds `steps`.
    pub fn width(&self) -> usize {
        match self.steps() {
            s if s <= u8::MAX as u32 => 1,
            s if s <= u16::MAX as u32 => 2,
            _ => 4,
        }
    }

    pub fn encode(&self, field: usize, value: FieldValue) -> Result<u32, RegistryError> {
        match (*self, value) {
            (
                Self::Quantized {
                    min, precision, ..
                },
                FieldValue::Float(v),
            ) => {
                if v.is_nan() {
                    return Ok(0);
                }
                // f32::round rounds half away from zero
                let q = ((v - min) / precision).round();
                Ok(q.clamp(0.0, self.steps() as f32) as u32)
            }
            (Self::Unsigned { .. }, FieldValue::UInt(v)) => Ok(v.min(self.steps())),
            (Self::Flag, FieldValue::Bool(v)) => Ok(v as u32),
            _ => Err(RegistryError::FieldTypeMismatch { field }),
        }
    }

    /// Returns `None` for raw values above `steps`.
    pub fn decode(&self, raw: u32) -> Option<FieldValue> {
        if raw > self.steps() {
            return None;
        }
        Some(match *self {
            Self::Quantized {
                min, precision, ..
            } => FieldValue::Float(min + raw as f32 * precision),
            Self::Unsigned { .. } => FieldValue::UInt(raw),
            Self::Flag => FieldValue::Bool(raw != 0),
        })
    }
}

pub(crate) fn write_raw(out: &mut [u8], raw: u32) {
    match out.len() {
        1 => out[0] = raw as u8,
        2 => out.copy_from_slice(&(raw as u16).to_le_bytes()),
        _ => out.copy_from_slice(&raw.to_le_bytes()),
    }
}

pub(crate) fn read_raw(bytes: &[u8]) -> u32 {
    match bytes.len() {
        1 => bytes[0] as u32,
        2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
        _ => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}
