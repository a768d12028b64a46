//! GGUF format types and constants.

use serde::{Deserialize, Serialize};

/// `GGUF` as a little-endian u32.
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Version 1 used 32-bit counts and is no longer produced by llama.cpp.
pub const GGUF_VERSION_MIN: u32 = 2;
pub const GGUF_VERSION_MAX: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum GGUFValueType {
    Uint8 = 0,
    Int8 = 1,
    Uint16 = 2,
    Int16 = 3,
    Uint32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    Uint64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl TryFrom<u32> for GGUFValueType {
    type Error = GGUFError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        use GGUFValueType::*;
        const TABLE: [GGUFValueType; 13] = [
            Uint8, Int8, Uint16, Int16, Uint32, Int32, Float32, Bool, String, Array, Uint64,
            Int64, Float64,
        ];
        TABLE
            .get(v as usize)
            .copied()
            .ok_or(GGUFError::InvalidValueType(v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GGUFHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GGUFMetadataKV {
    pub key: String,
    pub value: GGUFValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GGUFValue {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GGUFValue>),
    Uint64(u64),
    Int64(i64),
    Float64(f64),
}

impl GGUFValue {
    /// Integer value as u32, if it is a non-negative integer that fits.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Self::Uint8(v) => Some(v.into()),
            Self::Uint16(v) => Some(v.into()),
            Self::Uint32(v) => Some(v),
            Self::Int32(v) => u32::try_from(v).ok(),
            Self::Uint64(v) => u32::try_from(v).ok(),
            Self::Int64(v) => u32::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GGUFError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file (magic 0x{0:08X})")]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid value type tag: {0}")]
    InvalidValueType(u32),

    #[error("Truncated header (file too small)")]
    TruncatedHeader,

    #[error("Nested metadata arrays are not supported")]
    NestedArray,

    #[error("{0}")]
    Other(String),
}

/// Map `general.file_type` to its quantisation label.
pub fn file_type_name(ft: u32) -> &'static str {
    match ft {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        7 => "Q8_0",
        8 => "Q5_0",
        9 => "Q5_1",
        10 => "Q2_K",
        11 => "Q3_K_S",
        12 => "Q3_K_M",
        13 => "Q3_K_L",
        14 => "Q4_K_S",
        15 => "Q4_K_M",
        16 => "Q5_K_S",
        17 => "Q5_K_M",
        18 => "Q6_K",
        19 => "IQ2_XXS",
        20 => "IQ2_XS",
        21 => "Q2_K_S",
        22 => "IQ3_XS",
        23 => "IQ3_XXS",
        24 => "IQ1_S",
        25 => "IQ4_NL",
        26 => "IQ3_S",
        27 => "IQ3_M",
        28 => "IQ2_S",
        29 => "IQ2_M",
        30 => "IQ4_XS",
        31 => "IQ1_M",
        32 => "BF16",
        _ => "Unknown",
    }
}
