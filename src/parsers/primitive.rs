use super::{Endianness, PointerSize};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

pub fn swap16(v: u16) -> u16 {
    v.swap_bytes()
}

pub fn swap32(v: u32) -> u32 {
    v.swap_bytes()
}

pub fn swap64(v: u64) -> u64 {
    v.swap_bytes()
}

/// Reverses every 2-byte element of `data` in place. A trailing partial element is left alone.
pub fn swap16_array(data: &mut [u8]) {
    data.chunks_exact_mut(2).for_each(|c| c.reverse());
}

pub fn swap32_array(data: &mut [u8]) {
    data.chunks_exact_mut(4).for_each(|c| c.reverse());
}

pub fn swap64_array(data: &mut [u8]) {
    data.chunks_exact_mut(8).for_each(|c| c.reverse());
}

/// Splits a 64-bit address into its (low, high) 32-bit halves.
pub fn split_address(address: u64) -> (u32, u32) {
    ((address & 0xFFFF_FFFF) as u32, (address >> 32) as u32)
}

pub fn join_address(low: u32, high: u32) -> u64 {
    u64::from(low) | (u64::from(high) << 32)
}

/// Reads an address stored with pointer width `stored` and converts it to the width `native`.
///
/// Addresses are only ever used as lookup keys, so they are read in the reader's byte order no
/// matter what the file's byte order is. Widening keeps the stored value as the low word, narrowing
/// keeps whichever half is non-zero.
pub fn decode_address(data: &[u8], stored: PointerSize, native: PointerSize) -> Option<u64> {
    match stored {
        PointerSize::Bits32 => {
            let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
            Some(u64::from(u32::from_ne_bytes(bytes)))
        }
        PointerSize::Bits64 => {
            let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
            let address = u64::from_ne_bytes(bytes);
            match native {
                PointerSize::Bits64 => Some(address),
                PointerSize::Bits32 => {
                    let (low, high) = split_address(address);
                    Some(u64::from(if low != 0 { low } else { high }))
                }
            }
        }
    }
}

/// Writes `address` into `data` using the pointer width `size` in the reader's byte order.
pub fn encode_address(address: u64, size: PointerSize, data: &mut [u8]) {
    match size {
        PointerSize::Bits32 => data[..4].copy_from_slice(&(address as u32).to_ne_bytes()),
        PointerSize::Bits64 => data[..8].copy_from_slice(&address.to_ne_bytes()),
    }
}

/// The primitive types a schema may declare. Anything else is a struct or an opaque type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Primitive {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    Long,
    ULong,
    Float,
    Double,
    Int64,
    UInt64,
    Void,
}

impl Primitive {
    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "char" => Primitive::Char,
            "uchar" => Primitive::UChar,
            "short" => Primitive::Short,
            "ushort" => Primitive::UShort,
            "int" => Primitive::Int,
            "long" => Primitive::Long,
            "ulong" => Primitive::ULong,
            "float" => Primitive::Float,
            "double" => Primitive::Double,
            "int64_t" => Primitive::Int64,
            "uint64_t" => Primitive::UInt64,
            "void" => Primitive::Void,
            _ => return None,
        })
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Primitive::Char => "char",
            Primitive::UChar => "uchar",
            Primitive::Short => "short",
            Primitive::UShort => "ushort",
            Primitive::Int => "int",
            Primitive::Long => "long",
            Primitive::ULong => "ulong",
            Primitive::Float => "float",
            Primitive::Double => "double",
            Primitive::Int64 => "int64_t",
            Primitive::UInt64 => "uint64_t",
            Primitive::Void => "void",
        }
    }

    /// Width in bytes as stored in a blend file. `long` is always 4 bytes there.
    pub fn size(self) -> usize {
        match self {
            Primitive::Void => 0,
            Primitive::Char | Primitive::UChar => 1,
            Primitive::Short | Primitive::UShort => 2,
            Primitive::Int | Primitive::Long | Primitive::ULong | Primitive::Float => 4,
            Primitive::Double | Primitive::Int64 | Primitive::UInt64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, Primitive::Float | Primitive::Double | Primitive::Void)
    }

    pub fn is_number(self) -> bool {
        self != Primitive::Void
    }

    /// Reads one value in native byte order and widens it to a double.
    pub fn decode_f64(self, data: &[u8]) -> f64 {
        let e = Endianness::native();
        match self {
            Primitive::Char => f64::from(data[0] as i8),
            Primitive::UChar => f64::from(data[0]),
            Primitive::Short => f64::from(parse_i16(data, e)),
            Primitive::UShort => f64::from(parse_u16(data, e)),
            Primitive::Int | Primitive::Long => f64::from(parse_i32(data, e)),
            Primitive::ULong => f64::from(parse_u32(data, e)),
            Primitive::Float => f64::from(parse_f32(data, e)),
            Primitive::Double => parse_f64(data, e),
            Primitive::Int64 => parse_i64(data, e) as f64,
            Primitive::UInt64 => parse_u64(data, e) as f64,
            Primitive::Void => 0.0,
        }
    }

    /// Reads one integer in native byte order, sign extended when the type is signed.
    /// Floating point types read as zero.
    pub fn decode_i128(self, data: &[u8]) -> i128 {
        let e = Endianness::native();
        match self {
            Primitive::Char => i128::from(data[0] as i8),
            Primitive::UChar => i128::from(data[0]),
            Primitive::Short => i128::from(parse_i16(data, e)),
            Primitive::UShort => i128::from(parse_u16(data, e)),
            Primitive::Int | Primitive::Long => i128::from(parse_i32(data, e)),
            Primitive::ULong => i128::from(parse_u32(data, e)),
            Primitive::Int64 => i128::from(parse_i64(data, e)),
            Primitive::UInt64 => i128::from(parse_u64(data, e)),
            Primitive::Float | Primitive::Double | Primitive::Void => 0,
        }
    }

    /// Writes the low bytes of `value` in native byte order, like a C integer conversion.
    pub fn encode_i128(self, value: i128, data: &mut [u8]) {
        match self {
            Primitive::Char | Primitive::UChar => data[0] = value as u8,
            Primitive::Short | Primitive::UShort => data[..2].copy_from_slice(&(value as u16).to_ne_bytes()),
            Primitive::Int | Primitive::Long | Primitive::ULong => {
                data[..4].copy_from_slice(&(value as u32).to_ne_bytes())
            }
            Primitive::Int64 | Primitive::UInt64 => data[..8].copy_from_slice(&(value as u64).to_ne_bytes()),
            Primitive::Float | Primitive::Double | Primitive::Void => {}
        }
    }

    /// Narrows `value` to this primitive and writes it in native byte order.
    /// Out of range values saturate, NaN becomes zero.
    pub fn encode_f64(self, value: f64, data: &mut [u8]) {
        match self {
            Primitive::Char => data[0] = (value as i8) as u8,
            Primitive::UChar => data[0] = value as u8,
            Primitive::Short => data[..2].copy_from_slice(&(value as i16).to_ne_bytes()),
            Primitive::UShort => data[..2].copy_from_slice(&(value as u16).to_ne_bytes()),
            Primitive::Int | Primitive::Long => {
                data[..4].copy_from_slice(&(value as i32).to_ne_bytes())
            }
            Primitive::ULong => data[..4].copy_from_slice(&(value as u32).to_ne_bytes()),
            Primitive::Float => data[..4].copy_from_slice(&(value as f32).to_ne_bytes()),
            Primitive::Double => data[..8].copy_from_slice(&value.to_ne_bytes()),
            Primitive::Int64 => data[..8].copy_from_slice(&(value as i64).to_ne_bytes()),
            Primitive::UInt64 => data[..8].copy_from_slice(&(value as u64).to_ne_bytes()),
            Primitive::Void => {}
        }
    }
}

/// Swaps the byte order of one element into `scratch` according to the element's declared type.
/// Types without a known width are zero filled.
pub(crate) fn swap_element(primitive: Option<Primitive>, src: &[u8], scratch: &mut Vec<u8>) {
    scratch.clear();
    scratch.resize(src.len(), 0);

    match primitive.map(Primitive::size) {
        Some(1) => scratch.copy_from_slice(src),
        Some(2) if src.len() >= 2 => {
            scratch[..2].copy_from_slice(&swap16(u16::from_ne_bytes([src[0], src[1]])).to_ne_bytes())
        }
        Some(4) if src.len() >= 4 => {
            let v = u32::from_ne_bytes([src[0], src[1], src[2], src[3]]);
            scratch[..4].copy_from_slice(&swap32(v).to_ne_bytes())
        }
        Some(8) if src.len() >= 8 => {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&src[..8]);
            scratch[..8].copy_from_slice(&swap64(u64::from_ne_bytes(bytes)).to_ne_bytes())
        }
        _ => {}
    }
}

/// Primitives the runtime can read out of a relinked block, with the schema type they are declared as.
pub(crate) trait BlendPrimitive {
    fn parse(data: &[u8], endianness: Endianness) -> Self;
    fn blender_name() -> &'static str;
}

impl BlendPrimitive for i8 {
    fn parse(data: &[u8], _endianness: Endianness) -> Self {
        data[0] as i8
    }
    fn blender_name() -> &'static str {
        "char"
    }
}

impl BlendPrimitive for u8 {
    fn parse(data: &[u8], _endianness: Endianness) -> Self {
        data[0]
    }
    fn blender_name() -> &'static str {
        "char"
    }
}

macro_rules! blend_primitive {
    ($($ty:ty => $parse:ident, $name:expr;)*) => {
        $(
            impl BlendPrimitive for $ty {
                fn parse(data: &[u8], endianness: Endianness) -> Self {
                    $parse(data, endianness)
                }
                fn blender_name() -> &'static str {
                    $name
                }
            }
        )*
    };
}

blend_primitive! {
    u16 => parse_u16, "ushort";
    i16 => parse_i16, "short";
    i32 => parse_i32, "int";
    f32 => parse_f32, "float";
    f64 => parse_f64, "double";
    u64 => parse_u64, "uint64_t";
    i64 => parse_i64, "int64_t";
}

macro_rules! parse_fn {
    ($($name:ident -> $ty:ty, $read:ident;)*) => {
        $(
            /// # Panics
            /// Panics if `slice` is shorter than the value.
            pub fn $name(slice: &[u8], endianness: Endianness) -> $ty {
                match endianness {
                    Endianness::Little => LittleEndian::$read(slice),
                    Endianness::Big => BigEndian::$read(slice),
                }
            }
        )*
    };
}

parse_fn! {
    parse_u16 -> u16, read_u16;
    parse_i16 -> i16, read_i16;
    parse_u32 -> u32, read_u32;
    parse_i32 -> i32, read_i32;
    parse_f32 -> f32, read_f32;
    parse_f64 -> f64, read_f64;
    parse_u64 -> u64, read_u64;
    parse_i64 -> i64, read_i64;
}
