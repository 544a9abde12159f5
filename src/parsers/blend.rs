use crate::containers::NOT_FOUND;
use crate::parsers::{primitive::decode_address, BlendParseError, Endianness, PointerSize, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use nom::{
    branch::alt,
    bytes::complete::{tag, take},
    number::complete::{be_u32, le_u32},
    sequence::tuple,
    Err,
};

/// Length of the text header at the start of every file.
pub const HEADER_LEN: usize = 12;

/// Length value that marks a corrupt chunk header.
pub const INVALID_LENGTH: u32 = NOT_FOUND as u32;

/// Builds the integer form of a block code the way it is compared after decoding.
pub const fn code(bytes: [u8; 4]) -> u32 {
    u32::from_ne_bytes(bytes)
}

pub const CODE_DNA1: u32 = code(*b"DNA1");
pub const CODE_ENDB: u32 = code(*b"ENDB");
/// Tag a schema chunk carries once it has been recognized.
pub const CODE_SDNA: u32 = code(*b"SDNA");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// The size of the pointer on the machine used to save the file.
    pub pointer_size: PointerSize,
    /// The endianness of the machine used to save the file.
    pub endianness: Endianness,
    /// The version suffix, "280" is 280.
    pub version: u32,
}

fn pointer_size_bits32(input: &[u8]) -> Result<PointerSize> {
    let (input, _) = tag("_")(input)?;
    Ok((input, PointerSize::Bits32))
}

fn pointer_size_bits64(input: &[u8]) -> Result<PointerSize> {
    let (input, _) = tag("-")(input)?;
    Ok((input, PointerSize::Bits64))
}

pub fn pointer_size(input: &[u8]) -> Result<PointerSize> {
    alt((pointer_size_bits32, pointer_size_bits64))(input)
}

fn endianness_little(input: &[u8]) -> Result<Endianness> {
    let (input, _) = tag("v")(input)?;
    Ok((input, Endianness::Little))
}

fn endianness_big(input: &[u8]) -> Result<Endianness> {
    let (input, _) = tag("V")(input)?;
    Ok((input, Endianness::Big))
}

pub fn endianness(input: &[u8]) -> Result<Endianness> {
    alt((endianness_little, endianness_big))(input)
}

pub fn version(input: &[u8]) -> Result<u32> {
    let (input, v) = take(3_usize)(input)?;
    let version = v
        .iter()
        .filter(|b| b.is_ascii_digit())
        .fold(0, |acc, b| acc * 10 + u32::from(b - b'0'));
    Ok((input, version))
}

/// Parses the 12 byte header. The id occupies the first 7 bytes; a 6 byte id leaves one byte
/// that is not checked.
pub fn header<'a>(input: &'a [u8], magic: &[u8], alternate: Option<&[u8]>) -> Result<'a, Header> {
    let (input, id) = take::<_, _, BlendParseError>(7_usize)(input)?;

    let known = id.starts_with(magic) || alternate.map_or(false, |m| id.starts_with(m));
    if !known {
        return Err(Err::Failure(BlendParseError::InvalidHeader));
    }

    let (input, (pointer_size, endianness, version)) =
        tuple((pointer_size, endianness, version))(input)?;

    Ok((
        input,
        Header {
            pointer_size,
            endianness,
            version,
        },
    ))
}

pub fn encode_header(header: &Header, magic: &[u8]) -> [u8; HEADER_LEN] {
    let mut bytes = [b' '; HEADER_LEN];
    bytes[..magic.len().min(7)].copy_from_slice(&magic[..magic.len().min(7)]);
    bytes[7] = match header.pointer_size {
        PointerSize::Bits32 => b'_',
        PointerSize::Bits64 => b'-',
    };
    bytes[8] = match header.endianness {
        Endianness::Little => b'v',
        Endianness::Big => b'V',
    };
    let version = format!("{:03}", header.version % 1000);
    bytes[9..].copy_from_slice(version.as_bytes());
    bytes
}

/// How stored chunk headers differ from the reader.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ChunkFlags {
    /// The file's pointer width differs from the reader's.
    pub var_bits: bool,
    /// The file's byte order differs from the reader's.
    pub endian_swap: bool,
}

impl ChunkFlags {
    pub fn for_header(header: &Header, native_pointer: PointerSize, native_endianness: Endianness) -> Self {
        ChunkFlags {
            var_bits: header.pointer_size != native_pointer,
            endian_swap: header.endianness != native_endianness,
        }
    }
}

/// A chunk header in the reader's shape, whatever width and byte order it was stored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub code: u32,
    pub len: u32,
    /// The address of the data in the process that wrote the file.
    pub old: u64,
    pub type_index: u32,
    pub count: u32,
}

impl ChunkHeader {
    /// Size of a stored header written with pointers of `pointer_size`.
    pub fn encoded_len(pointer_size: PointerSize) -> usize {
        16 + pointer_size.bytes_num()
    }

    pub fn code_bytes(&self) -> [u8; 4] {
        self.code.to_ne_bytes()
    }

    /// 2 character codes mark blocks that own an ID, e.g. `OB` or `ME`.
    pub fn short_code(&self) -> Option<[u8; 2]> {
        match self.code_bytes() {
            [a, b, 0, 0] if a != 0 => Some([a, b]),
            _ => None,
        }
    }

    /// Encodes the header for a file with the given pointer width and byte order.
    /// The code is stored as an integer in that byte order, the address as given.
    pub fn encode(&self, pointer_size: PointerSize, endianness: Endianness) -> Vec<u8> {
        let mut out = vec![0; Self::encoded_len(pointer_size)];
        let ptr = pointer_size.bytes_num();
        let write_u32 = |buf: &mut [u8], v: u32| match endianness {
            Endianness::Little => LittleEndian::write_u32(buf, v),
            Endianness::Big => BigEndian::write_u32(buf, v),
        };

        write_u32(&mut out[0..4], self.code);
        write_u32(&mut out[4..8], self.len);
        let old = match pointer_size {
            PointerSize::Bits32 => self.old & 0xFFFF_FFFF,
            PointerSize::Bits64 => self.old,
        };
        match endianness {
            Endianness::Little => LittleEndian::write_uint(&mut out[8..8 + ptr], old, ptr),
            Endianness::Big => BigEndian::write_uint(&mut out[8..8 + ptr], old, ptr),
        }
        write_u32(&mut out[8 + ptr..12 + ptr], self.type_index);
        write_u32(&mut out[12 + ptr..16 + ptr], self.count);
        out
    }
}

fn native_u32(input: &[u8]) -> Result<u32> {
    if cfg!(target_endian = "little") {
        le_u32(input)
    } else {
        be_u32(input)
    }
}

/// Decodes one stored chunk header.
///
/// The layout follows the reader's pointer width `native`, or the other width when `var_bits` is
/// set. Fields are read in the reader's byte order and swapped afterwards when `endian_swap` is set;
/// the address is never swapped so it keeps matching the pointers stored inside the payloads.
pub fn chunk_header(input: &[u8], flags: ChunkFlags, native: PointerSize) -> Result<ChunkHeader> {
    let stored = if flags.var_bits { native.other() } else { native };

    let (input, code) = native_u32(input)?;
    let (input, len) = native_u32(input)?;
    let (input, address) = take(stored.bytes_num())(input)?;
    let (input, type_index) = native_u32(input)?;
    let (input, count) = native_u32(input)?;

    let old = match decode_address(address, stored, native) {
        Some(old) => old,
        None => return Err(Err::Failure(BlendParseError::NotEnoughData)),
    };

    let mut header = ChunkHeader {
        code,
        len,
        old,
        type_index,
        count,
    };

    if flags.endian_swap {
        header.code = header.code.swap_bytes();
        if header.code & 0xFFFF == 0 {
            header.code >>= 16;
        }
        header.len = header.len.swap_bytes();
        header.count = header.count.swap_bytes();
        header.type_index = header.type_index.swap_bytes();
    }

    Ok((input, header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::finish;

    #[test]
    fn parses_header() {
        let h = finish(header(b"BLENDER-v280", b"BLENDER", None)).unwrap();
        assert_eq!(h.pointer_size, PointerSize::Bits64);
        assert_eq!(h.endianness, Endianness::Little);
        assert_eq!(h.version, 280);

        let h = finish(header(b"BLENDER_V249", b"BLENDER", None)).unwrap();
        assert_eq!(h.pointer_size, PointerSize::Bits32);
        assert_eq!(h.endianness, Endianness::Big);
    }

    #[test]
    fn alternate_id() {
        assert!(finish(header(b"BULLETf-v275", b"BLENDER", None)).is_err());
        let h = finish(header(b"BULLETf-v275", b"BLENDER", Some(b"BULLET"))).unwrap();
        assert_eq!(h.version, 275);
    }

    #[test]
    fn rejects_unknown_id() {
        let res = finish(header(b"\x1f\x8b\x08\0\0\0\0\0\0\0\0\0", b"BLENDER", None));
        assert!(matches!(res, Err(BlendParseError::InvalidHeader)));
    }

    #[test]
    fn header_round_trip() {
        let h = Header {
            pointer_size: PointerSize::Bits32,
            endianness: Endianness::Big,
            version: 79,
        };
        let bytes = encode_header(&h, b"BLENDER");
        assert_eq!(&bytes, b"BLENDER_V079");
        assert_eq!(finish(header(&bytes, b"BLENDER", None)).unwrap(), h);
    }

    #[test]
    fn narrow_address_widens_on_64_bit_reader() {
        let stored = ChunkHeader {
            code: code(*b"DATA"),
            len: 16,
            old: 0x8000_1234,
            type_index: 3,
            count: 2,
        };
        let bytes = stored.encode(PointerSize::Bits32, Endianness::native());
        assert_eq!(bytes.len(), 20);

        let flags = ChunkFlags {
            var_bits: true,
            endian_swap: false,
        };
        let h = finish(chunk_header(&bytes, flags, PointerSize::Bits64)).unwrap();
        assert_eq!(h.old & 0xFFFF_FFFF, 0x8000_1234);
        assert_eq!(h.old >> 32, 0);
        assert_eq!(h.len, 16);
        assert_eq!(h.count, 2);
        assert_eq!(h.type_index, 3);
    }

    #[test]
    fn wide_address_narrows_on_32_bit_reader() {
        let stored = ChunkHeader {
            code: code(*b"DATA"),
            len: 4,
            old: 0x0000_0010_0000_0000,
            type_index: 0,
            count: 1,
        };
        let e = Endianness::native();
        let bytes = stored.encode(PointerSize::Bits64, e);
        let flags = ChunkFlags {
            var_bits: true,
            endian_swap: false,
        };
        let h = finish(chunk_header(&bytes, flags, PointerSize::Bits32)).unwrap();
        if e == Endianness::Little {
            assert_eq!(h.old, 0x10);
        }
    }

    #[test]
    fn swapped_fields() {
        let stored = ChunkHeader {
            code: code(*b"OB\0\0"),
            len: 0x0102,
            old: 0xABCD,
            type_index: 7,
            count: 1,
        };
        let foreign = Endianness::native().swapped();
        let bytes = stored.encode(PointerSize::native(), foreign);
        let flags = ChunkFlags {
            var_bits: false,
            endian_swap: true,
        };
        let h = finish(chunk_header(&bytes, flags, PointerSize::native())).unwrap();
        assert_eq!(h.code, code(*b"OB\0\0"));
        assert_eq!(h.short_code(), Some(*b"OB"));
        assert_eq!(h.len, 0x0102);
        assert_eq!(h.type_index, 7);
        assert_eq!(h.count, 1);
        // the address is only width converted, never swapped
        assert_eq!(h.old, 0xABCD_u64.swap_bytes() >> (64 - 8 * PointerSize::native().bytes_num()));
    }

    #[test]
    fn left_aligned_short_code_is_shifted() {
        // after swapping, the two characters sit in the high half and get shifted down
        let stored = ChunkHeader {
            code: 0x0000_424F,
            len: 0,
            old: 1,
            type_index: 0,
            count: 1,
        };
        let bytes = stored.encode(PointerSize::native(), Endianness::native());
        let flags = ChunkFlags {
            var_bits: false,
            endian_swap: true,
        };
        let h = finish(chunk_header(&bytes, flags, PointerSize::native())).unwrap();
        assert_eq!(h.code, 0x4F42);
    }

    #[test]
    fn short_input_fails() {
        let res = finish(chunk_header(&[0; 10], ChunkFlags::default(), PointerSize::Bits64));
        assert!(res.is_err());
    }
}
