use crate::error::{BlendError, Result};
use crate::parsers::{
    blend::{chunk_header, ChunkFlags, ChunkHeader, INVALID_LENGTH},
    finish, Endianness, PointerSize,
};
use crate::stream::Stream;
use std::io::{self, Write};

/// Reads the next chunk header from `stream`, leaving the stream at the start of its payload.
pub fn read_chunk<S: Stream + ?Sized>(stream: &mut S, flags: ChunkFlags, native: PointerSize) -> Result<ChunkHeader> {
    let stored = if flags.var_bits { native.other() } else { native };
    let len = ChunkHeader::encoded_len(stored);

    let mut buf = [0; 24];
    let read = stream
        .read_up_to(&mut buf[..len])
        .map_err(|_| BlendError::InvalidRead)?;
    if read != len {
        return Err(BlendError::InvalidRead);
    }

    let header = finish(chunk_header(&buf[..len], flags, native)).map_err(|_| BlendError::InvalidRead)?;
    if header.len == INVALID_LENGTH {
        return Err(BlendError::InvalidLength);
    }
    Ok(header)
}

/// Writes `header` followed by `data` with the given pointer width and byte order. Returns the
/// number of bytes written.
pub fn write_chunk<W: Write + ?Sized>(
    out: &mut W,
    header: &ChunkHeader,
    data: &[u8],
    pointer_size: PointerSize,
    endianness: Endianness,
) -> io::Result<usize> {
    let encoded = header.encode(pointer_size, endianness);
    out.write_all(&encoded)?;
    out.write_all(data)?;
    Ok(encoded.len() + data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::blend::code;
    use std::io::Cursor;

    fn native_flags() -> ChunkFlags {
        ChunkFlags::default()
    }

    #[test]
    fn write_then_read() {
        let header = ChunkHeader {
            code: code(*b"DATA"),
            len: 3,
            old: 0x1000,
            type_index: 1,
            count: 1,
        };
        let mut out = Vec::new();
        let written = write_chunk(&mut out, &header, &[7, 8, 9], PointerSize::native(), Endianness::native()).unwrap();
        assert_eq!(written, out.len());

        let mut stream = Cursor::new(out);
        let read = read_chunk(&mut stream, native_flags(), PointerSize::native()).unwrap();
        assert_eq!(read, header);
        assert_eq!(stream.position(), ChunkHeader::encoded_len(PointerSize::native()) as u64);
    }

    #[test]
    fn truncated_header() {
        let mut stream = Cursor::new(vec![0_u8; 6]);
        assert!(matches!(
            read_chunk(&mut stream, native_flags(), PointerSize::native()),
            Err(BlendError::InvalidRead)
        ));
    }

    #[test]
    fn sentinel_length_is_corrupt() {
        let header = ChunkHeader {
            code: code(*b"DATA"),
            len: INVALID_LENGTH,
            old: 0x1000,
            type_index: 0,
            count: 1,
        };
        let mut stream = Cursor::new(header.encode(PointerSize::native(), Endianness::native()));
        assert!(matches!(
            read_chunk(&mut stream, native_flags(), PointerSize::native()),
            Err(BlendError::InvalidLength)
        ));
    }
}
