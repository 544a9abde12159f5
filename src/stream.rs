//! The byte sources a file can be read from.
//!
//! Anything that is `Read + Seek` is a `Stream`: plain files, in-memory buffers and decompressed
//! gzip data all look the same to the reader.

use libflate::gzip::Decoder;
use std::{
    fs::File,
    io::{self, BufReader, Cursor, Read, Seek, SeekFrom},
    path::Path,
};

pub trait Stream: Read + Seek {
    fn position(&mut self) -> io::Result<u64> {
        self.stream_position()
    }

    /// Total length of the stream. The position is left unchanged.
    fn size(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    fn eof(&mut self) -> bool {
        match (self.position(), self.size()) {
            (Ok(pos), Ok(size)) => pos >= size,
            _ => true,
        }
    }

    /// Reads until `buf` is full or the stream ends. Returns how many bytes were read.
    fn read_up_to(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }
}

impl<T: Read + Seek + ?Sized> Stream for T {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

pub fn detect_compression(prefix: &[u8]) -> Compression {
    if prefix.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else {
        Compression::None
    }
}

/// Wraps `data` in a stream, decompressing it first if it is gzip data.
pub fn from_bytes(data: Vec<u8>) -> io::Result<Box<dyn Stream>> {
    match detect_compression(&data) {
        Compression::None => Ok(Box::new(Cursor::new(data))),
        Compression::Gzip => {
            let mut decoder = Decoder::new(&data[..])?;
            let mut plain = Vec::new();
            decoder.read_to_end(&mut plain)?;
            Ok(Box::new(Cursor::new(plain)))
        }
    }
}

/// Opens a file for reading. Compressed files are decompressed into memory, plain files are
/// read through a buffer.
pub fn open_path<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn Stream>> {
    let mut file = File::open(path)?;

    let mut prefix = [0; 2];
    let n = file.read_up_to(&mut prefix)?;
    file.seek(SeekFrom::Start(0))?;

    match detect_compression(&prefix[..n]) {
        Compression::None => Ok(Box::new(BufReader::new(file))),
        Compression::Gzip => {
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            from_bytes(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libflate::gzip::Encoder;
    use std::io::Write;

    #[test]
    fn size_keeps_position() {
        let mut stream = Cursor::new(vec![0_u8; 10]);
        stream.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(stream.size().unwrap(), 10);
        assert_eq!(Stream::position(&mut stream).unwrap(), 4);
        assert!(!stream.eof());
        stream.seek(SeekFrom::End(0)).unwrap();
        assert!(stream.eof());
    }

    #[test]
    fn short_read_reports_count() {
        let mut stream = Cursor::new(vec![1_u8, 2, 3]);
        let mut buf = [0; 8];
        assert_eq!(stream.read_up_to(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn gzip_is_detected() {
        let mut encoder = Encoder::new(Vec::new()).unwrap();
        encoder.write_all(b"BLENDER-v280").unwrap();
        let compressed = encoder.finish().into_result().unwrap();
        assert_eq!(detect_compression(&compressed), Compression::Gzip);

        let mut stream = from_bytes(compressed).unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"BLENDER-v280");

        assert_eq!(detect_compression(b"BLENDER"), Compression::None);
    }
}
