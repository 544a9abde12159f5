#![allow(dead_code)]

use blend_link::parsers::{blend::Header, Endianness, PointerSize};
use blend_link::writer::{BlendWriter, DnaBuilder};
use blend_link::{BlendFile, NullSink, ReaderOptions};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::io::Cursor;

/// Builds the payload of a block the way a writer with the given pointer size and byte order lays it out.
pub struct Payload {
    pointer_size: PointerSize,
    endianness: Endianness,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn new(pointer_size: PointerSize, endianness: Endianness) -> Self {
        Payload {
            pointer_size,
            endianness,
            bytes: Vec::new(),
        }
    }

    fn put(mut self, len: usize, write: impl FnOnce(&mut [u8], Endianness)) -> Self {
        let at = self.bytes.len();
        self.bytes.resize(at + len, 0);
        write(&mut self.bytes[at..], self.endianness);
        self
    }

    pub fn i16(self, v: i16) -> Self {
        self.put(2, |b, e| match e {
            Endianness::Little => LittleEndian::write_i16(b, v),
            Endianness::Big => BigEndian::write_i16(b, v),
        })
    }

    pub fn i32(self, v: i32) -> Self {
        self.put(4, |b, e| match e {
            Endianness::Little => LittleEndian::write_i32(b, v),
            Endianness::Big => BigEndian::write_i32(b, v),
        })
    }

    pub fn f32(self, v: f32) -> Self {
        self.put(4, |b, e| match e {
            Endianness::Little => LittleEndian::write_f32(b, v),
            Endianness::Big => BigEndian::write_f32(b, v),
        })
    }

    pub fn f64(self, v: f64) -> Self {
        self.put(8, |b, e| match e {
            Endianness::Little => LittleEndian::write_f64(b, v),
            Endianness::Big => BigEndian::write_f64(b, v),
        })
    }

    /// An address, stored the same way chunk headers store theirs.
    pub fn ptr(self, address: u64) -> Self {
        let len = self.pointer_size.bytes_num();
        self.put(len, |b, e| match e {
            Endianness::Little => LittleEndian::write_uint(b, address, len),
            Endianness::Big => BigEndian::write_uint(b, address, len),
        })
    }

    pub fn text(self, text: &str, len: usize) -> Self {
        self.put(len, |b, _| b[..text.len()].copy_from_slice(text.as_bytes()))
    }
}

/// A file being written with some pointer size and byte order.
pub struct Fixture {
    pub pointer_size: PointerSize,
    pub endianness: Endianness,
    writer: BlendWriter<Vec<u8>>,
}

impl Fixture {
    pub fn new(pointer_size: PointerSize, endianness: Endianness) -> Self {
        let header = Header {
            pointer_size,
            endianness,
            version: 280,
        };
        Fixture {
            pointer_size,
            endianness,
            writer: BlendWriter::new(Vec::new(), header, b"BLENDER").unwrap(),
        }
    }

    pub fn native() -> Self {
        Fixture::new(PointerSize::native(), Endianness::native())
    }

    pub fn payload(&self) -> Payload {
        Payload::new(self.pointer_size, self.endianness)
    }

    pub fn block(&mut self, code: [u8; 4], old: u64, dna: &DnaBuilder, struct_name: &str, count: u32, data: &[u8]) -> &mut Self {
        let type_index = dna.struct_index(struct_name).unwrap() as u32;
        self.writer.write_chunk(code, old, type_index, count, data).unwrap();
        self
    }

    pub fn finish(self, dna: &DnaBuilder) -> Vec<u8> {
        self.writer
            .finish(&dna.to_bytes(self.endianness, self.pointer_size).unwrap())
            .unwrap()
    }
}

pub fn memory_schema(dna: &DnaBuilder) -> Vec<u8> {
    dna.to_bytes(Endianness::native(), PointerSize::native()).unwrap()
}

pub fn read(memory: &DnaBuilder, bytes: Vec<u8>) -> BlendFile {
    let mut file = BlendFile::new(&memory_schema(memory), ReaderOptions::default()).unwrap();
    file.parse(&mut Cursor::new(bytes), &mut NullSink).unwrap();
    file
}

pub fn native_address(data: &[u8]) -> u64 {
    let mut bytes = [0; std::mem::size_of::<usize>()];
    let len = bytes.len();
    bytes.copy_from_slice(&data[..len]);
    usize::from_ne_bytes(bytes) as u64
}

/// The order every test schema starts with: `Link` is struct 0, as raw data blocks refer to it.
pub fn schema_with_link() -> DnaBuilder {
    let mut dna = DnaBuilder::with_primitives();
    dna.add_struct("Link", &[("Link", "*next"), ("Link", "*prev")]);
    dna
}
