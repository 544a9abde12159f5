//! Producing schemas and files: the inverse of the reader, used to generate reference schemas and
//! fixture files.

use crate::config::Limits;
use crate::parsers::{
    blend::{encode_header, ChunkHeader, Header, CODE_DNA1, CODE_ENDB, INVALID_LENGTH},
    field::parse_declarator,
    primitive::Primitive,
    Endianness, PointerSize,
};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{self, Write};

#[derive(Debug, Clone)]
enum TypeLen {
    Fixed(u16),
    Struct(usize),
}

/// Collects names, types and structs and emits them as a SDNA blob.
///
/// Struct lengths are the plain sum of their members for the chosen pointer size; padding has to
/// be declared explicitly, as in any SDNA.
#[derive(Debug, Clone, Default)]
pub struct DnaBuilder {
    names: Vec<String>,
    types: Vec<(String, TypeLen)>,
    structs: Vec<(usize, Vec<(usize, usize)>)>,
}

impl DnaBuilder {
    pub fn new() -> Self {
        DnaBuilder::default()
    }

    /// A builder with every primitive type registered, in the usual order.
    pub fn with_primitives() -> Self {
        let mut builder = DnaBuilder::new();
        for p in &[
            Primitive::Char,
            Primitive::UChar,
            Primitive::Short,
            Primitive::UShort,
            Primitive::Int,
            Primitive::Long,
            Primitive::ULong,
            Primitive::Float,
            Primitive::Double,
            Primitive::Int64,
            Primitive::UInt64,
            Primitive::Void,
        ] {
            builder.add_type(p.type_name(), p.size() as u16);
        }
        builder
    }

    fn name_index(&mut self, name: &str) -> usize {
        match self.names.iter().position(|n| n == name) {
            Some(i) => i,
            None => {
                self.names.push(name.to_owned());
                self.names.len() - 1
            }
        }
    }

    fn type_index(&self, name: &str) -> Option<usize> {
        self.types.iter().position(|(n, _)| n == name)
    }

    /// Registers a type that is not a struct. Returns its index.
    pub fn add_type(&mut self, name: &str, len: u16) -> usize {
        match self.type_index(name) {
            Some(i) => {
                self.types[i].1 = TypeLen::Fixed(len);
                i
            }
            None => {
                self.types.push((name.to_owned(), TypeLen::Fixed(len)));
                self.types.len() - 1
            }
        }
    }

    /// Registers a struct made of `(type name, declarator)` members. Member types that are not
    /// known yet are registered as forward declared structs and must be added before `to_bytes`.
    pub fn add_struct(&mut self, name: &str, members: &[(&str, &str)]) -> usize {
        let struct_index = self.structs.len();
        let type_index = match self.type_index(name) {
            Some(i) => {
                self.types[i].1 = TypeLen::Struct(struct_index);
                i
            }
            None => {
                self.types.push((name.to_owned(), TypeLen::Struct(struct_index)));
                self.types.len() - 1
            }
        };

        let members = members
            .iter()
            .map(|(ty, decl)| {
                let t = match self.type_index(ty) {
                    Some(t) => t,
                    None => {
                        self.types.push(((*ty).to_owned(), TypeLen::Fixed(0)));
                        self.types.len() - 1
                    }
                };
                (t, self.name_index(decl))
            })
            .collect();

        self.structs.push((type_index, members));
        struct_index
    }

    fn type_len(&self, type_index: usize, pointer_size: PointerSize, depth: usize) -> usize {
        match &self.types[type_index].1 {
            TypeLen::Fixed(len) => usize::from(*len),
            TypeLen::Struct(_) if depth > 32 => 0,
            TypeLen::Struct(s) => self.structs[*s]
                .1
                .iter()
                .map(|&(t, n)| self.member_len(t, n, pointer_size, depth + 1))
                .fold(0, usize::saturating_add),
        }
    }

    fn member_len(&self, type_index: usize, name_index: usize, pointer_size: PointerSize, depth: usize) -> usize {
        let decl = match parse_declarator(&self.names[name_index], Limits::default().max_identifier_len) {
            Ok(decl) => decl,
            Err(_) => return 0,
        };
        if decl.is_pointer() {
            pointer_size.bytes_num().saturating_mul(decl.array_len)
        } else {
            self.type_len(type_index, pointer_size, depth).saturating_mul(decl.array_len)
        }
    }

    /// Byte length of a registered type for the given pointer size.
    pub fn len_of(&self, name: &str, pointer_size: PointerSize) -> Option<usize> {
        self.type_index(name).map(|t| self.type_len(t, pointer_size, 0))
    }

    /// Index of the struct named `name`, which is what chunk headers refer to.
    pub fn struct_index(&self, name: &str) -> Option<usize> {
        let t = self.type_index(name)?;
        self.structs.iter().position(|(st, _)| *st == t)
    }

    /// Encodes the schema blob. Fails with `InvalidInput` when a table, an index or a type
    /// length doesn't fit the width SDNA stores it in.
    pub fn to_bytes(&self, endianness: Endianness, pointer_size: PointerSize) -> io::Result<Vec<u8>> {
        match endianness {
            Endianness::Little => self.encode::<LittleEndian>(pointer_size),
            Endianness::Big => self.encode::<BigEndian>(pointer_size),
        }
    }

    fn encode<B: ByteOrder>(&self, pointer_size: PointerSize) -> io::Result<Vec<u8>> {
        fn align(out: &mut Vec<u8>) {
            while out.len() % 4 != 0 {
                out.push(0);
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"SDNA");

        out.extend_from_slice(b"NAME");
        out.write_u32::<B>(narrow(self.names.len(), "name count")?)?;
        for name in &self.names {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        align(&mut out);

        out.extend_from_slice(b"TYPE");
        out.write_u32::<B>(narrow(self.types.len(), "type count")?)?;
        for (name, _) in &self.types {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        align(&mut out);

        out.extend_from_slice(b"TLEN");
        for t in 0..self.types.len() {
            out.write_u16::<B>(narrow(self.type_len(t, pointer_size, 0), "type length")?)?;
        }
        align(&mut out);

        out.extend_from_slice(b"STRC");
        out.write_u32::<B>(narrow(self.structs.len(), "struct count")?)?;
        for (type_index, members) in &self.structs {
            out.write_u16::<B>(narrow(*type_index, "type index")?)?;
            out.write_u16::<B>(narrow(members.len(), "member count")?)?;
            for &(t, n) in members {
                out.write_u16::<B>(narrow(t, "type index")?)?;
                out.write_u16::<B>(narrow(n, "name index")?)?;
            }
        }
        Ok(out)
    }
}

fn narrow<T: TryFrom<usize>>(value: usize, what: &str) -> io::Result<T> {
    T::try_from(value).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} {} is too large for a blend file", what, value),
        )
    })
}

/// Writes a blend file: header, chunks, schema chunk and end marker.
pub struct BlendWriter<W: Write> {
    out: W,
    header: Header,
}

impl<W: Write> BlendWriter<W> {
    pub fn new(mut out: W, header: Header, magic: &[u8]) -> io::Result<Self> {
        out.write_all(&encode_header(&header, magic))?;
        Ok(BlendWriter { out, header })
    }

    /// Writes one chunk. `old` is the address the data is known by in the writing process.
    pub fn write_chunk(&mut self, code: [u8; 4], old: u64, type_index: u32, count: u32, data: &[u8]) -> io::Result<usize> {
        let header = ChunkHeader {
            code: u32::from_ne_bytes(code),
            len: chunk_len(data)?,
            old,
            type_index,
            count,
        };
        crate::chunk::write_chunk(&mut self.out, &header, data, self.header.pointer_size, self.header.endianness)
    }

    /// Writes the schema chunk and the end marker, then hands back the output.
    pub fn finish(mut self, dna: &[u8]) -> io::Result<W> {
        let header = ChunkHeader {
            code: CODE_DNA1,
            len: chunk_len(dna)?,
            old: 1,
            type_index: 0,
            count: 1,
        };
        crate::chunk::write_chunk(&mut self.out, &header, dna, self.header.pointer_size, self.header.endianness)?;

        let end = ChunkHeader {
            code: CODE_ENDB,
            len: 0,
            old: 0,
            type_index: 0,
            count: 0,
        };
        crate::chunk::write_chunk(&mut self.out, &end, &[], self.header.pointer_size, self.header.endianness)?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Chunk lengths are 32 bits wide and `u32::MAX` marks a corrupt chunk.
fn chunk_len(data: &[u8]) -> io::Result<u32> {
    match narrow(data.len(), "chunk length")? {
        INVALID_LENGTH => Err(io::Error::new(io::ErrorKind::InvalidInput, "chunk length is reserved")),
        len => Ok(len),
    }
}
