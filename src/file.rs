//! The reader: scans a file's chunks, keeps one block per original address and, once the schema
//! chunk shows up, links the file schema to the memory schema and relinks every block.

use crate::chunk::read_chunk;
use crate::config::ReaderOptions;
use crate::containers::{AddressKey, HashTable};
use crate::error::{try_zeroed, BlendError, Result};
use crate::link::{link, LinkSummary};
use crate::parsers::{
    blend::{header, ChunkFlags, ChunkHeader, Header, CODE_DNA1, CODE_ENDB, CODE_SDNA, HEADER_LEN},
    finish, Endianness, PointerSize,
};
use crate::relink::{relink, RelinkSummary};
use crate::schema::SchemaTable;
use crate::stream::Stream;
use tracing::{debug, error, trace};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseState {
    Unopened,
    HeaderParsed,
    ScanningChunks,
    SchemaFound,
    Linked,
    Done,
    Failed,
}

/// Receives every relinked block, in the order the blocks appear in the file.
pub trait BlockSink {
    fn notify_data(&mut self, index: usize, data: &[u8], header: &ChunkHeader);
}

impl<F> BlockSink for F
where
    F: FnMut(usize, &[u8], &ChunkHeader),
{
    fn notify_data(&mut self, index: usize, data: &[u8], header: &ChunkHeader) {
        self(index, data, header)
    }
}

/// A sink that ignores every block.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullSink;

impl BlockSink for NullSink {
    fn notify_data(&mut self, _index: usize, _data: &[u8], _header: &ChunkHeader) {}
}

/// One block kept from the file.
#[derive(Debug)]
pub struct MemoryChunk {
    pub(crate) header: ChunkHeader,
    /// The bytes as read from the file, dropped once relinked.
    pub(crate) raw: Option<Box<[u8]>>,
    /// The bytes in the memory layout.
    pub(crate) data: Option<Box<[u8]>>,
    /// The block read as an array of pointers, remapped, when a double pointer refers to it.
    pub(crate) pointer_array: Option<Box<[u8]>>,
    pub(crate) modified: bool,
    pub(crate) struct_index: Option<usize>,
}

impl MemoryChunk {
    fn new(header: ChunkHeader, raw: Box<[u8]>) -> Self {
        MemoryChunk {
            header,
            raw: Some(raw),
            data: None,
            pointer_array: None,
            modified: false,
            struct_index: None,
        }
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// The relinked bytes, or the file bytes if the block wasn't relinked yet.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().or_else(|| self.raw.as_deref()).unwrap_or(&[])
    }

    pub fn pointer_array(&self) -> Option<&[u8]> {
        self.pointer_array.as_deref()
    }

    /// Set when the block was rewritten as an array of remapped pointers.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// The struct of the memory schema the block was relinked to.
    pub fn struct_index(&self) -> Option<usize> {
        self.struct_index
    }

    /// The address of the relinked data, which is what relinked pointers to this block hold.
    pub fn address(&self) -> u64 {
        match self.data.as_deref() {
            Some(data) if !data.is_empty() => data.as_ptr() as u64,
            _ => 0,
        }
    }
}

/// Reads one file against the memory schema it was created with.
///
/// ```no_run
/// use blend_link::{BlendFile, NullSink, ReaderOptions};
///
/// # fn run(schema: &[u8]) -> blend_link::Result<()> {
/// let mut file = BlendFile::new(schema, ReaderOptions::default())?;
/// let mut stream = blend_link::stream::open_path("scene.blend")?;
/// file.parse(&mut stream, &mut NullSink)?;
/// println!("{} blocks", file.chunks().len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BlendFile {
    options: ReaderOptions,
    state: ParseState,
    native: PointerSize,
    header: Option<Header>,
    memory: SchemaTable,
    chunks: Vec<MemoryChunk>,
    chunk_map: HashTable<AddressKey, usize>,
    addresses: HashTable<AddressKey, usize>,
    array_addresses: HashTable<AddressKey, usize>,
    link_summary: Option<LinkSummary>,
    relink_summary: Option<RelinkSummary>,
}

impl BlendFile {
    /// Creates a reader whose memory layout is described by the SDNA blob `reference_schema`.
    pub fn new(reference_schema: &[u8], options: ReaderOptions) -> Result<Self> {
        let memory = SchemaTable::read(reference_schema, false, PointerSize::native(), &options.limits)
            .map_err(BlendError::LinkFailed)?;
        Ok(Self::with_schema(memory, options))
    }

    pub fn with_schema(memory: SchemaTable, options: ReaderOptions) -> Self {
        BlendFile {
            options,
            state: ParseState::Unopened,
            native: PointerSize::native(),
            header: None,
            memory,
            chunks: Vec::new(),
            chunk_map: HashTable::new(),
            addresses: HashTable::new(),
            array_addresses: HashTable::new(),
            link_summary: None,
            relink_summary: None,
        }
    }

    /// Reads the whole of `stream`, handing every relinked block to `sink`.
    ///
    /// A reader parses a single stream. On error it ends up in `ParseState::Failed` and has to be
    /// discarded.
    pub fn parse<S: Stream + ?Sized>(&mut self, stream: &mut S, sink: &mut dyn BlockSink) -> Result<()> {
        let res = match self.options.dispatch.clone() {
            Some(dispatch) => tracing::dispatcher::with_default(&dispatch, || self.read_blocks(stream, sink)),
            None => self.read_blocks(stream, sink),
        };

        if let Err(e) = &res {
            debug!("parse failed with status {}: {}", e.status(), e);
            self.state = ParseState::Failed;
        }
        res
    }

    fn read_header<S: Stream + ?Sized>(&mut self, stream: &mut S) -> Result<Header> {
        let mut buf = [0; HEADER_LEN];
        let n = stream.read_up_to(&mut buf)?;
        let parsed = finish(header(
            &buf[..n],
            &self.options.magic,
            self.options.alternate_magic.as_deref(),
        ));

        match parsed {
            Ok(h) => {
                debug!(
                    "header: version {}, {:?} pointers, {:?} endian",
                    h.version, h.pointer_size, h.endianness
                );
                Ok(h)
            }
            Err(e) => {
                if !self.options.quiet_header {
                    error!("invalid file header: {}", e);
                }
                Err(BlendError::InvalidHeader)
            }
        }
    }

    fn read_blocks<S: Stream + ?Sized>(&mut self, stream: &mut S, sink: &mut dyn BlockSink) -> Result<()> {
        if self.state != ParseState::Unopened {
            return Err(BlendError::InvalidState("parse another stream"));
        }

        let header = self.read_header(stream)?;
        self.header = Some(header.clone());
        self.state = ParseState::HeaderParsed;

        let flags = ChunkFlags::for_header(&header, self.native, Endianness::native());
        self.state = ParseState::ScanningChunks;

        loop {
            let chunk = read_chunk(stream, flags, self.native)?;
            if chunk.code == CODE_ENDB {
                break;
            }

            if chunk.code == CODE_DNA1 {
                let remaining = stream.size()?.saturating_sub(stream.position()?) as usize;
                let schema = ChunkHeader {
                    code: CODE_SDNA,
                    len: remaining as u32,
                    ..chunk
                };
                let mut data = try_zeroed(remaining)?;
                if stream.read_up_to(&mut data).map_err(|_| BlendError::InvalidRead)? != remaining {
                    return Err(BlendError::InvalidRead);
                }
                self.state = ParseState::SchemaFound;
                trace!("schema chunk of {} bytes", schema.len);

                return self.link_and_relink(&header, flags, &data, sink);
            }

            let len = chunk.len as usize;
            let mut data = try_zeroed(len)?;
            if stream.read_up_to(&mut data).map_err(|_| BlendError::InvalidRead)? != len {
                return Err(BlendError::InvalidRead);
            }

            let key = AddressKey(chunk.old);
            if self.chunk_map.contains_key(&key) {
                debug!("duplicate block at {:#x} discarded", chunk.old);
                continue;
            }
            if !self.chunk_map.insert(key, self.chunks.len()) {
                return Err(BlendError::InvalidInsert(chunk.old));
            }
            self.chunks.push(MemoryChunk::new(chunk, data.into_boxed_slice()));
        }

        Err(BlendError::MissingSchema)
    }

    fn link_and_relink(&mut self, header: &Header, flags: ChunkFlags, dna: &[u8], sink: &mut dyn BlockSink) -> Result<()> {
        let mut file = SchemaTable::read(dna, flags.endian_swap, header.pointer_size, &self.options.limits)
            .map_err(BlendError::LinkFailed)?;
        self.link_summary = Some(link(&mut self.memory, &mut file));
        self.state = ParseState::Linked;

        let summary = relink(
            &self.memory,
            &file,
            &mut self.chunks,
            &self.chunk_map,
            header.pointer_size,
            flags,
            sink,
        )?;
        self.relink_summary = Some(summary);

        // the file schema is dropped here, so nothing may point into it
        self.memory.clear_links();

        self.addresses = HashTable::with_capacity(self.chunks.len());
        self.array_addresses = HashTable::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            let address = chunk.address();
            if address != 0 {
                self.addresses.insert(AddressKey(address), i);
            }
            if let Some(array) = chunk.pointer_array() {
                self.array_addresses.insert(AddressKey(array.as_ptr() as u64), i);
            }
        }

        self.state = ParseState::Done;
        Ok(())
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn link_summary(&self) -> Option<&LinkSummary> {
        self.link_summary.as_ref()
    }

    pub fn relink_summary(&self) -> Option<&RelinkSummary> {
        self.relink_summary.as_ref()
    }

    pub fn memory_schema(&self) -> &SchemaTable {
        &self.memory
    }

    pub fn chunks(&self) -> &[MemoryChunk] {
        &self.chunks
    }

    /// The block stored at `old` in the writing process.
    pub fn find_chunk(&self, old: u64) -> Option<usize> {
        self.chunk_map.get(&AddressKey(old)).copied()
    }

    /// The block a relinked pointer refers to.
    pub fn chunk_at_address(&self, address: u64) -> Option<usize> {
        self.addresses.get(&AddressKey(address)).copied()
    }

    /// The block whose remapped pointer array a relinked double pointer refers to.
    pub fn pointer_array_at_address(&self, address: u64) -> Option<usize> {
        self.array_addresses.get(&AddressKey(address)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{BlendWriter, DnaBuilder};
    use std::io::Cursor;

    fn schema() -> DnaBuilder {
        let mut b = DnaBuilder::with_primitives();
        b.add_struct("Item", &[("int", "value")]);
        b
    }

    fn native_header() -> Header {
        Header {
            pointer_size: PointerSize::native(),
            endianness: Endianness::native(),
            version: 280,
        }
    }

    fn reader() -> BlendFile {
        let bytes = schema().to_bytes(Endianness::native(), PointerSize::native()).unwrap();
        BlendFile::new(&bytes, ReaderOptions::default()).unwrap()
    }

    #[test]
    fn duplicate_addresses_keep_the_first_block() {
        let b = schema();
        let mut w = BlendWriter::new(Vec::new(), native_header(), b"BLENDER").unwrap();
        w.write_chunk(*b"DATA", 0x10, 0, 1, &1_i32.to_ne_bytes()).unwrap();
        w.write_chunk(*b"DATA", 0x10, 0, 1, &2_i32.to_ne_bytes()).unwrap();
        w.write_chunk(*b"DATA", 0x20, 0, 1, &3_i32.to_ne_bytes()).unwrap();
        let bytes = w
            .finish(&b.to_bytes(Endianness::native(), PointerSize::native()).unwrap())
            .unwrap();

        let mut file = reader();
        let mut seen = Vec::new();
        let mut sink = |i: usize, data: &[u8], h: &ChunkHeader| seen.push((i, data.to_vec(), h.old));
        file.parse(&mut Cursor::new(bytes), &mut sink).unwrap();

        assert_eq!(file.state(), ParseState::Done);
        assert_eq!(file.chunks().len(), 2);
        assert_eq!(file.chunks()[0].data(), &1_i32.to_ne_bytes());
        assert_eq!(file.find_chunk(0x20), Some(1));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], (1, 3_i32.to_ne_bytes().to_vec(), 0x20));

        let address = file.chunks()[1].address();
        assert_eq!(file.chunk_at_address(address), Some(1));
    }

    #[test]
    fn missing_schema() {
        let mut out = Vec::new();
        {
            let mut w = BlendWriter::new(&mut out, native_header(), b"BLENDER").unwrap();
            w.write_chunk(*b"DATA", 0x10, 0, 1, &[0; 4]).unwrap();
            w.write_chunk(*b"ENDB", 0, 0, 0, &[]).unwrap();
        }
        let mut file = reader();
        let err = file.parse(&mut Cursor::new(out), &mut NullSink).unwrap_err();
        assert!(matches!(err, BlendError::MissingSchema));
        assert_eq!(err.status(), -7);
        assert_eq!(file.state(), ParseState::Failed);
    }

    #[test]
    fn bad_header() {
        let mut file = BlendFile::new(
            &schema().to_bytes(Endianness::native(), PointerSize::native()).unwrap(),
            ReaderOptions::default().quiet_header(true),
        )
        .unwrap();
        let err = file.parse(&mut Cursor::new(b"NOTBLEND-v280".to_vec()), &mut NullSink).unwrap_err();
        assert_eq!(err.status(), -6);
    }

    #[test]
    fn truncated_block() {
        let mut bytes = BlendWriter::new(Vec::new(), native_header(), b"BLENDER")
            .and_then(|mut w| {
                w.write_chunk(*b"DATA", 0x10, 0, 1, &[0; 64])?;
                w.finish(&schema().to_bytes(Endianness::native(), PointerSize::native()).unwrap())
            })
            .unwrap();
        let header_len = HEADER_LEN + ChunkHeader::encoded_len(PointerSize::native());
        bytes.truncate(header_len + 10);

        let mut file = reader();
        let err = file.parse(&mut Cursor::new(bytes), &mut NullSink).unwrap_err();
        assert!(matches!(err, BlendError::InvalidRead));
    }

    #[test]
    fn reader_is_single_use() {
        let bytes = BlendWriter::new(Vec::new(), native_header(), b"BLENDER")
            .and_then(|w| w.finish(&schema().to_bytes(Endianness::native(), PointerSize::native()).unwrap()))
            .unwrap();
        let mut file = reader();
        file.parse(&mut Cursor::new(bytes.clone()), &mut NullSink).unwrap();
        let err = file.parse(&mut Cursor::new(bytes), &mut NullSink).unwrap_err();
        assert!(matches!(err, BlendError::InvalidState(_)));
    }

    #[test]
    fn bad_reference_schema() {
        let err = BlendFile::new(b"SDNANAME", ReaderOptions::default()).unwrap_err();
        assert!(matches!(err, BlendError::LinkFailed(_)));
    }
}
