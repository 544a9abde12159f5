//! Rebuilding every block in the memory layout once both schemas are linked.
//!
//! Values are copied member by member, byte swapped and converted as the links require. Pointers
//! are looked up by their original address and replaced by the address of the relinked block they
//! refer to, or null when nothing was stored at that address.

use crate::containers::{hash_str, AddressKey, HashTable};
use crate::error::{try_zeroed, BlendError, Result};
use crate::file::{BlockSink, MemoryChunk};
use crate::parsers::{
    blend::ChunkFlags,
    primitive::{decode_address, encode_address, swap_element},
    PointerSize,
};
use crate::schema::{CompiledStruct, Flags, Member, SchemaTable};
use tracing::{debug, trace, warn};

/// Blocks of this struct are lists of addresses and are copied as they are.
const PASSTHROUGH_STRUCT: &str = "Link";

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RelinkSummary {
    pub relinked: usize,
    pub verbatim: usize,
    pub pointer_arrays: usize,
    pub unresolved: usize,
}

#[derive(Debug, Copy, Clone)]
enum Plan {
    Relink {
        file_struct: usize,
        memory_struct: usize,
        elements: usize,
    },
    Copy(Option<usize>),
}

fn plan(memory: &SchemaTable, file: &SchemaTable, index: usize, chunk: &MemoryChunk) -> Plan {
    let file_struct = chunk.header.type_index as usize;
    let memory_struct = file.structs().get(file_struct).and_then(|s| s.link);

    match memory_struct {
        Some(m) if memory.structs()[m].type_hash == hash_str(PASSTHROUGH_STRUCT) => Plan::Copy(Some(m)),
        Some(m) => Plan::Relink {
            file_struct,
            memory_struct: m,
            elements: stored_elements(index, chunk, &file.structs()[file_struct]),
        },
        None => Plan::Copy(None),
    }
}

/// Number of whole elements the block actually holds. The header's count is not trusted past the
/// end of the payload.
fn stored_elements(index: usize, chunk: &MemoryChunk, fs: &CompiledStruct) -> usize {
    let count = chunk.header.count as usize;
    let available = match (chunk.raw.as_deref(), fs.len) {
        (_, 0) | (None, _) => 0,
        (Some(raw), len) => raw.len() / len,
    };
    if count > available {
        warn!(
            "block {} claims {} elements but holds {}, the rest is dropped",
            index, count, available
        );
    }
    count.min(available)
}

fn buffer_address(buf: Option<&[u8]>) -> u64 {
    match buf {
        Some(b) if !b.is_empty() => b.as_ptr() as u64,
        _ => 0,
    }
}

struct Relinker<'a> {
    memory: &'a SchemaTable,
    file: &'a SchemaTable,
    chunks: &'a [MemoryChunk],
    chunk_map: &'a HashTable<AddressKey, usize>,
    new_addresses: Vec<u64>,
    arrays: Vec<Option<Box<[u8]>>>,
    stored: PointerSize,
    native: PointerSize,
    swap: bool,
    scratch: Vec<u8>,
    summary: RelinkSummary,
}

impl<'a> Relinker<'a> {
    fn resolve(&mut self, old: u64) -> u64 {
        if old == 0 {
            return 0;
        }
        match self.chunk_map.get(&AddressKey(old)) {
            Some(&target) => self.new_addresses[target],
            None => {
                trace!("pointer to {:#x} has no block", old);
                self.summary.unresolved += 1;
                0
            }
        }
    }

    fn relink_block(
        &mut self,
        index: usize,
        file_struct: usize,
        memory_struct: usize,
        elements: usize,
        dst: &mut [u8],
    ) -> Result<()> {
        let (chunks, file, memory) = (self.chunks, self.file, self.memory);
        let fs: &'a CompiledStruct = &file.structs()[file_struct];
        let ms: &'a CompiledStruct = &memory.structs()[memory_struct];
        let src = chunks[index].raw.as_deref().unwrap_or(&[]);

        for element in 0..elements {
            let src_base = element * fs.len;
            let dst_base = element * ms.len;

            for mm in &ms.members {
                let fm = match mm.link {
                    Some(k) => &fs.members[k],
                    None => continue,
                };
                if mm.is_fn_pointer {
                    continue;
                }

                let src_at = src_base + fm.offset;
                let dst_at = dst_base + mm.offset;
                let (src_field, dst_field) = match (src.get(src_at..src_at + fm.len), dst.get_mut(dst_at..dst_at + mm.len)) {
                    (Some(s), Some(d)) => (s, d),
                    _ => {
                        trace!("block {} is too short for member at {}", index, src_at);
                        continue;
                    }
                };

                if mm.pointer_count > 1 {
                    self.remap_pointer_arrays(mm, fm, src_field, dst_field)?;
                } else if mm.pointer_count == 1 {
                    self.remap_pointers(mm, fm, src_field, dst_field);
                } else {
                    self.copy_value(mm, fm, src_field, dst_field);
                }
            }
        }
        Ok(())
    }

    fn remap_pointers(&mut self, mm: &Member, fm: &Member, src: &[u8], dst: &mut [u8]) {
        let (fp, np) = (self.stored.bytes_num(), self.native.bytes_num());
        for e in 0..fm.array_len.min(mm.array_len) {
            let old = decode_address(&src[e * fp..], self.stored, self.native).unwrap_or(0);
            let new = self.resolve(old);
            encode_address(new, self.native, &mut dst[e * np..]);
        }
    }

    /// Double pointers point at a block holding an array of pointers. That array is remapped once
    /// into a buffer of its own, which every reference to the block then shares.
    fn remap_pointer_arrays(&mut self, mm: &Member, fm: &Member, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let (fp, np) = (self.stored.bytes_num(), self.native.bytes_num());
        for e in 0..fm.array_len.min(mm.array_len) {
            let old = decode_address(&src[e * fp..], self.stored, self.native).unwrap_or(0);
            if old == 0 {
                continue;
            }
            let target = match self.chunk_map.get(&AddressKey(old)) {
                Some(&t) => t,
                None => {
                    self.summary.unresolved += 1;
                    continue;
                }
            };

            if self.arrays[target].is_none() {
                let chunks = self.chunks;
                let raw = chunks[target].raw.as_deref().unwrap_or(&[]);
                let entries = raw.len() / fp;
                let mut array = try_zeroed(entries * np)?;
                for k in 0..entries {
                    let address = decode_address(&raw[k * fp..], self.stored, self.native).unwrap_or(0);
                    let new = self.resolve(address);
                    encode_address(new, self.native, &mut array[k * np..]);
                }
                self.arrays[target] = Some(array.into_boxed_slice());
                self.summary.pointer_arrays += 1;
            }

            let address = buffer_address(self.arrays[target].as_deref());
            encode_address(address, self.native, &mut dst[e * np..]);
        }
        Ok(())
    }

    fn copy_value(&mut self, mm: &Member, fm: &Member, src: &[u8], dst: &mut [u8]) {
        let cast = mm.flags.contains(Flags::NEEDS_CAST);
        if mm.type_hash == fm.type_hash && !cast && !self.swap {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            return;
        }

        let (src_elem, dst_elem) = (fm.element_len(), mm.element_len());
        if src_elem == 0 || dst_elem == 0 {
            return;
        }

        for e in 0..fm.array_len.min(mm.array_len) {
            let s = &src[e * src_elem..(e + 1) * src_elem];
            let d = &mut dst[e * dst_elem..(e + 1) * dst_elem];
            let value: &[u8] = if self.swap {
                swap_element(fm.primitive, s, &mut self.scratch);
                &self.scratch
            } else {
                s
            };

            match (cast, fm.primitive, mm.primitive) {
                (true, Some(from), Some(to)) => {
                    if value.len() >= from.size() && d.len() >= to.size() {
                        to.encode_f64(from.decode_f64(value), d);
                    }
                }
                (true, _, _) => {}
                (false, Some(from), Some(to)) if from.is_integer() && to.is_integer() && from.size() != to.size() => {
                    if value.len() >= from.size() && d.len() >= to.size() {
                        to.encode_i128(from.decode_i128(value), d);
                    }
                }
                (false, _, _) => {
                    let n = value.len().min(d.len());
                    d[..n].copy_from_slice(&value[..n]);
                }
            }
        }
    }
}

/// Relinks every block of `chunks` from the layout of `file` to the layout of `memory`, which must
/// be linked to each other. `stored` is the file's pointer width. Every block with a struct known
/// to both schemas is handed to `sink` once it is finished. The file bytes of every block are
/// dropped afterwards.
pub(crate) fn relink(
    memory: &SchemaTable,
    file: &SchemaTable,
    chunks: &mut [MemoryChunk],
    chunk_map: &HashTable<AddressKey, usize>,
    stored: PointerSize,
    flags: ChunkFlags,
    sink: &mut dyn BlockSink,
) -> Result<RelinkSummary> {
    let plans: Vec<Plan> = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| plan(memory, file, i, c))
        .collect();

    let mut outputs: Vec<Option<Box<[u8]>>> = Vec::with_capacity(chunks.len());
    for (chunk, plan) in chunks.iter().zip(&plans) {
        let raw = chunk.raw.as_deref().unwrap_or(&[]);
        let out = match *plan {
            Plan::Relink {
                memory_struct,
                elements,
                ..
            } => {
                let len = memory.structs()[memory_struct]
                    .len
                    .checked_mul(elements)
                    .ok_or(BlendError::BadAlloc(usize::MAX))?;
                try_zeroed(len)?
            }
            Plan::Copy(_) => {
                let mut copy = try_zeroed(raw.len())?;
                copy.copy_from_slice(raw);
                copy
            }
        };
        outputs.push(Some(out.into_boxed_slice()));
    }

    let new_addresses = outputs.iter().map(|o| buffer_address(o.as_deref())).collect();

    let mut relinker = Relinker {
        memory,
        file,
        chunks: &*chunks,
        chunk_map,
        new_addresses,
        arrays: vec![None; chunks.len()],
        stored,
        native: memory.pointer_size(),
        swap: flags.endian_swap,
        scratch: Vec::with_capacity(8),
        summary: RelinkSummary::default(),
    };

    for (i, plan) in plans.iter().enumerate() {
        let mut dst = match outputs[i].take() {
            Some(dst) => dst,
            None => continue,
        };

        match *plan {
            Plan::Relink {
                file_struct,
                memory_struct,
                elements,
            } => {
                relinker.relink_block(i, file_struct, memory_struct, elements, &mut dst)?;
                relinker.summary.relinked += 1;
                sink.notify_data(i, &dst, &chunks[i].header);
            }
            Plan::Copy(memory_struct) => {
                relinker.summary.verbatim += 1;
                if memory_struct.is_some() {
                    sink.notify_data(i, &dst, &chunks[i].header);
                }
            }
        }
        outputs[i] = Some(dst);
    }

    let Relinker { arrays, summary, .. } = relinker;
    for (((chunk, out), array), plan) in chunks.iter_mut().zip(outputs).zip(arrays).zip(plans) {
        chunk.struct_index = match plan {
            Plan::Relink { memory_struct, .. } => Some(memory_struct),
            Plan::Copy(m) => m,
        };
        chunk.modified = array.is_some();
        chunk.pointer_array = array;
        chunk.data = out;
        chunk.raw = None;
    }

    debug!(
        "relinked {} blocks, {} copied verbatim, {} pointer arrays, {} unresolved pointers",
        summary.relinked, summary.verbatim, summary.pointer_arrays, summary.unresolved
    );
    Ok(summary)
}
