//! Schema tables: the parsed SDNA of one side (the file, or the reader's own memory layout) and
//! the flattened member layout of every struct in it.

use crate::config::Limits;
use crate::containers::{hash_str, HashTable, IntKey};
use crate::parsers::{
    dna::{Dna, DnaParseContext, DnaStruct},
    field::{parse_declarator, Declarator},
    finish,
    primitive::Primitive,
    BlendParseError, Endianness, PointerSize,
};
use std::fmt;
use tracing::{debug, warn};

/// Embedding deeper than this is treated as a struct that contains itself.
const MAX_EMBED_DEPTH: usize = 32;

/// State bits of a compiled struct or member.
#[derive(Default, Copy, Clone, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    /// No counterpart was found in the other schema.
    pub const MISSING: Flags = Flags(1);
    /// The members don't add up to the declared struct length.
    pub const MISALIGNED: Flags = Flags(1 << 1);
    /// A file member the reader has no use for.
    pub const SKIP: Flags = Flags(1 << 2);
    /// Linked to a member of a different numeric type.
    pub const NEEDS_CAST: Flags = Flags(1 << 3);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Flags::MISSING, "MISSING"),
            (Flags::MISALIGNED, "MISALIGNED"),
            (Flags::SKIP, "SKIP"),
            (Flags::NEEDS_CAST, "NEEDS_CAST"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({})", set.join(" | "))
    }
}

#[derive(Debug, Clone)]
pub struct NameEntry {
    pub raw: String,
    pub decl: Declarator,
}

#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub name: String,
    pub hash: u64,
    /// Byte length as declared in the schema.
    pub len: usize,
    pub struct_index: Option<usize>,
    pub primitive: Option<Primitive>,
}

/// One step from a struct into one of its embedded struct members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStep {
    pub type_hash: u64,
    pub name_hash: u64,
    /// Element of the embedded struct array, 0 for a single struct.
    pub element: usize,
}

/// A leaf member of a compiled struct, with embedded structs expanded in place.
#[derive(Debug, Clone)]
pub struct Member {
    pub type_index: usize,
    pub name_index: usize,
    pub type_hash: u64,
    pub name_hash: u64,
    /// Offset from the start of the top-level struct.
    pub offset: usize,
    pub len: usize,
    pub array_len: usize,
    pub pointer_count: usize,
    pub is_fn_pointer: bool,
    pub array_index: usize,
    pub depth: usize,
    /// Index of the top-level struct this member belongs to.
    pub owner: usize,
    pub flags: Flags,
    /// Index of the matching member in the linked struct of the other schema.
    pub link: Option<usize>,
    /// Path of embedded structs from the top-level struct down to this member.
    pub chain: Vec<KeyStep>,
    pub primitive: Option<Primitive>,
}

impl Member {
    pub fn is_pointer(&self) -> bool {
        self.pointer_count > 0 || self.is_fn_pointer
    }

    /// Length of one array element.
    pub fn element_len(&self) -> usize {
        if self.array_len == 0 {
            0
        } else {
            self.len / self.array_len
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledStruct {
    pub type_index: usize,
    pub type_hash: u64,
    /// Declared length from the type length table.
    pub len: usize,
    pub flags: Flags,
    /// Index of the struct with the same type name in the other schema.
    pub link: Option<usize>,
    pub members: Vec<Member>,
}

#[derive(Debug)]
pub struct SchemaTable {
    pointer_size: PointerSize,
    names: Vec<NameEntry>,
    types: Vec<TypeEntry>,
    layouts: Vec<DnaStruct>,
    structs: Vec<CompiledStruct>,
    type_lookup: HashTable<IntKey, usize>,
    base_names: HashTable<IntKey, Vec<usize>>,
}

/// State of flattening one struct.
struct Walk {
    owner: usize,
    members: Vec<Member>,
    /// Members and embedded elements that may still be visited.
    budget: usize,
    max: usize,
}

impl SchemaTable {
    /// Parses and compiles a SDNA blob. `swap_endianness` is set when the blob was written with
    /// the other byte order; `pointer_size` is the pointer width of the layout it describes.
    pub fn read(
        data: &[u8],
        swap_endianness: bool,
        pointer_size: PointerSize,
        limits: &Limits,
    ) -> Result<Self, BlendParseError> {
        let endianness = if swap_endianness {
            Endianness::native().swapped()
        } else {
            Endianness::native()
        };
        let dna = finish(DnaParseContext::new(endianness, *limits).dna(data))?;
        Self::from_dna(dna, pointer_size, limits)
    }

    pub fn from_dna(dna: Dna, pointer_size: PointerSize, limits: &Limits) -> Result<Self, BlendParseError> {
        let Dna { names, types, structs } = dna;

        let names = names
            .into_iter()
            .map(|raw| {
                let decl = parse_declarator(&raw, limits.max_identifier_len)?;
                Ok(NameEntry { raw, decl })
            })
            .collect::<Result<Vec<_>, BlendParseError>>()?;

        let mut base_names: HashTable<IntKey, Vec<usize>> = HashTable::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let key = IntKey(name.decl.base_hash);
            match base_names.get_mut(&key) {
                Some(list) => list.push(i),
                None => {
                    base_names.insert(key, vec![i]);
                }
            }
        }

        let mut types: Vec<TypeEntry> = types
            .into_iter()
            .map(|t| TypeEntry {
                hash: hash_str(&t.name),
                primitive: Primitive::from_type_name(&t.name),
                name: t.name,
                len: t.bytes_len,
                struct_index: None,
            })
            .collect();

        let mut type_lookup = HashTable::with_capacity(types.len());
        for (i, t) in types.iter().enumerate() {
            // the first type of a given name wins
            type_lookup.insert(IntKey(t.hash), i);
        }

        for (i, s) in structs.iter().enumerate() {
            let t = &mut types[s.type_index];
            if t.struct_index.is_none() {
                t.struct_index = Some(i);
                t.primitive = None;
            }
        }

        let mut table = SchemaTable {
            pointer_size,
            names,
            types,
            layouts: structs,
            structs: Vec::new(),
            type_lookup,
            base_names,
        };
        table.compile(limits)?;
        Ok(table)
    }

    fn compile(&mut self, limits: &Limits) -> Result<(), BlendParseError> {
        let mut compiled = Vec::with_capacity(self.layouts.len());

        for (i, layout) in self.layouts.iter().enumerate() {
            let ty = &self.types[layout.type_index];
            let mut walk = Walk {
                owner: i,
                members: Vec::with_capacity(layout.fields.len()),
                budget: limits.max_flattened_members,
                max: limits.max_flattened_members,
            };
            self.flatten(i, 0, &[], &mut walk)?;
            let members = walk.members;

            let mut flags = Flags::default();
            let total = members.iter().map(|m| m.len).fold(0, usize::saturating_add);
            if total != ty.len {
                warn!(
                    "struct '{}' is misaligned: members add up to {} bytes, declared length is {}",
                    ty.name, total, ty.len
                );
                flags.insert(Flags::MISALIGNED);
            }

            compiled.push(CompiledStruct {
                type_index: layout.type_index,
                type_hash: ty.hash,
                len: ty.len,
                flags,
                link: None,
                members,
            });
        }

        debug!(
            "compiled {} structs, {} types, {} names",
            compiled.len(),
            self.types.len(),
            self.names.len()
        );
        self.structs = compiled;
        Ok(())
    }

    /// Appends the leaf members of struct `struct_index` placed at `base` to `walk`.
    fn flatten(&self, struct_index: usize, base: usize, chain: &[KeyStep], walk: &mut Walk) -> Result<usize, BlendParseError> {
        let layout = &self.layouts[struct_index];
        if chain.len() > MAX_EMBED_DEPTH {
            let name = self.types[layout.type_index].name.clone();
            return Err(BlendParseError::RecursiveStruct(name));
        }

        let mut offset = base;
        for field in &layout.fields {
            let ty = &self.types[field.type_index];
            let name = &self.names[field.name_index];
            let decl = &name.decl;
            let invalid_size = || BlendParseError::InvalidArraySize(name.raw.clone());

            match ty.struct_index {
                Some(nested) if !decl.is_pointer() => {
                    for element in 0..decl.array_len {
                        self.spend(walk)?;
                        let mut sub = chain.to_vec();
                        sub.push(KeyStep {
                            type_hash: ty.hash,
                            name_hash: decl.base_hash,
                            element,
                        });
                        self.flatten(nested, offset, &sub, walk)?;
                        offset = offset.checked_add(ty.len).ok_or_else(invalid_size)?;
                    }
                }
                _ => {
                    self.spend(walk)?;
                    let element_len = if decl.is_pointer() {
                        self.pointer_size.bytes_num()
                    } else {
                        ty.len
                    };
                    let len = element_len.checked_mul(decl.array_len).ok_or_else(invalid_size)?;

                    walk.members.push(Member {
                        type_index: field.type_index,
                        name_index: field.name_index,
                        type_hash: ty.hash,
                        name_hash: decl.base_hash,
                        offset,
                        len,
                        array_len: decl.array_len,
                        pointer_count: decl.pointer_count,
                        is_fn_pointer: decl.is_fn_pointer,
                        array_index: chain.last().map_or(0, |s| s.element),
                        depth: chain.len(),
                        owner: walk.owner,
                        flags: Flags::default(),
                        link: None,
                        chain: chain.to_vec(),
                        primitive: ty.primitive,
                    });
                    offset = offset.checked_add(len).ok_or_else(invalid_size)?;
                }
            }
        }
        Ok(offset - base)
    }

    /// Counts one member or embedded element against the flattening budget.
    fn spend(&self, walk: &mut Walk) -> Result<(), BlendParseError> {
        match walk.budget.checked_sub(1) {
            Some(left) => {
                walk.budget = left;
                Ok(())
            }
            None => {
                let layout = &self.layouts[walk.owner];
                Err(BlendParseError::TooManyFlattenedMembers {
                    name: self.types[layout.type_index].name.clone(),
                    max: walk.max,
                })
            }
        }
    }

    pub fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    pub fn names(&self) -> &[NameEntry] {
        &self.names
    }

    pub fn types(&self) -> &[TypeEntry] {
        &self.types
    }

    /// The struct layouts as stored, members not flattened.
    pub fn layouts(&self) -> &[DnaStruct] {
        &self.layouts
    }

    pub fn structs(&self) -> &[CompiledStruct] {
        &self.structs
    }

    pub(crate) fn structs_mut(&mut self) -> &mut [CompiledStruct] {
        &mut self.structs
    }

    pub fn find_type_id(&self, name: &str) -> Option<usize> {
        self.type_by_hash(hash_str(name))
    }

    pub fn type_by_hash(&self, hash: u64) -> Option<usize> {
        self.type_lookup.get(&IntKey(hash)).copied()
    }

    /// Index of the struct whose type is named `name`.
    pub fn find_struct(&self, name: &str) -> Option<usize> {
        self.struct_by_hash(hash_str(name))
    }

    pub fn struct_by_hash(&self, hash: u64) -> Option<usize> {
        self.type_by_hash(hash).and_then(|t| self.types[t].struct_index)
    }

    pub fn struct_name(&self, struct_index: usize) -> &str {
        &self.types[self.structs[struct_index].type_index].name
    }

    /// Indices of every name whose base name is `base`, e.g. `*next` and `next[2]` for `next`.
    pub fn names_with_base(&self, base: &str) -> &[usize] {
        self.base_names
            .get(&IntKey(hash_str(base)))
            .map_or(&[], |v| &v[..])
    }

    /// A member of a top-level struct (not one inside an embedded struct) by base name.
    pub fn member(&self, struct_index: usize, base: &str) -> Option<&Member> {
        let hash = hash_str(base);
        self.structs
            .get(struct_index)?
            .members
            .iter()
            .find(|m| m.depth == 0 && m.name_hash == hash)
    }

    /// Forgets every link into the other table.
    pub fn clear_links(&mut self) {
        for s in &mut self.structs {
            s.link = None;
            for m in &mut s.members {
                m.link = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::DnaBuilder;

    fn table(builder: &DnaBuilder, pointer_size: PointerSize) -> SchemaTable {
        let bytes = builder.to_bytes(Endianness::native(), pointer_size).unwrap();
        SchemaTable::read(&bytes, false, pointer_size, &Limits::default()).unwrap()
    }

    #[test]
    fn flattens_embedded_structs() {
        let mut b = DnaBuilder::with_primitives();
        b.add_struct("Point", &[("float", "x"), ("float", "y")]);
        b.add_struct("Line", &[("short", "flag"), ("Point", "ends[2]"), ("Point", "*next")]);

        let t = table(&b, PointerSize::Bits64);
        let line = &t.structs()[t.find_struct("Line").unwrap()];
        assert_eq!(line.len, 2 + 16 + 8);
        assert!(!line.flags.contains(Flags::MISALIGNED));

        let offsets: Vec<_> = line.members.iter().map(|m| (m.offset, m.len, m.depth)).collect();
        assert_eq!(offsets, vec![(0, 2, 0), (2, 4, 1), (6, 4, 1), (10, 4, 1), (14, 4, 1), (18, 8, 0)]);

        let second_y = &line.members[4];
        assert_eq!(second_y.name_hash, hash_str("y"));
        assert_eq!(second_y.array_index, 1);
        assert_eq!(
            second_y.chain,
            vec![KeyStep {
                type_hash: hash_str("Point"),
                name_hash: hash_str("ends"),
                element: 1
            }]
        );
        assert!(line.members[5].is_pointer());
        assert_eq!(line.members[5].primitive, None);
    }

    #[test]
    fn pointer_width_changes_layout() {
        let mut b = DnaBuilder::with_primitives();
        b.add_struct("Node", &[("Node", "*next"), ("int", "value"), ("void", "(*free)()")]);

        let t = table(&b, PointerSize::Bits32);
        let node = &t.structs()[t.find_struct("Node").unwrap()];
        assert_eq!(node.len, 12);
        assert_eq!(node.members[1].offset, 4);
        assert!(node.members[2].is_fn_pointer);
    }

    #[test]
    fn misaligned_struct_is_flagged() {
        let mut b = DnaBuilder::with_primitives();
        b.add_struct("Point", &[("float", "x"), ("float", "y")]);
        let bytes = b.to_bytes(Endianness::native(), PointerSize::Bits64).unwrap();
        let mut dna = finish(DnaParseContext::new(Endianness::native(), Limits::default()).dna(&bytes)).unwrap();
        let point = dna.types.iter_mut().find(|t| t.name == "Point").unwrap();
        point.bytes_len = 12;

        let t = SchemaTable::from_dna(dna, PointerSize::Bits64, &Limits::default()).unwrap();
        let s = &t.structs()[0];
        assert!(s.flags.contains(Flags::MISALIGNED));
        assert_eq!(s.members.len(), 2);
    }

    #[test]
    fn lookups() {
        let mut b = DnaBuilder::with_primitives();
        b.add_struct("Link", &[("Link", "*next"), ("Link", "*prev")]);
        b.add_struct("Other", &[("int", "next[2]")]);
        let t = table(&b, PointerSize::Bits64);

        assert_eq!(t.find_type_id("float"), Some(7));
        assert_eq!(t.find_type_id("Nope"), None);
        assert_eq!(t.find_struct("int"), None);
        assert_eq!(t.find_struct("Other"), Some(1));
        assert_eq!(t.struct_name(0), "Link");

        let with_next: Vec<_> = t.names_with_base("next").iter().map(|&i| t.names()[i].raw.as_str()).collect();
        assert_eq!(with_next, vec!["*next", "next[2]"]);
        assert!(t.names_with_base("missing").is_empty());

        assert_eq!(t.member(0, "prev").unwrap().offset, 8);
        assert!(t.member(0, "value").is_none());
    }

    #[test]
    fn swapped_blob() {
        let mut b = DnaBuilder::with_primitives();
        b.add_struct("Point", &[("float", "x"), ("float", "y")]);
        let bytes = b.to_bytes(Endianness::native().swapped(), PointerSize::Bits64).unwrap();
        let t = SchemaTable::read(&bytes, true, PointerSize::Bits64, &Limits::default()).unwrap();
        assert_eq!(t.structs()[0].len, 8);
        assert!(SchemaTable::read(&bytes, false, PointerSize::Bits64, &Limits::default()).is_err());
    }

    #[test]
    fn self_embedding_is_rejected() {
        let mut b = DnaBuilder::with_primitives();
        b.add_struct("Loop", &[("int", "a"), ("Loop", "inner")]);
        let bytes = b.to_bytes(Endianness::native(), PointerSize::Bits64).unwrap();
        let res = SchemaTable::read(&bytes, false, PointerSize::Bits64, &Limits::default());
        assert!(matches!(res, Err(BlendParseError::RecursiveStruct(_))));
    }

    #[test]
    fn large_embedded_arrays_are_refused() {
        let mut b = DnaBuilder::with_primitives();
        b.add_struct("Point", &[("float", "x"), ("float", "y")]);
        b.add_struct("Cloud", &[("Point", "pts[2]")]);
        let bytes = b.to_bytes(Endianness::native(), PointerSize::Bits64).unwrap();
        let mut dna = finish(DnaParseContext::new(Endianness::native(), Limits::default()).dna(&bytes)).unwrap();
        let pts = dna.names.iter_mut().find(|n| n.as_str() == "pts[2]").unwrap();
        *pts = "pts[1000000]".to_owned();

        let res = SchemaTable::from_dna(dna, PointerSize::Bits64, &Limits::default());
        assert!(matches!(
            res,
            Err(BlendParseError::TooManyFlattenedMembers { ref name, max: 65536 }) if name == "Cloud"
        ));

        let mut b = DnaBuilder::with_primitives();
        b.add_struct("Empty", &[]);
        b.add_struct("Bag", &[("Empty", "items[1000000000]")]);
        let bytes = b.to_bytes(Endianness::native(), PointerSize::Bits64).unwrap();
        let limits = Limits {
            max_flattened_members: 100,
            ..Limits::default()
        };
        let res = SchemaTable::read(&bytes, false, PointerSize::Bits64, &limits);
        assert!(matches!(res, Err(BlendParseError::TooManyFlattenedMembers { max: 100, .. })));
    }

    #[test]
    fn flags_debug() {
        let mut f = Flags::default();
        f.insert(Flags::MISSING);
        f.insert(Flags::NEEDS_CAST);
        assert_eq!(format!("{:?}", f), "Flags(MISSING | NEEDS_CAST)");
        f.remove(Flags::MISSING);
        assert!(!f.contains(Flags::MISSING));
    }
}
