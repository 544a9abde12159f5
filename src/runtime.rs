use crate::config::ReaderOptions;
use crate::error::Result;
use crate::file::{BlendFile, BlockSink};
use crate::parsers::{
    blend::ChunkHeader,
    field::FieldInfo,
    primitive::{BlendPrimitive, Primitive},
    Endianness,
};
use crate::schema::SchemaTable;
use crate::stream::{open_path, Stream};
use linked_hash_map::LinkedHashMap;
use std::{fmt, mem::size_of, num::NonZeroU64, path::Path};

/// Pointers are valid if they hold the address of a relinked block. Pointers the relinker
/// couldn't resolve were already nulled, so `Invalid` only shows up for pointers into the middle
/// of a block.
pub enum PointerInfo {
    Block(usize),
    Null,
    Invalid,
}

/// Represents a field inside a struct. The data `FieldTemplate` keeps is used to interpret the relinked bytes.
#[derive(Debug, Clone)]
pub struct FieldTemplate {
    pub info: FieldInfo,
    /// The index of this field's type in the memory schema.
    pub type_index: usize,
    pub type_name: String,
    /// The index of the data in the `Instance` owned by this field.
    pub data_start: usize,
    /// The length in bytes of the data in the `Instance` owned by this field.
    pub data_len: usize,
    pub primitive: Option<Primitive>,
    /// Set when the field's type is a struct of the memory schema.
    pub struct_index: Option<usize>,
}

/// A view of one struct inside a relinked block. The block can be a camera, a mesh, a material, or anything else
/// the schema describes. Fields are read lazily from the block's bytes when accessed.
#[derive(Clone)]
pub struct Instance<'a> {
    file: &'a BlendFile,
    pub type_name: String,
    pub struct_index: usize,
    /// The relinked block this `Instance` lives in, if it is a whole block element.
    pub block: Option<usize>,
    data: &'a [u8],
    /// The fields of this `Instance`, in declaration order.
    pub fields: LinkedHashMap<String, FieldTemplate>,
}

impl<'a> fmt::Debug for Instance<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type_name", &self.type_name)
            .field("block", &self.block)
            .field("fields", &self.fields)
            .finish()
    }
}

fn generate_fields(schema: &SchemaTable, struct_index: usize) -> LinkedHashMap<String, FieldTemplate> {
    let layout = &schema.layouts()[struct_index];
    let pointer_size = schema.pointer_size().bytes_num();
    let mut fields = LinkedHashMap::new();
    let mut data_start = 0;

    for field in &layout.fields {
        let ty = &schema.types()[field.type_index];
        let decl = &schema.names()[field.name_index].decl;

        let data_len = if decl.is_pointer() {
            pointer_size * decl.array_len
        } else {
            ty.len * decl.array_len
        };

        fields.insert(
            decl.base_name.to_string(),
            FieldTemplate {
                info: decl.info(),
                type_index: field.type_index,
                type_name: ty.name.clone(),
                data_start,
                data_len,
                primitive: ty.primitive,
                struct_index: ty.struct_index,
            },
        );
        data_start += data_len;
    }

    fields
}

fn read_address(data: &[u8]) -> u64 {
    let mut bytes = [0; size_of::<usize>()];
    bytes.copy_from_slice(&data[..size_of::<usize>()]);
    usize::from_ne_bytes(bytes) as u64
}

/// `char` fields may be read as signed or unsigned bytes, `long` is 32 bits wide.
fn type_matches(type_name: &str, blender_name: &str) -> bool {
    type_name == blender_name
        || matches!((type_name, blender_name), ("uchar", "char") | ("long", "int"))
}

impl<'a> Instance<'a> {
    fn new(file: &'a BlendFile, struct_index: usize, block: Option<usize>, data: &'a [u8]) -> Self {
        let schema = file.memory_schema();
        Instance {
            file,
            type_name: schema.struct_name(struct_index).to_owned(),
            struct_index,
            block,
            data,
            fields: generate_fields(schema, struct_index),
        }
    }

    /// One instance per element of a relinked block.
    fn block_instances(file: &'a BlendFile, index: usize, struct_index: usize) -> Vec<Instance<'a>> {
        let chunk = &file.chunks()[index];
        let len = file.memory_schema().structs()[struct_index].len;
        if len == 0 {
            return Vec::new();
        }
        chunk
            .data()
            .chunks_exact(len)
            .take(chunk.header().count as usize)
            .map(|data| Instance::new(file, struct_index, Some(index), data))
            .collect()
    }

    /// The code of the block this `Instance` was read from. Possible codes include "OB" for objects, "ME" for
    /// meshes, "CA" for cameras, etc.
    /// # Panics
    /// Panics if the instance is not a block element.
    pub fn code(&self) -> [u8; 4] {
        let block = self.block.expect("instance doesn't have a code");
        self.file.chunks()[block].header().code_bytes()
    }

    /// The address of this `Instance`'s data. Relinked pointers to it hold this value.
    pub fn memory_address(&self) -> NonZeroU64 {
        NonZeroU64::new(self.data.as_ptr() as u64).expect("instance data has an address")
    }

    /// The raw bytes of this `Instance` in the memory layout.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// `expect_field` simplifies accessing a field since most of the time panicking is the correct response for an
    /// invalid field name.
    fn expect_field(&self, name: &str) -> &FieldTemplate {
        match self.fields.get(name) {
            Some(field) => field,
            None => panic!("invalid field '{}' in {}", name, self.type_name),
        }
    }

    fn field_data(&self, field: &FieldTemplate) -> &'a [u8] {
        &self.data[field.data_start..field.data_start + field.data_len]
    }

    fn pointer_at(&self, data: &[u8]) -> PointerInfo {
        match read_address(data) {
            0 => PointerInfo::Null,
            address => match self.file.chunk_at_address(address) {
                Some(block) => PointerInfo::Block(block),
                None => PointerInfo::Invalid,
            },
        }
    }

    /// Used internally to get the block behind a pointer, use `Instance::get` or `Instance::get_vec` instead.
    /// # Panics
    /// Panics if field.info is not FieldInfo::Pointer
    pub fn get_ptr(&self, field: &FieldTemplate) -> PointerInfo {
        match field.info {
            FieldInfo::Pointer { .. } => {}
            _ => panic!("get_ptr can only be called for pointer fields. ({:?})", field),
        }
        self.pointer_at(self.field_data(field))
    }

    /// The struct a block behind a pointer field is read as: the struct it was relinked to, or else the type the
    /// field points to.
    fn pointee_struct(&self, field: &FieldTemplate, block: usize) -> Option<usize> {
        self.file.chunks()[block].struct_index().or(field.struct_index)
    }

    /// The blocks referred to by a double pointer, in order. Null entries are skipped.
    fn pointer_array_blocks(&self, field: &FieldTemplate) -> Vec<usize> {
        let address = read_address(self.field_data(field));
        let array = match self
            .file
            .pointer_array_at_address(address)
            .and_then(|i| self.file.chunks()[i].pointer_array())
        {
            Some(array) => array,
            None => return Vec::new(),
        };

        array
            .chunks_exact(size_of::<usize>())
            .filter_map(|p| match self.pointer_at(p) {
                PointerInfo::Block(block) => Some(block),
                PointerInfo::Null | PointerInfo::Invalid => None,
            })
            .collect()
    }

    /// Tests whether a field is valid and can be accessed using the `get` methods without panicking.
    pub fn is_valid<T: AsRef<str>>(&self, name: T) -> bool {
        let field = match self.fields.get(name.as_ref()) {
            Some(field) => field,
            None => return false,
        };

        match field.info {
            FieldInfo::Pointer { indirection_count: 1 } => match self.get_ptr(field) {
                PointerInfo::Block(block) => self.pointee_struct(field, block).is_some(),
                PointerInfo::Null | PointerInfo::Invalid => false,
            },
            FieldInfo::Pointer { .. } => {
                let address = read_address(self.field_data(field));
                self.file.pointer_array_at_address(address).is_some()
            }
            FieldInfo::FnPointer => false,
            FieldInfo::PointerArray { .. } => true,
            FieldInfo::Value if field.type_name == "ListBase" => {
                let list = self.get(name);
                list.is_valid("first") && list.is_valid("last")
            }
            FieldInfo::Value | FieldInfo::ValueArray { .. } => true,
        }
    }

    /// `get_value` abstracts accessing primitives and is used by all `get_[]` functions (`get_i8`, `get_f32`, etc).
    fn get_value<T: AsRef<str>, U: BlendPrimitive>(&self, name: T) -> U {
        let name = name.as_ref();
        let field = self.expect_field(name);
        let blender_type_name = U::blender_name();

        match field.info {
            FieldInfo::Value if field.primitive.is_some() && type_matches(&field.type_name, blender_type_name) => {
                assert_eq!(
                    field.data_len,
                    size_of::<U>(),
                    "field '{}' doesn't have enough data for a {}. ({:?})",
                    name,
                    blender_type_name,
                    field,
                );
                U::parse(self.field_data(field), Endianness::native())
            }
            _ => panic!("field '{}' is not {}. ({:?})", name, blender_type_name, field),
        }
    }

    pub fn get_u8<T: AsRef<str>>(&self, name: T) -> u8 {
        self.get_value(name)
    }

    pub fn get_i8<T: AsRef<str>>(&self, name: T) -> i8 {
        self.get_value(name)
    }

    pub fn get_char<T: AsRef<str>>(&self, name: T) -> char {
        self.get_u8(name) as char
    }

    pub fn get_u16<T: AsRef<str>>(&self, name: T) -> u16 {
        self.get_value(name)
    }

    pub fn get_i16<T: AsRef<str>>(&self, name: T) -> i16 {
        self.get_value(name)
    }

    pub fn get_i32<T: AsRef<str>>(&self, name: T) -> i32 {
        self.get_value(name)
    }

    pub fn get_f32<T: AsRef<str>>(&self, name: T) -> f32 {
        self.get_value(name)
    }

    pub fn get_f64<T: AsRef<str>>(&self, name: T) -> f64 {
        self.get_value(name)
    }

    pub fn get_u64<T: AsRef<str>>(&self, name: T) -> u64 {
        self.get_value(name)
    }

    pub fn get_i64<T: AsRef<str>>(&self, name: T) -> i64 {
        self.get_value(name)
    }

    /// `get_value_vec` abstracts accessing primitive arrays and is used by all `get_[]_vec` functions. Both fixed
    /// arrays and pointers to blocks of primitives can be read.
    fn get_value_vec<T: AsRef<str>, U: BlendPrimitive>(&self, name: T) -> Vec<U> {
        let name = name.as_ref();
        let field = self.expect_field(name);
        let blender_type_name = U::blender_name();

        if !type_matches(&field.type_name, blender_type_name) {
            panic!("field '{}' is not a {} array. ({:?})", name, blender_type_name, field);
        }

        let data = match field.info {
            FieldInfo::ValueArray { len, .. } if field.primitive.is_some() => {
                assert_eq!(
                    field.data_len / len,
                    size_of::<U>(),
                    "field '{}' doesn't have enough data for a {} array. ({:?})",
                    name,
                    blender_type_name,
                    field,
                );
                self.field_data(field)
            }
            FieldInfo::Pointer { indirection_count: 1 } => match self.get_ptr(field) {
                PointerInfo::Block(block) => self.file.chunks()[block].data(),
                PointerInfo::Null | PointerInfo::Invalid => {
                    panic!("field '{}' is a null or invalid pointer. ({:?})", name, field)
                }
            },
            _ => panic!("field '{}' is not a {} array. ({:?})", name, blender_type_name, field),
        };

        data.chunks_exact(size_of::<U>())
            .map(|s| U::parse(s, Endianness::native()))
            .collect()
    }

    pub fn get_u8_vec<T: AsRef<str>>(&self, name: T) -> Vec<u8> {
        self.get_value_vec(name)
    }

    pub fn get_i8_vec<T: AsRef<str>>(&self, name: T) -> Vec<i8> {
        self.get_value_vec(name)
    }

    pub fn get_i32_vec<T: AsRef<str>>(&self, name: T) -> Vec<i32> {
        self.get_value_vec(name)
    }

    pub fn get_i16_vec<T: AsRef<str>>(&self, name: T) -> Vec<i16> {
        self.get_value_vec(name)
    }

    pub fn get_f32_vec<T: AsRef<str>>(&self, name: T) -> Vec<f32> {
        self.get_value_vec(name)
    }

    pub fn get_f64_vec<T: AsRef<str>>(&self, name: T) -> Vec<f64> {
        self.get_value_vec(name)
    }

    pub fn get_u64_vec<T: AsRef<str>>(&self, name: T) -> Vec<u64> {
        self.get_value_vec(name)
    }

    pub fn get_i64_vec<T: AsRef<str>>(&self, name: T) -> Vec<i64> {
        self.get_value_vec(name)
    }

    /// Reads a `char` array up to its first zero byte.
    pub fn get_string<T: AsRef<str>>(&self, name: T) -> String {
        let name = name.as_ref();
        let field = self.expect_field(name);

        match field.info {
            FieldInfo::Value | FieldInfo::ValueArray { .. } if type_matches(&field.type_name, "char") => self
                .field_data(field)
                .iter()
                .take_while(|c| **c != 0)
                .map(|c| *c as char)
                .collect(),
            _ => panic!("field '{}' is not a string. ({:?})", name, field),
        }
    }

    /// Accesses an embedded struct or the single struct behind a pointer with the same call.
    /// # Panics
    /// Panics if the field is a primitive, a null pointer, or points to a block holding a list of structs.
    pub fn get<T: AsRef<str>>(&self, name: T) -> Instance<'a> {
        let name = name.as_ref();
        let field = self.expect_field(name);

        match field.info {
            FieldInfo::Value => {
                let struct_index = field
                    .struct_index
                    .unwrap_or_else(|| panic!("cannot access field '{}' as a struct. ({:?})", name, field));
                Instance::new(self.file, struct_index, None, self.field_data(field))
            }
            FieldInfo::Pointer { indirection_count: 1 } => {
                let block = match self.get_ptr(field) {
                    PointerInfo::Block(block) => block,
                    PointerInfo::Null | PointerInfo::Invalid => panic!(
                        "field '{}' is null or doesn't point to a valid block. ({:?})",
                        name, field
                    ),
                };
                let struct_index = self
                    .pointee_struct(field, block)
                    .unwrap_or_else(|| panic!("no type information for the block behind '{}'. ({:?})", name, field));

                let mut instances = Instance::block_instances(self.file, block, struct_index);
                assert!(
                    instances.len() == 1,
                    "field '{}' is a list of structs, use get_vec to access. ({:?})",
                    name,
                    field
                );
                instances.remove(0)
            }
            _ => panic!("field '{}' is not a valid struct ({:?})", name, field),
        }
    }

    /// Accesses every struct a field leads to: the elements of an embedded struct array, every element of the
    /// block behind a pointer, or the blocks behind a double pointer or an array of pointers.
    pub fn get_vec<T: AsRef<str>>(&self, name: T) -> impl Iterator<Item = Instance<'a>> {
        let name = name.as_ref();
        let field = self.expect_field(name);

        let instances: Vec<Instance<'a>> = match &field.info {
            FieldInfo::ValueArray { len, .. } => {
                let struct_index = field.struct_index.unwrap_or_else(|| {
                    panic!(
                        "field '{}' is a primitive array, call the appropriate method. ({:?})",
                        name, field
                    )
                });
                let element_len = field.data_len / len;
                self.field_data(field)
                    .chunks_exact(element_len.max(1))
                    .map(|data| Instance::new(self.file, struct_index, None, data))
                    .collect()
            }
            FieldInfo::Pointer { indirection_count: 1 } => match self.get_ptr(field) {
                PointerInfo::Block(block) => match self.pointee_struct(field, block) {
                    Some(struct_index) => Instance::block_instances(self.file, block, struct_index),
                    None => Vec::new(),
                },
                PointerInfo::Null | PointerInfo::Invalid => panic!(
                    "field '{}' is null or doesn't point to a valid block. ({:?})",
                    name, field
                ),
            },
            FieldInfo::Pointer { .. } => self
                .pointer_array_blocks(field)
                .into_iter()
                .filter_map(|block| {
                    let struct_index = self.file.chunks()[block].struct_index()?;
                    Instance::block_instances(self.file, block, struct_index).into_iter().next()
                })
                .collect(),
            FieldInfo::PointerArray { indirection_count: 1, .. } => self
                .field_data(field)
                .chunks_exact(size_of::<usize>())
                .filter_map(|p| match self.pointer_at(p) {
                    PointerInfo::Block(block) => {
                        let struct_index = self.pointee_struct(field, block)?;
                        Instance::block_instances(self.file, block, struct_index).into_iter().next()
                    }
                    PointerInfo::Null | PointerInfo::Invalid => None,
                })
                .collect(),
            _ => panic!("field '{}' cannot be read as a list of structs ({:?})", name, field),
        };

        instances.into_iter()
    }

    /// Follows the element after this one in a `first`/`next` linked list. Structs whose `next` pointer lives in
    /// their first embedded struct (like an `ID`) are handled too.
    fn next_in_list(&self) -> Option<Instance<'a>> {
        let mut cur = self.clone();
        loop {
            if cur.fields.contains_key("next") {
                return if cur.is_valid("next") { Some(cur.get("next")) } else { None };
            }
            let (first_name, first) = cur.fields.iter().next()?;
            match (&first.info, first.struct_index) {
                (FieldInfo::Value, Some(_)) => {
                    let first_name = first_name.clone();
                    cur = cur.get(first_name);
                }
                _ => return None,
            }
        }
    }

    /// Reads a `ListBase` field: every struct from `first`, following `next`, up to `last`.
    pub fn get_list<T: AsRef<str>>(&self, name: T) -> Vec<Instance<'a>> {
        let list = self.get(name);
        if !list.is_valid("first") {
            return Vec::new();
        }
        let last = if list.is_valid("last") {
            Some(list.get("last").memory_address())
        } else {
            None
        };

        let mut cur = list.get("first");
        let mut instances = Vec::new();
        // a corrupted list may loop, no list is longer than the number of blocks
        for _ in 0..self.file.chunks().len() {
            let address = cur.memory_address();
            instances.push(cur.clone());
            if Some(address) == last {
                break;
            }
            match cur.next_in_list() {
                Some(next) => cur = next,
                None => break,
            }
        }
        instances
    }
}

fn fmt_instance(f: &mut fmt::Formatter, inst: &Instance, ident: usize) -> fmt::Result {
    let ident_str: String = " ".repeat(4 * ident);

    write!(f, "{}", inst.type_name)?;
    if let Some(block) = inst.block {
        let code = inst.file.chunks()[block].header().code_bytes();
        let code: String = code.iter().take_while(|&&c| c != 0).map(|&c| c as char).collect();
        write!(f, " (code:{}|@{:#x})", code, inst.memory_address().get())?;
    }
    writeln!(f, " {{")?;

    for (name, field) in inst.fields.iter().filter(|(n, _)| !n.starts_with("_pad")) {
        write!(f, "{}    {}: ", ident_str, name)?;
        match (&field.info, field.primitive) {
            (FieldInfo::Value, Some(p)) => writeln!(f, "{} = {};", field.type_name, p.decode_f64(inst.field_data(field)))?,
            (FieldInfo::Value, None) if field.struct_index.is_some() => {
                fmt_instance(f, &inst.get(name), ident + 1)?;
            }
            (FieldInfo::ValueArray { dimensions, .. }, Some(Primitive::Char)) => {
                writeln!(f, "{}{:?} = \"{}\";", field.type_name, dimensions, inst.get_string(name))?
            }
            (FieldInfo::ValueArray { dimensions, len }, Some(p)) => {
                let size = field.data_len / len;
                let values: Vec<f64> = inst
                    .field_data(field)
                    .chunks_exact(size.max(1))
                    .map(|v| p.decode_f64(v))
                    .collect();
                writeln!(f, "{}{:?} = {:?};", field.type_name, dimensions, values)?
            }
            (FieldInfo::Pointer { indirection_count: 1 }, _) => match inst.get_ptr(field) {
                PointerInfo::Block(block) => {
                    let address = inst.file.chunks()[block].address();
                    writeln!(f, "{}* = (@{:#x});", field.type_name, address)?
                }
                PointerInfo::Null | PointerInfo::Invalid => writeln!(f, "{}* = null;", field.type_name)?,
            },
            (FieldInfo::FnPointer, _) => writeln!(f, "fn() = null;")?,
            _ => writeln!(f, "{} = (...);", field.type_name)?,
        }
    }

    writeln!(f, "{}}}", ident_str)
}

impl fmt::Display for Instance<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_instance(f, self, 0)
    }
}

/// Blocks with a 2 character code, grouped by code in the order the codes first appear.
#[derive(Debug, Default)]
struct CodeBuckets(LinkedHashMap<[u8; 2], Vec<usize>>);

impl BlockSink for CodeBuckets {
    fn notify_data(&mut self, index: usize, _data: &[u8], header: &ChunkHeader) {
        if let Some(code) = header.short_code() {
            self.0.entry(code).or_insert_with(Vec::new).push(index);
        }
    }
}

/// A relinked file together with its root blocks.
pub struct Blend {
    pub file: BlendFile,
    buckets: LinkedHashMap<[u8; 2], Vec<usize>>,
}

impl Blend {
    /// Reads `stream` against the memory layout described by `reference_schema`.
    pub fn from_stream<S: Stream + ?Sized>(reference_schema: &[u8], options: ReaderOptions, stream: &mut S) -> Result<Blend> {
        let mut file = BlendFile::new(reference_schema, options)?;
        let mut buckets = CodeBuckets::default();
        file.parse(stream, &mut buckets)?;
        Ok(Blend {
            file,
            buckets: buckets.0,
        })
    }

    /// Reads a file from disk, decompressing it if it is gzip compressed.
    pub fn from_path<T: AsRef<Path>>(reference_schema: &[u8], path: T) -> Result<Blend> {
        let mut stream = open_path(path)?;
        Blend::from_stream(reference_schema, ReaderOptions::default(), &mut stream)
    }

    /// The block codes found in the file, in the order they first appeared.
    pub fn codes(&self) -> impl Iterator<Item = &[u8; 2]> {
        self.buckets.keys()
    }

    /// Root blocks have a code that tells us their type, "OB" for object, "ME" for mesh, "MA" for material, etc.
    /// You can use this method to filter for a single type of block.
    pub fn get_by_code(&self, search_code: [u8; 2]) -> Vec<Instance> {
        self.buckets
            .get(&search_code)
            .map(|blocks| blocks.iter().flat_map(|&b| self.instances_of(b)).collect())
            .unwrap_or_default()
    }

    /// Every root block, grouped by code.
    pub fn root_instances(&self) -> Vec<Instance> {
        self.buckets
            .values()
            .flatten()
            .flat_map(|&b| self.instances_of(b))
            .collect()
    }

    fn instances_of(&self, block: usize) -> Vec<Instance> {
        match self.file.chunks()[block].struct_index() {
            Some(struct_index) => Instance::block_instances(&self.file, block, struct_index),
            None => Vec::new(),
        }
    }
}
