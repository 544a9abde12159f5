use crate::config::Limits;
use crate::parsers::{BlendParseError, Endianness, Result};
use nom::{
    bytes::complete::{tag, take, take_while},
    combinator::map,
    multi::count,
    number::complete::{be_u16, be_u32, le_u16, le_u32},
    sequence::terminated,
    Err,
};

/// The tables of a SDNA blob exactly as stored, before any layout is computed.
#[derive(Debug, Clone)]
pub struct Dna {
    pub names: Vec<String>,
    pub types: Vec<DnaType>,
    pub structs: Vec<DnaStruct>,
}

#[derive(Debug, Clone)]
pub struct DnaType {
    pub name: String,
    pub bytes_len: usize, //size in bytes of the type
}

#[derive(Debug, Clone, Copy)]
pub struct DnaField {
    pub type_index: usize, //index on Dna::types array
    pub name_index: usize, //index on Dna::names array
}

#[derive(Debug, Clone)]
pub struct DnaStruct {
    pub type_index: usize, //index on Dna::types array
    pub fields: Vec<DnaField>,
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Debug)]
pub struct DnaParseContext {
    endianness: Endianness,
    limits: Limits,
}

impl DnaParseContext {
    /// `endianness` is the byte order the blob was written in.
    pub fn new(endianness: Endianness, limits: Limits) -> Self {
        Self { endianness, limits }
    }

    fn u32<'a>(&self, input: &'a [u8]) -> Result<'a, u32> {
        match self.endianness {
            Endianness::Little => le_u32(input),
            Endianness::Big => be_u32(input),
        }
    }

    fn u16<'a>(&self, input: &'a [u8]) -> Result<'a, u16> {
        match self.endianness {
            Endianness::Little => le_u16(input),
            Endianness::Big => be_u16(input),
        }
    }

    fn table_len<'a>(&self, input: &'a [u8], table: &'static str) -> Result<'a, usize> {
        let (input, len) = self.u32(input)?;
        let len = len as usize;
        if len > self.limits.max_table_entries {
            return Err(Err::Failure(BlendParseError::TableTooLarge {
                table,
                count: len,
                max: self.limits.max_table_entries,
            }));
        }
        Ok((input, len))
    }

    /// Reads `len` NUL terminated strings followed by the padding up to the next 4 byte boundary.
    fn strings<'a>(&self, input: &'a [u8], len: usize) -> Result<'a, Vec<String>> {
        let (input, strings) = count(
            terminated(
                map(take_while(|b: u8| b != 0), |b: &[u8]| {
                    String::from_utf8_lossy(b).into_owned()
                }),
                tag("\0"),
            ),
            len,
        )(input)?;

        let all_len: usize = strings.iter().map(|s| s.len() + 1).sum();
        let (input, _) = take(padding(all_len))(input)?;

        Ok((input, strings))
    }

    fn names<'a>(&self, input: &'a [u8]) -> Result<'a, Vec<String>> {
        let (input, _) = tag("NAME")(input)?;
        let (input, names_len) = self.table_len(input, "name")?;
        self.strings(input, names_len)
    }

    fn types<'a>(&self, input: &'a [u8]) -> Result<'a, Vec<DnaType>> {
        let (input, _) = tag("TYPE")(input)?;
        let (input, types_len) = self.table_len(input, "type")?;
        let (input, type_names) = self.strings(input, types_len)?;

        let (input, _) = tag("TLEN")(input)?;
        let (input, type_lengths) = count(|i| self.u16(i), types_len)(input)?;

        // an odd number of lengths leaves one 2 byte slot of padding
        let (input, _) = take(padding(types_len * 2))(input)?;

        Ok((
            input,
            type_names
                .into_iter()
                .zip(type_lengths)
                .map(|(name, length)| DnaType {
                    name,
                    bytes_len: usize::from(length),
                })
                .collect(),
        ))
    }

    fn structs<'a>(&self, input: &'a [u8], types_len: usize, names_len: usize) -> Result<'a, Vec<DnaStruct>> {
        let (input, _) = tag("STRC")(input)?;
        let (mut input, structs_len) = self.table_len(input, "struct")?;

        let check = |table: &'static str, index: usize, len: usize| {
            if index < len {
                Ok(index)
            } else {
                Err(Err::Failure(BlendParseError::InvalidIndex { table, index }))
            }
        };

        let mut structs = Vec::with_capacity(structs_len);
        for struct_index in 0..structs_len {
            let (next, type_index) = self.u16(input)?;
            let (next, fields_num) = self.u16(next)?;
            let fields_num = usize::from(fields_num);
            if fields_num > self.limits.max_struct_members {
                return Err(Err::Failure(BlendParseError::TooManyMembers {
                    index: struct_index,
                    count: fields_num,
                    max: self.limits.max_struct_members,
                }));
            }

            let mut next_input = next;
            let mut fields = Vec::with_capacity(fields_num);
            for _ in 0..fields_num {
                let (next, field_type_index) = self.u16(next_input)?;
                let (next, field_name_index) = self.u16(next)?;
                next_input = next;

                fields.push(DnaField {
                    type_index: check("type", usize::from(field_type_index), types_len)?,
                    name_index: check("name", usize::from(field_name_index), names_len)?,
                });
            }
            input = next_input;

            structs.push(DnaStruct {
                type_index: check("type", usize::from(type_index), types_len)?,
                fields,
            });
        }

        Ok((input, structs))
    }

    pub fn dna<'a>(&self, input: &'a [u8]) -> Result<'a, Dna> {
        let (input, _) = tag("SDNA")(input)?;
        let (input, names) = self.names(input)?;
        let (input, types) = self.types(input)?;
        let (input, structs) = self.structs(input, types.len(), names.len())?;

        if structs.is_empty() {
            return Err(Err::Failure(BlendParseError::NoStructs));
        }

        Ok((
            input,
            Dna {
                names,
                types,
                structs,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::{finish, PointerSize};
    use crate::writer::DnaBuilder;

    fn sample() -> DnaBuilder {
        let mut builder = DnaBuilder::with_primitives();
        builder.add_struct("Point", &[("float", "x"), ("float", "y")]);
        builder.add_struct("Line", &[("Point", "a"), ("Point", "b"), ("short", "flag")]);
        builder
    }

    #[test]
    fn parses_both_byte_orders() {
        for &e in &[Endianness::Little, Endianness::Big] {
            let bytes = sample().to_bytes(e, PointerSize::Bits64).unwrap();
            let dna = finish(DnaParseContext::new(e, Limits::default()).dna(&bytes)).unwrap();

            assert!(dna.names.iter().any(|n| n == "flag"));
            let line = dna.structs.iter().find(|s| dna.types[s.type_index].name == "Line").unwrap();
            assert_eq!(line.fields.len(), 3);
            assert_eq!(dna.types[line.type_index].bytes_len, 18);
            assert_eq!(dna.names[line.fields[2].name_index], "flag");
        }
    }

    #[test]
    fn wrong_byte_order_fails() {
        let bytes = sample().to_bytes(Endianness::Big, PointerSize::Bits64).unwrap();
        let res = finish(DnaParseContext::new(Endianness::Little, Limits::default()).dna(&bytes));
        assert!(res.is_err());
    }

    #[test]
    fn table_limit_is_enforced() {
        let bytes = sample().to_bytes(Endianness::Little, PointerSize::Bits64).unwrap();
        let limits = Limits {
            max_table_entries: 3,
            ..Limits::default()
        };
        let res = finish(DnaParseContext::new(Endianness::Little, limits).dna(&bytes));
        assert!(matches!(res, Err(BlendParseError::TableTooLarge { table: "name", .. })));
    }

    #[test]
    fn member_limit_is_enforced() {
        let bytes = sample().to_bytes(Endianness::Little, PointerSize::Bits64).unwrap();
        let limits = Limits {
            max_struct_members: 2,
            ..Limits::default()
        };
        let res = finish(DnaParseContext::new(Endianness::Little, limits).dna(&bytes));
        assert!(matches!(res, Err(BlendParseError::TooManyMembers { count: 3, .. })));
    }

    #[test]
    fn empty_struct_table_fails() {
        let bytes = DnaBuilder::with_primitives().to_bytes(Endianness::Little, PointerSize::Bits64).unwrap();
        let res = finish(DnaParseContext::new(Endianness::Little, Limits::default()).dna(&bytes));
        assert!(matches!(res, Err(BlendParseError::NoStructs)));
    }

    #[test]
    fn truncated_blob_fails() {
        let bytes = sample().to_bytes(Endianness::Little, PointerSize::Bits64).unwrap();
        let res = finish(DnaParseContext::new(Endianness::Little, Limits::default()).dna(&bytes[..bytes.len() - 3]));
        assert!(res.is_err());
    }
}
