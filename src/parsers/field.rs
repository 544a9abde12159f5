use super::{finish, BlendParseError};
use crate::containers::FixedString;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_until},
    combinator::{all_consuming, complete, rest},
    multi::{many0, many1},
    sequence::{delimited, tuple},
    IResult,
};

/// Number of array dimensions recorded per declarator. Further dimensions still count towards
/// `array_len`.
pub const MAX_ARRAY_DIMENSIONS: usize = 3;

/// How a member is laid out, derived from its declarator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldInfo {
    Value,
    ValueArray {
        len: usize,
        dimensions: Vec<usize>,
    },
    Pointer {
        indirection_count: usize,
    },
    PointerArray {
        indirection_count: usize,
        len: usize,
        dimensions: Vec<usize>,
    },
    FnPointer,
}

/// A member declarator such as `*next`, `co[3]`, `**mat` or `(*func)()` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declarator {
    /// The declarator without pointer, array or function decoration.
    pub base_name: FixedString,
    pub base_hash: u64,
    pub pointer_count: usize,
    pub is_fn_pointer: bool,
    /// Product of every array dimension, 1 for scalars.
    pub array_len: usize,
    pub dimensions: Vec<usize>,
}

impl Declarator {
    pub fn is_pointer(&self) -> bool {
        self.pointer_count > 0 || self.is_fn_pointer
    }

    pub fn info(&self) -> FieldInfo {
        if self.is_fn_pointer {
            FieldInfo::FnPointer
        } else if self.pointer_count > 0 && self.dimensions.is_empty() {
            FieldInfo::Pointer {
                indirection_count: self.pointer_count,
            }
        } else if self.pointer_count > 0 {
            FieldInfo::PointerArray {
                indirection_count: self.pointer_count,
                len: self.array_len,
                dimensions: self.dimensions.clone(),
            }
        } else if self.dimensions.is_empty() {
            FieldInfo::Value
        } else {
            FieldInfo::ValueArray {
                len: self.array_len,
                dimensions: self.dimensions.clone(),
            }
        }
    }
}

type Result<'a, T> = IResult<&'a str, T, BlendParseError>;

/// A declarator split up but not yet checked against the limits.
struct Parts<'a> {
    name: &'a str,
    pointer_count: usize,
    is_fn_pointer: bool,
    dimensions: Vec<usize>,
}

fn array_dimensions(input: &str) -> Result<Vec<usize>> {
    let (input, array_dimensions) = many0(complete(delimited(tag("["), take_until("]"), tag("]"))))(input)?;

    let mut dimensions = Vec::with_capacity(array_dimensions.len());
    for dimension_str in array_dimensions {
        dimensions.push(
            dimension_str
                .trim()
                .parse::<usize>()
                .map_err(|_| nom::Err::Failure(BlendParseError::InvalidArraySize(dimension_str.to_owned())))?,
        );
    }

    Ok((input, dimensions))
}

/// `(*name)(args)`, the argument list is ignored.
fn fn_pointer(input: &str) -> Result<Parts> {
    let (input, (asterisks, name, dimensions)) = delimited(
        tag("("),
        tuple((many1(tag("*")), take_till(|c: char| c == '[' || c == ')'), array_dimensions)),
        tag(")"),
    )(input)?;
    let (input, _) = rest(input)?;

    Ok((
        input,
        Parts {
            name,
            pointer_count: asterisks.len(),
            is_fn_pointer: true,
            dimensions,
        },
    ))
}

fn pointer(input: &str) -> Result<Parts> {
    let (input, asterisks) = many1(tag("*"))(input)?;
    let (input, name) = take_till(|c: char| c == '[')(input)?;
    let (input, dimensions) = array_dimensions(input)?;

    Ok((
        input,
        Parts {
            name,
            pointer_count: asterisks.len(),
            is_fn_pointer: false,
            dimensions,
        },
    ))
}

fn value(input: &str) -> Result<Parts> {
    let (input, name) = take_till(|c: char| c == '[')(input)?;
    let (input, dimensions) = array_dimensions(input)?;

    Ok((
        input,
        Parts {
            name,
            pointer_count: 0,
            is_fn_pointer: false,
            dimensions,
        },
    ))
}

/// Splits a raw declarator into its base name, indirection and array dimensions.
///
/// The whole declarator must be consumed, except for a function pointer's argument list. The
/// base name must fit in `max_identifier_len` bytes and the array length must fit in a `usize`.
pub fn parse_declarator(raw: &str, max_identifier_len: usize) -> std::result::Result<Declarator, BlendParseError> {
    let parts = finish(all_consuming(alt((fn_pointer, pointer, value)))(raw)).map_err(|e| match e {
        BlendParseError::InvalidArraySize(_) => BlendParseError::InvalidArraySize(raw.to_owned()),
        e => e,
    })?;

    let array_len = parts
        .dimensions
        .iter()
        .try_fold(1_usize, |len, &d| len.checked_mul(d))
        .ok_or_else(|| BlendParseError::InvalidArraySize(raw.to_owned()))?;
    let mut dimensions = parts.dimensions;
    dimensions.truncate(MAX_ARRAY_DIMENSIONS);

    let mut base_name = FixedString::with_capacity(max_identifier_len);
    if !base_name.push_str(parts.name.trim()) {
        return Err(BlendParseError::IdentifierTooLong(raw.to_owned()));
    }

    let base_hash = base_name.hash();
    Ok(Declarator {
        base_name,
        base_hash,
        pointer_count: parts.pointer_count,
        is_fn_pointer: parts.is_fn_pointer,
        array_len,
        dimensions,
    })
}
