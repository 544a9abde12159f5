pub mod blend;
pub mod dna;
pub mod field;
pub mod primitive;

use nom::{
    error::{ErrorKind, ParseError},
    IResult,
};
use thiserror::Error;

pub(crate) type Result<'a, T> = IResult<&'a [u8], T, BlendParseError>;

/// Size of a pointer on the machine that wrote a file, or on the machine reading it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PointerSize {
    Bits32,
    Bits64,
}

impl PointerSize {
    /// Returns the pointer size in bytes.
    pub fn bytes_num(self) -> usize {
        match self {
            PointerSize::Bits32 => 4,
            PointerSize::Bits64 => 8,
        }
    }

    /// Pointer size of the running process.
    pub fn native() -> Self {
        if std::mem::size_of::<usize>() == 8 {
            PointerSize::Bits64
        } else {
            PointerSize::Bits32
        }
    }

    pub fn other(self) -> Self {
        match self {
            PointerSize::Bits32 => PointerSize::Bits64,
            PointerSize::Bits64 => PointerSize::Bits32,
        }
    }
}

/// Byte order of the machine that wrote a file, or of the machine reading it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Detects the byte order of the running process by building a known integer from bytes.
    pub fn native() -> Self {
        if u16::from_ne_bytes([1, 0]) == 1 {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    pub fn swapped(self) -> Self {
        match self {
            Endianness::Little => Endianness::Big,
            Endianness::Big => Endianness::Little,
        }
    }
}

/// Errors raised while decoding the header, chunk headers or the SDNA blob.
/// Most errors are simply `NomError`, the rest carry the limit or index that was violated.
#[derive(Debug, Error)]
pub enum BlendParseError {
    #[error("parser error ({kind:?})")]
    NomError {
        kind: ErrorKind,
        other: Option<Box<BlendParseError>>,
    },
    /// Returned when the input ends before a complete record was decoded.
    #[error("not enough data")]
    NotEnoughData,
    /// The first bytes don't match the expected magic id.
    #[error("unrecognized header id")]
    InvalidHeader,
    #[error("{table} table has {count} entries, the limit is {max}")]
    TableTooLarge {
        table: &'static str,
        count: usize,
        max: usize,
    },
    #[error("struct {index} has {count} members, the limit is {max}")]
    TooManyMembers { index: usize, count: usize, max: usize },
    #[error("identifier '{0}' exceeds the maximum identifier length")]
    IdentifierTooLong(String),
    #[error("invalid array size in declarator '{0}'")]
    InvalidArraySize(String),
    #[error("{table} index {index} is out of range")]
    InvalidIndex { table: &'static str, index: usize },
    /// A schema must describe at least one struct.
    #[error("schema contains no structs")]
    NoStructs,
    #[error("struct '{0}' embeds itself")]
    RecursiveStruct(String),
    #[error("struct '{name}' flattens to more than {max} members")]
    TooManyFlattenedMembers { name: String, max: usize },
}

impl ParseError<&[u8]> for BlendParseError {
    fn from_error_kind(_input: &[u8], kind: ErrorKind) -> Self {
        BlendParseError::NomError { kind, other: None }
    }

    fn append(_input: &[u8], kind: ErrorKind, other: Self) -> Self {
        BlendParseError::NomError {
            kind,
            other: Some(Box::new(other)),
        }
    }
}

impl ParseError<&str> for BlendParseError {
    fn from_error_kind(_input: &str, kind: ErrorKind) -> Self {
        BlendParseError::NomError { kind, other: None }
    }

    fn append(_input: &str, kind: ErrorKind, other: Self) -> Self {
        BlendParseError::NomError {
            kind,
            other: Some(Box::new(other)),
        }
    }
}

/// Flattens a nom result into the error that caused it.
pub(crate) fn finish<I, T>(res: IResult<I, T, BlendParseError>) -> std::result::Result<T, BlendParseError> {
    match res {
        Ok((_, v)) => Ok(v),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(e),
        Err(nom::Err::Incomplete(..)) => Err(BlendParseError::NotEnoughData),
    }
}
