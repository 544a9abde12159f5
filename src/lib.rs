//! # blend_link - Reading .blend files written by other builds
//!
//! ## Example
//!
//! ```ignore
//! use blend_link::Blend;
//!
//! /// Prints the name and position of every object
//! fn main() {
//!     // the SDNA of the structs this program was built with
//!     let schema = include_bytes!("dna.bin");
//!     let blend = Blend::from_path(schema, "file.blend").unwrap();
//!
//!     for obj in blend.get_by_code(*b"OB") {
//!         let loc = obj.get_f32_vec("loc");
//!         let name = obj.get("id").get_string("name");
//!
//!         println!("\"{}\" at {:?}", name, loc);
//!     }
//! }
//! ```
//!
//! ## The .blend file
//!
//! Blender saves a file by dumping its memory to disk: a list of blocks, each holding one or more C-like structs, and
//! at the end a schema (the "SDNA") describing every struct that appears in the file. Blocks refer to each other
//! through the addresses the structs had in the memory of the process that saved them.
//!
//! A file written by an older build, a 32-bit build or a big-endian machine does not match the layout the reading
//! program was compiled with. This crate reads the file's schema, matches every struct and member against the
//! reader's own schema (the "memory" schema) by name, and rebuilds every block in the memory layout:
//!
//! * members are matched by name, also when they moved; members that were removed are skipped, members that were
//!   added are left zeroed
//! * integers are narrowed or widened, other numbers converted through a double
//! * byte order and pointer width are converted
//! * pointers are rewritten to the addresses of the rebuilt blocks, or null when they refer to nothing in the file
//!
//! ### Learn more
//!
//! Documentation on the .blend file is a bit sparse, but the most common source is the [Mystery of the Blend](https://github.com/fschutt/mystery-of-the-blend-backup).
//!
//! ## This crate
//!
//! The low level pieces are public: `parsers` holds the nom parsers for the header, chunk headers and the SDNA,
//! `schema` compiles a SDNA into flattened layouts, `link` matches two schemas and `file::BlendFile` drives a
//! whole read, handing every rebuilt block to a `file::BlockSink`. `writer` goes the other way and produces schemas
//! and files, which is how reference schemas and test fixtures are made.
//!
//! `runtime` sits on top and lets you access the rebuilt blocks as if they were simple objects in memory. For
//! example: you can access a struct through both a non-primitive value field and a non-null pointer field using the
//! same method call (`Instance::get`).
//!
//! ### Diagnostics
//!
//! Everything is logged through `tracing`. Misaligned structs, unknown structs and discarded blocks show up at
//! `debug` or `warn` level. A `tracing::Dispatch` can be handed to the reader in `ReaderOptions` to collect the
//! logs of one read without touching the global subscriber.
//!
//! ### Warnings
//!
//! The reader itself never panics on bad input, every failure is a `BlendError` with a status code. The runtime is
//! panic happy though: you are meant to know what you are accessing ahead of time, so almost none of the `Instance`
//! accessors return a `Result::Err` or `Option::None` on bad inputs.

pub mod chunk;
pub mod config;
pub mod containers;
pub mod error;
pub mod file;
pub mod link;
pub mod parsers;
pub mod relink;
pub mod runtime;
pub mod schema;
pub mod stream;
pub mod writer;

pub use config::{Limits, ReaderOptions};
pub use error::{BlendError, Result, STATUS_OK};
pub use file::{BlendFile, BlockSink, MemoryChunk, NullSink, ParseState};
pub use runtime::{Blend, Instance};
pub use schema::SchemaTable;
