/// Upper bounds for schema tables. They cap how much a corrupted or hostile schema can allocate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of names, types or structs in a schema.
    pub max_table_entries: usize,
    pub max_struct_members: usize,
    /// Maximum length of a member's base name.
    pub max_identifier_len: usize,
    /// Maximum number of members a struct has once embedded structs are expanded. Every element
    /// of an embedded struct array counts too.
    pub max_flattened_members: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_table_entries: 5000,
            max_struct_members: 256,
            max_identifier_len: 64,
            max_flattened_members: 65536,
        }
    }
}

/// Settings of a `BlendFile` reader.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub limits: Limits,
    /// The id a file must start with.
    pub magic: Vec<u8>,
    /// A second accepted id, e.g. for stripped files. Ids are 6 or 7 bytes long.
    pub alternate_magic: Option<Vec<u8>>,
    /// Don't log unrecognized headers, useful when probing files of unknown format.
    pub quiet_header: bool,
    /// Where diagnostics go while a file is parsed. `None` uses the current default subscriber.
    pub dispatch: Option<tracing::Dispatch>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            limits: Limits::default(),
            magic: b"BLENDER".to_vec(),
            alternate_magic: None,
            quiet_header: false,
            dispatch: None,
        }
    }
}

impl ReaderOptions {
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_alternate_magic(mut self, magic: &[u8]) -> Self {
        self.alternate_magic = Some(magic.to_vec());
        self
    }

    pub fn quiet_header(mut self, quiet: bool) -> Self {
        self.quiet_header = quiet;
        self
    }

    pub fn with_dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }
}
