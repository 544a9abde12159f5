//! Matching a file schema against the reader's memory schema.
//!
//! Structs are matched by type name. Members are matched by their key chain (the embedded structs
//! leading to them) and base name, then by type:
//!
//! * same type, or pointers of the same type, indirection and kind: linked as is
//! * two integer types: linked, the value is sign or zero extended by its source type, or keeps its
//!   low bytes when narrowed
//! * two other numeric types: linked and flagged `NEEDS_CAST`
//!
//! Anything else is left unlinked. Memory members without a match are `MISSING` and stay zero,
//! file members without a match are `SKIP`ped.

use crate::containers::{HashTable, IntKey};
use crate::schema::{CompiledStruct, Flags, Member, SchemaTable};
use tracing::{debug, trace};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LinkSummary {
    pub structs: usize,
    pub members: usize,
    pub casts: usize,
    pub missing_structs: usize,
}

enum Match {
    Exact,
    Cast,
}

fn compatible(memory: &Member, file: &Member) -> Option<Match> {
    if memory.is_pointer() || file.is_pointer() {
        let same = memory.pointer_count == file.pointer_count
            && memory.is_fn_pointer == file.is_fn_pointer
            && memory.type_hash == file.type_hash;
        return if same { Some(Match::Exact) } else { None };
    }

    if memory.type_hash == file.type_hash {
        return Some(Match::Exact);
    }

    match (memory.primitive, file.primitive) {
        (Some(m), Some(f)) if m.is_integer() && f.is_integer() => Some(Match::Exact),
        (Some(m), Some(f)) if m.is_number() && f.is_number() => Some(Match::Cast),
        _ => None,
    }
}

fn reset(table: &mut SchemaTable) {
    table.clear_links();
    for s in table.structs_mut() {
        s.flags.remove(Flags::MISSING);
        for m in &mut s.members {
            m.flags.remove(Flags::MISSING);
            m.flags.remove(Flags::SKIP);
            m.flags.remove(Flags::NEEDS_CAST);
        }
    }
}

fn link_members(memory: &mut CompiledStruct, file: &mut CompiledStruct, summary: &mut LinkSummary) {
    let mut by_name: HashTable<IntKey, Vec<usize>> = HashTable::with_capacity(file.members.len());
    for (i, m) in file.members.iter().enumerate() {
        let key = IntKey(m.name_hash);
        match by_name.get_mut(&key) {
            Some(list) => list.push(i),
            None => {
                by_name.insert(key, vec![i]);
            }
        }
    }

    for (j, mm) in memory.members.iter_mut().enumerate() {
        let candidates = by_name.get(&IntKey(mm.name_hash)).map_or(&[][..], |v| &v[..]);
        let members = &file.members;
        let usable = |k: &usize| members[*k].link.is_none() && members[*k].chain == mm.chain;
        // a member of the very same type wins over an earlier one that needs converting
        let found = candidates
            .iter()
            .copied()
            .filter(usable)
            .find(|&k| members[k].type_hash == mm.type_hash)
            .and_then(|k| compatible(mm, &members[k]).map(|how| (k, how)))
            .or_else(|| {
                candidates
                    .iter()
                    .copied()
                    .filter(usable)
                    .find_map(|k| compatible(mm, &members[k]).map(|how| (k, how)))
            });

        match found {
            Some((k, how)) => {
                let fm = &mut file.members[k];
                mm.link = Some(k);
                fm.link = Some(j);
                if let Match::Cast = how {
                    mm.flags.insert(Flags::NEEDS_CAST);
                    fm.flags.insert(Flags::NEEDS_CAST);
                    summary.casts += 1;
                }
                summary.members += 1;
            }
            None => mm.flags.insert(Flags::MISSING),
        }
    }

    for fm in &mut file.members {
        if fm.link.is_none() {
            fm.flags.insert(Flags::SKIP);
        }
    }
}

/// Links every struct and member of `file` to its counterpart in `memory`, both ways. Links from
/// an earlier call are discarded first.
pub fn link(memory: &mut SchemaTable, file: &mut SchemaTable) -> LinkSummary {
    reset(memory);
    reset(file);

    let pairs: Vec<(usize, Option<usize>)> = file
        .structs()
        .iter()
        .enumerate()
        .map(|(i, s)| (i, memory.struct_by_hash(s.type_hash)))
        .collect();

    let mut summary = LinkSummary::default();
    for (f, m) in pairs {
        match m {
            Some(m) => {
                let memory_struct = &mut memory.structs_mut()[m];
                let file_struct = &mut file.structs_mut()[f];
                memory_struct.link = Some(f);
                file_struct.link = Some(m);
                link_members(memory_struct, file_struct, &mut summary);
                summary.structs += 1;
            }
            None => {
                trace!("file struct '{}' has no counterpart", file.struct_name(f));
                file.structs_mut()[f].flags.insert(Flags::MISSING);
                summary.missing_structs += 1;
            }
        }
    }

    for s in memory.structs_mut() {
        if s.link.is_none() {
            s.flags.insert(Flags::MISSING);
        }
    }

    debug!(
        "linked {} structs and {} members ({} casts), {} file structs unknown",
        summary.structs, summary.members, summary.casts, summary.missing_structs
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::parsers::{Endianness, PointerSize};
    use crate::writer::DnaBuilder;

    fn table(builder: &DnaBuilder) -> SchemaTable {
        let bytes = builder.to_bytes(Endianness::native(), PointerSize::Bits64).unwrap();
        SchemaTable::read(&bytes, false, PointerSize::Bits64, &Limits::default()).unwrap()
    }

    fn member<'a>(t: &'a SchemaTable, s: &str, name: &str) -> &'a Member {
        t.member(t.find_struct(s).unwrap(), name).unwrap()
    }

    #[test]
    fn added_and_removed_members() {
        let mut file = DnaBuilder::with_primitives();
        file.add_struct("Point", &[("float", "x"), ("float", "y"), ("float", "w")]);
        let mut memory = DnaBuilder::with_primitives();
        memory.add_struct("Point", &[("float", "x"), ("float", "y"), ("float", "z")]);

        let mut file = table(&file);
        let mut memory = table(&memory);
        let summary = link(&mut memory, &mut file);
        assert_eq!(summary.structs, 1);
        assert_eq!(summary.members, 2);

        assert_eq!(member(&memory, "Point", "y").link, Some(1));
        assert!(member(&memory, "Point", "z").flags.contains(Flags::MISSING));
        assert!(member(&file, "Point", "w").flags.contains(Flags::SKIP));
        assert_eq!(memory.structs()[0].link, Some(0));
    }

    #[test]
    fn reordered_members() {
        let mut file = DnaBuilder::with_primitives();
        file.add_struct("S", &[("int", "a"), ("float", "b")]);
        let mut memory = DnaBuilder::with_primitives();
        memory.add_struct("S", &[("float", "b"), ("int", "a")]);

        let mut file = table(&file);
        let mut memory = table(&memory);
        link(&mut memory, &mut file);
        assert_eq!(member(&memory, "S", "a").link, Some(0));
        assert_eq!(member(&memory, "S", "b").link, Some(1));
        assert_eq!(member(&file, "S", "a").link, Some(1));
    }

    #[test]
    fn numeric_conversions() {
        let mut file = DnaBuilder::with_primitives();
        file.add_struct("S", &[("short", "i"), ("int", "f"), ("float", "p"), ("ListBase", "opaque")]);
        file.add_type("ListBase", 16);
        let mut memory = DnaBuilder::with_primitives();
        memory.add_struct("S", &[("int", "i"), ("float", "f"), ("float", "*p"), ("int", "opaque")]);

        let mut file = table(&file);
        let mut memory = table(&memory);
        let summary = link(&mut memory, &mut file);

        let i = member(&memory, "S", "i");
        assert!(i.link.is_some());
        assert!(!i.flags.contains(Flags::NEEDS_CAST));

        let f = member(&memory, "S", "f");
        assert!(f.link.is_some());
        assert!(f.flags.contains(Flags::NEEDS_CAST));
        assert!(member(&file, "S", "f").flags.contains(Flags::NEEDS_CAST));

        assert!(member(&memory, "S", "p").flags.contains(Flags::MISSING));
        assert!(member(&memory, "S", "opaque").flags.contains(Flags::MISSING));
        assert_eq!(summary.casts, 1);
    }

    #[test]
    fn same_type_is_preferred() {
        let mut file = DnaBuilder::with_primitives();
        file.add_struct("S", &[("int", "a"), ("float", "a[2]")]);
        let mut memory = DnaBuilder::with_primitives();
        memory.add_struct("S", &[("float", "a[2]")]);

        let mut file = table(&file);
        let mut memory = table(&memory);
        let summary = link(&mut memory, &mut file);

        let a = member(&memory, "S", "a");
        assert_eq!(a.link, Some(1));
        assert!(!a.flags.contains(Flags::NEEDS_CAST));
        assert_eq!(summary.casts, 0);
        assert!(file.structs()[0].members[0].flags.contains(Flags::SKIP));
    }

    #[test]
    fn pointers_need_matching_indirection() {
        let mut file = DnaBuilder::with_primitives();
        file.add_struct("S", &[("S", "*a"), ("S", "**b"), ("void", "(*c)()"), ("int", "*d")]);
        let mut memory = DnaBuilder::with_primitives();
        memory.add_struct("S", &[("S", "*a"), ("S", "*b"), ("void", "*c"), ("float", "*d")]);

        let mut file = table(&file);
        let mut memory = table(&memory);
        link(&mut memory, &mut file);
        assert!(member(&memory, "S", "a").link.is_some());
        for name in &["b", "c", "d"] {
            assert!(member(&memory, "S", name).flags.contains(Flags::MISSING), "{}", name);
        }
    }

    #[test]
    fn embedded_members_follow_their_chain() {
        let mut file = DnaBuilder::with_primitives();
        file.add_struct("Vec2", &[("float", "x"), ("float", "y")]);
        file.add_struct("Seg", &[("Vec2", "a"), ("Vec2", "b")]);
        let mut memory = DnaBuilder::with_primitives();
        memory.add_struct("Vec2", &[("float", "x"), ("float", "y")]);
        memory.add_struct("Seg", &[("Vec2", "b"), ("Vec2", "a")]);

        let mut file = table(&file);
        let mut memory = table(&memory);
        link(&mut memory, &mut file);

        let seg = &memory.structs()[memory.find_struct("Seg").unwrap()];
        // memory b.x, b.y, a.x, a.y; file a.x, a.y, b.x, b.y
        let links: Vec<_> = seg.members.iter().map(|m| m.link).collect();
        assert_eq!(links, vec![Some(2), Some(3), Some(0), Some(1)]);
    }

    #[test]
    fn unknown_structs_and_relinking() {
        let mut file = DnaBuilder::with_primitives();
        file.add_struct("Gone", &[("int", "a")]);
        file.add_struct("Kept", &[("int", "a")]);
        let mut memory = DnaBuilder::with_primitives();
        memory.add_struct("Kept", &[("int", "a")]);
        memory.add_struct("New", &[("int", "a")]);

        let mut file = table(&file);
        let mut memory = table(&memory);
        let first = link(&mut memory, &mut file);
        let second = link(&mut memory, &mut file);
        assert_eq!(first, second);
        assert_eq!(second.missing_structs, 1);

        assert!(file.structs()[0].flags.contains(Flags::MISSING));
        assert_eq!(file.structs()[1].link, Some(0));
        assert!(memory.structs()[1].flags.contains(Flags::MISSING));
    }
}
