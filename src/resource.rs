//! Resource directory decoding.
//!
//! The tree is always Type -> Name -> Language. Every interior entry must
//! point at a subdirectory and every language entry at a data entry; any
//! other shape is reported and the offending subtree skipped.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::bytes::{cstr, read_u16, read_u32, utf16, utf16_nul, FieldReader};
use crate::error::{Error, Result};
use crate::image::PeImage;
use crate::pe::DirectoryIndex;

const DIRECTORY_HEADER_SIZE: usize = 16;
const DIRECTORY_ENTRY_SIZE: usize = 8;
const DATA_ENTRY_SIZE: usize = 16;
const HIGH_BIT: u32 = 0x8000_0000;

pub const RT_STRING: u16 = 6;
pub const RT_MESSAGETABLE: u16 = 11;

const MESSAGE_RESOURCE_UNICODE: u16 = 0x0001;
const STRINGS_PER_BLOCK: u32 = 16;

/// Well-known name of a numeric resource type.
pub fn type_name(id: u16) -> Option<&'static str> {
    const TYPES: [Option<&str>; 25] = [
        None,
        Some("CURSOR"),
        Some("BITMAP"),
        Some("ICON"),
        Some("MENU"),
        Some("DIALOG"),
        Some("STRING"),
        Some("FONTDIR"),
        Some("FONT"),
        Some("ACCELERATOR"),
        Some("RCDATA"),
        Some("MESSAGETABLE"),
        Some("GROUP_CURSOR"),
        None,
        Some("GROUP_ICON"),
        None,
        Some("VERSION"),
        Some("DLGINCLUDE"),
        None,
        Some("PLUGPLAY"),
        Some("VXD"),
        Some("ANICURSOR"),
        Some("ANIICON"),
        Some("HTML"),
        Some("RT_MANIFEST"),
    ];
    TYPES.get(id as usize).copied().flatten()
}

/// Entry key: numeric ID or counted Unicode name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceId {
    Id(u16),
    Name(String),
}

impl ResourceId {
    pub fn id(&self) -> Option<u16> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Name(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub unicode: bool,
    pub text: String,
}

/// Leaf payload, interpreted according to the resource type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceContent<'a> {
    /// One string-table block: `(string id, text)` for each non-empty slot.
    Strings(Vec<(u32, String)>),
    Messages(Vec<Message>),
    Raw(&'a [u8]),
    /// `OffsetToData`/`Size` don't map.
    Unresolved,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceLeaf<'a> {
    pub type_id: ResourceId,
    pub name: ResourceId,
    pub language: u16,
    pub data_rva: u32,
    pub size: u32,
    pub codepage: u32,
    pub content: ResourceContent<'a>,
}

/// All resource leaves in tree order, plus whatever made parts of the
/// tree unreadable.
#[derive(Debug, Default)]
pub struct ResourceTree<'a> {
    pub leaves: Vec<ResourceLeaf<'a>>,
    pub errors: Vec<Error>,
}

struct Entry {
    id: ResourceId,
    /// Offset from the resource root.
    target: u32,
    is_directory: bool,
    at: u32,
}

struct Walker<'i, 'a> {
    image: &'i PeImage<'a>,
    root: &'a [u8],
}

impl<'a> Walker<'_, 'a> {
    fn entries(&self, dir_offset: u32, level: &'static str) -> Result<Vec<Entry>> {
        let start = dir_offset as usize;
        let header = self
            .root
            .get(start..start + DIRECTORY_HEADER_SIZE)
            .ok_or(Error::Truncated { what: level, offset: start })?;
        let mut r = FieldReader::new(header);
        r.skip(12);
        let count = r.u16() as usize + r.u16() as usize;

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = start + DIRECTORY_HEADER_SIZE + i * DIRECTORY_ENTRY_SIZE;
            let (Some(name), Some(target)) = (read_u32(self.root, at), read_u32(self.root, at + 4)) else {
                return Err(Error::Truncated { what: level, offset: at });
            };
            let id = if name & HIGH_BIT != 0 {
                ResourceId::Name(self.name_string(name & !HIGH_BIT))
            } else {
                ResourceId::Id(name as u16)
            };
            entries.push(Entry {
                id,
                target: target & !HIGH_BIT,
                is_directory: target & HIGH_BIT != 0,
                at: at as u32,
            });
        }
        Ok(entries)
    }

    fn name_string(&self, offset: u32) -> String {
        let off = offset as usize;
        read_u16(self.root, off)
            .and_then(|len| utf16(self.root.get(off + 2..)?, len as usize))
            .unwrap_or_default()
    }

    fn leaf(&self, type_id: &ResourceId, name: &ResourceId, language: &Entry) -> Result<ResourceLeaf<'a>> {
        let off = language.target as usize;
        let raw = self
            .root
            .get(off..off + DATA_ENTRY_SIZE)
            .ok_or(Error::Truncated { what: "resource data entry", offset: off })?;
        let mut r = FieldReader::new(raw);
        let data_rva = r.u32();
        let size = r.u32();
        let codepage = r.u32();

        let content = match self.image.resolve_rva(data_rva, size) {
            None => {
                warn!(rva = format_args!("{data_rva:#x}"), size, "can't grab resource data");
                ResourceContent::Unresolved
            }
            Some(data) => match type_id.id() {
                Some(RT_STRING) => ResourceContent::Strings(string_block(data, name.id().unwrap_or(0))),
                Some(RT_MESSAGETABLE) => ResourceContent::Messages(message_table(data)),
                _ => ResourceContent::Raw(data),
            },
        };

        Ok(ResourceLeaf {
            type_id: type_id.clone(),
            name: name.clone(),
            language: language.id.id().unwrap_or(0),
            data_rva,
            size,
            codepage,
            content,
        })
    }
}

/// Leaves and errors gathered during the walk.
///
/// Each subdirectory is entered at most once and the record count is
/// bounded by how many directory entries the section could hold.
struct Collector<'a> {
    tree: ResourceTree<'a>,
    visited: HashSet<u32>,
    limit: usize,
    full: bool,
}

impl<'a> Collector<'a> {
    fn new(root_len: usize) -> Self {
        Self {
            tree: ResourceTree::default(),
            visited: HashSet::from([0]),
            limit: (root_len / DIRECTORY_ENTRY_SIZE).max(1),
            full: false,
        }
    }

    fn has_room(&mut self) -> bool {
        if self.full {
            return false;
        }
        if self.tree.leaves.len() + self.tree.errors.len() >= self.limit {
            self.full = true;
            self.tree.errors.push(Error::ResourceLimit { limit: self.limit });
            return false;
        }
        true
    }

    fn error(&mut self, e: Error) {
        if self.has_room() {
            self.tree.errors.push(e);
        }
    }

    fn leaf(&mut self, leaf: ResourceLeaf<'a>) {
        if self.has_room() {
            self.tree.leaves.push(leaf);
        }
    }

    /// Entries of the subdirectory `entry` points at, or `None` after
    /// recording why it can't be walked.
    fn subdirectory(
        &mut self,
        walker: &Walker<'_, 'a>,
        entry: &Entry,
        level: &'static str,
        what: &'static str,
    ) -> Option<Vec<Entry>> {
        if !entry.is_directory {
            self.error(Error::MalformedResource { level, offset: entry.at });
            return None;
        }
        if !self.visited.insert(entry.target) {
            self.error(Error::ResourceLoop { offset: entry.target });
            return None;
        }
        match walker.entries(entry.target, what) {
            Ok(entries) => Some(entries),
            Err(e) => {
                self.error(e);
                None
            }
        }
    }
}

/// Decode the full resource tree.
pub fn decode<'a>(image: &PeImage<'a>) -> Result<Option<ResourceTree<'a>>> {
    let Some(dir) = image.directory(DirectoryIndex::Resource)? else {
        return Ok(None);
    };
    // Tree offsets may run past the declared size but stay inside the section.
    let root = image.resolve_tail(dir.rva).unwrap_or(dir.data);
    let walker = Walker { image, root };

    let mut found = Collector::new(root.len());
    'walk: for type_entry in walker.entries(0, "resource type directory")? {
        let Some(names) = found.subdirectory(&walker, &type_entry, "type", "resource name directory") else {
            continue;
        };
        for name_entry in names {
            let Some(languages) =
                found.subdirectory(&walker, &name_entry, "name", "resource language directory")
            else {
                continue;
            };
            for lang_entry in languages {
                if found.full {
                    break 'walk;
                }
                if lang_entry.is_directory {
                    found.error(Error::MalformedResource { level: "language", offset: lang_entry.at });
                    continue;
                }
                match walker.leaf(&type_entry.id, &name_entry.id, &lang_entry) {
                    Ok(leaf) => found.leaf(leaf),
                    Err(e) => found.error(e),
                }
            }
        }
        if found.full {
            break;
        }
    }

    let tree = found.tree;
    for e in &tree.errors {
        warn!(error = %e, "skipped part of the resource tree");
    }
    debug!(leaves = tree.leaves.len(), "decoded resource directory");
    Ok(Some(tree))
}

/// Decode one 16-string block of a STRING resource named `block_id`.
fn string_block(data: &[u8], block_id: u16) -> Vec<(u32, String)> {
    let mut strings = Vec::new();
    let mut remaining = data.len() / 2;
    let mut pos = 0;
    let first = (block_id as u32).wrapping_sub(1).wrapping_mul(STRINGS_PER_BLOCK);

    for i in 0..STRINGS_PER_BLOCK {
        if remaining == 0 {
            break;
        }
        let Some(len) = read_u16(data, pos) else {
            break;
        };
        pos += 2;
        remaining -= 1;
        let len = (len as usize).min(remaining);
        remaining -= len;
        if len > 0 {
            let text = utf16(&data[pos..], len).unwrap_or_default();
            strings.push((first.wrapping_add(i), text));
            pos += len * 2;
        }
    }
    strings
}

/// Decode a `MESSAGE_RESOURCE_DATA` block.
fn message_table(data: &[u8]) -> Vec<Message> {
    let mut messages = Vec::new();
    let blocks = read_u32(data, 0).unwrap_or(0) as usize;

    for b in 0..blocks {
        let at = 4 + b * 12;
        let (Some(low), Some(high), Some(entries)) =
            (read_u32(data, at), read_u32(data, at + 4), read_u32(data, at + 8))
        else {
            warn!(block = b, "message table block header truncated");
            break;
        };
        let mut pos = entries as usize;
        for id in low..=high {
            let (Some(length), Some(flags)) = (read_u16(data, pos), read_u16(data, pos + 2)) else {
                break;
            };
            if length < 4 {
                break;
            }
            let Some(body) = data.get(pos + 4..pos + length as usize) else {
                break;
            };
            let unicode = flags & MESSAGE_RESOURCE_UNICODE != 0;
            let text = if unicode { utf16_nul(body) } else { cstr(body) };
            messages.push(Message { id, unicode, text });
            pos += length as usize;
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{put16, put32, ImageBuilder};

    const RSRC_VA: u32 = 0x4000;

    fn dir_header(buf: &mut [u8], off: usize, named: u16, ids: u16) {
        put16(buf, off + 12, named);
        put16(buf, off + 14, ids);
    }

    fn entry(buf: &mut [u8], off: usize, name: u32, target: u32) {
        put32(buf, off, name);
        put32(buf, off + 4, target);
    }

    fn image_with(rsrc: &[u8]) -> Vec<u8> {
        ImageBuilder::pe32()
            .section(".rsrc", RSRC_VA, 0x400, rsrc)
            .directory(DirectoryIndex::Resource, RSRC_VA, 0x400)
            .build()
    }

    /// RCDATA/7/0x409 -> 4 bytes at 0x4200.
    fn single_leaf() -> Vec<u8> {
        let mut rsrc = vec![0u8; 0x400];
        dir_header(&mut rsrc, 0x00, 0, 1);
        entry(&mut rsrc, 0x10, 10, HIGH_BIT | 0x18);
        dir_header(&mut rsrc, 0x18, 0, 1);
        entry(&mut rsrc, 0x28, 7, HIGH_BIT | 0x30);
        dir_header(&mut rsrc, 0x30, 0, 1);
        entry(&mut rsrc, 0x40, 0x409, 0x48);
        put32(&mut rsrc, 0x48, RSRC_VA + 0x200);
        put32(&mut rsrc, 0x4C, 4);
        put32(&mut rsrc, 0x50, 1252);
        rsrc[0x200..0x204].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        rsrc
    }

    #[test]
    fn test_one_leaf_per_complete_path() {
        let bytes = image_with(&single_leaf());
        let image = PeImage::parse(&bytes).unwrap();
        let tree = decode(&image).unwrap().unwrap();
        assert!(tree.errors.is_empty());
        assert_eq!(tree.leaves.len(), 1);
        let leaf = &tree.leaves[0];
        assert_eq!(leaf.type_id, ResourceId::Id(10));
        assert_eq!(leaf.name, ResourceId::Id(7));
        assert_eq!(leaf.language, 0x409);
        assert_eq!(leaf.codepage, 1252);
        assert_eq!(leaf.content, ResourceContent::Raw(&[0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn test_name_level_leaf_is_rejected() {
        let mut rsrc = single_leaf();
        // Name entry points straight at the data entry.
        entry(&mut rsrc, 0x28, 7, 0x48);
        let bytes = image_with(&rsrc);
        let image = PeImage::parse(&bytes).unwrap();
        let tree = decode(&image).unwrap().unwrap();
        assert!(tree.leaves.is_empty());
        assert!(matches!(
            tree.errors.as_slice(),
            [Error::MalformedResource { level: "name", offset: 0x28 }]
        ));
    }

    #[test]
    fn test_self_referencing_root_is_bounded() {
        let mut rsrc = vec![0u8; 0x400];
        dir_header(&mut rsrc, 0, 0, 100);
        for i in 0..100 {
            entry(&mut rsrc, 0x10 + i * 8, i as u32 + 1, HIGH_BIT);
        }
        let bytes = image_with(&rsrc);
        let image = PeImage::parse(&bytes).unwrap();
        let tree = decode(&image).unwrap().unwrap();
        assert!(tree.leaves.is_empty());
        assert_eq!(tree.errors.len(), 100);
        assert!(tree
            .errors
            .iter()
            .all(|e| matches!(e, Error::ResourceLoop { offset: 0 })));
    }

    #[test]
    fn test_shared_language_directory_is_walked_once() {
        let mut rsrc = single_leaf();
        // Two name entries pointing at the same language directory.
        dir_header(&mut rsrc, 0x18, 0, 2);
        entry(&mut rsrc, 0x28, 7, HIGH_BIT | 0x60);
        entry(&mut rsrc, 0x30, 8, HIGH_BIT | 0x60);
        dir_header(&mut rsrc, 0x60, 0, 1);
        entry(&mut rsrc, 0x70, 0x409, 0x48);
        let bytes = image_with(&rsrc);
        let image = PeImage::parse(&bytes).unwrap();
        let tree = decode(&image).unwrap().unwrap();
        assert_eq!(tree.leaves.len(), 1);
        assert!(matches!(tree.errors.as_slice(), [Error::ResourceLoop { offset: 0x60 }]));
    }

    #[test]
    fn test_record_count_is_capped() {
        // Room for two records.
        let mut found = Collector::new(2 * DIRECTORY_ENTRY_SIZE);
        for offset in 0..10 {
            found.error(Error::MalformedResource { level: "type", offset });
        }
        assert!(found.full);
        assert_eq!(found.tree.errors.len(), 3);
        assert!(matches!(found.tree.errors[2], Error::ResourceLimit { limit: 2 }));
    }

    #[test]
    fn test_named_type_entry() {
        let mut rsrc = single_leaf();
        entry(&mut rsrc, 0x10, HIGH_BIT | 0x100, HIGH_BIT | 0x18);
        put16(&mut rsrc, 0x100, 3);
        rsrc[0x102..0x108].copy_from_slice(&[b'P', 0, b'N', 0, b'G', 0]);
        let bytes = image_with(&rsrc);
        let image = PeImage::parse(&bytes).unwrap();
        let tree = decode(&image).unwrap().unwrap();
        assert_eq!(tree.leaves[0].type_id, ResourceId::Name("PNG".into()));
    }

    #[test]
    fn test_string_block() {
        let mut data = Vec::new();
        // Slot 0 empty, slot 1 "Hi", slot 2 "A", rest absent.
        for unit in [0u16, 2, b'H' as u16, b'i' as u16, 1, b'A' as u16] {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        let strings = string_block(&data, 2);
        assert_eq!(strings, vec![(17, "Hi".to_string()), (18, "A".to_string())]);
    }

    #[test]
    fn test_string_leaf_from_tree() {
        let mut rsrc = single_leaf();
        entry(&mut rsrc, 0x10, RT_STRING as u32, HIGH_BIT | 0x18);
        entry(&mut rsrc, 0x28, 1, HIGH_BIT | 0x30);
        put32(&mut rsrc, 0x4C, 6);
        rsrc[0x200..0x206].copy_from_slice(&[1, 0, b'X', 0, 0, 0]);
        let bytes = image_with(&rsrc);
        let image = PeImage::parse(&bytes).unwrap();
        let tree = decode(&image).unwrap().unwrap();
        assert_eq!(tree.leaves[0].content, ResourceContent::Strings(vec![(0, "X".into())]));
    }

    #[test]
    fn test_message_table() {
        let mut data = vec![0u8; 0x40];
        put32(&mut data, 0, 1);
        put32(&mut data, 4, 0x100);
        put32(&mut data, 8, 0x101);
        put32(&mut data, 12, 16);
        // ANSI entry, length 8.
        put16(&mut data, 16, 8);
        data[20..23].copy_from_slice(b"ok\0");
        // Unicode entry, length 12.
        put16(&mut data, 24, 12);
        put16(&mut data, 26, MESSAGE_RESOURCE_UNICODE);
        data[28..32].copy_from_slice(&[b'h', 0, b'i', 0]);
        let messages = message_table(&data);
        assert_eq!(
            messages,
            vec![
                Message { id: 0x100, unicode: false, text: "ok".into() },
                Message { id: 0x101, unicode: true, text: "hi".into() },
            ]
        );
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(RT_STRING), Some("STRING"));
        assert_eq!(type_name(24), Some("RT_MANIFEST"));
        assert_eq!(type_name(13), None);
        assert_eq!(type_name(0x100), None);
    }
}
