//! Base relocation directory decoding.

use tracing::{debug, warn};

use crate::bytes::{read_u16, read_u32};
use crate::error::Result;
use crate::image::PeImage;
use crate::pe::DirectoryIndex;

const BLOCK_HEADER_SIZE: usize = 8;

const TYPE_NAMES: [&str; 16] = [
    "BASED_ABSOLUTE",
    "BASED_HIGH",
    "BASED_LOW",
    "BASED_HIGHLOW",
    "BASED_HIGHADJ",
    "BASED_MIPS_JMPADDR",
    "BASED_SECTION",
    "BASED_REL",
    "unknown 8",
    "BASED_IA64_IMM64",
    "BASED_DIR64",
    "BASED_HIGH3ADJ",
    "unknown 12",
    "unknown 13",
    "unknown 14",
    "unknown 15",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    /// Offset within the block's page (12 bits).
    pub offset: u16,
    pub kind: u8,
}

impl Relocation {
    fn from_raw(raw: u16) -> Self {
        Self {
            offset: raw & 0x0fff,
            kind: (raw >> 12) as u8,
        }
    }

    pub fn type_name(&self) -> &'static str {
        TYPE_NAMES[(self.kind & 0xf) as usize]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocationBlock {
    pub page_rva: u32,
    pub size_of_block: u32,
    pub entries: Vec<Relocation>,
}

pub fn decode(image: &PeImage<'_>) -> Result<Option<Vec<RelocationBlock>>> {
    let Some(dir) = image.directory(DirectoryIndex::BaseReloc)? else {
        return Ok(None);
    };
    let data = dir.data;

    let mut blocks = Vec::new();
    let mut pos = 0;
    while pos + BLOCK_HEADER_SIZE <= data.len() {
        let (Some(page_rva), Some(size_of_block)) = (read_u32(data, pos), read_u32(data, pos + 4)) else {
            break;
        };
        if size_of_block == 0 {
            break;
        }
        if (size_of_block as usize) < BLOCK_HEADER_SIZE {
            warn!(offset = pos, size_of_block, "relocation block smaller than its header");
            break;
        }
        let end = pos + size_of_block as usize;
        if end > data.len() {
            warn!(offset = pos, size_of_block, "relocation block runs past the directory");
        }
        let entries = (pos + BLOCK_HEADER_SIZE..end.min(data.len()))
            .step_by(2)
            .map_while(|at| read_u16(data, at))
            .map(Relocation::from_raw)
            .collect();
        blocks.push(RelocationBlock {
            page_rva,
            size_of_block,
            entries,
        });
        pos = end;
    }

    debug!(blocks = blocks.len(), "decoded base relocations");
    Ok(Some(blocks))
}
