//! Import and delay-import directory decoding.
//!
//! Both tables end in a sentinel record and point at zero-terminated thunk
//! arrays. They share the thunk walker; the delay-load variant first
//! subtracts a per-descriptor base from every address it reads.

use tracing::{debug, warn};

use crate::bytes::FieldReader;
use crate::error::Result;
use crate::image::PeImage;
use crate::pe::DirectoryIndex;

const IMPORT_DESCRIPTOR_SIZE: u32 = 20;
const DELAY_DESCRIPTOR_SIZE: u32 = 32;
const ORDINAL_FLAG32: u64 = 0x8000_0000;
const ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

/// `Attributes` bit saying the delay descriptor holds RVAs, not VAs.
const DELAY_ATTR_RVA_BASED: u32 = 1;

/// How one thunk refers to the imported symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThunkKind {
    Ordinal(u16),
    Named { hint: u16, name: String },
    /// The hint/name entry at this RVA doesn't map.
    Unresolved(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thunk {
    /// RVA of the matching import address table slot.
    pub thunk_rva: u32,
    pub kind: ThunkKind,
}

/// One `IMAGE_IMPORT_DESCRIPTOR`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportDescriptor {
    /// File offset of the descriptor record.
    pub offset: usize,
    pub dll_name: Option<String>,
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub first_thunk: u32,
    /// `None` when the thunk array itself can't be located.
    pub thunks: Option<Vec<Thunk>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportDirectory {
    pub size: u32,
    pub descriptors: Vec<ImportDescriptor>,
}

/// One `IMAGE_DELAYLOAD_DESCRIPTOR`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelayImportDescriptor {
    pub offset: usize,
    pub attributes: u32,
    pub dll_name: Option<String>,
    pub module_handle: u32,
    pub import_address_table: u32,
    pub import_name_table: u32,
    pub bound_import_address_table: u32,
    pub unload_information_table: u32,
    pub time_date_stamp: u32,
    pub thunks: Option<Vec<Thunk>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelayImportDirectory {
    pub size: u32,
    pub descriptors: Vec<DelayImportDescriptor>,
}

/// Decode the import directory.
pub fn decode(image: &PeImage<'_>) -> Result<Option<ImportDirectory>> {
    let Some(dir) = image.directory(DirectoryIndex::Import)? else {
        return Ok(None);
    };

    let mut descriptors = Vec::new();
    let mut rva = dir.rva;
    loop {
        let Some(raw) = image.resolve_rva(rva, IMPORT_DESCRIPTOR_SIZE) else {
            warn!(rva = format_args!("{rva:#x}"), "import descriptor unmapped, stopping");
            break;
        };
        let mut r = FieldReader::new(raw);
        let original_first_thunk = r.u32();
        let time_date_stamp = r.u32();
        let forwarder_chain = r.u32();
        let name = r.u32();
        let first_thunk = r.u32();
        if name == 0 || first_thunk == 0 {
            break;
        }

        let table = if original_first_thunk != 0 {
            original_first_thunk
        } else {
            first_thunk
        };
        descriptors.push(ImportDescriptor {
            offset: image.file_offset(rva).unwrap_or_default(),
            dll_name: image.read_cstr(name),
            original_first_thunk,
            time_date_stamp,
            forwarder_chain,
            first_thunk,
            thunks: walk_thunks(image, table, first_thunk, 0),
        });
        rva = rva.wrapping_add(IMPORT_DESCRIPTOR_SIZE);
    }

    debug!(dlls = descriptors.len(), "decoded import directory");
    Ok(Some(ImportDirectory {
        size: dir.size,
        descriptors,
    }))
}

/// Decode the delay-load import directory.
pub fn decode_delay(image: &PeImage<'_>) -> Result<Option<DelayImportDirectory>> {
    let Some(dir) = image.directory(DirectoryIndex::DelayImport)? else {
        return Ok(None);
    };

    let mut descriptors = Vec::new();
    let mut rva = dir.rva;
    loop {
        let Some(raw) = image.resolve_rva(rva, DELAY_DESCRIPTOR_SIZE) else {
            warn!(rva = format_args!("{rva:#x}"), "delay import descriptor unmapped, stopping");
            break;
        };
        let mut r = FieldReader::new(raw);
        let attributes = r.u32();
        let dll_name_rva = r.u32();
        let module_handle = r.u32();
        let import_address_table = r.u32();
        let import_name_table = r.u32();
        let bound_import_address_table = r.u32();
        let unload_information_table = r.u32();
        let time_date_stamp = r.u32();
        if dll_name_rva == 0 || import_address_table == 0 || import_name_table == 0 {
            break;
        }

        let base = delay_base(image, attributes);
        descriptors.push(DelayImportDescriptor {
            offset: image.file_offset(rva).unwrap_or_default(),
            attributes,
            dll_name: image.read_cstr(rebase(dll_name_rva.into(), base)),
            module_handle,
            import_address_table,
            import_name_table,
            bound_import_address_table,
            unload_information_table,
            time_date_stamp,
            thunks: walk_thunks(
                image,
                rebase(import_name_table.into(), base),
                rebase(import_address_table.into(), base),
                base,
            ),
        });
        rva = rva.wrapping_add(DELAY_DESCRIPTOR_SIZE);
    }

    debug!(dlls = descriptors.len(), "decoded delay import directory");
    Ok(Some(DelayImportDirectory {
        size: dir.size,
        descriptors,
    }))
}

/// Base subtracted from every address in a delay descriptor.
fn delay_base(image: &PeImage<'_>, attributes: u32) -> u64 {
    if attributes & DELAY_ATTR_RVA_BASED != 0 {
        0
    } else {
        image.headers().image_base()
    }
}

fn rebase(address: u64, base: u64) -> u32 {
    address.wrapping_sub(base) as u32
}

/// Walk a zero-terminated thunk array at `table`, labelling each entry with
/// the IAT slot at the same index starting from `iat`.
fn walk_thunks(image: &PeImage<'_>, table: u32, iat: u32, base: u64) -> Option<Vec<Thunk>> {
    let width = image.pointer_size();
    if image.resolve_rva(table, width).is_none() {
        warn!(rva = format_args!("{table:#x}"), "can't grab thunk data");
        return None;
    }
    let ordinal_flag = if image.is_64bit() {
        ORDINAL_FLAG64
    } else {
        ORDINAL_FLAG32
    };

    let mut thunks = Vec::new();
    for i in 0u32.. {
        let slot = table.wrapping_add(i.wrapping_mul(width));
        let Some(value) = image.read_ptr(slot) else {
            warn!(rva = format_args!("{slot:#x}"), "thunk array runs off its section");
            break;
        };
        if value == 0 {
            break;
        }
        let kind = if value & ordinal_flag != 0 {
            ThunkKind::Ordinal(value as u16)
        } else {
            let by_name = rebase(value, base);
            match (image.read_u16(by_name), image.read_cstr(by_name.wrapping_add(2))) {
                (Some(hint), Some(name)) => ThunkKind::Named { hint, name },
                _ => ThunkKind::Unresolved(by_name),
            }
        };
        thunks.push(Thunk {
            thunk_rva: iat.wrapping_add(i.wrapping_mul(width)),
            kind,
        });
    }
    Some(thunks)
}
