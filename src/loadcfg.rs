//! Load configuration directory decoding.

use tracing::debug;

use crate::bytes::{read_u32, FieldReader};
use crate::error::{Error, Result};
use crate::image::PeImage;
use crate::pe::DirectoryIndex;

const LOAD_CONFIG32_SIZE: usize = 72;
const LOAD_CONFIG64_SIZE: usize = 112;

/// The classic `IMAGE_LOAD_CONFIG_DIRECTORY` prefix.
///
/// Fields past the record's own `Size` read as zero; a record whose `Size`
/// runs past its section is an error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadConfig {
    pub size: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub global_flags_clear: u32,
    pub global_flags_set: u32,
    pub critical_section_default_timeout: u32,
    pub de_commit_free_block_threshold: u64,
    pub de_commit_total_free_threshold: u64,
    pub lock_prefix_table: u64,
    pub maximum_allocation_size: u64,
    pub virtual_memory_threshold: u64,
    pub process_heap_flags: u32,
    pub process_affinity_mask: u64,
    pub csd_version: u16,
    pub reserved1: u16,
    pub edit_list: u64,
    pub security_cookie: u64,
    pub se_handler_table: u64,
    pub se_handler_count: u64,
}

pub fn decode(image: &PeImage<'_>) -> Result<Option<LoadConfig>> {
    let Some(dir) = image.directory(DirectoryIndex::LoadConfig)? else {
        return Ok(None);
    };
    let is_64bit = image.is_64bit();
    let full = if is_64bit {
        LOAD_CONFIG64_SIZE
    } else {
        LOAD_CONFIG32_SIZE
    };
    let raw = image.resolve_tail(dir.rva).unwrap_or(dir.data);
    let declared = read_u32(raw, 0).unwrap_or(0) as usize;
    let wanted = declared.max(4).min(full);
    if raw.len() < wanted {
        return Err(Error::Truncated {
            what: "load config directory",
            offset: image.file_offset(dir.rva).unwrap_or_default(),
        });
    }
    let raw = &raw[..wanted];

    let mut r = FieldReader::new(raw);
    let mut cfg = LoadConfig {
        size: r.u32(),
        time_date_stamp: r.u32(),
        major_version: r.u16(),
        minor_version: r.u16(),
        global_flags_clear: r.u32(),
        global_flags_set: r.u32(),
        critical_section_default_timeout: r.u32(),
        de_commit_free_block_threshold: r.ptr(is_64bit),
        de_commit_total_free_threshold: r.ptr(is_64bit),
        lock_prefix_table: r.ptr(is_64bit),
        maximum_allocation_size: r.ptr(is_64bit),
        virtual_memory_threshold: r.ptr(is_64bit),
        ..LoadConfig::default()
    };
    if is_64bit {
        cfg.process_affinity_mask = r.u64();
        cfg.process_heap_flags = r.u32();
    } else {
        cfg.process_heap_flags = r.u32();
        cfg.process_affinity_mask = r.u32().into();
    }
    cfg.csd_version = r.u16();
    cfg.reserved1 = r.u16();
    cfg.edit_list = r.ptr(is_64bit);
    cfg.security_cookie = r.ptr(is_64bit);
    cfg.se_handler_table = r.ptr(is_64bit);
    cfg.se_handler_count = r.ptr(is_64bit);

    debug!(size = cfg.size, "decoded load config directory");
    Ok(Some(cfg))
}
