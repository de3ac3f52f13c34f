//! Debug directory decoding.
//!
//! Only the `MISC` payload is interpreted; CodeView, COFF and FPO payloads
//! are listed by location and left alone.

use tracing::{debug, warn};

use crate::bytes::{cstr, utf16_nul, FieldReader};
use crate::error::Result;
use crate::image::PeImage;
use crate::pe::DirectoryIndex;

const DEBUG_DIRECTORY_SIZE: usize = 28;
const MISC_HEADER_SIZE: usize = 12;

pub const DEBUG_TYPE_MISC: u32 = 4;
pub const DEBUG_MISC_EXENAME: u32 = 1;

/// Name of an `IMAGE_DEBUG_TYPE_*` value.
pub fn type_name(kind: u32) -> &'static str {
    match kind {
        1 => "COFF",
        2 => "CODEVIEW",
        3 => "FPO",
        4 => "MISC",
        5 => "EXCEPTION",
        6 => "FIXUP",
        7 => "OMAP_TO_SRC",
        8 => "OMAP_FROM_SRC",
        9 => "BORLAND",
        10 => "RESERVED10",
        11 => "CLSID",
        12 => "VC_FEATURE",
        13 => "POGO",
        14 => "ILTCG",
        15 => "MPX",
        16 => "REPRO",
        _ => "UNKNOWN",
    }
}

/// `IMAGE_DEBUG_MISC` payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiscDebug {
    pub data_type: u32,
    pub length: u32,
    pub unicode: bool,
    pub data: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugEntry {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub kind: u32,
    pub size_of_data: u32,
    pub address_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    /// Set for readable `MISC` entries.
    pub misc: Option<MiscDebug>,
}

pub fn decode(image: &PeImage<'_>) -> Result<Option<Vec<DebugEntry>>> {
    let Some(dir) = image.directory(DirectoryIndex::Debug)? else {
        return Ok(None);
    };

    let entries: Vec<DebugEntry> = dir
        .data
        .chunks_exact(DEBUG_DIRECTORY_SIZE)
        .map(|raw| {
            let mut r = FieldReader::new(raw);
            let mut entry = DebugEntry {
                characteristics: r.u32(),
                time_date_stamp: r.u32(),
                major_version: r.u16(),
                minor_version: r.u16(),
                kind: r.u32(),
                size_of_data: r.u32(),
                address_of_raw_data: r.u32(),
                pointer_to_raw_data: r.u32(),
                misc: None,
            };
            if entry.kind == DEBUG_TYPE_MISC {
                entry.misc = misc_payload(image, &entry);
            }
            entry
        })
        .collect();

    debug!(entries = entries.len(), "decoded debug directory");
    Ok(Some(entries))
}

fn misc_payload(image: &PeImage<'_>, entry: &DebugEntry) -> Option<MiscDebug> {
    let Some(raw) = image
        .file_bytes(entry.pointer_to_raw_data as usize, entry.size_of_data as usize)
        .filter(|raw| raw.len() >= MISC_HEADER_SIZE)
    else {
        warn!(
            offset = format_args!("{:#x}", entry.pointer_to_raw_data),
            "can't get misc debug information"
        );
        return None;
    };
    let mut r = FieldReader::new(raw);
    let data_type = r.u32();
    let length = r.u32();
    let unicode = r.u8() != 0;
    let body = &raw[MISC_HEADER_SIZE..];
    Some(MiscDebug {
        data_type,
        length,
        unicode,
        data: if unicode { utf16_nul(body) } else { cstr(body) },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{put32, ImageBuilder};

    #[test]
    fn test_misc_entry_read_by_file_offset() {
        let mut data = vec![0u8; 0x200];
        // Two entries: CODEVIEW (left alone) and MISC.
        put32(&mut data, 12, 2);
        put32(&mut data, 28 + 12, DEBUG_TYPE_MISC);
        put32(&mut data, 28 + 16, 0x20);
        put32(&mut data, 28 + 24, 0x500); // file offset of the payload
        put32(&mut data, 0x100, DEBUG_MISC_EXENAME);
        put32(&mut data, 0x104, 0x20);
        data[0x10c..0x114].copy_from_slice(b"app.exe\0");

        let bytes = ImageBuilder::pe32()
            .section(".rdata", 0x2000, 0x200, &data)
            .directory(DirectoryIndex::Debug, 0x2000, 56)
            .build();
        let image = PeImage::parse(&bytes).unwrap();
        let entries = decode(&image).unwrap().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(type_name(entries[0].kind), "CODEVIEW");
        assert_eq!(entries[0].misc, None);
        let misc = entries[1].misc.as_ref().unwrap();
        assert_eq!(misc.data_type, DEBUG_MISC_EXENAME);
        assert!(!misc.unicode);
        assert_eq!(misc.data, "app.exe");
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(16), "REPRO");
        assert_eq!(type_name(0), "UNKNOWN");
        assert_eq!(type_name(99), "UNKNOWN");
    }
}
