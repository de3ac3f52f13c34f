//! Export directory decoding.

use tracing::debug;

use crate::bytes::{read_u16, read_u32, FieldReader};
use crate::error::Result;
use crate::image::PeImage;
use crate::pe::DirectoryIndex;

const EXPORT_DIRECTORY_SIZE: u32 = 40;

/// What an export slot points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportTarget {
    Code,
    /// Forwarded to `DLL.Symbol`; `None` if the string itself can't be read.
    Forwarder(Option<String>),
}

/// One populated slot of the export address table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
    pub ordinal: u32,
    pub rva: u32,
    /// `None` for exports by ordinal only.
    pub name: Option<String>,
    pub target: ExportTarget,
}

impl Export {
    pub fn is_forwarder(&self) -> bool {
        matches!(self.target, ExportTarget::Forwarder(_))
    }
}

/// Decoded `IMAGE_EXPORT_DIRECTORY` with its resolved table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportDirectory {
    pub name: Option<String>,
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
    pub exports: Vec<Export>,
}

/// Decode the export directory, or `Ok(None)` if the image has none.
///
/// Fails if the directory header or the function address table can't be
/// resolved. Unreadable name tables degrade to ordinal-only exports.
pub fn decode(image: &PeImage<'_>) -> Result<Option<ExportDirectory>> {
    let Some(dir) = image.directory(DirectoryIndex::Export)? else {
        return Ok(None);
    };
    let header = image.require("export directory", dir.rva, EXPORT_DIRECTORY_SIZE)?;

    let mut r = FieldReader::new(header);
    let characteristics = r.u32();
    let time_date_stamp = r.u32();
    let major_version = r.u16();
    let minor_version = r.u16();
    let name_rva = r.u32();
    let base = r.u32();
    let number_of_functions = r.u32();
    let number_of_names = r.u32();
    let address_of_functions = r.u32();
    let address_of_names = r.u32();
    let address_of_name_ordinals = r.u32();

    let functions = image.require(
        "functions' address table",
        address_of_functions,
        number_of_functions.saturating_mul(4),
    )?;

    let names = image.resolve_rva(address_of_names, number_of_names.saturating_mul(4));
    let ordinals = image.resolve_rva(address_of_name_ordinals, number_of_names.saturating_mul(2));

    // First name wins when several point at the same slot.
    let mut slot_names: Vec<Option<u32>> = vec![None; number_of_functions as usize];
    if let (Some(names), Some(ordinals)) = (names, ordinals) {
        for i in 0..number_of_names as usize {
            let (Some(index), Some(name_rva)) = (read_u16(ordinals, i * 2), read_u32(names, i * 4)) else {
                break;
            };
            if let Some(slot @ None) = slot_names.get_mut(index as usize) {
                *slot = Some(name_rva);
            }
        }
    }

    let exports = slot_names
        .iter()
        .enumerate()
        .filter_map(|(i, name_rva)| {
            let rva = read_u32(functions, i * 4)?;
            if rva == 0 {
                return None;
            }
            let target = if dir.contains(rva) {
                ExportTarget::Forwarder(image.read_cstr(rva))
            } else {
                ExportTarget::Code
            };
            Some(Export {
                ordinal: base.wrapping_add(i as u32),
                rva,
                name: name_rva.and_then(|n| image.read_cstr(n)),
                target,
            })
        })
        .collect::<Vec<_>>();

    debug!(functions = number_of_functions, exported = exports.len(), "decoded export directory");

    Ok(Some(ExportDirectory {
        name: image.read_cstr(name_rva),
        characteristics,
        time_date_stamp,
        major_version,
        minor_version,
        base,
        number_of_functions,
        number_of_names,
        address_of_functions,
        address_of_names,
        address_of_name_ordinals,
        exports,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testutil::{put16, put32, ImageBuilder};

    /// Export directory at 0x1100 with three slots: code, forwarder, and
    /// an ordinal-only export. Two names alias slot 0.
    fn export_image(dir_size: u32) -> Vec<u8> {
        let mut text = vec![0u8; 0x400];
        let d = 0x100;
        put32(&mut text, d + 12, 0x1180); // Name
        put32(&mut text, d + 16, 5); // Base
        put32(&mut text, d + 20, 3); // NumberOfFunctions
        put32(&mut text, d + 24, 3); // NumberOfNames
        put32(&mut text, d + 28, 0x1140);
        put32(&mut text, d + 32, 0x1150);
        put32(&mut text, d + 36, 0x1160);

        put32(&mut text, 0x140, 0x1010);
        put32(&mut text, 0x144, 0x11a0);
        put32(&mut text, 0x148, 0x1020);

        put32(&mut text, 0x150, 0x1190);
        put32(&mut text, 0x154, 0x11c0);
        put32(&mut text, 0x158, 0x11d0);
        put16(&mut text, 0x160, 0);
        put16(&mut text, 0x162, 1);
        put16(&mut text, 0x164, 0);

        text[0x180..0x188].copy_from_slice(b"foo.dll\0");
        text[0x190..0x194].copy_from_slice(b"Foo\0");
        text[0x1a0..0x1ae].copy_from_slice(b"NTDLL.RtlFoo\0\0");
        text[0x1c0..0x1c4].copy_from_slice(b"Fwd\0");
        text[0x1d0..0x1d6].copy_from_slice(b"Alias\0");

        ImageBuilder::pe32()
            .section(".text", 0x1000, 0x400, &text)
            .directory(DirectoryIndex::Export, 0x1100, dir_size)
            .build()
    }

    #[test]
    fn test_forwarder_classification() {
        let bytes = export_image(0x100);
        let image = PeImage::parse(&bytes).unwrap();
        let dir = decode(&image).unwrap().unwrap();
        assert_eq!(dir.name.as_deref(), Some("foo.dll"));
        assert_eq!(dir.exports.len(), 3);

        let foo = &dir.exports[0];
        assert_eq!((foo.ordinal, foo.rva, foo.name.as_deref()), (5, 0x1010, Some("Foo")));
        assert_eq!(foo.target, ExportTarget::Code);

        let fwd = &dir.exports[1];
        assert_eq!(fwd.name.as_deref(), Some("Fwd"));
        assert_eq!(fwd.target, ExportTarget::Forwarder(Some("NTDLL.RtlFoo".into())));

        let by_ordinal = &dir.exports[2];
        assert_eq!((by_ordinal.ordinal, by_ordinal.name.as_deref()), (7, None));
    }

    #[test]
    fn test_forwarder_window_uses_directory_size() {
        // The forwarder string at 0x11a0 lies past a 0x40-byte directory.
        let bytes = export_image(0x40);
        let image = PeImage::parse(&bytes).unwrap();
        let dir = decode(&image).unwrap().unwrap();
        assert_eq!(dir.exports[1].target, ExportTarget::Code);
    }

    #[test]
    fn test_unmapped_function_table_fails() {
        let mut bytes = export_image(0x100);
        // AddressOfFunctions -> unmapped RVA.
        put32(&mut bytes, 0x400 + 0x100 + 28, 0x8000);
        let image = PeImage::parse(&bytes).unwrap();
        assert!(matches!(
            decode(&image),
            Err(Error::Unresolved { what: "functions' address table", rva: 0x8000, .. })
        ));
    }

    #[test]
    fn test_no_export_directory() {
        let bytes = ImageBuilder::pe32().section(".text", 0x1000, 0x200, &[]).build();
        let image = PeImage::parse(&bytes).unwrap();
        assert_eq!(decode(&image).unwrap(), None);
    }
}
