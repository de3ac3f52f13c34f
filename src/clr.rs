//! CLR (COR20) header decoding.

use bitflags::bitflags;
use tracing::debug;

use crate::bytes::FieldReader;
use crate::error::Result;
use crate::image::PeImage;
use crate::pe::{DataDirectory, DirectoryIndex};

const COR20_HEADER_SIZE: u32 = 72;

bitflags! {
    /// `COMIMAGE_FLAGS_*`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ClrFlags: u32 {
        const ILONLY = 0x0000_0001;
        const REQUIRED_32BIT = 0x0000_0002;
        const IL_LIBRARY = 0x0000_0004;
        const STRONGNAMESIGNED = 0x0000_0008;
        const NATIVE_ENTRYPOINT = 0x0000_0010;
        const TRACKDEBUGDATA = 0x0001_0000;
    }
}

impl ClrFlags {
    /// Names of the set flags, in display order.
    pub fn names(self) -> Vec<&'static str> {
        [
            (Self::ILONLY, "ILONLY"),
            (Self::REQUIRED_32BIT, "32BITREQUIRED"),
            (Self::IL_LIBRARY, "IL_LIBRARY"),
            (Self::STRONGNAMESIGNED, "STRONGNAMESIGNED"),
            (Self::NATIVE_ENTRYPOINT, "NATIVE_ENTRYPOINT"),
            (Self::TRACKDEBUGDATA, "TRACKDEBUGDATA"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClrHeader {
    pub cb: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub metadata: DataDirectory,
    pub flags: ClrFlags,
    /// Entry point token, or an RVA when `NATIVE_ENTRYPOINT` is set.
    pub entry_point: u32,
    pub resources: DataDirectory,
    pub strong_name_signature: DataDirectory,
    pub code_manager_table: DataDirectory,
    pub vtable_fixups: DataDirectory,
    pub export_address_table_jumps: DataDirectory,
    pub managed_native_header: DataDirectory,
}

impl ClrHeader {
    /// The data directories in declaration order, with display names.
    pub fn directories(&self) -> [(&'static str, DataDirectory); 7] {
        [
            ("MetaData", self.metadata),
            ("Resources", self.resources),
            ("StrongNameSignature", self.strong_name_signature),
            ("CodeManagerTable", self.code_manager_table),
            ("VTableFixups", self.vtable_fixups),
            ("ExportAddressTableJumps", self.export_address_table_jumps),
            ("ManagedNativeHeader", self.managed_native_header),
        ]
    }
}

pub fn decode(image: &PeImage<'_>) -> Result<Option<ClrHeader>> {
    let Some(dir) = image.directory(DirectoryIndex::ClrHeader)? else {
        return Ok(None);
    };
    let raw = image.require("CLR header", dir.rva, COR20_HEADER_SIZE)?;
    let mut r = FieldReader::new(raw);
    let header = ClrHeader {
        cb: r.u32(),
        major_runtime_version: r.u16(),
        minor_runtime_version: r.u16(),
        metadata: DataDirectory::read(&mut r),
        flags: ClrFlags::from_bits_retain(r.u32()),
        entry_point: r.u32(),
        resources: DataDirectory::read(&mut r),
        strong_name_signature: DataDirectory::read(&mut r),
        code_manager_table: DataDirectory::read(&mut r),
        vtable_fixups: DataDirectory::read(&mut r),
        export_address_table_jumps: DataDirectory::read(&mut r),
        managed_native_header: DataDirectory::read(&mut r),
    };
    debug!(flags = header.flags.bits(), "decoded CLR header");
    Ok(Some(header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{put16, put32, ImageBuilder};

    #[test]
    fn test_clr_header() {
        let mut data = vec![0u8; 0x100];
        put32(&mut data, 0, 72);
        put16(&mut data, 4, 2);
        put16(&mut data, 6, 5);
        put32(&mut data, 8, 0x2050);
        put32(&mut data, 12, 0x600);
        put32(&mut data, 16, 0x0000_0009);
        put32(&mut data, 20, 0x0600_0001);
        put32(&mut data, 64, 0x2800);

        let bytes = ImageBuilder::pe32()
            .section(".text", 0x2000, 0x100, &data)
            .directory(DirectoryIndex::ClrHeader, 0x2000, 72)
            .build();
        let image = PeImage::parse(&bytes).unwrap();
        let clr = decode(&image).unwrap().unwrap();
        assert_eq!((clr.major_runtime_version, clr.minor_runtime_version), (2, 5));
        assert_eq!(clr.metadata, DataDirectory { virtual_address: 0x2050, size: 0x600 });
        assert_eq!(clr.flags.names(), vec!["ILONLY", "STRONGNAMESIGNED"]);
        assert_eq!(clr.entry_point, 0x0600_0001);
        assert_eq!(clr.directories()[6].1.virtual_address, 0x2800);
    }
}
