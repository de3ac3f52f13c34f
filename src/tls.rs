//! TLS directory decoding.

use tracing::{debug, warn};

use crate::bytes::FieldReader;
use crate::error::{Error, Result};
use crate::image::PeImage;
use crate::pe::DirectoryIndex;

const TLS32_SIZE: u32 = 24;
const TLS64_SIZE: u32 = 40;

/// `IMAGE_TLS_DIRECTORY`, widened to 64-bit addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsDirectory {
    pub start_address_of_raw_data: u64,
    pub end_address_of_raw_data: u64,
    pub address_of_index: u64,
    pub address_of_callbacks: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
    /// Callback VAs up to the terminating zero.
    pub callbacks: Vec<u64>,
}

impl TlsDirectory {
    pub fn raw_data_size(&self) -> u64 {
        self.end_address_of_raw_data
            .wrapping_sub(self.start_address_of_raw_data)
    }
}

pub fn decode(image: &PeImage<'_>) -> Result<Option<TlsDirectory>> {
    let Some(dir) = image.directory(DirectoryIndex::Tls)? else {
        return Ok(None);
    };
    let is_64bit = image.is_64bit();
    let size = if is_64bit { TLS64_SIZE } else { TLS32_SIZE };
    let raw = image.resolve_rva(dir.rva, size).ok_or_else(|| Error::Truncated {
        what: "TLS directory",
        offset: image.file_offset(dir.rva).unwrap_or_default(),
    })?;

    let mut r = FieldReader::new(raw);
    let mut tls = TlsDirectory {
        start_address_of_raw_data: r.ptr(is_64bit),
        end_address_of_raw_data: r.ptr(is_64bit),
        address_of_index: r.ptr(is_64bit),
        address_of_callbacks: r.ptr(is_64bit),
        size_of_zero_fill: r.u32(),
        characteristics: r.u32(),
        callbacks: Vec::new(),
    };

    if tls.address_of_callbacks != 0 {
        match image.va_to_rva(tls.address_of_callbacks) {
            Some(mut rva) => {
                while let Some(callback) = image.read_ptr(rva) {
                    if callback == 0 {
                        break;
                    }
                    tls.callbacks.push(callback);
                    rva = rva.wrapping_add(image.pointer_size());
                }
            }
            None => warn!(
                va = format_args!("{:#x}", tls.address_of_callbacks),
                "TLS callback array below image base"
            ),
        }
    }

    debug!(callbacks = tls.callbacks.len(), "decoded TLS directory");
    Ok(Some(tls))
}
