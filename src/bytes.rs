//! Little-endian field access over borrowed byte slices.
//!
//! Every multi-byte value in a PE image is little-endian and may sit at an
//! unaligned offset, so fields are reassembled from bytes rather than read
//! through struct casts.

use byteorder::{ByteOrder, LittleEndian};

#[inline]
pub(crate) fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset.checked_add(2)?).map(LittleEndian::read_u16)
}

#[inline]
pub(crate) fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset.checked_add(4)?).map(LittleEndian::read_u32)
}

#[inline]
pub(crate) fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset.checked_add(8)?).map(LittleEndian::read_u64)
}

/// Sequential reader used for fixed-layout records.
///
/// Reads past the end of the slice yield zero. Callers either hand it a
/// slice already validated to cover the record, or rely on the zero fill
/// on purpose (truncated optional headers).
pub(crate) struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn skip(&mut self, n: usize) -> &mut Self {
        self.pos += n;
        self
    }

    pub(crate) fn u8(&mut self) -> u8 {
        let v = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        v
    }

    pub(crate) fn u16(&mut self) -> u16 {
        let v = read_u16(self.data, self.pos).unwrap_or(0);
        self.pos += 2;
        v
    }

    pub(crate) fn u32(&mut self) -> u32 {
        let v = read_u32(self.data, self.pos).unwrap_or(0);
        self.pos += 4;
        v
    }

    pub(crate) fn u64(&mut self) -> u64 {
        let v = read_u64(self.data, self.pos).unwrap_or(0);
        self.pos += 8;
        v
    }

    /// Reads a pointer-sized field, widened to 64 bits.
    pub(crate) fn ptr(&mut self, is_64bit: bool) -> u64 {
        if is_64bit {
            self.u64()
        } else {
            self.u32() as u64
        }
    }
}

/// Decodes a NUL-terminated byte string, lossily.
pub(crate) fn cstr(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Decodes `units` UTF-16LE code units, lossily.
pub(crate) fn utf16(data: &[u8], units: usize) -> Option<String> {
    let raw = data.get(..units.checked_mul(2)?)?;
    let wide: Vec<u16> = raw.chunks_exact(2).map(LittleEndian::read_u16).collect();
    Some(String::from_utf16_lossy(&wide))
}

/// Decodes UTF-16LE up to the first NUL unit (or the end of the slice).
pub(crate) fn utf16_nul(data: &[u8]) -> String {
    let wide: Vec<u16> = data
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|&c| c != 0)
        .collect();
    String::from_utf16_lossy(&wide)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_reads() {
        let data = [0xff, 0x34, 0x12, 0x78, 0x56];
        assert_eq!(read_u16(&data, 1), Some(0x1234));
        assert_eq!(read_u32(&data, 1), Some(0x5678_1234));
        assert_eq!(read_u32(&data, 2), None);
        assert_eq!(read_u16(&data, usize::MAX), None);
    }

    #[test]
    fn test_field_reader_zero_fills() {
        let data = [0x0b, 0x01, 0x0e];
        let mut r = FieldReader::new(&data);
        assert_eq!(r.u16(), 0x010b);
        assert_eq!(r.u8(), 0x0e);
        assert_eq!(r.u32(), 0);
        assert_eq!(r.ptr(true), 0);
    }

    #[test]
    fn test_strings() {
        assert_eq!(cstr(b"KERNEL32.dll\0junk"), "KERNEL32.dll");
        assert_eq!(cstr(b"no-nul"), "no-nul");
        let wide = [b'h', 0, b'i', 0, 0, 0, b'x', 0];
        assert_eq!(utf16(&wide, 2).as_deref(), Some("hi"));
        assert_eq!(utf16(&wide, 5), None);
        assert_eq!(utf16_nul(&wide), "hi");
    }
}
