//! Bounds-checked big-endian reads at fixed offsets of an in-memory buffer.

use alloc::format;

use crate::{Error, Result};

pub trait ReadBeExt {
    /// Borrows `len` bytes at `offset`, failing with [`Error::Corrupt`]
    /// rather than reading past the end of the buffer.
    fn bytes_at(&self, offset: usize, len: usize) -> Result<&[u8]>;

    fn read_u8_at(&self, offset: usize) -> Result<u8> {
        Ok(self.bytes_at(offset, 1)?[0])
    }

    fn read_i8_at(&self, offset: usize) -> Result<i8> {
        Ok(self.bytes_at(offset, 1)?[0] as i8)
    }

    fn read_u16_be_at(&self, offset: usize) -> Result<u16> {
        let b = self.bytes_at(offset, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_i16_be_at(&self, offset: usize) -> Result<i16> {
        let b = self.bytes_at(offset, 2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32_be_at(&self, offset: usize) -> Result<u32> {
        let b = self.bytes_at(offset, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64_be_at(&self, offset: usize) -> Result<u64> {
        let b = self.bytes_at(offset, 8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

impl ReadBeExt for [u8] {
    fn bytes_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.get(offset..end))
            .ok_or_else(|| {
                Error::Corrupt(format!(
                    "{len}-byte read at offset {offset} overruns a {}-byte buffer",
                    self.len()
                ))
            })
    }
}
