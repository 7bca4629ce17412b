//! Block device boundary: whole-sector reads, nothing else.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use tracing::trace;

use crate::{Error, Result};

pub const DEFAULT_SECTOR_SIZE: u32 = 512;

pub trait BlockDevice {
    /// Physical sector size in bytes. Reads are issued in multiples of it.
    fn sector_size(&self) -> u32;

    /// Fills `buf` starting at `sector`. `buf.len()` is a multiple of
    /// [`BlockDevice::sector_size`].
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_sectors(sector, buf)
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_sectors(sector, buf)
    }
}

/// Reads `buf.len()` bytes at an arbitrary byte offset, widening the request
/// to whole sectors.
pub fn read_bytes<D: BlockDevice + ?Sized>(device: &D, offset: u64, buf: &mut [u8]) -> Result<()> {
    let sector_size = u64::from(device.sector_size());
    if sector_size == 0 {
        return Err(Error::Io {
            sector: 0,
            reason: String::from("device reports a zero sector size"),
        });
    }
    let sector = offset / sector_size;
    let lead = (offset % sector_size) as usize;
    let span = (lead + buf.len()).div_ceil(sector_size as usize) * sector_size as usize;
    trace!(offset, len = buf.len(), sector, span, "device read");

    if lead == 0 && span == buf.len() {
        return device.read_sectors(sector, buf);
    }
    let mut scratch = vec![0u8; span];
    device.read_sectors(sector, &mut scratch)?;
    buf.copy_from_slice(&scratch[lead..lead + buf.len()]);
    Ok(())
}

/// Where a volume starts on its device and how the device is addressed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VolumeOptions {
    /// Byte offset of the HFS Plus partition inside the image.
    pub partition_offset: u64,
    pub sector_size: u32,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            partition_offset: 0,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }
}

/// An image held in memory.
pub struct MemoryDevice<T> {
    data: T,
    sector_size: u32,
}

impl<T: AsRef<[u8]>> MemoryDevice<T> {
    pub fn new(data: T) -> Self {
        Self::with_sector_size(data, DEFAULT_SECTOR_SIZE)
    }

    pub fn with_sector_size(data: T, sector_size: u32) -> Self {
        Self { data, sector_size }
    }
}

impl<T: AsRef<[u8]>> BlockDevice for MemoryDevice<T> {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.as_ref();
        if self.sector_size == 0 {
            return Err(Error::Io {
                sector,
                reason: String::from("device reports a zero sector size"),
            });
        }
        if buf.len() % self.sector_size as usize != 0 {
            return Err(Error::Io {
                sector,
                reason: format!("{}-byte read is not sector aligned", buf.len()),
            });
        }
        let start = sector
            .checked_mul(u64::from(self.sector_size))
            .and_then(|s| usize::try_from(s).ok());
        match start.and_then(|s| Some(s..s.checked_add(buf.len())?)) {
            Some(range) if range.end <= data.len() => {
                buf.copy_from_slice(&data[range]);
                Ok(())
            }
            _ => Err(Error::Io {
                sector,
                reason: format!("read past the end of a {}-byte image", data.len()),
            }),
        }
    }
}

#[cfg(not(target_os = "none"))]
pub use self::hosted::StdDevice;

#[cfg(not(target_os = "none"))]
mod hosted {
    use super::{BlockDevice, VolumeOptions};
    use crate::{Error, Result};
    use alloc::string::ToString;
    use spin::Mutex;
    use std::io::{Read, Seek, SeekFrom};

    /// A seekable stream, such as an image file, shared behind a lock.
    pub struct StdDevice<F> {
        inner: Mutex<F>,
        options: VolumeOptions,
    }

    impl<F: Read + Seek> StdDevice<F> {
        pub fn new(inner: F) -> Self {
            Self::with_options(inner, VolumeOptions::default())
        }

        pub fn with_options(inner: F, options: VolumeOptions) -> Self {
            Self {
                inner: Mutex::new(inner),
                options,
            }
        }

        pub fn options(&self) -> VolumeOptions {
            self.options
        }
    }

    impl<F: Read + Seek> BlockDevice for StdDevice<F> {
        fn sector_size(&self) -> u32 {
            self.options.sector_size
        }

        fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
            let position = sector
                .checked_mul(u64::from(self.options.sector_size))
                .and_then(|bytes| bytes.checked_add(self.options.partition_offset))
                .ok_or_else(|| Error::Io {
                    sector,
                    reason: "sector lies beyond the addressable range".to_string(),
                })?;
            let mut file = self.inner.lock();
            file.seek(SeekFrom::Start(position))
                .and_then(|_| file.read_exact(buf))
                .map_err(|e| Error::Io {
                    sector,
                    reason: e.to_string(),
                })
        }
    }
}
