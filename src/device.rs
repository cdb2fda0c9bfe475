// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::error::BoxedError;
use alloc::boxed::Box;

#[cfg(feature = "std")]
use {
    std::fs::File,
    std::io::{Seek, SeekFrom},
};

/// Interface used by [`BlockDevice`] to read and write fixed-size
/// sectors of the underlying storage.
///
/// This is the "raw block device" collaborator that §1 marks out of
/// scope for the core: the core only consumes this interface, it does
/// not implement any particular backing store.
///
/// [`BlockDevice`]: crate::block::BlockDevice
pub trait SectorDevice {
    /// Number of bytes per sector. Fixed for the lifetime of the device.
    fn sector_size(&self) -> u32;

    /// Total number of sectors on the device.
    fn sector_count(&self) -> u64;

    /// Read `dst.len()` bytes starting at sector `sector_index`.
    ///
    /// `dst.len()` must be a multiple of [`Self::sector_size`].
    fn read_sectors(
        &mut self,
        sector_index: u64,
        dst: &mut [u8],
    ) -> Result<(), BoxedError>;

    /// Write `src` starting at sector `sector_index`.
    ///
    /// `src.len()` must be a multiple of [`Self::sector_size`].
    ///
    /// Returns an error if the device is read-only.
    fn write_sectors(
        &mut self,
        sector_index: u64,
        src: &[u8],
    ) -> Result<(), BoxedError>;

    /// Whether [`Self::write_sectors`] will always fail.
    fn is_read_only(&self) -> bool {
        false
    }
}

/// A [`SectorDevice`] backed by an in-memory buffer, a fixed sector
/// size, and a read-only flag. Used by tests and by callers who have
/// already loaded the whole device image into memory.
pub struct MemSectorDevice {
    data: alloc::vec::Vec<u8>,
    sector_size: u32,
    read_only: bool,
}

impl MemSectorDevice {
    #[must_use]
    pub fn new(data: alloc::vec::Vec<u8>, sector_size: u32) -> Self {
        Self {
            data,
            sector_size,
            read_only: false,
        }
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn into_inner(self) -> alloc::vec::Vec<u8> {
        self.data
    }
}

impl SectorDevice for MemSectorDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.data.len() as u64 / u64::from(self.sector_size)
    }

    fn read_sectors(
        &mut self,
        sector_index: u64,
        dst: &mut [u8],
    ) -> Result<(), BoxedError> {
        let start = sector_index * u64::from(self.sector_size);
        let start = usize::try_from(start)
            .map_err(|e| Box::new(e) as BoxedError)?;
        let end = start + dst.len();
        let src = self
            .data
            .get(start..end)
            .ok_or_else(|| -> BoxedError { "read past end of device".into() })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_sectors(
        &mut self,
        sector_index: u64,
        src: &[u8],
    ) -> Result<(), BoxedError> {
        if self.read_only {
            return Err("device is read-only".into());
        }
        let start = sector_index * u64::from(self.sector_size);
        let start = usize::try_from(start)
            .map_err(|e| Box::new(e) as BoxedError)?;
        let end = start + src.len();
        let dst = self
            .data
            .get_mut(start..end)
            .ok_or_else(|| -> BoxedError { "write past end of device".into() })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// A [`SectorDevice`] backed by a plain file, used by callers running
/// against a real console storage device or a raw image file.
#[cfg(feature = "std")]
pub struct FileSectorDevice {
    file: File,
    sector_size: u32,
    sector_count: u64,
    read_only: bool,
}

#[cfg(feature = "std")]
impl FileSectorDevice {
    /// Open `path` and compute the sector count from the file length.
    pub fn open(
        path: &std::path::Path,
        sector_size: u32,
        read_only: bool,
    ) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            sector_size,
            sector_count: len / u64::from(sector_size),
            read_only,
        })
    }
}

#[cfg(feature = "std")]
impl SectorDevice for FileSectorDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(
        &mut self,
        sector_index: u64,
        dst: &mut [u8],
    ) -> Result<(), BoxedError> {
        use std::io::Read;
        self.file
            .seek(SeekFrom::Start(sector_index * u64::from(self.sector_size)))
            .map_err(Box::new)?;
        self.file.read_exact(dst).map_err(Box::new)?;
        Ok(())
    }

    fn write_sectors(
        &mut self,
        sector_index: u64,
        src: &[u8],
    ) -> Result<(), BoxedError> {
        use std::io::Write;
        if self.read_only {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device is read-only",
            )));
        }
        self.file
            .seek(SeekFrom::Start(sector_index * u64::from(self.sector_size)))
            .map_err(Box::new)?;
        self.file.write_all(src).map_err(Box::new)?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_sector_device_round_trip() {
        let mut dev = MemSectorDevice::new(alloc::vec![0u8; 512 * 4], 512);
        dev.write_sectors(1, &[7u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        dev.read_sectors(1, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);
        assert_eq!(dev.sector_count(), 4);
    }

    #[test]
    fn test_mem_sector_device_read_only() {
        let dev = MemSectorDevice::new(alloc::vec![0u8; 512], 512).read_only();
        let mut dev = dev;
        assert!(dev.write_sectors(0, &[1u8; 512]).is_err());
    }
}
