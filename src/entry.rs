// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `EntryMetadata`, the fixed-size record attached to every name in a
//! directory trie leaf (§4.6, §4.8). Grounded on `structs.h`'s
//! `EntryMetadata`/`Permissions`.

use crate::error::{CorruptKind, WfsError};
use crate::util::{read_u32be, write_u32be};
use alloc::vec::Vec;
use bitflags::bitflags;

/// Size of the fixed part of an on-disk `EntryMetadata` record. The
/// variable-length case bitmap (`ceil(filename_length / 8)` bytes)
/// follows immediately at this offset.
pub(crate) const FIXED_LEN: usize = 43;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct EntryFlags: u32 {
        const UNENCRYPTED_FILE = 0x0200_0000;
        const LINK = 0x0400_0000;
        const AREA_SIZE_BASIC = 0x1000_0000;
        const AREA_SIZE_REGULAR = 0x2000_0000;
        const QUOTA = 0x4000_0000;
        const DIRECTORY = 0x8000_0000;
    }
}

/// `owner`/`group`/`mode`, 12 bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Permissions {
    pub(crate) owner: u32,
    pub(crate) group: u32,
    pub(crate) mode: u32,
}

impl Permissions {
    pub(crate) const LEN: usize = 12;

    pub(crate) fn read(bytes: &[u8]) -> Self {
        Self {
            owner: read_u32be(bytes, 0),
            group: read_u32be(bytes, 4),
            mode: read_u32be(bytes, 8),
        }
    }

    pub(crate) fn write(&self, bytes: &mut [u8]) {
        write_u32be(bytes, 0, self.owner);
        write_u32be(bytes, 4, self.group);
        write_u32be(bytes, 8, self.mode);
    }
}

/// Fixed-size portion of `EntryMetadata` (§3 "metadata record"). The
/// `file_size` and `quota_blocks_count` fields in the original are a
/// union over the same 4 bytes; callers pick the interpretation based
/// on `flags`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct EntryMetadata {
    pub(crate) flags: EntryFlags,
    pub(crate) size_on_disk: u32,
    pub(crate) ctime: u32,
    pub(crate) mtime: u32,
    pub(crate) unknown: u32,
    /// `file_size` for a file/link, `quota_blocks_count` for a quota.
    pub(crate) size_or_quota_blocks: u32,
    /// Metadata block number of this entry's directory, if it is one.
    pub(crate) directory_block_number: u32,
    pub(crate) permissions: Permissions,
    /// log2 of the total size of this metadata record, including the
    /// case bitmap.
    pub(crate) metadata_log2_size: u8,
    /// Storage category selector, 0-4 (§4.7).
    pub(crate) size_category: u8,
    pub(crate) filename_length: u8,
}

impl EntryMetadata {
    pub(crate) fn is_directory(&self) -> bool {
        self.flags.contains(EntryFlags::DIRECTORY)
    }

    pub(crate) fn is_link(&self) -> bool {
        self.flags.contains(EntryFlags::LINK)
    }

    pub(crate) fn is_quota(&self) -> bool {
        self.flags.contains(EntryFlags::QUOTA)
    }

    /// Number of bytes in the trailing case bitmap, `ceil(filename_length / 8)`.
    pub(crate) fn case_bitmap_len(&self) -> usize {
        usize::from(self.filename_length).div_ceil(8)
    }

    /// Total serialized length: fixed part plus the case bitmap.
    pub(crate) fn serialized_len(&self) -> usize {
        FIXED_LEN + self.case_bitmap_len()
    }

    /// Parse a fixed-part record, rejecting a `size_category` outside
    /// the five storage categories §4.7 defines (0-4).
    pub(crate) fn read(bytes: &[u8]) -> Result<Self, WfsError> {
        let size_category = bytes[41];
        if size_category > 4 {
            return Err(CorruptKind::FileMetadata.into());
        }
        Ok(Self {
            flags: EntryFlags::from_bits_truncate(read_u32be(bytes, 0)),
            size_on_disk: read_u32be(bytes, 4),
            ctime: read_u32be(bytes, 8),
            mtime: read_u32be(bytes, 12),
            unknown: read_u32be(bytes, 16),
            size_or_quota_blocks: read_u32be(bytes, 20),
            directory_block_number: read_u32be(bytes, 24),
            permissions: Permissions::read(&bytes[28..28 + Permissions::LEN]),
            metadata_log2_size: bytes[40],
            size_category,
            filename_length: bytes[42],
        })
    }

    pub(crate) fn write(&self, bytes: &mut [u8]) {
        write_u32be(bytes, 0, self.flags.bits());
        write_u32be(bytes, 4, self.size_on_disk);
        write_u32be(bytes, 8, self.ctime);
        write_u32be(bytes, 12, self.mtime);
        write_u32be(bytes, 16, self.unknown);
        write_u32be(bytes, 20, self.size_or_quota_blocks);
        write_u32be(bytes, 24, self.directory_block_number);
        self.permissions.write(&mut bytes[28..28 + Permissions::LEN]);
        bytes[40] = self.metadata_log2_size;
        bytes[41] = self.size_category;
        bytes[42] = self.filename_length;
    }
}

/// Public, read-only view of an [`EntryMetadata`] record, the same
/// "byte record inside, ergonomic type outside" split the teacher's
/// `Metadata` wraps an `Inode` with.
pub struct Metadata(pub(crate) EntryMetadata);

impl Metadata {
    /// Returns true if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.0.is_directory()
    }

    /// Returns true if this entry is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.0.is_link()
    }

    /// Size in bytes of a regular file's content.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        u64::from(self.0.size_on_disk)
    }

    /// UNIX-style permission bits.
    pub fn mode(&self) -> u32 {
        self.0.permissions.mode
    }

    /// Owning user id.
    pub fn owner(&self) -> u32 {
        self.0.permissions.owner
    }

    /// Owning group id.
    pub fn group(&self) -> u32 {
        self.0.permissions.group
    }

    /// Creation time, in the device's native timestamp units.
    pub fn ctime(&self) -> u32 {
        self.0.ctime
    }

    /// Last-modified time, in the device's native timestamp units.
    pub fn mtime(&self) -> u32 {
        self.0.mtime
    }
}

/// Reconstruct the original-case filename from the lower-cased trie
/// key plus the trailing case bitmap (one bit per byte of `name`, set
/// when that byte was originally upper-case). Grounded on
/// `Entry::GetCaseSensitiveName` (`original_source/src/entry.cpp`).
pub(crate) fn apply_case_bitmap(name: &[u8], case_bitmap: &[u8]) -> Vec<u8> {
    let mut out = name.to_vec();
    for (i, byte) in out.iter_mut().enumerate() {
        let bit = case_bitmap
            .get(i / 8)
            .is_some_and(|b| (b >> (i % 8)) & 1 != 0);
        if bit && byte.is_ascii_lowercase() {
            *byte = byte.to_ascii_uppercase();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EntryMetadata {
        EntryMetadata {
            flags: EntryFlags::DIRECTORY,
            size_on_disk: 4096,
            ctime: 1,
            mtime: 2,
            unknown: 0,
            size_or_quota_blocks: 0,
            directory_block_number: 7,
            permissions: Permissions {
                owner: 0,
                group: 0,
                mode: 0o755,
            },
            metadata_log2_size: 6,
            size_category: 0,
            filename_length: 5,
        }
    }

    #[test]
    fn test_entry_metadata_round_trip() {
        let entry = sample();
        let mut buf = [0u8; FIXED_LEN];
        entry.write(&mut buf);
        let parsed = EntryMetadata::read(&buf).unwrap();
        assert_eq!(parsed, entry);
        assert!(parsed.is_directory());
        assert_eq!(parsed.case_bitmap_len(), 1);
    }

    #[test]
    fn test_entry_metadata_rejects_bad_size_category() {
        let mut entry = sample();
        entry.size_category = 5;
        let mut buf = [0u8; FIXED_LEN];
        entry.write(&mut buf);
        let err = EntryMetadata::read(&buf).unwrap_err();
        assert_eq!(err, CorruptKind::FileMetadata);
    }

    #[test]
    fn test_apply_case_bitmap() {
        // "hello", bit 0 set (capitalize 'h').
        let out = apply_case_bitmap(b"hello", &[0b0000_0001]);
        assert_eq!(out, b"Hello");
    }
}
