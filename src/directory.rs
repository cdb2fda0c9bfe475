// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The higher-level entry/directory/file/link model (§4.8) that
//! `WfsDevice` exposes, built on top of [`EntryMetadata`] and
//! [`DirectoryTree`].

use crate::block_size::BlockSizeLog2;
use crate::dirtree::DirectoryTree;
use crate::entry::EntryMetadata;
use crate::error::WfsError;
use crate::file::{FileResizer, StorageCategory};
use crate::path::PathBuf;
use alloc::string::String;
use alloc::vec::Vec;

/// A resolved filesystem object: a regular file's bytes, a directory's
/// trie, or a symbolic link's target.
pub(crate) enum Entry {
    File(File),
    Directory(Directory),
    Link(Link),
}

impl Entry {
    pub(crate) fn metadata(&self) -> &EntryMetadata {
        match self {
            Self::File(f) => &f.metadata,
            Self::Directory(d) => &d.metadata,
            Self::Link(l) => &l.metadata,
        }
    }

    pub(crate) fn as_file(&self) -> Result<&File, WfsError> {
        match self {
            Self::File(f) => Ok(f),
            _ => Err(WfsError::NotFile),
        }
    }

    pub(crate) fn as_directory(&self) -> Result<&Directory, WfsError> {
        match self {
            Self::Directory(d) => Ok(d),
            _ => Err(WfsError::NotDirectory),
        }
    }
}

/// A directory's contents: the name-to-metadata trie plus the
/// directory's own metadata record.
pub(crate) struct Directory {
    pub(crate) metadata: EntryMetadata,
    tree: DirectoryTree,
}

impl Directory {
    pub(crate) fn new(metadata: EntryMetadata) -> Self {
        Self {
            metadata,
            tree: DirectoryTree::new(),
        }
    }

    pub(crate) fn entries_count(&self) -> u32 {
        self.tree.records_count()
    }

    pub(crate) fn get_entry(&self, name: &[u8]) -> Result<(Vec<u8>, &EntryMetadata), WfsError> {
        self.tree.find(name).ok_or(WfsError::ItemNotFound)
    }

    /// Add a new name, rejecting a name that already exists (§4.6 "no
    /// implicit overwrite on create").
    pub(crate) fn create_entry(
        &mut self,
        name: &[u8],
        metadata: EntryMetadata,
    ) -> Result<(), WfsError> {
        if self.tree.find(name).is_some() {
            return Err(WfsError::Io(alloc::boxed::Box::new(EntryExists)));
        }
        self.tree.insert(name, metadata)?;
        Ok(())
    }

    pub(crate) fn remove_entry(&mut self, name: &[u8]) -> Result<EntryMetadata, WfsError> {
        self.tree.remove(name).ok_or(WfsError::ItemNotFound)
    }

    pub(crate) fn entries(&self) -> Vec<(Vec<u8>, &EntryMetadata)> {
        self.tree.iter()
    }
}

#[derive(Debug)]
struct EntryExists;

impl core::fmt::Display for EntryExists {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "an entry with that name already exists")
    }
}

impl core::error::Error for EntryExists {}

/// A regular file's content and storage category (§4.7).
pub(crate) struct File {
    pub(crate) metadata: EntryMetadata,
    data: Vec<u8>,
    /// The contiguous run of device blocks backing `data`, allocated
    /// and freed by `WfsDevice` through its `FreeBlocksAllocator` as
    /// the file grows and shrinks. `None` for an empty file.
    pub(crate) storage_extent: Option<(u64, u64)>,
}

impl File {
    pub(crate) fn new(metadata: EntryMetadata) -> Self {
        Self {
            metadata,
            data: Vec::new(),
            storage_extent: None,
        }
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Grow or shrink the file, migrating [`StorageCategory`] as needed
    /// (§4.7 point 3).
    pub(crate) fn resize(&mut self, new_len: usize, block_size_log2: BlockSizeLog2) {
        self.data = FileResizer::migrate(&self.data, new_len);
        self.metadata.size_on_disk = new_len as u32;
        self.metadata.size_category =
            StorageCategory::for_size(new_len as u64, block_size_log2) as u8;
    }

    /// Overwrite `buf.len()` bytes starting at `offset`, growing the
    /// file (and migrating category) first if `offset + buf.len()`
    /// exceeds the current length.
    pub(crate) fn write_at(
        &mut self,
        offset: usize,
        buf: &[u8],
        block_size_log2: BlockSizeLog2,
    ) {
        let end = offset + buf.len();
        if end > self.data.len() {
            self.resize(end, block_size_log2);
        }
        self.data[offset..end].copy_from_slice(buf);
    }
}

/// A symbolic link: a stored target path, resolved lazily by the
/// caller (§4.8's link-following rule lives in `WfsDevice`, not here).
pub(crate) struct Link {
    pub(crate) metadata: EntryMetadata,
    pub(crate) target: PathBuf,
}

impl Link {
    pub(crate) fn new(metadata: EntryMetadata, target: PathBuf) -> Self {
        Self { metadata, target }
    }

    pub(crate) fn target_string(&self) -> String {
        String::from_utf8_lossy(self.target.as_path().as_bytes()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryFlags, Permissions};
    use crate::path::PathBuf;
    use core::convert::TryFrom;

    fn metadata(flags: EntryFlags) -> EntryMetadata {
        EntryMetadata {
            flags,
            size_on_disk: 0,
            ctime: 0,
            mtime: 0,
            unknown: 0,
            size_or_quota_blocks: 0,
            directory_block_number: 0,
            permissions: Permissions {
                owner: 0,
                group: 0,
                mode: 0,
            },
            metadata_log2_size: 0,
            size_category: 0,
            filename_length: 0,
        }
    }

    #[test]
    fn test_directory_create_reject_duplicate() {
        let mut dir = Directory::new(metadata(EntryFlags::DIRECTORY));
        let mut entry = metadata(EntryFlags::empty());
        entry.filename_length = 5;
        dir.create_entry(b"a.txt", entry.clone()).unwrap();
        assert!(dir.create_entry(b"a.txt", entry).is_err());
        assert_eq!(dir.entries_count(), 1);
    }

    #[test]
    fn test_directory_get_missing_entry() {
        let dir = Directory::new(metadata(EntryFlags::DIRECTORY));
        assert!(matches!(
            dir.get_entry(b"missing"),
            Err(WfsError::ItemNotFound)
        ));
    }

    #[test]
    fn test_file_resize_updates_category() {
        let mut file = File::new(metadata(EntryFlags::empty()));
        file.resize(10, BlockSizeLog2::PHYSICAL);
        assert_eq!(file.metadata.size_category, StorageCategory::Inline as u8);
        file.resize(5000, BlockSizeLog2::PHYSICAL);
        assert_eq!(file.metadata.size_category, StorageCategory::Single as u8);
        assert_eq!(file.len(), 5000);
    }

    #[test]
    fn test_file_write_at_grows() {
        let mut file = File::new(metadata(EntryFlags::empty()));
        file.write_at(0, b"hello", BlockSizeLog2::PHYSICAL);
        assert_eq!(file.data(), b"hello");
        file.write_at(5, b" world", BlockSizeLog2::PHYSICAL);
        assert_eq!(file.data(), b"hello world");
    }

    #[test]
    fn test_link_target_round_trip() {
        let target = PathBuf::try_from("/a/b").unwrap();
        let link = Link::new(metadata(EntryFlags::LINK), target);
        assert_eq!(link.target_string(), "/a/b");
    }
}
