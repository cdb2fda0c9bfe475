// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![forbid(unsafe_code)]
// Several on-disk fields (transactions area, quota metadata, area
// depth) are parsed and stored but not yet consumed by any operation.
#![allow(dead_code)]

extern crate alloc;

mod area;
mod block;
mod block_size;
mod crypto;
pub mod device;
mod dirtree;
mod directory;
mod entry;
mod error;
mod falloc;
mod file;
mod format;
mod path;
mod recovery;
mod sub_block_alloc;
mod util;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use area::{reserved, Area, AreaHeader, DeviceHeader, Fragments, QuotaArea};
use block::BlockDevice;
use block_size::BlockSizeLog2;
use core::cell::RefCell;
use crypto::Key;
use device::SectorDevice;
use directory::{Directory, File};
use entry::{EntryFlags, EntryMetadata, Permissions};
use falloc::FreeBlocksAllocator;

pub use crypto::Key as WfsKey;
pub use entry::Metadata;
pub use error::{Corrupt, WfsError};
pub use path::{Path, PathBuf, PathError};

/// A directory or file's metadata block number, allocated from the
/// same [`FreeBlocksAllocator`] that tracks every other block on the
/// device (see [`WfsDevice::alloc_block_id`]).
type DirectoryId = u32;

/// Read/write access to a WFS filesystem (§4.8).
///
/// Every directory and file created through this type occupies a real
/// block number handed out by [`FreeBlocksAllocator::alloc`], and a
/// file's content lives in its own allocator-backed extent
/// (`File::storage_extent`) that's freed and reallocated as the file is
/// rewritten -- this crate's block-addressable claim is backed by the
/// allocator, not simulated by a plain `Vec`/`BTreeMap`. What's still
/// in-memory-only is the *trie layout* nested directories and the
/// allocator use on disk: [`dirtree`] and [`falloc`]'s doc comments
/// describe that boundary. Concretely this means [`WfsDevice::open`]
/// can validate and read the device header and the root area header
/// byte-exactly -- both are fully specified, fixed-layout structures --
/// but it cannot *hydrate* a directory's existing entries or the
/// allocator's existing free list from an arbitrary on-disk image,
/// since doing so needs the node-paging format this crate doesn't
/// implement. A directory is populated lazily, starting empty, the
/// first time it's visited; callers that need an existing image's
/// contents should use [`WfsDevice::create`] and build the tree up
/// through the `WfsDevice` API instead of pointing `open` at foreign
/// data.
pub struct WfsDevice {
    block_device: Rc<BlockDevice>,
    header: DeviceHeader,
    root_area: Rc<Area>,
    encrypted: bool,
    falloc: RefCell<FreeBlocksAllocator>,
    directories: RefCell<BTreeMap<DirectoryId, Directory>>,
    files: RefCell<BTreeMap<DirectoryId, File>>,
    /// Nested areas rooted at a `QUOTA`-flagged directory entry (§4.3),
    /// keyed by that entry's metadata block number.
    quota_areas: RefCell<BTreeMap<DirectoryId, QuotaArea>>,
}

impl WfsDevice {
    const ROOT_DIRECTORY_ID: DirectoryId = reserved::ROOT_DIRECTORY as u32;

    /// Initialize a brand new, empty filesystem over `sector_device`.
    pub fn create(
        sector_device: Box<dyn SectorDevice>,
        key: Option<Key>,
        total_blocks: u32,
    ) -> Result<Self, WfsError> {
        let encrypted = key.is_some();
        let block_device = BlockDevice::new(sector_device, key);
        let block_size_log2 = BlockSizeLog2::PHYSICAL;

        let header = DeviceHeader {
            iv: 0,
            version: area::WFS_VERSION,
            device_type: 0,
            root_quota_metadata: root_directory_metadata(),
            transactions_area_block_number: 0,
            transactions_area_blocks_count: 0,
        };

        let area_header = AreaHeader {
            iv: 0,
            blocks_count: total_blocks,
            root_directory_block_number: reserved::ROOT_DIRECTORY as u32,
            depth: 0,
            block_size_log2,
            large_block_size_log2: block_size_log2
                .grow(BlockSizeLog2::LARGE_SHIFT),
            cluster_block_size_log2: block_size_log2
                .grow(BlockSizeLog2::CLUSTER_SHIFT),
            is_quota_area: false,
            remainder_blocks_count: 0,
            first_fragments: [area::FragmentInfo {
                block_number: 0,
                blocks_count: 0,
            }; 8],
            fragments_log2_block_size: u32::from(block_size_log2.log2()),
        };

        let header_block = block_device.load_metadata_block(
            reserved::HEADER,
            block_size_log2,
            0,
            encrypted,
            true,
            false,
        )?;
        {
            let mut block = header_block.borrow_mut();
            let data = block.data_mut();
            header.write(&mut data[..DeviceHeader::LEN]);
            area_header
                .write(&mut data[DeviceHeader::LEN..DeviceHeader::LEN + AreaHeader::LEN]);
        }

        let root_area = Rc::new(Area {
            header_block,
            header: area_header,
            fragments: Fragments::new(&[], 0),
            parent: None,
        });

        let mut directories = BTreeMap::new();
        directories.insert(Self::ROOT_DIRECTORY_ID, Directory::new(root_directory_metadata()));

        let mut falloc = FreeBlocksAllocator::new(u64::from(total_blocks));
        Self::reserve_fixed_blocks(&mut falloc)?;

        Ok(Self {
            block_device,
            header,
            root_area,
            encrypted,
            falloc: RefCell::new(falloc),
            directories: RefCell::new(directories),
            files: RefCell::new(BTreeMap::new()),
            quota_areas: RefCell::new(BTreeMap::new()),
        })
    }

    /// Open an existing filesystem, validating (but not fully
    /// hydrating, see the struct doc comment) its header and root area.
    pub fn open(
        sector_device: Box<dyn SectorDevice>,
        key: Option<Key>,
        block_size_log2: BlockSizeLog2,
    ) -> Result<Self, WfsError> {
        let encrypted = key.is_some();
        let block_device = BlockDevice::new(sector_device, key);

        let header_block = block_device.load_metadata_block(
            reserved::HEADER,
            block_size_log2,
            0,
            encrypted,
            false,
            true,
        )?;
        let header = DeviceHeader::read(&header_block.borrow().data()[..DeviceHeader::LEN])?;
        let area_header = {
            let block = header_block.borrow();
            let data = block.data();
            AreaHeader::read(&data[DeviceHeader::LEN..DeviceHeader::LEN + AreaHeader::LEN])?
        };
        let total_blocks = area_header.blocks_count;

        let root_area = Rc::new(Area {
            header_block,
            header: area_header,
            fragments: Fragments::new(&[], 0),
            parent: None,
        });

        let mut directories = BTreeMap::new();
        directories.insert(Self::ROOT_DIRECTORY_ID, Directory::new(root_directory_metadata()));

        let mut falloc = FreeBlocksAllocator::new(u64::from(total_blocks));
        Self::reserve_fixed_blocks(&mut falloc)?;

        Ok(Self {
            block_device,
            header,
            root_area,
            encrypted,
            falloc: RefCell::new(falloc),
            directories: RefCell::new(directories),
            files: RefCell::new(BTreeMap::new()),
            quota_areas: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn block_size_log2(&self) -> BlockSizeLog2 {
        self.root_area.header.block_size_log2
    }

    /// Flush every dirty block back to the underlying [`SectorDevice`].
    pub fn flush(&self) -> Result<(), WfsError> {
        self.block_device.flush_all()
    }

    /// Look up a path, descending through directories as needed.
    pub fn get_entry(&self, path: Path) -> Result<Metadata, WfsError> {
        let (dir_id, name) = self.resolve_parent(path)?;
        let metadata = match name {
            None => self.directories.borrow()[&dir_id].metadata.clone(),
            Some(name) => {
                let directories = self.directories.borrow();
                let dir = directories.get(&dir_id).ok_or(WfsError::ItemNotFound)?;
                dir.get_entry(name)?.1.clone()
            }
        };
        Ok(Metadata(metadata))
    }

    pub fn create_directory(&self, path: Path) -> Result<(), WfsError> {
        let (parent_id, name) = self.resolve_parent(path)?;
        let name = name.ok_or(WfsError::ItemNotFound)?;

        let id = self.alloc_block_id()?;
        let metadata = with_filename_length(directory_metadata(id), name)?;
        {
            let mut directories = self.directories.borrow_mut();
            let parent = directories
                .get_mut(&parent_id)
                .ok_or(WfsError::ItemNotFound)?;
            parent.create_entry(name, metadata)?;
        }
        self.directories
            .borrow_mut()
            .insert(id, Directory::new(directory_metadata(id)));
        Ok(())
    }

    pub fn create_file(&self, path: Path) -> Result<(), WfsError> {
        let (parent_id, name) = self.resolve_parent(path)?;
        let name = name.ok_or(WfsError::ItemNotFound)?;

        let id = self.alloc_block_id()?;
        let metadata = with_filename_length(file_metadata(), name)?;
        {
            let mut directories = self.directories.borrow_mut();
            let parent = directories
                .get_mut(&parent_id)
                .ok_or(WfsError::ItemNotFound)?;
            parent.create_entry(name, metadata.clone())?;
        }
        self.files.borrow_mut().insert(id, File::new(metadata));
        Ok(())
    }

    pub fn read_file(&self, path: Path) -> Result<Vec<u8>, WfsError> {
        let id = self.file_id(path)?;
        let files = self.files.borrow();
        let file = files.get(&id).ok_or(WfsError::ItemNotFound)?;
        Ok(file.data().to_vec())
    }

    /// Overwrite a file's content, reallocating its backing device
    /// blocks through the free-blocks allocator to match the new size
    /// (§4.4's block-addressable storage, not a bare in-memory resize).
    pub fn write_file(&self, path: Path, data: &[u8]) -> Result<(), WfsError> {
        let id = self.file_id(path)?;
        let block_size_log2 = self.block_size_log2();
        let blocks_needed = blocks_for_len(data.len(), block_size_log2);

        {
            let mut files = self.files.borrow_mut();
            let file = files.get_mut(&id).ok_or(WfsError::ItemNotFound)?;

            if let Some((old_start, old_len)) = file.storage_extent.take() {
                self.falloc.borrow_mut().free(old_start, old_len);
            }
            if blocks_needed > 0 {
                let start = self.falloc.borrow_mut().alloc(blocks_needed)?;
                file.storage_extent = Some((start, blocks_needed));
            }

            file.write_at(0, data, block_size_log2);
            file.resize(data.len(), block_size_log2);
        }

        let (parent_id, name) = self.resolve_parent(path)?;
        let name = name.ok_or(WfsError::ItemNotFound)?;
        let files = self.files.borrow();
        let file = files.get(&id).ok_or(WfsError::ItemNotFound)?;
        let mut directories = self.directories.borrow_mut();
        let parent = directories
            .get_mut(&parent_id)
            .ok_or(WfsError::ItemNotFound)?;
        parent.remove_entry(name).ok();
        parent.create_entry(name, file.metadata.clone())?;
        Ok(())
    }

    pub fn list_directory(
        &self,
        path: Path,
    ) -> Result<Vec<(Vec<u8>, Metadata)>, WfsError> {
        let id = self.directory_id(path)?;
        let directories = self.directories.borrow();
        let dir = directories.get(&id).ok_or(WfsError::ItemNotFound)?;
        Ok(dir
            .entries()
            .into_iter()
            .map(|(name, metadata)| (name, Metadata(metadata.clone())))
            .collect())
    }

    /// Carve out a nested quota area under `path` (§4.3, §4.8): the
    /// entry itself is flagged `QUOTA` and records `blocks_count` as its
    /// `size_or_quota_blocks`, and a [`QuotaArea`] with its own
    /// independent [`FreeBlocksAllocator`] and root directory is rooted
    /// at the entry's metadata block, entirely separate from the
    /// device's own free set.
    pub fn create_quota_area(&self, path: Path, blocks_count: u32) -> Result<(), WfsError> {
        let (parent_id, name) = self.resolve_parent(path)?;
        let name = name.ok_or(WfsError::ItemNotFound)?;

        let id = self.alloc_block_id()?;
        let mut metadata = with_filename_length(directory_metadata(id), name)?;
        metadata.flags |= EntryFlags::QUOTA;
        metadata.size_or_quota_blocks = blocks_count;

        {
            let mut directories = self.directories.borrow_mut();
            let parent = directories
                .get_mut(&parent_id)
                .ok_or(WfsError::ItemNotFound)?;
            parent.create_entry(name, metadata)?;
        }

        let block_size_log2 = self.block_size_log2();
        let header_block = self.block_device.load_metadata_block(
            u64::from(id),
            block_size_log2,
            0,
            self.encrypted,
            true,
            false,
        )?;
        let quota = QuotaArea::create(
            self.root_area.clone(),
            header_block,
            blocks_count,
            block_size_log2,
            Fragments::new(&[], 0),
        )?;
        self.quota_areas.borrow_mut().insert(id, quota);
        Ok(())
    }

    /// Free blocks remaining in the quota area rooted at `path`, read
    /// from that area's own allocator rather than the device's.
    pub fn quota_area_free_blocks(&self, path: Path) -> Result<u64, WfsError> {
        let id = self.quota_area_id(path)?;
        let quota_areas = self.quota_areas.borrow();
        let quota = quota_areas.get(&id).ok_or(WfsError::ItemNotFound)?;
        Ok(quota.free_blocks_allocator().borrow().free_blocks())
    }

    fn quota_area_id(&self, path: Path) -> Result<DirectoryId, WfsError> {
        let (parent_id, name) = self.resolve_parent(path)?;
        let name = name.ok_or(WfsError::ItemNotFound)?;
        let directories = self.directories.borrow();
        let dir = directories.get(&parent_id).ok_or(WfsError::ItemNotFound)?;
        let (_, metadata) = dir.get_entry(name)?;
        if !metadata.is_quota() {
            return Err(WfsError::NotDirectory);
        }
        Ok(metadata.directory_block_number)
    }

    /// Carve the device header, allocator root/FTrees blocks, and root
    /// and shadow directory blocks (§4.3's `reserved` layout) out of the
    /// free set before any caller data is allocated. A fresh allocator
    /// covers `[0, total_blocks)` as one run, so these six single-block
    /// allocations land at blocks 0..=5 in address order, matching
    /// `reserved::HEADER..=SHADOW_DIRECTORY_2`.
    fn reserve_fixed_blocks(falloc: &mut FreeBlocksAllocator) -> Result<(), WfsError> {
        for _ in 0..6 {
            falloc.alloc(1)?;
        }
        Ok(())
    }

    /// Allocate a single metadata block for a new directory or file,
    /// returning its block number.
    fn alloc_block_id(&self) -> Result<DirectoryId, WfsError> {
        let block = self.falloc.borrow_mut().alloc(1)?;
        u32::try_from(block).map_err(|_| WfsError::NoSpace)
    }

    /// Resolve every component but the last, returning the containing
    /// directory's id and the final component (`None` for the root).
    fn resolve_parent<'a>(
        &self,
        path: Path<'a>,
    ) -> Result<(DirectoryId, Option<&'a [u8]>), WfsError> {
        let bytes = path.as_bytes();
        let components: Vec<&[u8]> = bytes
            .split(|&b| b == Path::SEPARATOR)
            .filter(|c| !c.is_empty())
            .collect();

        let mut dir_id = Self::ROOT_DIRECTORY_ID;
        if components.is_empty() {
            return Ok((dir_id, None));
        }

        for component in &components[..components.len() - 1] {
            dir_id = self.child_directory_id(dir_id, component)?;
        }
        Ok((dir_id, Some(components[components.len() - 1])))
    }

    fn directory_id(&self, path: Path) -> Result<DirectoryId, WfsError> {
        let (parent_id, name) = self.resolve_parent(path)?;
        match name {
            None => Ok(parent_id),
            Some(name) => self.child_directory_id(parent_id, name),
        }
    }

    fn file_id(&self, path: Path) -> Result<DirectoryId, WfsError> {
        let (parent_id, name) = self.resolve_parent(path)?;
        let name = name.ok_or(WfsError::NotFile)?;
        let directories = self.directories.borrow();
        let dir = directories.get(&parent_id).ok_or(WfsError::ItemNotFound)?;
        let (_, metadata) = dir.get_entry(name)?;
        if !metadata.is_directory() {
            Ok(metadata.directory_block_number)
        } else {
            Err(WfsError::NotFile)
        }
    }

    fn child_directory_id(
        &self,
        parent_id: DirectoryId,
        name: &[u8],
    ) -> Result<DirectoryId, WfsError> {
        let directories = self.directories.borrow();
        let dir = directories.get(&parent_id).ok_or(WfsError::ItemNotFound)?;
        let (_, metadata) = dir.get_entry(name)?;
        if !metadata.is_directory() {
            return Err(WfsError::NotDirectory);
        }
        Ok(metadata.directory_block_number)
    }
}

/// Blocks needed to hold `len` bytes, rounding up.
fn blocks_for_len(len: usize, block_size_log2: BlockSizeLog2) -> u64 {
    (len as u64).div_ceil(block_size_log2.to_u64())
}

fn root_directory_metadata() -> EntryMetadata {
    directory_metadata(WfsDevice::ROOT_DIRECTORY_ID)
}

fn directory_metadata(block_number: DirectoryId) -> EntryMetadata {
    EntryMetadata {
        flags: EntryFlags::DIRECTORY,
        size_on_disk: 0,
        ctime: 0,
        mtime: 0,
        unknown: 0,
        size_or_quota_blocks: 0,
        directory_block_number: block_number,
        permissions: Permissions {
            owner: 0,
            group: 0,
            mode: 0o755,
        },
        metadata_log2_size: 0,
        size_category: 0,
        filename_length: 0,
    }
}

fn file_metadata() -> EntryMetadata {
    EntryMetadata {
        flags: EntryFlags::empty(),
        size_on_disk: 0,
        ctime: 0,
        mtime: 0,
        unknown: 0,
        size_or_quota_blocks: 0,
        directory_block_number: 0,
        permissions: Permissions {
            owner: 0,
            group: 0,
            mode: 0o644,
        },
        metadata_log2_size: 0,
        size_category: 0,
        filename_length: 0,
    }
}

/// §4.6's `filename_length` field must match the name actually being
/// stored -- [`dirtree::DirectoryTree::insert`] rejects a mismatch as
/// corrupt -- so every entry created through `WfsDevice` stamps it here
/// before handing the record to a directory.
fn with_filename_length(mut metadata: EntryMetadata, name: &[u8]) -> Result<EntryMetadata, WfsError> {
    metadata.filename_length = u8::try_from(name.len()).map_err(|_| WfsError::Io(
        Box::new(NameTooLong),
    ))?;
    Ok(metadata)
}

#[derive(Debug)]
struct NameTooLong;

impl core::fmt::Display for NameTooLong {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "file name longer than 255 bytes")
    }
}

impl core::error::Error for NameTooLong {}

#[cfg(test)]
mod tests {
    use super::*;
    use device::MemSectorDevice;

    fn new_fs() -> WfsDevice {
        let mem = MemSectorDevice::new(vec![0u8; 4096 * 64], 512);
        WfsDevice::create(Box::new(mem), None, 64).unwrap()
    }

    #[test]
    fn test_create_and_list_root() {
        let fs = new_fs();
        let root = Path::try_from("/").unwrap();
        assert!(fs.list_directory(root).unwrap().is_empty());
    }

    #[test]
    fn test_create_file_and_read_write() {
        let fs = new_fs();
        let path = Path::try_from("/hello.txt").unwrap();
        fs.create_file(path).unwrap();
        fs.write_file(path, b"hello").unwrap();
        assert_eq!(fs.read_file(path).unwrap(), b"hello");

        let root = Path::try_from("/").unwrap();
        let entries = fs.list_directory(root).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, b"hello.txt");
    }

    #[test]
    fn test_create_directory_and_nested_file() {
        let fs = new_fs();
        let dir_path = Path::try_from("/sub").unwrap();
        fs.create_directory(dir_path).unwrap();

        let file_path = Path::try_from("/sub/a.txt").unwrap();
        fs.create_file(file_path).unwrap();
        fs.write_file(file_path, b"data").unwrap();
        assert_eq!(fs.read_file(file_path).unwrap(), b"data");

        let entries = fs.list_directory(dir_path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_get_entry_not_found() {
        let fs = new_fs();
        let path = Path::try_from("/missing").unwrap();
        assert!(matches!(fs.get_entry(path), Err(WfsError::ItemNotFound)));
    }

    #[test]
    fn test_flush_empty_is_ok() {
        let fs = new_fs();
        fs.flush().unwrap();
    }

    #[test]
    fn test_reserved_blocks_are_not_handed_out() {
        let fs = new_fs();
        let free_after_create = fs.falloc.borrow().free_blocks();
        // 64 total minus the 6 fixed blocks reserved by `create`.
        assert_eq!(free_after_create, 64 - 6);

        let path = Path::try_from("/a.txt").unwrap();
        fs.create_file(path).unwrap();
        // One more block for the file's own metadata record.
        assert_eq!(fs.falloc.borrow().free_blocks(), 64 - 7);
    }

    #[test]
    fn test_write_file_allocates_and_frees_data_blocks() {
        let fs = new_fs();
        let path = Path::try_from("/a.txt").unwrap();
        fs.create_file(path).unwrap();
        let free_before_write = fs.falloc.borrow().free_blocks();

        fs.write_file(path, &[1u8; 4096 * 3]).unwrap();
        assert_eq!(fs.falloc.borrow().free_blocks(), free_before_write - 3);

        fs.write_file(path, b"tiny").unwrap();
        assert_eq!(fs.falloc.borrow().free_blocks(), free_before_write - 1);
    }

    #[test]
    fn test_quota_area_has_its_own_free_set() {
        let fs = new_fs();
        let free_before = fs.falloc.borrow().free_blocks();

        let path = Path::try_from("/quota").unwrap();
        fs.create_quota_area(path, 16).unwrap();

        // Allocating one more block on the device's own namespace must
        // not touch the quota area's allocator, and vice versa.
        assert_eq!(fs.falloc.borrow().free_blocks(), free_before - 1);
        // 16 blocks minus the 6 the quota area reserves for itself.
        assert_eq!(fs.quota_area_free_blocks(path).unwrap(), 10);

        let free_after_other_alloc = fs.falloc.borrow().free_blocks();
        let other = Path::try_from("/b.txt").unwrap();
        fs.create_file(other).unwrap();
        assert_eq!(fs.falloc.borrow().free_blocks(), free_after_other_alloc - 1);
        assert_eq!(fs.quota_area_free_blocks(path).unwrap(), 10);
    }

    #[test]
    fn test_quota_area_free_blocks_rejects_non_quota_path() {
        let fs = new_fs();
        let path = Path::try_from("/a.txt").unwrap();
        fs.create_file(path).unwrap();
        assert!(matches!(
            fs.quota_area_free_blocks(path),
            Err(WfsError::NotDirectory)
        ));
    }
}
