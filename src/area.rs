// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Area hierarchy (§4.3): the device header, the root area, and nested
//! quota areas, each potentially spread across multiple fragments.
//! Grounded on `structs.h`'s `WfsDeviceHeader`/`WfsAreaHeader`/
//! `WfsQuotaAreaHeader`/`WfsAreaFragmentInfo`.

use crate::block::{BlockRef, DeviceBlockIndex};
use crate::block_size::BlockSizeLog2;
use crate::directory::Directory;
use crate::entry::{EntryFlags, EntryMetadata, Permissions};
use crate::error::{CorruptKind, WfsError};
use crate::falloc::FreeBlocksAllocator;
use crate::util::{read_u16be, read_u32be, write_u16be, write_u32be};
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

pub(crate) const WFS_VERSION: u32 = 0x0101_0800;

/// Fixed-position metadata blocks every area reserves for itself,
/// before any caller data (§4.3).
pub(crate) mod reserved {
    pub(crate) const HEADER: u64 = 0;
    pub(crate) const ALLOCATOR_ROOT: u64 = 1;
    pub(crate) const FTREES: u64 = 2;
    pub(crate) const ROOT_DIRECTORY: u64 = 3;
    pub(crate) const SHADOW_DIRECTORY_1: u64 = 4;
    pub(crate) const SHADOW_DIRECTORY_2: u64 = 5;
}

/// `WfsDeviceHeader`, 0x48 bytes, read from device-block 0.
#[derive(Clone, Debug)]
pub(crate) struct DeviceHeader {
    pub(crate) iv: u32,
    pub(crate) version: u32,
    pub(crate) device_type: u16,
    pub(crate) root_quota_metadata: EntryMetadata,
    pub(crate) transactions_area_block_number: u32,
    pub(crate) transactions_area_blocks_count: u32,
}

impl DeviceHeader {
    pub(crate) const LEN: usize = 0x48;

    pub(crate) fn read(bytes: &[u8]) -> Result<Self, WfsError> {
        let version = read_u32be(bytes, 4);
        if version != WFS_VERSION {
            return Err(WfsError::InvalidWfsVersion);
        }
        let transactions_area_block_number = read_u32be(bytes, 0x38);
        let transactions_area_blocks_count = read_u32be(bytes, 0x3c);
        // A reserved-but-empty area (both fields zero) is valid; a
        // block number without a length, or vice versa, is not.
        if (transactions_area_block_number == 0) != (transactions_area_blocks_count == 0) {
            return Err(CorruptKind::TransactionsArea.into());
        }
        Ok(Self {
            iv: read_u32be(bytes, 0),
            version,
            device_type: read_u16be(bytes, 8),
            root_quota_metadata: EntryMetadata::read(&bytes[12..12 + 43])?,
            transactions_area_block_number,
            transactions_area_blocks_count,
        })
    }

    pub(crate) fn write(&self, bytes: &mut [u8]) {
        write_u32be(bytes, 0, self.iv);
        write_u32be(bytes, 4, self.version);
        write_u16be(bytes, 8, self.device_type);
        self.root_quota_metadata.write(&mut bytes[12..12 + 43]);
        write_u32be(bytes, 0x38, self.transactions_area_block_number);
        write_u32be(bytes, 0x3c, self.transactions_area_blocks_count);
    }
}

/// One `(block_number, blocks_count)` pair, in the parent area's block
/// size. `structs.h`'s `WfsAreaFragmentInfo`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FragmentInfo {
    pub(crate) block_number: u32,
    pub(crate) blocks_count: u32,
}

impl FragmentInfo {
    pub(crate) const LEN: usize = 8;

    pub(crate) fn read(bytes: &[u8]) -> Self {
        Self {
            block_number: read_u32be(bytes, 0),
            blocks_count: read_u32be(bytes, 4),
        }
    }

    pub(crate) fn write(&self, bytes: &mut [u8]) {
        write_u32be(bytes, 0, self.block_number);
        write_u32be(bytes, 4, self.blocks_count);
    }
}

/// The (possibly multi-fragment) range an area occupies within its
/// parent area, in units of the area's own block size.
///
/// The on-disk format expresses fragment extents in the *parent* area's
/// block size (`fragments_log2_block_size`). This type normalizes that
/// away at construction time so that [`Fragments::locate`] always
/// returns an offset already expressed in the child area's block size;
/// see the allocator fidelity note in `DESIGN.md` for why this
/// normalization, rather than carrying both units through every call
/// site, was chosen.
#[derive(Clone, Debug, Default)]
pub(crate) struct Fragments {
    /// `(first_own_block, own_block_count)`, sorted, contiguous in the
    /// logical address space they cover.
    ranges: Vec<(u64, u64)>,
}

impl Fragments {
    pub(crate) fn new(
        raw: &[FragmentInfo],
        parent_to_own_shift: u8,
    ) -> Self {
        let ranges = raw
            .iter()
            .filter(|f| f.blocks_count != 0)
            .map(|f| {
                (
                    u64::from(f.block_number) << parent_to_own_shift,
                    u64::from(f.blocks_count) << parent_to_own_shift,
                )
            })
            .collect();
        Self { ranges }
    }

    /// Total number of own-block-size blocks covered.
    pub(crate) fn total_blocks(&self) -> u64 {
        self.ranges.iter().map(|(_, count)| count).sum()
    }

    /// Map a logical area-block index to a block number in the parent
    /// area's address space (still in this area's own block-size
    /// units; the caller is expected to be the parent `Area`, which
    /// knows how to interpret it).
    pub(crate) fn locate(&self, area_block: u64) -> Result<u64, WfsError> {
        let mut remaining = area_block;
        for &(first, count) in &self.ranges {
            if remaining < count {
                return Ok(first + remaining);
            }
            remaining -= count;
        }
        Err(CorruptKind::AreaHeader.into())
    }
}

/// `WfsAreaHeader`, 0x60 bytes. The root area and every quota area
/// share this header shape; quota areas additionally own a
/// `WfsQuotaAreaHeader` extension block when they have more than 8
/// fragments.
#[derive(Clone, Debug)]
pub(crate) struct AreaHeader {
    pub(crate) iv: u32,
    pub(crate) blocks_count: u32,
    pub(crate) root_directory_block_number: u32,
    pub(crate) depth: u8,
    pub(crate) block_size_log2: BlockSizeLog2,
    pub(crate) large_block_size_log2: BlockSizeLog2,
    pub(crate) cluster_block_size_log2: BlockSizeLog2,
    pub(crate) is_quota_area: bool,
    pub(crate) remainder_blocks_count: u16,
    pub(crate) first_fragments: [FragmentInfo; 8],
    pub(crate) fragments_log2_block_size: u32,
}

impl AreaHeader {
    pub(crate) const LEN: usize = 0x60;

    pub(crate) fn read(bytes: &[u8]) -> Result<Self, WfsError> {
        let block_size_log2 = BlockSizeLog2::new(bytes[21])
            .ok_or(CorruptKind::AreaHeader)?;
        let large_block_size_log2 = BlockSizeLog2::new(bytes[22])
            .ok_or(CorruptKind::AreaHeader)?;
        let cluster_block_size_log2 = BlockSizeLog2::new(bytes[23])
            .ok_or(CorruptKind::AreaHeader)?;

        let mut first_fragments = [FragmentInfo {
            block_number: 0,
            blocks_count: 0,
        }; 8];
        for (i, frag) in first_fragments.iter_mut().enumerate() {
            let off = 28 + i * FragmentInfo::LEN;
            *frag = FragmentInfo::read(&bytes[off..off + FragmentInfo::LEN]);
        }

        Ok(Self {
            iv: read_u32be(bytes, 0),
            blocks_count: read_u32be(bytes, 4),
            root_directory_block_number: read_u32be(bytes, 8),
            depth: bytes[20],
            block_size_log2,
            large_block_size_log2,
            cluster_block_size_log2,
            is_quota_area: bytes[24] == 1,
            remainder_blocks_count: read_u16be(bytes, 26),
            first_fragments,
            fragments_log2_block_size: read_u32be(bytes, 0x5c),
        })
    }

    pub(crate) fn write(&self, bytes: &mut [u8]) {
        write_u32be(bytes, 0, self.iv);
        write_u32be(bytes, 4, self.blocks_count);
        write_u32be(bytes, 8, self.root_directory_block_number);
        // Shadow directory slots (offsets 12, 16) are unused, see
        // structs.h; leave zeroed.
        bytes[20] = self.depth;
        bytes[21] = self.block_size_log2.log2();
        bytes[22] = self.large_block_size_log2.log2();
        bytes[23] = self.cluster_block_size_log2.log2();
        bytes[24] = u8::from(self.is_quota_area);
        bytes[25] = 0;
        write_u16be(bytes, 26, self.remainder_blocks_count);
        for (i, frag) in self.first_fragments.iter().enumerate() {
            let off = 28 + i * FragmentInfo::LEN;
            frag.write(&mut bytes[off..off + FragmentInfo::LEN]);
        }
        write_u32be(bytes, 0x5c, self.fragments_log2_block_size);
    }
}

/// `WfsQuotaAreaHeader`'s fragment extension table (up to 480 entries
/// beyond the 8 inlined in `AreaHeader`).
pub(crate) struct QuotaFragmentsExtension {
    pub(crate) fragments_log2_block_size: u16,
    pub(crate) fragments: Vec<FragmentInfo>,
}

impl QuotaFragmentsExtension {
    pub(crate) const LEN: usize = 0xf08;
    pub(crate) const MAX_FRAGMENTS: usize = 480;

    pub(crate) fn read(bytes: &[u8]) -> Self {
        let fragments_count = read_u32be(bytes, 4) as usize;
        let mut fragments = Vec::with_capacity(fragments_count);
        for i in 0..fragments_count.min(Self::MAX_FRAGMENTS) {
            let off = 8 + i * FragmentInfo::LEN;
            fragments.push(FragmentInfo::read(&bytes[off..off + FragmentInfo::LEN]));
        }
        Self {
            fragments_log2_block_size: read_u16be(bytes, 2),
            fragments,
        }
    }

    pub(crate) fn write(&self, bytes: &mut [u8]) {
        write_u16be(bytes, 0, Self::MAX_FRAGMENTS as u16);
        write_u16be(bytes, 2, self.fragments_log2_block_size);
        write_u32be(bytes, 4, self.fragments.len() as u32);
        for (i, frag) in self.fragments.iter().enumerate() {
            let off = 8 + i * FragmentInfo::LEN;
            frag.write(&mut bytes[off..off + FragmentInfo::LEN]);
        }
    }
}

/// An area: the root area of a device, or a quota area nested inside a
/// parent area (§4.3).
pub(crate) struct Area {
    pub(crate) header_block: BlockRef,
    pub(crate) header: AreaHeader,
    pub(crate) fragments: Fragments,
    pub(crate) parent: Option<Rc<Area>>,
}

impl Area {
    /// IV used for every block in this area, per §4.3:
    /// `area.iv XOR device.iv`, combined at load time by the caller
    /// with the per-block offset term.
    pub(crate) fn combined_iv(&self, device_iv: u32) -> u32 {
        self.header.iv ^ device_iv
    }

    /// Translate an area-relative block number (in this area's own
    /// block size) into an absolute device block number (§4.3).
    pub(crate) fn block_to_device_block(
        self: &Rc<Self>,
        area_block: u64,
    ) -> Result<DeviceBlockIndex, WfsError> {
        let parent_block = self.fragments.locate(area_block)?;
        match &self.parent {
            None => Ok(parent_block),
            Some(parent) => parent.block_to_device_block(parent_block),
        }
    }

    /// Per-block IV seed fed to [`crate::crypto::build_iv`]: the area's
    /// combined IV plus the block's offset within the area, shifted
    /// into `Physical`-sized units per §4.3's formula.
    pub(crate) fn block_iv_seed(&self, device_iv: u32, area_block: u64) -> u32 {
        let shift = self
            .header
            .block_size_log2
            .log2()
            .saturating_sub(BlockSizeLog2::PHYSICAL.log2());
        self.combined_iv(device_iv)
            .wrapping_add((area_block << shift) as u32)
    }
}

/// A quota area nested inside a parent area (§4.3): a directory entry
/// flagged [`EntryFlags::QUOTA`] that, rather than holding file content
/// directly, roots its own independent block address space -- its own
/// [`FreeBlocksAllocator`] and its own root/shadow directories, six
/// fixed blocks reserved exactly like the device's root area.
/// Grounded on `quota_area.h`/`quota_area.cpp`'s `QuotaArea` class.
pub(crate) struct QuotaArea {
    pub(crate) area: Rc<Area>,
    falloc: RefCell<FreeBlocksAllocator>,
    directories: RefCell<BTreeMap<u32, Directory>>,
}

impl QuotaArea {
    /// Root directory's metadata-block number within the quota area's
    /// own address space, matching `reserved::ROOT_DIRECTORY`.
    pub(crate) const ROOT_DIRECTORY_ID: u32 = reserved::ROOT_DIRECTORY as u32;

    /// Build a fresh quota area of `blocks_count` blocks nested under
    /// `parent`, reserving its six fixed blocks the same way a device's
    /// root area does (`ReservedBlocks` in `quota_area.h`).
    pub(crate) fn create(
        parent: Rc<Area>,
        header_block: BlockRef,
        blocks_count: u32,
        block_size_log2: BlockSizeLog2,
        fragments: Fragments,
    ) -> Result<Self, WfsError> {
        let header = AreaHeader {
            iv: 0,
            blocks_count,
            root_directory_block_number: reserved::ROOT_DIRECTORY as u32,
            depth: 0,
            block_size_log2,
            large_block_size_log2: block_size_log2.grow(BlockSizeLog2::LARGE_SHIFT),
            cluster_block_size_log2: block_size_log2.grow(BlockSizeLog2::CLUSTER_SHIFT),
            is_quota_area: true,
            remainder_blocks_count: 0,
            first_fragments: [FragmentInfo {
                block_number: 0,
                blocks_count: 0,
            }; 8],
            fragments_log2_block_size: u32::from(block_size_log2.log2()),
        };

        let area = Rc::new(Area {
            header_block,
            header,
            fragments,
            parent: Some(parent),
        });

        let mut falloc = FreeBlocksAllocator::new(u64::from(blocks_count));
        for _ in 0..6 {
            falloc.alloc(1)?;
        }

        let mut directories = BTreeMap::new();
        directories.insert(Self::ROOT_DIRECTORY_ID, Directory::new(quota_root_metadata()));

        Ok(Self {
            area,
            falloc: RefCell::new(falloc),
            directories: RefCell::new(directories),
        })
    }

    /// The allocator tracking this quota area's own free blocks,
    /// entirely separate from its parent's (`GetFreeBlocksAllocator`).
    pub(crate) fn free_blocks_allocator(&self) -> &RefCell<FreeBlocksAllocator> {
        &self.falloc
    }

    /// The quota area's root directory (`LoadRootDirectory`).
    pub(crate) fn root_directory(&self) -> core::cell::RefMut<'_, BTreeMap<u32, Directory>> {
        self.directories.borrow_mut()
    }

    /// Allocate a metadata block number from this area's own free set
    /// (`AllocMetadataBlock`).
    pub(crate) fn alloc_block_id(&self) -> Result<u32, WfsError> {
        let block = self.falloc.borrow_mut().alloc(1)?;
        u32::try_from(block).map_err(|_| WfsError::NoSpace)
    }
}

/// The metadata record a quota area's own root directory carries:
/// identical shape to the device's root directory (§4.8), just nested
/// one level deeper.
fn quota_root_metadata() -> EntryMetadata {
    EntryMetadata {
        flags: EntryFlags::DIRECTORY,
        size_on_disk: 0,
        ctime: 0,
        mtime: 0,
        unknown: 0,
        size_or_quota_blocks: 0,
        directory_block_number: reserved::ROOT_DIRECTORY as u32,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(block_number: u32, blocks_count: u32) -> FragmentInfo {
        FragmentInfo {
            block_number,
            blocks_count,
        }
    }

    #[test]
    fn test_fragments_locate_single_range() {
        let fragments = Fragments::new(&[frag(10, 5)], 0);
        assert_eq!(fragments.locate(0).unwrap(), 10);
        assert_eq!(fragments.locate(4).unwrap(), 14);
        assert!(fragments.locate(5).is_err());
    }

    #[test]
    fn test_fragments_locate_multi_range() {
        let fragments = Fragments::new(&[frag(10, 2), frag(100, 3)], 0);
        assert_eq!(fragments.locate(0).unwrap(), 10);
        assert_eq!(fragments.locate(1).unwrap(), 11);
        assert_eq!(fragments.locate(2).unwrap(), 100);
        assert_eq!(fragments.locate(4).unwrap(), 102);
        assert!(fragments.locate(5).is_err());
    }

    #[test]
    fn test_fragments_shift() {
        // Parent block size is 2x the child's, so each parent block
        // covers 2 child blocks.
        let fragments = Fragments::new(&[frag(1, 1)], 1);
        assert_eq!(fragments.total_blocks(), 2);
        assert_eq!(fragments.locate(0).unwrap(), 2);
        assert_eq!(fragments.locate(1).unwrap(), 3);
    }

    #[test]
    fn test_quota_area_has_independent_allocator() {
        use crate::block::BlockDevice;
        use crate::device::MemSectorDevice;

        let mem = MemSectorDevice::new(alloc::vec![0u8; 4096 * 16], 512);
        let block_device = BlockDevice::new(alloc::boxed::Box::new(mem), None);

        let parent_header_block = block_device
            .load_metadata_block(0, BlockSizeLog2::PHYSICAL, 0, false, true, false)
            .unwrap();
        let parent = Rc::new(Area {
            header_block: parent_header_block,
            header: AreaHeader {
                iv: 0,
                blocks_count: 16,
                root_directory_block_number: reserved::ROOT_DIRECTORY as u32,
                depth: 0,
                block_size_log2: BlockSizeLog2::PHYSICAL,
                large_block_size_log2: BlockSizeLog2::PHYSICAL
                    .grow(BlockSizeLog2::LARGE_SHIFT),
                cluster_block_size_log2: BlockSizeLog2::PHYSICAL
                    .grow(BlockSizeLog2::CLUSTER_SHIFT),
                is_quota_area: false,
                remainder_blocks_count: 0,
                first_fragments: [frag(0, 0); 8],
                fragments_log2_block_size: u32::from(BlockSizeLog2::PHYSICAL.log2()),
            },
            fragments: Fragments::new(&[], 0),
            parent: None,
        });

        let quota_header_block = block_device
            .load_metadata_block(1, BlockSizeLog2::PHYSICAL, 0, false, true, false)
            .unwrap();
        let quota = QuotaArea::create(
            parent,
            quota_header_block,
            10,
            BlockSizeLog2::PHYSICAL,
            Fragments::new(&[frag(1, 10)], 0),
        )
        .unwrap();

        // 10 blocks, minus the 6 reserved the same way a device root
        // area reserves them.
        assert_eq!(quota.free_blocks_allocator().borrow().free_blocks(), 4);
        assert!(quota.root_directory().contains_key(&QuotaArea::ROOT_DIRECTORY_ID));

        let id = quota.alloc_block_id().unwrap();
        assert_eq!(quota.free_blocks_allocator().borrow().free_blocks(), 3);
        assert_ne!(id, QuotaArea::ROOT_DIRECTORY_ID);
    }

    #[test]
    fn test_area_header_round_trip() {
        let header = AreaHeader {
            iv: 0x1234,
            blocks_count: 1000,
            root_directory_block_number: 3,
            depth: 1,
            block_size_log2: BlockSizeLog2::PHYSICAL,
            large_block_size_log2: BlockSizeLog2::PHYSICAL
                .grow(BlockSizeLog2::LARGE_SHIFT),
            cluster_block_size_log2: BlockSizeLog2::PHYSICAL
                .grow(BlockSizeLog2::CLUSTER_SHIFT),
            is_quota_area: true,
            remainder_blocks_count: 7,
            first_fragments: [frag(0, 0); 8],
            fragments_log2_block_size: 12,
        };
        let mut bytes = [0u8; AreaHeader::LEN];
        header.write(&mut bytes);
        let parsed = AreaHeader::read(&bytes).unwrap();
        assert_eq!(parsed.iv, header.iv);
        assert_eq!(parsed.blocks_count, header.blocks_count);
        assert!(parsed.is_quota_area);
        assert_eq!(parsed.block_size_log2, BlockSizeLog2::PHYSICAL);
    }
}
