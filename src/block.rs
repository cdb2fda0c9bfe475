// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Block layer: §4.1 `BlockDevice` and §4.2 `Block`.
//!
//! A [`Block`] owns one decrypted payload buffer for one logical block
//! of the device. [`BlockDevice`] translates `(device_block, size
//! class)` pairs into sector ranges, drives encryption/hashing, and
//! owns the block cache that guarantees at most one live [`Block`] per
//! absolute device block number (§8 property 1).

use crate::block_size::BlockSizeLog2;
use crate::crypto::{self, Hash, Key};
use crate::device::SectorDevice;
use crate::error::WfsError;
use crate::util::usize_from_u32;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

/// Absolute device block number, expressed in units of the device's
/// `Basic` sector size (§3). This is the unit `WfsAreaHeader` and
/// `MetadataBlockHeader` numbers are given in once converted by
/// [`crate::area::Area::block_to_device_block`].
pub(crate) type DeviceBlockIndex = u64;

/// Where a block's SHA-1 hash is stored, per §3's "Hash reference".
pub(crate) enum HashLocation {
    /// The hash lives inside the block's own payload (metadata blocks).
    /// Offset 4, per §4.1 ("Hash in metadata blocks sits at offset 4").
    SelfEmbedded { offset: usize },

    /// The hash lives at `offset` in a parent metadata block's payload
    /// (data blocks).
    Parent { parent: BlockRef, offset: usize },
}

pub(crate) type BlockRef = Rc<RefCell<Block>>;

/// One decrypted payload buffer for one logical block of the device.
pub(crate) struct Block {
    device: Rc<BlockDevice>,
    device_block: DeviceBlockIndex,
    size_log2: BlockSizeLog2,
    /// Per-block IV seed, derived by the owning [`crate::area::Area`].
    iv_seed: u32,
    encrypted: bool,
    hash_location: HashLocation,
    data: Vec<u8>,
    dirty: bool,
    /// Set when this block has been logically replaced (directory
    /// splits detach the old block so it's no longer looked up from
    /// the cache under its old number).
    detached: bool,
}

impl Block {
    pub(crate) fn device_block(&self) -> DeviceBlockIndex {
        self.device_block
    }

    pub(crate) fn size_log2(&self) -> BlockSizeLog2 {
        self.size_log2
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    /// Obtain a mutable view of the payload. Marks the block dirty.
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// §4.2: round up to sector size, zero-extend.
    pub(crate) fn resize(&mut self, new_size_log2: BlockSizeLog2) {
        self.data.resize(new_size_log2.to_usize(), 0);
        self.size_log2 = new_size_log2;
        self.dirty = true;
    }

    /// §4.2: mark the block as not belonging to the cache.
    pub(crate) fn detach(&mut self) {
        self.detached = true;
        self.device.remove_from_cache(self.device_block);
    }

    /// §4.2 `Flush`: if dirty, recompute/propagate the hash, then write
    /// through `BlockDevice`.
    pub(crate) fn flush(&mut self) -> Result<(), WfsError> {
        if !self.dirty {
            return Ok(());
        }

        match &self.hash_location {
            HashLocation::SelfEmbedded { offset } => {
                let h = self_hash(&self.data, *offset);
                self.data[*offset..*offset + 20].copy_from_slice(&h);
            }
            HashLocation::Parent { parent, offset } => {
                let h = crypto::sha1(&pad_to_sector(
                    &self.data,
                    self.device.sector_size(),
                ));
                parent.borrow_mut().data_mut()[*offset..*offset + 20]
                    .copy_from_slice(&h);
                parent.borrow_mut().flush()?;
            }
        }

        self.device.write_raw(
            self.device_block,
            &self.data,
            self.iv_seed,
            self.encrypted,
        )?;
        self.dirty = false;
        Ok(())
    }
}

/// Mask the embedded hash slot with `0xFF` fill, hash the sector-padded
/// buffer, per §4.1 ("freshly zeroed block has a well-defined hash").
fn self_hash(data: &[u8], hash_offset: usize) -> Hash {
    let mut scratch = data.to_vec();
    scratch[hash_offset..hash_offset + 20].fill(0xFF);
    crypto::sha1(&scratch)
}

fn pad_to_sector(data: &[u8], sector_size: u32) -> Vec<u8> {
    let sector_size = usize_from_u32(sector_size);
    let padded_len = data.len().div_ceil(sector_size) * sector_size;
    if padded_len == data.len() {
        return data.to_vec();
    }
    let mut v = data.to_vec();
    v.resize(padded_len, 0);
    v
}

/// §4.1: translate block addresses into sectors, encrypt/decrypt,
/// hash/verify, and own the weak-reference block cache.
pub(crate) struct BlockDevice {
    sector_device: RefCell<Box<dyn SectorDevice>>,
    key: Option<Key>,
    cache: RefCell<BTreeMap<DeviceBlockIndex, Weak<RefCell<Block>>>>,
}

impl BlockDevice {
    pub(crate) fn new(
        sector_device: Box<dyn SectorDevice>,
        key: Option<Key>,
    ) -> Rc<Self> {
        Rc::new(Self {
            sector_device: RefCell::new(sector_device),
            key,
            cache: RefCell::new(BTreeMap::new()),
        })
    }

    pub(crate) fn sector_size(&self) -> u32 {
        self.sector_device.borrow().sector_size()
    }

    pub(crate) fn sector_count(&self) -> u64 {
        self.sector_device.borrow().sector_count()
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.sector_device.borrow().is_read_only()
    }

    pub(crate) fn get_from_cache(
        &self,
        device_block: DeviceBlockIndex,
    ) -> Option<BlockRef> {
        self.cache.borrow().get(&device_block)?.upgrade()
    }

    fn add_to_cache(&self, device_block: DeviceBlockIndex, block: &BlockRef) {
        self.cache
            .borrow_mut()
            .insert(device_block, Rc::downgrade(block));
    }

    pub(crate) fn remove_from_cache(&self, device_block: DeviceBlockIndex) {
        self.cache.borrow_mut().remove(&device_block);
    }

    /// §4.1 `ReadBlock`. Reads sectors, decrypts in place, optionally
    /// verifies the hash.
    fn read_raw(
        &self,
        device_block: DeviceBlockIndex,
        size_log2: BlockSizeLog2,
    ) -> Result<Vec<u8>, WfsError> {
        let mut data = vec![0u8; size_log2.to_usize()];
        self.sector_device
            .borrow_mut()
            .read_sectors(device_block, &mut data)
            .map_err(WfsError::Io)?;
        Ok(data)
    }

    fn decrypt(&self, data: &mut [u8], iv_seed: u32) {
        if let Some(key) = &self.key {
            let iv = crypto::build_iv(
                data.len() as u32,
                iv_seed,
                self.sector_count() as u32,
                self.sector_size(),
            );
            crypto::cbc_decrypt(key, &iv, data);
        }
    }

    fn write_raw(
        &self,
        device_block: DeviceBlockIndex,
        data: &[u8],
        iv_seed: u32,
        encrypt: bool,
    ) -> Result<(), WfsError> {
        if self.is_read_only() {
            return Err(WfsError::Io(Box::new(ReadOnlyDevice)));
        }
        let mut scratch = data.to_vec();
        if encrypt {
            if let Some(key) = &self.key {
                let iv = crypto::build_iv(
                    scratch.len() as u32,
                    iv_seed,
                    self.sector_count() as u32,
                    self.sector_size(),
                );
                crypto::cbc_encrypt(key, &iv, &mut scratch);
            }
        }
        self.sector_device
            .borrow_mut()
            .write_sectors(device_block, &scratch)
            .map_err(WfsError::Io)
    }

    /// §4.3 `LoadMetadataBlock`. Metadata blocks are self-hashed.
    pub(crate) fn load_metadata_block(
        self: &Rc<Self>,
        device_block: DeviceBlockIndex,
        size_log2: BlockSizeLog2,
        iv_seed: u32,
        encrypted: bool,
        new_block: bool,
        check_hash: bool,
    ) -> Result<BlockRef, WfsError> {
        if let Some(existing) = self.get_from_cache(device_block) {
            return Ok(existing);
        }

        const HASH_OFFSET: usize = 4;
        let data = if new_block {
            vec![0u8; size_log2.to_usize()]
        } else {
            let mut data = self.read_raw(device_block, size_log2)?;
            if encrypted {
                self.decrypt(&mut data, iv_seed);
            }
            if check_hash {
                let stored: Hash = data[HASH_OFFSET..HASH_OFFSET + 20]
                    .try_into()
                    .unwrap();
                let computed = self_hash(&data, HASH_OFFSET);
                if stored != computed {
                    return Err(WfsError::BlockBadHash);
                }
            }
            data
        };

        let block = Rc::new(RefCell::new(Block {
            device: Rc::clone(self),
            device_block,
            size_log2,
            iv_seed,
            encrypted,
            hash_location: HashLocation::SelfEmbedded {
                offset: HASH_OFFSET,
            },
            data,
            dirty: new_block,
            detached: false,
        }));
        self.add_to_cache(device_block, &block);
        Ok(block)
    }

    /// §4.3 `LoadDataBlock`. The hash lives in the caller-supplied
    /// parent metadata block.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn load_data_block(
        self: &Rc<Self>,
        device_block: DeviceBlockIndex,
        size_log2: BlockSizeLog2,
        iv_seed: u32,
        encrypted: bool,
        parent: BlockRef,
        hash_offset: usize,
        new_block: bool,
        check_hash: bool,
    ) -> Result<BlockRef, WfsError> {
        if let Some(existing) = self.get_from_cache(device_block) {
            return Ok(existing);
        }

        let data = if new_block {
            vec![0u8; size_log2.to_usize()]
        } else {
            let mut data = self.read_raw(device_block, size_log2)?;
            if encrypted {
                self.decrypt(&mut data, iv_seed);
            }
            if check_hash {
                let stored: Hash = {
                    let p = parent.borrow();
                    p.data()[hash_offset..hash_offset + 20]
                        .try_into()
                        .unwrap()
                };
                let computed =
                    crypto::sha1(&pad_to_sector(&data, self.sector_size()));
                if stored != computed {
                    return Err(WfsError::BlockBadHash);
                }
            }
            data
        };

        let block = Rc::new(RefCell::new(Block {
            device: Rc::clone(self),
            device_block,
            size_log2,
            iv_seed,
            encrypted,
            hash_location: HashLocation::Parent {
                parent,
                offset: hash_offset,
            },
            data,
            dirty: new_block,
            detached: false,
        }));
        self.add_to_cache(device_block, &block);
        Ok(block)
    }

    /// §4.8 `Flush`: walk the block cache and flush all live dirty
    /// blocks.
    pub(crate) fn flush_all(&self) -> Result<(), WfsError> {
        let live: Vec<BlockRef> = self
            .cache
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for block in live {
            block.borrow_mut().flush()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ReadOnlyDevice;

impl core::fmt::Display for ReadOnlyDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "device is read-only")
    }
}

impl core::error::Error for ReadOnlyDevice {}
