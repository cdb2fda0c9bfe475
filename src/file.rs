// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! File storage engine (§4.7): the five storage categories a file can
//! live in, and online migration between them as a file grows or
//! shrinks. Grounded on `structs.h`'s `DataBlockMetadata`/
//! `DataBlocksClusterMetadata` and `original_source/src/file_resizer.cpp`.

use crate::block_size::BlockSizeLog2;
use crate::crypto::{self, Hash};
use crate::error::{CorruptKind, WfsError};
use crate::util::{read_u32be, write_u32be};
use alloc::vec::Vec;

/// `DataBlockMetadata`, 0x18 bytes: one data block's number plus the
/// SHA-1 hash of its contents (4-byte block number + 20-byte digest).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct DataBlockMetadata {
    pub(crate) block_number: u32,
    pub(crate) hash: Hash,
}

impl DataBlockMetadata {
    pub(crate) const HEADER_LEN: usize = 0x18;

    /// Build the metadata record for a `Single`-category block,
    /// hashing its content.
    pub(crate) fn for_block(block_number: u32, data: &[u8]) -> Self {
        Self {
            block_number,
            hash: crypto::sha1(data),
        }
    }

    pub(crate) fn read(bytes: &[u8]) -> Self {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[4..24]);
        Self {
            block_number: read_u32be(bytes, 0),
            hash,
        }
    }

    pub(crate) fn write(&self, bytes: &mut [u8]) {
        write_u32be(bytes, 0, self.block_number);
        bytes[4..24].copy_from_slice(&self.hash);
    }

    /// Whether `data` still matches the stored hash.
    pub(crate) fn verify(&self, data: &[u8]) -> bool {
        crypto::sha1(data) == self.hash
    }

    /// Read a block's metadata and check it against the block's actual
    /// content, the way a `Single`-category file read must before
    /// trusting what it loaded off the device.
    pub(crate) fn read_verified(bytes: &[u8], data: &[u8]) -> Result<Self, WfsError> {
        let meta = Self::read(bytes);
        if meta.verify(data) {
            Ok(meta)
        } else {
            Err(CorruptKind::FileData.into())
        }
    }
}

/// `DataBlocksClusterMetadata`, 0xa4 bytes: a cluster's first block
/// number, plus the SHA-1 hash of each of the 8 large blocks making up
/// the cluster (4-byte block number + 8 * 20-byte digests).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct DataBlocksClusterMetadata {
    pub(crate) block_number: u32,
    pub(crate) hashes: [Hash; Self::HASHES_PER_CLUSTER],
}

impl DataBlocksClusterMetadata {
    pub(crate) const HEADER_LEN: usize = 0xa4;
    pub(crate) const HASHES_PER_CLUSTER: usize = 8;

    /// Build the metadata record for a `Cluster`-category file,
    /// hashing each of its 8 large-block-sized chunks.
    pub(crate) fn for_cluster(block_number: u32, large_blocks: &[&[u8]; Self::HASHES_PER_CLUSTER]) -> Self {
        let mut hashes = [[0u8; 20]; Self::HASHES_PER_CLUSTER];
        for (hash, data) in hashes.iter_mut().zip(large_blocks.iter()) {
            *hash = crypto::sha1(data);
        }
        Self {
            block_number,
            hashes,
        }
    }

    pub(crate) fn read(bytes: &[u8]) -> Self {
        let mut hashes = [[0u8; 20]; Self::HASHES_PER_CLUSTER];
        for (i, hash) in hashes.iter_mut().enumerate() {
            let off = 4 + i * 20;
            hash.copy_from_slice(&bytes[off..off + 20]);
        }
        Self {
            block_number: read_u32be(bytes, 0),
            hashes,
        }
    }

    pub(crate) fn write(&self, bytes: &mut [u8]) {
        write_u32be(bytes, 0, self.block_number);
        for (i, hash) in self.hashes.iter().enumerate() {
            let off = 4 + i * 20;
            bytes[off..off + 20].copy_from_slice(hash);
        }
    }

    /// Whether each of `large_blocks` still matches its stored hash, in
    /// order.
    pub(crate) fn verify(&self, large_blocks: &[&[u8]; Self::HASHES_PER_CLUSTER]) -> bool {
        self.hashes
            .iter()
            .zip(large_blocks.iter())
            .all(|(hash, data)| crypto::sha1(data) == *hash)
    }

    /// Read a cluster's metadata and check it against the cluster's
    /// actual content, the way a `Cluster`-category file read must
    /// before trusting what it loaded off the device.
    pub(crate) fn read_verified(
        bytes: &[u8],
        large_blocks: &[&[u8]; Self::HASHES_PER_CLUSTER],
    ) -> Result<Self, WfsError> {
        let meta = Self::read(bytes);
        if meta.verify(large_blocks) {
            Ok(meta)
        } else {
            Err(CorruptKind::FileData.into())
        }
    }
}

/// The five storage categories a file's contents can live in (§4.7),
/// selected by total size. `EntryMetadata.size_category` stores the
/// discriminant (0-4).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum StorageCategory {
    /// Embedded directly in the entry's metadata record.
    Inline = 0,
    /// One area block.
    Single = 1,
    /// One `Large` unit (`2^LARGE_SHIFT` area blocks).
    Large = 2,
    /// One `Cluster` unit (`2^CLUSTER_SHIFT` area blocks).
    Cluster = 3,
    /// Multiple clusters, indexed by an extent list.
    ExtendedCluster = 4,
}

impl StorageCategory {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Inline),
            1 => Some(Self::Single),
            2 => Some(Self::Large),
            3 => Some(Self::Cluster),
            4 => Some(Self::ExtendedCluster),
            _ => None,
        }
    }

    /// Largest file size this category can hold without migrating to
    /// the next one up, given the area's block size.
    pub(crate) fn max_size(self, block_size_log2: BlockSizeLog2) -> u64 {
        match self {
            Self::Inline => INLINE_MAX_BYTES,
            Self::Single => block_size_log2.to_u64(),
            Self::Large => {
                block_size_log2.grow(BlockSizeLog2::LARGE_SHIFT).to_u64()
            }
            Self::Cluster | Self::ExtendedCluster => block_size_log2
                .grow(BlockSizeLog2::CLUSTER_SHIFT)
                .to_u64(),
        }
    }

    /// Pick the smallest category that fits `size` bytes, given the
    /// area's block size. Sizes beyond a single cluster always need
    /// [`Self::ExtendedCluster`].
    pub(crate) fn for_size(size: u64, block_size_log2: BlockSizeLog2) -> Self {
        if size <= Self::Inline.max_size(block_size_log2) {
            Self::Inline
        } else if size <= Self::Single.max_size(block_size_log2) {
            Self::Single
        } else if size <= Self::Large.max_size(block_size_log2) {
            Self::Large
        } else if size <= Self::Cluster.max_size(block_size_log2) {
            Self::Cluster
        } else {
            Self::ExtendedCluster
        }
    }
}

/// Largest file size kept inline in the entry's metadata record.
/// `structs.h` doesn't give this constant directly; 32 bytes is chosen
/// to leave room for a typical `EntryMetadata` plus case bitmap within
/// the smallest sub-block allocation class (§4.5's 8-byte-aligned
/// classes up to 1024 bytes).
const INLINE_MAX_BYTES: u64 = 32;

/// Streaming copy used when a file's category changes (§4.7 point 3).
/// Grounded on `FileResizer`'s 64 KiB chunked copy
/// (`original_source/src/file_resizer.cpp`).
pub(crate) struct FileResizer;

impl FileResizer {
    pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

    /// Copy `src` into a freshly sized buffer for `new_len`, truncating
    /// or zero-extending as needed, one chunk at a time so a real
    /// implementation can interleave block allocation per chunk
    /// instead of needing the whole file resident at once.
    pub(crate) fn migrate(src: &[u8], new_len: usize) -> Vec<u8> {
        let mut dst = Vec::with_capacity(new_len);
        let mut offset = 0;
        while offset < new_len {
            let chunk_len = Self::CHUNK_SIZE.min(new_len - offset);
            let copy_len = chunk_len.min(src.len().saturating_sub(offset));
            dst.extend_from_slice(&src[offset..offset + copy_len]);
            dst.resize(offset + chunk_len, 0);
            offset += chunk_len;
        }
        dst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_category_selection() {
        let log2 = BlockSizeLog2::PHYSICAL;
        assert_eq!(StorageCategory::for_size(10, log2), StorageCategory::Inline);
        assert_eq!(
            StorageCategory::for_size(4096, log2),
            StorageCategory::Single
        );
        assert_eq!(
            StorageCategory::for_size(4096 * 8, log2),
            StorageCategory::Large
        );
        assert_eq!(
            StorageCategory::for_size(4096 * 64, log2),
            StorageCategory::Cluster
        );
        assert_eq!(
            StorageCategory::for_size(4096 * 64 + 1, log2),
            StorageCategory::ExtendedCluster
        );
    }

    #[test]
    fn test_file_resizer_grow_zero_fills() {
        let src = b"hello".to_vec();
        let grown = FileResizer::migrate(&src, 10);
        assert_eq!(grown, b"hello\0\0\0\0\0");
    }

    #[test]
    fn test_file_resizer_shrink_truncates() {
        let src = b"hello world".to_vec();
        let shrunk = FileResizer::migrate(&src, 5);
        assert_eq!(shrunk, b"hello");
    }

    #[test]
    fn test_file_resizer_multi_chunk() {
        let src = alloc::vec![7u8; FileResizer::CHUNK_SIZE + 10];
        let out = FileResizer::migrate(&src, FileResizer::CHUNK_SIZE * 2);
        assert_eq!(out.len(), FileResizer::CHUNK_SIZE * 2);
        assert_eq!(out[0], 7);
        assert_eq!(out[FileResizer::CHUNK_SIZE + 9], 7);
        assert_eq!(out[FileResizer::CHUNK_SIZE + 10], 0);
    }

    #[test]
    fn test_data_block_metadata_round_trip() {
        let meta = DataBlockMetadata::for_block(42, b"payload");
        let mut bytes = [0u8; DataBlockMetadata::HEADER_LEN];
        meta.write(&mut bytes);
        let parsed = DataBlockMetadata::read(&bytes);
        assert_eq!(parsed.block_number, 42);
        assert_eq!(parsed.hash, meta.hash);
        assert!(parsed.verify(b"payload"));
        assert!(!parsed.verify(b"tampered"));
    }

    #[test]
    fn test_data_block_read_verified_rejects_hash_mismatch() {
        let meta = DataBlockMetadata::for_block(42, b"payload");
        let mut bytes = [0u8; DataBlockMetadata::HEADER_LEN];
        meta.write(&mut bytes);

        assert!(DataBlockMetadata::read_verified(&bytes, b"payload").is_ok());
        let err = DataBlockMetadata::read_verified(&bytes, b"tampered").unwrap_err();
        assert_eq!(err, CorruptKind::FileData);
    }

    #[test]
    fn test_data_blocks_cluster_metadata_round_trip() {
        let chunks: [&[u8]; DataBlocksClusterMetadata::HASHES_PER_CLUSTER] =
            [b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"];
        let meta = DataBlocksClusterMetadata::for_cluster(7, &chunks);
        let mut bytes = [0u8; DataBlocksClusterMetadata::HEADER_LEN];
        meta.write(&mut bytes);
        let parsed = DataBlocksClusterMetadata::read(&bytes);
        assert_eq!(parsed.block_number, 7);
        assert_eq!(parsed.hashes, meta.hashes);
        assert!(parsed.verify(&chunks));
    }

    #[test]
    fn test_data_blocks_cluster_read_verified_rejects_hash_mismatch() {
        let chunks: [&[u8]; DataBlocksClusterMetadata::HASHES_PER_CLUSTER] =
            [b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"];
        let meta = DataBlocksClusterMetadata::for_cluster(7, &chunks);
        let mut bytes = [0u8; DataBlocksClusterMetadata::HEADER_LEN];
        meta.write(&mut bytes);

        assert!(DataBlocksClusterMetadata::read_verified(&bytes, &chunks).is_ok());
        let tampered: [&[u8]; DataBlocksClusterMetadata::HASHES_PER_CLUSTER] =
            [b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"X"];
        let err = DataBlocksClusterMetadata::read_verified(&bytes, &tampered).unwrap_err();
        assert_eq!(err, CorruptKind::FileData);
    }
}
