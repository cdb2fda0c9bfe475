// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::boxed::Box;
use core::error::Error;
use core::fmt::{self, Debug, Display, Formatter};

/// Boxed error, used for IO errors. This is similar in spirit to
/// `anyhow::Error`, although a much simpler implementation.
pub(crate) type BoxedError = Box<dyn Error + Send + Sync + 'static>;

/// Common error type for all [`WfsDevice`] operations.
///
/// [`WfsDevice`]: crate::WfsDevice
#[derive(Debug)]
#[non_exhaustive]
pub enum WfsError {
    /// A path component does not exist.
    ItemNotFound,

    /// An operation that requires a directory was attempted on a
    /// non-directory entry.
    NotDirectory,

    /// An operation that requires a regular file was attempted on a
    /// directory or link.
    NotFile,

    /// A block's stored SHA-1 hash did not match the hash of its
    /// decrypted contents.
    BlockBadHash,

    /// The filesystem version does not match the one supported value,
    /// `0x01010800`.
    InvalidWfsVersion,

    /// The allocator has no extent large enough to satisfy a request,
    /// or a file's in-metadata storage is full.
    NoSpace,

    /// A structural invariant of the on-disk format was violated.
    Corrupt(Corrupt),

    /// An IO operation failed. This error comes from the [`SectorDevice`]
    /// passed to [`BlockDevice::new`].
    ///
    /// [`SectorDevice`]: crate::device::SectorDevice
    /// [`BlockDevice::new`]: crate::block::BlockDevice::new
    Io(BoxedError),
}

impl Display for WfsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ItemNotFound => write!(f, "item not found"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::NotFile => write!(f, "not a file"),
            Self::BlockBadHash => write!(f, "block hash verification failed"),
            Self::InvalidWfsVersion => {
                write!(f, "unsupported wfs version")
            }
            Self::NoSpace => write!(f, "no space left on device"),
            Self::Corrupt(c) => write!(f, "corrupt filesystem: {c}"),
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl Error for WfsError {}

impl From<CorruptKind> for WfsError {
    fn from(c: CorruptKind) -> Self {
        Self::Corrupt(Corrupt(c))
    }
}

#[cfg(feature = "std")]
impl From<WfsError> for std::io::Error {
    fn from(e: WfsError) -> Self {
        use std::io::ErrorKind::*;

        match e {
            WfsError::NotDirectory | WfsError::NotFile => InvalidInput.into(),
            WfsError::ItemNotFound => NotFound.into(),
            WfsError::Io(inner) => Self::other(inner),
            WfsError::BlockBadHash
            | WfsError::InvalidWfsVersion
            | WfsError::NoSpace
            | WfsError::Corrupt(_) => Self::other(e),
        }
    }
}

/// Error type used in [`WfsError::Corrupt`] when a structural invariant
/// of the on-disk format was violated.
#[derive(Clone, Eq, PartialEq)]
pub struct Corrupt(CorruptKind);

impl Debug for Corrupt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <CorruptKind as Debug>::fmt(&self.0, f)
    }
}

impl Display for Corrupt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <CorruptKind as Display>::fmt(&self.0, f)
    }
}

/// §7 enumerates these as the structural-check error kinds:
/// `AreaHeaderCorrupted`, `DirectoryCorrupted`,
/// `FreeBlocksAllocatorCorrupted`, `FileDataCorrupted`,
/// `FileMetadataCorrupted`, `TransactionsAreaCorrupted`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub(crate) enum CorruptKind {
    /// `WfsAreaHeader`/`WfsQuotaAreaHeader` failed a sanity check.
    AreaHeader,

    /// A directory entry's stored `filename_length` doesn't match the
    /// name it's filed under.
    Directory,

    /// A free-blocks allocator root block failed its `always_one` check.
    FreeBlocksAllocator,

    /// A file's data block or cluster content doesn't match its stored
    /// SHA-1 hash.
    FileData,

    /// A file's `EntryMetadata` record is malformed.
    FileMetadata,

    /// The reserved transactions area header failed a sanity check.
    TransactionsArea,

    /// The sub-block allocator's free list is malformed.
    SubBlockAllocator,
}

impl Display for CorruptKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::AreaHeader => write!(f, "invalid area header"),
            Self::Directory => write!(f, "invalid directory tree node"),
            Self::FreeBlocksAllocator => {
                write!(f, "invalid free-blocks allocator tree node")
            }
            Self::FileData => write!(f, "invalid file data layout"),
            Self::FileMetadata => write!(f, "invalid file metadata record"),
            Self::TransactionsArea => {
                write!(f, "invalid transactions area header")
            }
            Self::SubBlockAllocator => {
                write!(f, "invalid sub-block allocator free list")
            }
        }
    }
}

impl PartialEq<CorruptKind> for WfsError {
    fn eq(&self, ck: &CorruptKind) -> bool {
        if let Self::Corrupt(c) = self {
            c.0 == *ck
        } else {
            false
        }
    }
}
