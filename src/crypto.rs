// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Block hashing and encryption, per §4.1 and §6.
//!
//! Hashing is plain SHA-1 over the sector-padded payload. Encryption is
//! AES-128-CBC, with a per-transfer IV built from device geometry so
//! that the same plaintext block encrypts differently depending on
//! where on the device it lives.

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha1::{Digest, Sha1};

/// A 16-byte AES-128 key.
pub type Key = [u8; 16];

/// A 20-byte SHA-1 digest.
pub type Hash = [u8; 20];

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Compute the SHA-1 digest of `data`.
#[must_use]
pub(crate) fn sha1(data: &[u8]) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Build the per-transfer IV described in §4.1 / §6: four big-endian
/// `u32` words, `[transfer_len_bytes, block_iv, total_sectors, sector_size]`.
#[must_use]
pub(crate) fn build_iv(
    transfer_len_bytes: u32,
    block_iv: u32,
    total_sectors: u32,
    sector_size: u32,
) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..4].copy_from_slice(&transfer_len_bytes.to_be_bytes());
    iv[4..8].copy_from_slice(&block_iv.to_be_bytes());
    iv[8..12].copy_from_slice(&total_sectors.to_be_bytes());
    iv[12..16].copy_from_slice(&sector_size.to_be_bytes());
    iv
}

/// AES-128-CBC encrypt `data` in place using `key` and `iv`.
///
/// `data.len()` must be a multiple of the AES block size (16 bytes);
/// every block size in this filesystem is, so no padding is needed.
///
/// # Panics
///
/// Panics if `data.len()` is not a multiple of 16.
pub(crate) fn cbc_encrypt(key: &Key, iv: &[u8; 16], data: &mut [u8]) {
    let len = data.len();
    Aes128CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .expect("data length must be a multiple of the AES block size");
}

/// AES-128-CBC decrypt `data` in place using `key` and `iv`.
///
/// # Panics
///
/// Panics if `data.len()` is not a multiple of 16.
pub(crate) fn cbc_decrypt(key: &Key, iv: &[u8; 16], data: &mut [u8]) {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .expect("data length must be a multiple of the AES block size");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1() {
        // SHA-1("") from RFC 3174 test vectors.
        assert_eq!(
            sha1(b""),
            [
                0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55,
                0xbf, 0xef, 0x95, 0x60, 0x18, 0x90, 0xaf, 0xd8, 0x07, 0x09,
            ]
        );
    }

    #[test]
    fn test_build_iv() {
        let iv = build_iv(0x1000, 0x1122_3344, 0x2000, 0x200);
        assert_eq!(
            iv,
            [
                0x00, 0x00, 0x10, 0x00, 0x11, 0x22, 0x33, 0x44, 0x00, 0x00,
                0x20, 0x00, 0x00, 0x00, 0x02, 0x00,
            ]
        );
    }

    #[test]
    fn test_cbc_round_trip() {
        let key: Key = [0x42; 16];
        let iv = build_iv(64, 7, 1000, 512);
        let mut data = [0u8; 64];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = data;
        cbc_encrypt(&key, &iv, &mut data);
        assert_ne!(data, original);
        cbc_decrypt(&key, &iv, &mut data);
        assert_eq!(data, original);
    }
}
