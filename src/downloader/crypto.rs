//! AES-128-CBC decoding of encrypted HLS segments

use crate::utils::error::DownloadError;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// Key and IV for one segment (or one whole manifest).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentKey {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl std::fmt::Debug for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key material
        f.debug_struct("SegmentKey")
            .field("iv", &hex::encode(self.iv))
            .finish_non_exhaustive()
    }
}

impl SegmentKey {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Parse hex strings as written in a manifest (`0x` prefix optional).
    pub fn from_hex(key: &str, iv: &str) -> Result<Self, DownloadError> {
        Ok(Self {
            key: parse_hex_block("key", key)?,
            iv: parse_hex_block("iv", iv)?,
        })
    }

    /// IV derived from the media sequence number, used when the manifest
    /// carries a key without an explicit IV.
    pub fn with_sequence_iv(key: [u8; 16], media_sequence: u64) -> Self {
        Self {
            key,
            iv: (media_sequence as u128).to_be_bytes(),
        }
    }
}

fn parse_hex_block(what: &str, value: &str) -> Result<[u8; 16], DownloadError> {
    let trimmed = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let bytes = hex::decode(trimmed)
        .map_err(|e| DownloadError::InvalidConfig(format!("invalid {} hex: {}", what, e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        DownloadError::InvalidConfig(format!("{} must be 16 bytes, got {}", what, b.len()))
    })
}

/// Decrypt one completed segment buffer.
///
/// `index` is only used to label the error.
pub fn decrypt(
    index: usize,
    cipher_bytes: &[u8],
    key: &SegmentKey,
) -> Result<Vec<u8>, DownloadError> {
    let decryptor = Aes128CbcDec::new_from_slices(&key.key, &key.iv).map_err(|e| {
        DownloadError::Decryption {
            index,
            reason: e.to_string(),
        }
    })?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(cipher_bytes)
        .map_err(|e| DownloadError::Decryption {
            index,
            reason: e.to_string(),
        })
}

/// Encrypt a buffer the way an HLS packager does. Mostly useful for fixtures.
pub fn encrypt(plain_bytes: &[u8], key: &SegmentKey) -> Vec<u8> {
    Aes128CbcEnc::new(&key.key.into(), &key.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain_bytes)
}
