//! AES-256-GCM sealing with a data key.
//!
//! A sealed value is the base64 (no padding) encoding of:
//!
//! ```text
//! u32 BE len | ciphertext | u8 len | algorithm | u8 len | key id | u8 len | root key id | u8 len | nonce
//! ```
//!
//! The key id is the first four bytes of SHA-256 over the encrypted data key,
//! so a value can be matched to the key that sealed it without decrypting.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const ALGORITHM_AESGCM: &str = "aesgcm";

const KEY_LEN: usize = 32;
const KEY_ID_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("key is the wrong size {0}, expected 32 bytes")]
    WrongKeySize(usize),
    #[error("missing key")]
    MissingKey,
    #[error("decoding payload: {0}")]
    Decode(String),
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
    #[error("supplied key cannot decrypt this message; wrong key was used")]
    WrongKey,
    #[error("encrypting payload")]
    Encrypt,
    #[error("opening seal")]
    Open,
}

/// A data key. `unencrypted` lives only in memory and is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    unencrypted: Vec<u8>,
    /// The data key encrypted by the root key; safe to store.
    pub encrypted: Vec<u8>,
    pub algorithm: String,
    pub root_key_id: String,
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("algorithm", &self.algorithm)
            .field("root_key_id", &self.root_key_id)
            .finish_non_exhaustive()
    }
}

impl SymmetricKey {
    pub fn new(unencrypted: Vec<u8>, encrypted: Vec<u8>, root_key_id: &str) -> Self {
        Self {
            unencrypted,
            encrypted,
            algorithm: ALGORITHM_AESGCM.to_string(),
            root_key_id: root_key_id.to_string(),
        }
    }

    /// A fresh random 256-bit key with no encrypted form yet.
    pub fn generate_plain() -> Vec<u8> {
        Aes256Gcm::generate_key(OsRng).to_vec()
    }

    fn key_id(&self) -> [u8; KEY_ID_LEN] {
        let digest = Sha256::digest(&self.encrypted);
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        id
    }

    fn cipher(&self) -> Result<Aes256Gcm, SealError> {
        if self.unencrypted.is_empty() {
            return Err(SealError::MissingKey);
        }
        if self.unencrypted.len() != KEY_LEN {
            return Err(SealError::WrongKeySize(self.unencrypted.len()));
        }
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.unencrypted)))
    }
}

struct Payload {
    ciphertext: Vec<u8>,
    algorithm: String,
    key_id: Vec<u8>,
    root_key_id: String,
    nonce: Vec<u8>,
}

impl Payload {
    fn marshal(&self) -> Result<Vec<u8>, SealError> {
        let short = |b: &[u8]| u8::try_from(b.len()).map_err(|_| SealError::Malformed("field too long"));

        let mut out = Vec::with_capacity(self.ciphertext.len() + 64);
        let ct_len =
            u32::try_from(self.ciphertext.len()).map_err(|_| SealError::Malformed("ciphertext too long"))?;
        out.extend_from_slice(&ct_len.to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        for field in [
            self.algorithm.as_bytes(),
            &self.key_id,
            self.root_key_id.as_bytes(),
            &self.nonce,
        ] {
            out.push(short(field)?);
            out.extend_from_slice(field);
        }
        Ok(out)
    }

    fn unmarshal(mut b: &[u8]) -> Result<Self, SealError> {
        fn take<'a>(b: &mut &'a [u8], n: usize) -> Result<&'a [u8], SealError> {
            if b.len() < n {
                return Err(SealError::Malformed("unexpected end of payload"));
            }
            let (head, tail) = b.split_at(n);
            *b = tail;
            Ok(head)
        }
        fn short<'a>(b: &mut &'a [u8]) -> Result<&'a [u8], SealError> {
            let n = take(b, 1)?[0] as usize;
            take(b, n)
        }

        let mut len = [0u8; 4];
        len.copy_from_slice(take(&mut b, 4)?);
        let ciphertext = take(&mut b, u32::from_be_bytes(len) as usize)?.to_vec();
        let algorithm = String::from_utf8_lossy(short(&mut b)?).into_owned();
        let key_id = short(&mut b)?.to_vec();
        let root_key_id = String::from_utf8_lossy(short(&mut b)?).into_owned();
        let nonce = short(&mut b)?.to_vec();

        Ok(Self {
            ciphertext,
            algorithm,
            key_id,
            root_key_id,
            nonce,
        })
    }
}

/// Encrypt `plain` and return the unencoded payload.
pub fn seal_raw(key: &SymmetricKey, plain: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher = key.cipher()?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain)
        .map_err(|_| SealError::Encrypt)?;

    Payload {
        ciphertext,
        algorithm: key.algorithm.clone(),
        key_id: key.key_id().to_vec(),
        root_key_id: key.root_key_id.clone(),
        nonce: nonce.to_vec(),
    }
    .marshal()
}

pub fn unseal_raw(key: &SymmetricKey, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher = key.cipher()?;
    let payload = Payload::unmarshal(sealed)?;

    if payload.key_id != key.key_id() {
        return Err(SealError::WrongKey);
    }
    if payload.nonce.len() != 12 {
        return Err(SealError::Malformed("nonce has the wrong size"));
    }

    cipher
        .decrypt(Nonce::from_slice(&payload.nonce), payload.ciphertext.as_ref())
        .map_err(|_| SealError::Open)
}

/// Encrypt `plain` and return it as unpadded base64 text.
pub fn seal(key: &SymmetricKey, plain: &[u8]) -> Result<String, SealError> {
    Ok(STANDARD_NO_PAD.encode(seal_raw(key, plain)?))
}

pub fn unseal(key: &SymmetricKey, encoded: &str) -> Result<Vec<u8>, SealError> {
    if key.unencrypted.is_empty() {
        return Err(SealError::MissingKey);
    }
    let sealed = STANDARD_NO_PAD
        .decode(encoded.as_bytes())
        .map_err(|e| SealError::Decode(e.to_string()))?;
    unseal_raw(key, &sealed)
}
