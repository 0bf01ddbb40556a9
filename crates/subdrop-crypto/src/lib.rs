//! # Password-Based File Encryption
//!
//! Optional symmetric encryption applied to a file before it enters the
//! transfer protocol. With no password the layer is the identity. With a
//! password, the file body is replaced by a single opaque blob:
//!
//! ```text
//! +----------------+----------------+------------------------------+
//! | Salt (16B)     | IV (12B)       | Ciphertext (+16B tag)        |
//! +----------------+----------------+------------------------------+
//! ```
//!
//! The key is derived with PBKDF2-HMAC-SHA256 at 100,000 iterations and the
//! body sealed with AES-256-GCM. An encrypted file is renamed with the
//! reserved `.encrypted` suffix; a receiver cannot tell an encrypted payload
//! from the suffix alone without attempting decryption.
//!
//! Authentication failure (wrong password or corrupted data) is an ordinary
//! error value, never a panic; the receiving side limits attempts before
//! discarding the file.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// IV (nonce) length in bytes.
pub const IV_LEN: usize = 12;

/// Byte offset where the ciphertext begins.
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN;

/// PBKDF2 iteration count.
pub const PBKDF2_ROUNDS: u32 = 100_000;

/// Reserved file name suffix marking an encrypted payload.
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";

/// Encryption layer failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Blob shorter than salt + IV; cannot even be split.
    #[error("encrypted payload too short: {0} bytes")]
    TooShort(usize),

    /// Authenticated decryption failed: wrong password or corrupted data.
    #[error("decryption failed: wrong password or corrupted data")]
    BadPassword,

    /// AEAD encryption failed.
    #[error("encryption failed")]
    Encrypt,
}

/// Derive the 256-bit file key from a password and salt.
fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt `data` under `password` into one `salt || iv || ciphertext` blob.
pub fn encrypt(data: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), data)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Split a blob at the fixed offsets, re-derive the key and decrypt.
///
/// # Errors
///
/// [`CryptoError::BadPassword`] for a wrong password or corrupted data;
/// [`CryptoError::TooShort`] if the blob cannot hold a header.
pub fn decrypt(blob: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < HEADER_LEN {
        return Err(CryptoError::TooShort(blob.len()));
    }
    let salt = &blob[..SALT_LEN];
    let iv = &blob[SALT_LEN..HEADER_LEN];
    let ciphertext = &blob[HEADER_LEN..];

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::BadPassword)
}

/// A file prepared for transfer: possibly renamed and sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFile {
    pub file_name: String,
    pub data: Vec<u8>,
    pub encrypted: bool,
}

/// Apply the encryption layer to an outgoing file.
///
/// An absent or blank password is the identity: the file passes through
/// untouched. Otherwise the body is sealed and the name gains the reserved
/// suffix.
pub fn seal_file(
    file_name: &str,
    data: Vec<u8>,
    password: Option<&str>,
) -> Result<SealedFile, CryptoError> {
    match password.map(str::trim).filter(|p| !p.is_empty()) {
        None => Ok(SealedFile {
            file_name: file_name.to_string(),
            data,
            encrypted: false,
        }),
        Some(password) => {
            let sealed = encrypt(&data, password)?;
            Ok(SealedFile {
                file_name: format!("{file_name}{ENCRYPTED_SUFFIX}"),
                data: sealed,
                encrypted: true,
            })
        }
    }
}

/// Whether a received file name carries the reserved suffix.
pub fn is_encrypted_name(file_name: &str) -> bool {
    file_name.ends_with(ENCRYPTED_SUFFIX)
}

/// Original name with the reserved suffix removed, if present.
pub fn original_name(file_name: &str) -> &str {
    file_name.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(file_name)
}
