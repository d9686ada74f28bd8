//! Repository cipher support.
//!
//! Payloads are encrypted with AES-256-CBC. The key is derived from the
//! configured passphrase with PBKDF2; each stream gets a random IV that is
//! prefixed to the ciphertext, and PKCS-7 padding closes the final block.
//!
//! Keys form a two level hierarchy: the user passphrase protects the info
//! files, which carry a randomly generated subkey per stanza. File payloads
//! (archive segments, manifest copies, backup files) are encrypted under the
//! subkey, so rotating the user passphrase only requires re-encrypting the
//! info files.

use anyhow::{format_err, Error};
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::rand::rand_bytes;
use openssl::symm::{Cipher, Crypter, Mode};

use crate::error::{vault_err, ErrorClass};

pub const CIPHER_BLOCK_SIZE: usize = 16;

const KEY_SIZE: usize = 32;
const DERIVE_ROUNDS: usize = 10000;
const DERIVE_SALT: &[u8] = b"pgvault-cipher-v1";

/// Cipher applied to repository files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherType {
    None,
    Aes256Cbc,
}

impl CipherType {
    pub fn parse(value: &str) -> Result<CipherType, Error> {
        match value {
            "none" => Ok(CipherType::None),
            "aes-256-cbc" => Ok(CipherType::Aes256Cbc),
            _ => Err(vault_err(
                ErrorClass::Option,
                format!("invalid cipher type '{}'", value),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CipherType::None => "none",
            CipherType::Aes256Cbc => "aes-256-cbc",
        }
    }
}

/// Key material derived from a passphrase.
#[derive(Clone)]
pub struct CipherConfig {
    key: [u8; KEY_SIZE],
}

impl CipherConfig {
    pub fn new(passphrase: &str) -> Result<Self, Error> {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac(
            passphrase.as_bytes(),
            DERIVE_SALT,
            DERIVE_ROUNDS,
            MessageDigest::sha256(),
            &mut key,
        )
        .map_err(|err| format_err!("key derivation failed - {}", err))?;

        Ok(CipherConfig { key })
    }

    pub fn random_iv() -> Result<[u8; CIPHER_BLOCK_SIZE], Error> {
        let mut iv = [0u8; CIPHER_BLOCK_SIZE];
        rand_bytes(&mut iv).map_err(|err| format_err!("iv generation failed - {}", err))?;
        Ok(iv)
    }

    pub fn crypter(&self, mode: Mode, iv: &[u8]) -> Result<Crypter, Error> {
        let mut crypter = Crypter::new(Cipher::aes_256_cbc(), mode, &self.key, Some(iv))
            .map_err(|err| vault_err(ErrorClass::Crypto, format!("cipher init failed - {}", err)))?;
        crypter.pad(true);
        Ok(crypter)
    }

    /// One-shot encrypt, IV prefixed to the result.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let iv = Self::random_iv()?;
        let mut crypter = self.crypter(Mode::Encrypt, &iv)?;

        let mut out = Vec::with_capacity(CIPHER_BLOCK_SIZE + data.len() + CIPHER_BLOCK_SIZE);
        out.extend_from_slice(&iv);

        let mut chunk = vec![0u8; data.len() + CIPHER_BLOCK_SIZE];
        let mut count = crypter
            .update(data, &mut chunk)
            .map_err(|err| vault_err(ErrorClass::Crypto, format!("encrypt failed - {}", err)))?;
        out.extend_from_slice(&chunk[..count]);

        count = crypter
            .finalize(&mut chunk)
            .map_err(|err| vault_err(ErrorClass::Crypto, format!("encrypt failed - {}", err)))?;
        out.extend_from_slice(&chunk[..count]);

        Ok(out)
    }

    /// One-shot decrypt of an IV-prefixed stream.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() < CIPHER_BLOCK_SIZE {
            return Err(vault_err(
                ErrorClass::Crypto,
                "encrypted data missing cipher header",
            ));
        }

        let (iv, payload) = data.split_at(CIPHER_BLOCK_SIZE);
        let mut crypter = self.crypter(Mode::Decrypt, iv)?;

        let mut out = vec![0u8; payload.len() + CIPHER_BLOCK_SIZE];
        let mut total = crypter
            .update(payload, &mut out)
            .map_err(|err| vault_err(ErrorClass::Crypto, format!("decrypt failed - {}", err)))?;
        total += crypter
            .finalize(&mut out[total..])
            .map_err(|err| {
                vault_err(
                    ErrorClass::Crypto,
                    format!("unable to decrypt - wrong passphrase or corrupt data - {}", err),
                )
            })?;

        out.truncate(total);
        Ok(out)
    }
}

/// Random passphrase for the per-stanza subkey, stored in the info files.
pub fn generate_passphrase() -> Result<String, Error> {
    let mut raw = [0u8; 48];
    rand_bytes(&mut raw).map_err(|err| format_err!("passphrase generation failed - {}", err))?;
    Ok(base64::encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let config = CipherConfig::new("correct horse").unwrap();
        let data = b"WAL segment payload".to_vec();

        let encrypted = config.encrypt(&data).unwrap();
        assert_ne!(encrypted, data);
        // IV prefix plus at least one padded block.
        assert!(encrypted.len() >= CIPHER_BLOCK_SIZE + data.len());

        assert_eq!(config.decrypt(&encrypted).unwrap(), data);
    }

    #[test]
    fn iv_makes_ciphertext_unique() {
        let config = CipherConfig::new("pass").unwrap();
        let a = config.encrypt(b"same data").unwrap();
        let b = config.encrypt(b"same data").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let good = CipherConfig::new("right").unwrap();
        let bad = CipherConfig::new("wrong").unwrap();

        let encrypted = good.encrypt(b"secret").unwrap();
        assert!(bad.decrypt(&encrypted).is_err());
    }

    #[test]
    fn short_stream_rejected() {
        let config = CipherConfig::new("pass").unwrap();
        assert!(config.decrypt(b"short").is_err());
    }

    #[test]
    fn generated_passphrases_differ() {
        assert_ne!(generate_passphrase().unwrap(), generate_passphrase().unwrap());
    }
}
