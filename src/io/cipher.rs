//! Encrypt/decrypt filters.
//!
//! The encrypt filter prefixes a random IV to the ciphertext; the decrypt
//! filter strips it. Padding is PKCS-7, so the final block only appears when
//! the stream is flushed.

use anyhow::Error;
use openssl::symm::{Crypter, Mode};

use crate::crypt::{CipherConfig, CIPHER_BLOCK_SIZE};
use crate::error::{vault_err, ErrorClass};

use super::Filter;

pub struct CipherEncryptFilter {
    crypter: Crypter,
    iv: Option<[u8; CIPHER_BLOCK_SIZE]>,
    done: bool,
}

impl CipherEncryptFilter {
    pub fn new(config: &CipherConfig) -> Result<Self, Error> {
        let iv = CipherConfig::random_iv()?;
        let crypter = config.crypter(Mode::Encrypt, &iv)?;
        Ok(CipherEncryptFilter {
            crypter,
            iv: Some(iv),
            done: false,
        })
    }
}

impl Filter for CipherEncryptFilter {
    fn name(&self) -> &'static str {
        "cipher-encrypt"
    }

    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error> {
        if let Some(iv) = self.iv.take() {
            output.extend_from_slice(&iv);
        }

        let mut chunk = vec![0u8; input.len() + CIPHER_BLOCK_SIZE];
        if !input.is_empty() {
            let count = self
                .crypter
                .update(input, &mut chunk)
                .map_err(|err| vault_err(ErrorClass::Crypto, format!("encrypt failed - {}", err)))?;
            output.extend_from_slice(&chunk[..count]);
        }

        if eof && !self.done {
            let count = self
                .crypter
                .finalize(&mut chunk)
                .map_err(|err| vault_err(ErrorClass::Crypto, format!("encrypt failed - {}", err)))?;
            output.extend_from_slice(&chunk[..count]);
            self.done = true;
        }

        Ok(input.len())
    }

    fn done(&self) -> bool {
        self.done
    }
}

pub struct CipherDecryptFilter {
    config: CipherConfig,
    crypter: Option<Crypter>,
    iv: Vec<u8>,
    done: bool,
}

impl CipherDecryptFilter {
    pub fn new(config: &CipherConfig) -> Self {
        CipherDecryptFilter {
            config: config.clone(),
            crypter: None,
            iv: Vec::with_capacity(CIPHER_BLOCK_SIZE),
            done: false,
        }
    }
}

impl Filter for CipherDecryptFilter {
    fn name(&self) -> &'static str {
        "cipher-decrypt"
    }

    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error> {
        let mut consumed = 0;

        // Collect the IV prefix before any payload can be decrypted.
        if self.crypter.is_none() {
            let need = CIPHER_BLOCK_SIZE - self.iv.len();
            let take = need.min(input.len());
            self.iv.extend_from_slice(&input[..take]);
            consumed += take;

            if self.iv.len() == CIPHER_BLOCK_SIZE {
                self.crypter = Some(self.config.crypter(Mode::Decrypt, &self.iv)?);
            } else if eof {
                return Err(vault_err(
                    ErrorClass::Crypto,
                    "encrypted stream ends before cipher header is complete",
                ));
            } else {
                return Ok(consumed);
            }
        }

        let crypter = self.crypter.as_mut().unwrap();
        let payload = &input[consumed..];
        let mut chunk = vec![0u8; payload.len() + CIPHER_BLOCK_SIZE];

        if !payload.is_empty() {
            let count = crypter
                .update(payload, &mut chunk)
                .map_err(|err| vault_err(ErrorClass::Crypto, format!("decrypt failed - {}", err)))?;
            output.extend_from_slice(&chunk[..count]);
            consumed += payload.len();
        }

        if eof && !self.done {
            let count = crypter.finalize(&mut chunk).map_err(|err| {
                vault_err(
                    ErrorClass::Crypto,
                    format!("unable to decrypt - wrong passphrase or corrupt data - {}", err),
                )
            })?;
            output.extend_from_slice(&chunk[..count]);
            self.done = true;
        }

        Ok(consumed)
    }

    fn done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FilterGroup;

    fn encrypt(config: &CipherConfig, data: &[u8], chunk: usize) -> Vec<u8> {
        let mut group =
            FilterGroup::new().add(Box::new(CipherEncryptFilter::new(config).unwrap()));
        let mut out = Vec::new();
        for part in data.chunks(chunk.max(1)) {
            group.process(part, false, &mut out).unwrap();
        }
        group.process(&[], true, &mut out).unwrap();
        out
    }

    fn decrypt(config: &CipherConfig, data: &[u8], chunk: usize) -> Result<Vec<u8>, Error> {
        let mut group = FilterGroup::new().add(Box::new(CipherDecryptFilter::new(config)));
        let mut out = Vec::new();
        for part in data.chunks(chunk.max(1)) {
            group.process(part, false, &mut out)?;
        }
        group.process(&[], true, &mut out)?;
        Ok(out)
    }

    #[test]
    fn round_trip_various_chunk_sizes() {
        let config = CipherConfig::new("test-pass").unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|v| (v % 256) as u8).collect();

        for chunk in [1, 7, 16, 4096] {
            let encrypted = encrypt(&config, &data, chunk);
            assert_eq!(decrypt(&config, &encrypted, chunk).unwrap(), data);
        }
    }

    #[test]
    fn matches_one_shot_helpers() {
        let config = CipherConfig::new("test-pass").unwrap();
        let encrypted = encrypt(&config, b"payload", 3);
        assert_eq!(config.decrypt(&encrypted).unwrap(), b"payload");

        let one_shot = config.encrypt(b"payload").unwrap();
        assert_eq!(decrypt(&config, &one_shot, 5).unwrap(), b"payload");
    }

    #[test]
    fn truncated_stream_fails() {
        let config = CipherConfig::new("test-pass").unwrap();
        let mut encrypted = encrypt(&config, b"some longer payload here", 8);
        encrypted.truncate(encrypted.len() - 3);
        assert!(decrypt(&config, &encrypted, 8).is_err());
    }

    #[test]
    fn empty_payload() {
        let config = CipherConfig::new("test-pass").unwrap();
        let encrypted = encrypt(&config, b"", 16);
        // IV plus one padding block.
        assert_eq!(encrypted.len(), CIPHER_BLOCK_SIZE * 2);
        assert_eq!(decrypt(&config, &encrypted, 4).unwrap(), b"");
    }
}
