//! Content hash filter.

use anyhow::{format_err, Error};
use openssl::hash::{Hasher, MessageDigest};

use super::{Filter, FilterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    Sha1,
    Sha256,
}

impl HashType {
    fn digest(self) -> MessageDigest {
        match self {
            HashType::Sha1 => MessageDigest::sha1(),
            HashType::Sha256 => MessageDigest::sha256(),
        }
    }
}

/// Passes the stream through unchanged while hashing it. The hex digest is
/// the filter result.
pub struct HashFilter {
    hasher: Hasher,
    digest: Option<String>,
    done: bool,
}

impl HashFilter {
    pub fn new(hash_type: HashType) -> Self {
        // Hasher::new only fails when the digest is unknown to the linked
        // openssl, which cannot happen for sha1/sha256.
        let hasher = Hasher::new(hash_type.digest()).unwrap();
        HashFilter {
            hasher,
            digest: None,
            done: false,
        }
    }

    /// Hash a complete buffer, returning the hex digest.
    pub fn digest_buf(hash_type: HashType, data: &[u8]) -> Result<String, Error> {
        let mut hasher =
            Hasher::new(hash_type.digest()).map_err(|err| format_err!("hash init - {}", err))?;
        hasher
            .update(data)
            .map_err(|err| format_err!("hash update - {}", err))?;
        let digest = hasher
            .finish()
            .map_err(|err| format_err!("hash finish - {}", err))?;
        Ok(hex::encode(&digest))
    }
}

impl Filter for HashFilter {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error> {
        if !input.is_empty() {
            self.hasher
                .update(input)
                .map_err(|err| format_err!("hash update - {}", err))?;
            output.extend_from_slice(input);
        }

        if eof && !self.done {
            let digest = self
                .hasher
                .finish()
                .map_err(|err| format_err!("hash finish - {}", err))?;
            self.digest = Some(hex::encode(&digest));
            self.done = true;
        }

        Ok(input.len())
    }

    fn done(&self) -> bool {
        self.done
    }

    fn result(&mut self) -> FilterResult {
        match &self.digest {
            Some(digest) => FilterResult::Digest(digest.clone()),
            None => FilterResult::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_known_vector() {
        let mut filter = HashFilter::new(HashType::Sha1);
        let mut out = Vec::new();
        filter.process(b"abc", true, &mut out).unwrap();
        assert_eq!(
            filter.result(),
            FilterResult::Digest("a9993e364706816aba3e25717850c26c9cd0d89d".to_string())
        );
    }

    #[test]
    fn sha256_empty() {
        let mut filter = HashFilter::new(HashType::Sha256);
        let mut out = Vec::new();
        filter.process(b"", true, &mut out).unwrap();
        assert_eq!(
            filter.result(),
            FilterResult::Digest(
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string()
            )
        );
    }

    #[test]
    fn digest_buf_matches_filter() {
        assert_eq!(
            HashFilter::digest_buf(HashType::Sha1, b"abc").unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
