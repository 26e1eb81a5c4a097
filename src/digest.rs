//! Streaming content digests and verification.
//!
//! Everything a registry serves or accepts is addressed by a digest of the
//! form `<algorithm>:<hex>`. This module computes those digests
//! incrementally and checks retrieved content against the digest it was
//! requested by.

use sha2::{Digest, Sha256, Sha512};

use crate::errors::{OciDistributionError, Result};

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn for_digest(digest: &str) -> Result<Self> {
        match digest.split(':').next() {
            Some("sha256") => Ok(Hasher::Sha256(Sha256::new())),
            Some("sha512") => Ok(Hasher::Sha512(Sha512::new())),
            other => Err(OciDistributionError::UnsupportedDigestAlgorithm(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Sha512(h) => h.update(bytes),
        }
    }

    fn finalize(self) -> String {
        match self {
            Hasher::Sha256(h) => format!("sha256:{:x}", h.finalize()),
            Hasher::Sha512(h) => format!("sha512:{:x}", h.finalize()),
        }
    }
}

/// Incrementally hashes a byte stream with the algorithm named by the
/// expected digest, and compares the result once the stream is complete.
///
/// A mismatch is fatal for the content being transferred; the verifier
/// never retries on its own and mutates no shared state.
pub struct DigestVerifier {
    hasher: Hasher,
    expected: String,
}

impl DigestVerifier {
    /// Create a verifier for the given expected digest. Fails with
    /// `UnsupportedDigestAlgorithm` when the algorithm prefix is not
    /// sha256 or sha512.
    pub fn new(expected: &str) -> Result<Self> {
        Ok(DigestVerifier {
            hasher: Hasher::for_digest(expected)?,
            expected: expected.to_string(),
        })
    }

    /// Feed the next chunk of the stream into the hash.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finish the stream and compare the computed digest against the
    /// expected one. Returns `DigestMismatch` carrying both digests when
    /// they disagree.
    pub fn verify(self) -> Result<()> {
        let expected = self.expected;
        let computed = self.hasher.finalize();
        if computed == expected {
            Ok(())
        } else {
            Err(OciDistributionError::DigestMismatch { expected, computed })
        }
    }
}

/// Computes the SHA256 digest of a byte slice in registry form.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

/// Computes the SHA512 digest of a byte slice in registry form.
pub fn sha512_digest(bytes: &[u8]) -> String {
    format!("sha512:{:x}", Sha512::digest(bytes))
}

/// Computes the digest of `bytes` using the same algorithm as `like`, so
/// the two strings are directly comparable.
pub(crate) fn digest_like(like: &str, bytes: &[u8]) -> Result<String> {
    let mut hasher = Hasher::for_digest(like)?;
    hasher.update(bytes);
    Ok(hasher.finalize())
}
