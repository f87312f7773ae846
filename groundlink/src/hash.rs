//! Streaming content-hash verification.
//!
//! Artifacts referenced by a manifest are content-addressed with a compact
//! descriptor of the form `algo:hexdigest` (e.g. `sha256:9f86d0...`). This
//! module parses those descriptors and checks arbitrary readers against
//! them without buffering the whole content in memory.

use md5::Md5;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::Read;
use thiserror::Error;

/// Read buffer size for streaming verification.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Errors that can occur while parsing descriptors or verifying content.
#[derive(Debug, Error)]
pub enum HashError {
    /// The descriptor names an algorithm this agent does not implement.
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The compact descriptor is not of the form `algo:hex`.
    #[error("invalid hash descriptor {0:?}: must be algo:hex")]
    InvalidDescriptor(String),

    /// Content digest differs from the expected digest.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    /// Reading the content failed.
    #[error("hashing failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Digest algorithms accepted in a content descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Parses an algorithm name, case-insensitively.
    pub fn parse(name: &str) -> Result<Self, HashError> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(HashError::UnsupportedAlgorithm(name.to_string())),
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental digest over one of the supported algorithms.
///
/// Used to hash-tee a download while it is written to a staging file, so
/// verification does not require a second pass over the bytes.
pub enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    /// Creates a fresh hasher for the given algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Self::Md5(Md5::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    /// Feeds a chunk of content into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Md5(h) => h.update(bytes),
            Self::Sha256(h) => h.update(bytes),
            Self::Sha512(h) => h.update(bytes),
        }
    }

    /// Consumes the hasher and returns the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algo = match self {
            Self::Md5(_) => HashAlgorithm::Md5,
            Self::Sha256(_) => HashAlgorithm::Sha256,
            Self::Sha512(_) => HashAlgorithm::Sha512,
        };
        f.debug_tuple("Hasher").field(&algo).finish()
    }
}

/// Checks content against an expected digest.
///
/// The expected digest is normalized to lowercase at construction; the
/// comparison is an exact string match, so a digest of the wrong length is
/// reported as a [`HashError::Mismatch`], not a parse failure.
#[derive(Debug, Clone)]
pub struct HashVerifier {
    algorithm: HashAlgorithm,
    expected: String,
}

impl HashVerifier {
    /// Creates a verifier from an algorithm name and expected hex digest.
    pub fn new(algorithm: &str, expected: &str) -> Result<Self, HashError> {
        Ok(Self {
            algorithm: HashAlgorithm::parse(algorithm)?,
            expected: expected.to_ascii_lowercase(),
        })
    }

    /// Creates a verifier from a compact `algo:hex` descriptor.
    pub fn from_descriptor(descriptor: &str) -> Result<Self, HashError> {
        let (algorithm, expected) = descriptor
            .split_once(':')
            .ok_or_else(|| HashError::InvalidDescriptor(descriptor.to_string()))?;
        Self::new(algorithm, expected)
    }

    /// The algorithm this verifier checks with.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The expected digest, lowercase hex.
    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// Fully consumes `reader` and checks its digest.
    ///
    /// Underlying read failures propagate as [`HashError::Io`].
    pub fn verify<R: Read>(&self, mut reader: R) -> Result<(), HashError> {
        let mut hasher = Hasher::new(self.algorithm);
        let mut buf = [0u8; READ_BUF_SIZE];

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        self.check(hasher.finalize_hex())
    }

    /// Checks an in-memory byte slice.
    pub fn verify_bytes(&self, bytes: &[u8]) -> Result<(), HashError> {
        let mut hasher = Hasher::new(self.algorithm);
        hasher.update(bytes);
        self.check(hasher.finalize_hex())
    }

    /// Compares a computed digest against the expected one.
    pub fn check(&self, actual: String) -> Result<(), HashError> {
        if actual != self.expected {
            return Err(HashError::Mismatch {
                expected: self.expected.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Computes the lowercase hex digest of a byte slice.
pub fn digest_hex(algorithm: HashAlgorithm, bytes: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(bytes);
    hasher.finalize_hex()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HELLO_SHA512: &str = "9b71d224bd62f3785d96d46ad3ea3d73319bfbc2890caadae2dff72519673ca7\
                                2323c3d99ba5c11d7c7acc6e14b8c5da0c4663475c2e5c3adef46f73bcdec043";

    #[test]
    fn verify_sha256_reader() {
        let verifier = HashVerifier::new("sha256", HELLO_SHA256).unwrap();
        verifier.verify(Cursor::new(b"hello")).unwrap();
    }

    #[test]
    fn verify_md5_and_sha512() {
        HashVerifier::new("md5", HELLO_MD5)
            .unwrap()
            .verify_bytes(b"hello")
            .unwrap();
        HashVerifier::new("sha512", HELLO_SHA512)
            .unwrap()
            .verify_bytes(b"hello")
            .unwrap();
    }

    #[test]
    fn algorithm_name_is_case_insensitive() {
        let verifier = HashVerifier::new("SHA256", HELLO_SHA256).unwrap();
        assert_eq!(verifier.algorithm(), HashAlgorithm::Sha256);
        verifier.verify_bytes(b"hello").unwrap();
    }

    #[test]
    fn expected_digest_is_lowercased() {
        let verifier = HashVerifier::new("sha256", &HELLO_SHA256.to_uppercase()).unwrap();
        verifier.verify_bytes(b"hello").unwrap();
    }

    #[test]
    fn mismatch_reports_both_digests() {
        let verifier = HashVerifier::new("sha256", HELLO_SHA256).unwrap();
        let err = verifier.verify_bytes(b"goodbye").unwrap_err();
        match err {
            HashError::Mismatch { expected, actual } => {
                assert_eq!(expected, HELLO_SHA256);
                assert_ne!(actual, expected);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn wrong_length_digest_is_a_mismatch() {
        // A truncated digest can never match, but it must not be treated
        // as a descriptor parse failure.
        let verifier = HashVerifier::new("sha256", "abc123").unwrap();
        let err = verifier.verify_bytes(b"hello").unwrap_err();
        assert!(matches!(err, HashError::Mismatch { .. }));
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = HashVerifier::new("crc32", "00000000").unwrap_err();
        assert!(matches!(err, HashError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn descriptor_without_separator_is_invalid() {
        let err = HashVerifier::from_descriptor("sha256deadbeef").unwrap_err();
        assert!(matches!(err, HashError::InvalidDescriptor(_)));
    }

    #[test]
    fn descriptor_with_unknown_algorithm() {
        let err = HashVerifier::from_descriptor("crc32:deadbeef").unwrap_err();
        assert!(matches!(err, HashError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn descriptor_round_trip() {
        let verifier =
            HashVerifier::from_descriptor(&format!("sha256:{HELLO_SHA256}")).unwrap();
        assert_eq!(verifier.algorithm(), HashAlgorithm::Sha256);
        assert_eq!(verifier.expected(), HELLO_SHA256);
        verifier.verify(Cursor::new(b"hello")).unwrap();
    }

    #[test]
    fn read_errors_propagate() {
        struct FailingReader;

        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk on fire"))
            }
        }

        let verifier = HashVerifier::new("sha256", HELLO_SHA256).unwrap();
        let err = verifier.verify(FailingReader).unwrap_err();
        assert!(matches!(err, HashError::Io(_)));
    }

    #[test]
    fn incremental_hasher_matches_one_shot() {
        let mut hasher = Hasher::new(HashAlgorithm::Sha256);
        hasher.update(b"he");
        hasher.update(b"llo");
        assert_eq!(hasher.finalize_hex(), HELLO_SHA256);
        assert_eq!(digest_hex(HashAlgorithm::Sha256, b"hello"), HELLO_SHA256);
    }
}
