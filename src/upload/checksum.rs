//! Chunk checksum verification for `Upload-Checksum`.

use md5::Md5;
use sha1::{Digest, Sha1};

/// Advertised through `Protocol-Checksum-Algorithm`.
pub const SUPPORTED_ALGORITHMS: &str = "sha1,md5,crc32";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha1,
    Md5,
    Crc32,
}

impl ChecksumAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "md5" => Some(Self::Md5),
            "crc32" => Some(Self::Crc32),
            _ => None,
        }
    }

    /// Lowercase hex digest of `buffer`. crc32 is rendered as its four
    /// little-endian bytes.
    pub fn digest_hex(self, buffer: &[u8]) -> String {
        match self {
            Self::Sha1 => hex::encode(Sha1::digest(buffer)),
            Self::Md5 => hex::encode(Md5::digest(buffer)),
            Self::Crc32 => hex::encode(crc32fast::hash(buffer).to_le_bytes()),
        }
    }
}

/// Splits an `Upload-Checksum` value into algorithm and digest.
pub fn parse_checksum_header(value: &str) -> Option<(&str, &str)> {
    let mut parts = value.split_whitespace();
    let algorithm = parts.next()?;
    let digest = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((algorithm, digest))
}

/// Returns true when `digest` matches `buffer` under `algorithm`.
/// Unknown algorithms never match.
pub fn verify_checksum(buffer: &[u8], algorithm: &str, digest: &str) -> bool {
    let Some(algorithm) = ChecksumAlgorithm::from_name(algorithm) else {
        return false;
    };
    algorithm.digest_hex(buffer).eq_ignore_ascii_case(digest)
}
