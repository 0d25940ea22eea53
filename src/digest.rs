//! Block/body digest algorithms.
//!
//! `edb-blocksum` (block checksums) and `checksum` (content-pool body
//! checksums) both name one of these algorithms. Neither is negotiated at
//! runtime — the algorithm is read from the relevant settings block once,
//! at open, and used for every check for the lifetime of that file.

use md5::{Digest as _, Md5};
use sha2::Sha256;

/// A digest algorithm usable for block checksums or body checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDigest {
    Sha256,
    Md5,
}

impl BlockDigest {
    pub const DEFAULT: BlockDigest = BlockDigest::Sha256;

    pub fn name(self) -> &'static str {
        match self {
            BlockDigest::Sha256 => "sha256",
            BlockDigest::Md5 => "md5",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(BlockDigest::Sha256),
            "md5" => Some(BlockDigest::Md5),
            _ => None,
        }
    }

    /// Byte length of this digest's output.
    pub fn output_len(self) -> usize {
        match self {
            BlockDigest::Sha256 => 32,
            BlockDigest::Md5 => 16,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            BlockDigest::Sha256 => {
                let mut h = Sha256::new();
                h.update(data);
                h.finalize().to_vec()
            }
            BlockDigest::Md5 => {
                let mut h = Md5::new();
                h.update(data);
                h.finalize().to_vec()
            }
        }
    }
}

impl Default for BlockDigest {
    fn default() -> Self {
        BlockDigest::DEFAULT
    }
}
